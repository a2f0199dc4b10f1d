//! The installed side: gather the state of an installation once, then run the update,
//! repair and self-update steps against it.

mod context;
mod launcher;
mod progress;
mod repairer;
mod runner;
mod updater;

pub use context::UpdateContext;
pub use launcher::LauncherUpdater;
pub use progress::{Progress, ProgressEvent, ProgressSink};
pub use repairer::{classify, is_repair_needed, FileIntegrity, Repairer};
pub use runner::{StepCallback, UpdateRunner, UpdateStep};
pub use updater::Updater;
