//! The publishing side. Everything here works on an [`AdminSettings`] workspace whose
//! `builds/`, `patches/` and `updater/` folders are served to clients as they are.
//!
//! [`AdminSettings`]: crate::config::AdminSettings

mod build;
mod patch;
mod updater;

pub use build::{build, definition_of, next_version, BuildReport};
pub use patch::{build_patch, PatchReport};
pub use updater::build_updater_index;
