//! Versioned build distribution.
//!
//! The publishing side ([`admin`]) turns an application folder into numbered builds,
//! binary patches between them and the catalogs that list both. The client side
//! ([`client`]) brings an installation to the newest build by repairing it against
//! its manifest and applying the patch chain, and keeps the launcher itself current.

pub mod admin;
pub mod archive;
pub mod client;
pub mod codec;
pub mod config;
pub mod delta;
pub mod diff;
pub mod download;
pub mod error;
pub mod format;
pub mod fsops;
pub mod index;
pub mod resolver;
pub mod util;
pub mod version;

pub use config::{AdminSettings, FailurePolicy, LauncherSettings};
pub use error::{PatchError, Result};
pub use version::{Bump, Version};
