//! Launcher and publishing settings, plus the remote/local folder layout.
//!
//! Settings load from TOML; every field has a default so a file only needs the
//! values it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PatchError, Result};
use crate::util::{join_relative, uri_combine};
use crate::version::Version;

pub const BUILDS_FOLDER: &str = "builds";
pub const PATCHES_FOLDER: &str = "patches";
pub const UPDATER_FOLDER: &str = "updater";
pub const BUILDS_INDEX_FILE: &str = "builds_index.json";
pub const PATCHES_INDEX_FILE: &str = "patches_index.json";
pub const UPDATER_INDEX_FILE: &str = "updater_index.json";
pub const VERSION_FILE: &str = "version.data";
pub const PENDING_REPAIR_FILE: &str = "pending_repair.json";

const DEFAULT_KEYPHRASE: &str = "dwqqe2231ffe32";

pub fn build_definition_file(version: &Version) -> String {
    format!("build_{version}.json")
}

pub fn patch_name(from: &Version, to: &Version) -> String {
    format!("{from}_{to}")
}

/// Extension of the staged delta of an updated file inside a patch archive.
pub const DELTA_EXTENSION: &str = "patch";

/// `<staged>/<relative path>.patch`
pub fn staged_delta_path(staged: &Path, relative_path: &str) -> PathBuf {
    join_relative(staged, &format!("{relative_path}.{DELTA_EXTENSION}"))
}

/// What to do when a binary delta cannot be applied to an installed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep the previous file, log, and continue with the chain. The repair step
    /// restores the file on the next run.
    #[default]
    Skip,
    /// Stop the chain with the error.
    Abort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra PEM root certificate trusted by the HTTP transport.
    pub root_certificate: Option<PathBuf>,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherSettings {
    pub root_path: PathBuf,
    pub remote_url: String,
    pub encryption_keyphrase: String,
    pub game_folder_name: String,
    pub temp_folder_name: String,
    pub logs_folder_name: String,
    pub patch_download_attempts: u32,
    pub download_attempts: u32,
    pub retry_delay_ms: u64,
    pub parallel_downloads: bool,
    pub failure_policy: FailurePolicy,
    pub network: NetworkSettings,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            remote_url: "http://localhost/patch".to_string(),
            encryption_keyphrase: DEFAULT_KEYPHRASE.to_string(),
            game_folder_name: "Game".to_string(),
            temp_folder_name: "Temp".to_string(),
            logs_folder_name: "Logs".to_string(),
            patch_download_attempts: 3,
            download_attempts: 10,
            retry_delay_ms: 50,
            parallel_downloads: true,
            failure_policy: FailurePolicy::Skip,
            network: NetworkSettings::default(),
        }
    }
}

impl LauncherSettings {
    pub fn new(root_path: impl Into<PathBuf>, remote_url: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            remote_url: remote_url.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_url.trim().is_empty() {
            return Err(PatchError::configuration("remote_url is not set"));
        }
        if self.root_path.as_os_str().is_empty() {
            return Err(PatchError::configuration("root_path is not set"));
        }
        if self.patch_download_attempts == 0 || self.download_attempts == 0 {
            return Err(PatchError::configuration(
                "download attempt budgets must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn game_path(&self) -> PathBuf {
        self.root_path.join(&self.game_folder_name)
    }

    pub fn temp_path(&self) -> PathBuf {
        self.root_path.join(&self.temp_folder_name)
    }

    pub fn logs_path(&self) -> PathBuf {
        self.root_path.join(&self.logs_folder_name)
    }

    pub fn version_file_path(&self) -> PathBuf {
        self.game_path().join(VERSION_FILE)
    }

    /// Files a previous run left stale; kept outside the game folder.
    pub fn pending_repair_path(&self) -> PathBuf {
        self.temp_path().join(PENDING_REPAIR_FILE)
    }

    pub fn game_file_path(&self, relative_path: &str) -> PathBuf {
        join_relative(&self.game_path(), relative_path)
    }

    pub fn downloaded_patch_archive_path(&self, from: &Version, to: &Version) -> PathBuf {
        self.temp_path().join(format!("{}.zip", patch_name(from, to)))
    }

    pub fn uncompressed_patch_path(&self, from: &Version, to: &Version) -> PathBuf {
        self.temp_path()
            .join(format!("{}_uncompressed", patch_name(from, to)))
    }

    pub fn remote_builds_index_url(&self) -> String {
        uri_combine(&self.remote_url, &[BUILDS_FOLDER, BUILDS_INDEX_FILE])
    }

    pub fn remote_build_definition_url(&self, version: &Version) -> String {
        uri_combine(
            &self.remote_url,
            &[BUILDS_FOLDER, &build_definition_file(version)],
        )
    }

    pub fn remote_build_file_url(&self, version: &Version, relative_path: &str) -> String {
        uri_combine(
            &self.remote_url,
            &[BUILDS_FOLDER, &version.to_string(), relative_path],
        )
    }

    pub fn remote_patches_index_url(&self) -> String {
        uri_combine(&self.remote_url, &[PATCHES_FOLDER, PATCHES_INDEX_FILE])
    }

    pub fn remote_patch_definition_url(&self, from: &Version, to: &Version) -> String {
        uri_combine(
            &self.remote_url,
            &[PATCHES_FOLDER, &format!("{}.json", patch_name(from, to))],
        )
    }

    pub fn remote_patch_archive_url(&self, from: &Version, to: &Version) -> String {
        uri_combine(
            &self.remote_url,
            &[PATCHES_FOLDER, &format!("{}.zip", patch_name(from, to))],
        )
    }

    pub fn remote_updater_index_url(&self) -> String {
        uri_combine(&self.remote_url, &[UPDATER_FOLDER, UPDATER_INDEX_FILE])
    }

    pub fn remote_updater_file_url(&self, relative_path: &str) -> String {
        uri_combine(&self.remote_url, &[UPDATER_FOLDER, relative_path])
    }
}

/// Publishing workspace: `app/` holds the next build's files, the other folders are
/// the tree served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    pub workspace: PathBuf,
    pub encryption_keyphrase: String,
    pub app_folder_name: String,
    pub temp_folder_name: String,
    pub compression_level: u8,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            encryption_keyphrase: DEFAULT_KEYPHRASE.to_string(),
            app_folder_name: "app".to_string(),
            temp_folder_name: "temp".to_string(),
            compression_level: 6,
        }
    }
}

impl AdminSettings {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_toml(path)
    }

    pub fn app_path(&self) -> PathBuf {
        self.workspace.join(&self.app_folder_name)
    }

    pub fn temp_path(&self) -> PathBuf {
        self.workspace.join(&self.temp_folder_name)
    }

    pub fn builds_path(&self) -> PathBuf {
        self.workspace.join(BUILDS_FOLDER)
    }

    pub fn patches_path(&self) -> PathBuf {
        self.workspace.join(PATCHES_FOLDER)
    }

    pub fn updater_path(&self) -> PathBuf {
        self.workspace.join(UPDATER_FOLDER)
    }

    pub fn build_path(&self, version: &Version) -> PathBuf {
        self.builds_path().join(version.to_string())
    }

    pub fn build_definition_path(&self, version: &Version) -> PathBuf {
        self.builds_path().join(build_definition_file(version))
    }

    pub fn builds_index_path(&self) -> PathBuf {
        self.builds_path().join(BUILDS_INDEX_FILE)
    }

    pub fn patches_index_path(&self) -> PathBuf {
        self.patches_path().join(PATCHES_INDEX_FILE)
    }

    pub fn patch_archive_path(&self, from: &Version, to: &Version) -> PathBuf {
        self.patches_path()
            .join(format!("{}.zip", patch_name(from, to)))
    }

    pub fn patch_definition_path(&self, from: &Version, to: &Version) -> PathBuf {
        self.patches_path()
            .join(format!("{}.json", patch_name(from, to)))
    }

    pub fn patch_staging_path(&self, from: &Version, to: &Version) -> PathBuf {
        self.temp_path().join(patch_name(from, to))
    }

    pub fn updater_index_path(&self) -> PathBuf {
        self.updater_path().join(UPDATER_INDEX_FILE)
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| PatchError::io(path, e))?;
    toml::from_str(&contents).map_err(|e| PatchError::codec(path.display().to_string(), e))
}
