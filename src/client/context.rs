use futures_util::future::try_join_all;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::codec;
use crate::config::LauncherSettings;
use crate::download::{fetch_document, Downloader};
use crate::error::Result;
use crate::format::{
    BuildDefinition, BuildsIndex, LocalFileInfo, PatchDefinition, PatchIndex, PendingRepair,
    UpdaterDefinition,
};
use crate::fsops::{self, LockCheck, OsLockCheck};
use crate::resolver;
use crate::util;
use crate::version::Version;

/// Everything a client run needs to know, gathered once at startup. Steps only read it.
pub struct UpdateContext {
    settings: LauncherSettings,
    downloader: Arc<dyn Downloader>,
    lock_check: Arc<dyn LockCheck>,
    local_version: Option<Version>,
    current_version: Version,
    repair_forced: bool,
    builds_index: BuildsIndex,
    patches_index: PatchIndex,
    updater_definition: UpdaterDefinition,
    build_definition: BuildDefinition,
    local_files: HashMap<String, LocalFileInfo>,
    pending_repair: PendingRepair,
    patch_chain: Vec<PatchDefinition>,
}

async fn fetch_or_default<T: DeserializeOwned + Default>(
    downloader: &dyn Downloader,
    url: &str,
    what: &str,
) -> T {
    match fetch_document(downloader, url).await {
        Ok(value) => value,
        Err(e) => {
            warn!(url, error = %e, "Could not fetch the {what}, continuing without it");
            T::default()
        }
    }
}

impl UpdateContext {
    pub async fn initialize(
        settings: LauncherSettings,
        downloader: Arc<dyn Downloader>,
    ) -> Result<Self> {
        Self::initialize_with(settings, downloader, Arc::new(OsLockCheck)).await
    }

    pub async fn initialize_with(
        settings: LauncherSettings,
        downloader: Arc<dyn Downloader>,
        lock_check: Arc<dyn LockCheck>,
    ) -> Result<Self> {
        settings.validate()?;

        let root = settings.root_path.clone();
        let swept = tokio::task::spawn_blocking(move || fsops::clean_workspace(&root)).await?;
        if swept > 0 {
            info!(files = swept, "Removed files left over from a previous run");
        }

        let local_version =
            codec::read_version_marker(&settings.version_file_path(), &settings.encryption_keyphrase);
        let shown = local_version.map_or_else(|| "none".to_string(), |v| v.to_string());
        info!(version = %shown, "Installed version");

        let pending_repair: PendingRepair =
            match codec::read_document_or_default(&settings.pending_repair_path()) {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable pending repair list");
                    PendingRepair::default()
                }
            };
        if !pending_repair.files.is_empty() {
            info!(files = pending_repair.files.len(), "Files left stale by a previous run");
        }

        let dl = downloader.as_ref();
        let updater_url = settings.remote_updater_index_url();
        let builds_url = settings.remote_builds_index_url();
        let patches_url = settings.remote_patches_index_url();
        let (updater_definition, builds_index, patches_index) = tokio::join!(
            fetch_or_default::<UpdaterDefinition>(dl, &updater_url, "updater index"),
            fetch_or_default::<BuildsIndex>(dl, &builds_url, "builds index"),
            fetch_or_default::<PatchIndex>(dl, &patches_url, "patches index"),
        );

        let start = resolver::resolve_start(local_version, &builds_index)?;
        if start.repair_forced {
            info!(version = %start.version, "Installation will be restored from the newest build");
        }

        let game_path = settings.game_path();
        let definition_url = settings.remote_build_definition_url(&start.version);
        let (local_files, build_definition) = tokio::join!(
            tokio::task::spawn_blocking(move || util::walk_files(&game_path)),
            fetch_or_default::<BuildDefinition>(dl, &definition_url, "build definition"),
        );
        let local_files: HashMap<String, LocalFileInfo> = local_files??
            .into_iter()
            .map(|f| (f.info.relative_path.clone(), f.info))
            .collect();

        let chain = resolver::resolve(start.version, &patches_index);
        let patch_chain = try_join_all(chain.iter().map(|p| {
            let url = settings.remote_patch_definition_url(&p.from, &p.to);
            async move { fetch_document::<PatchDefinition>(dl, &url).await }
        }))
        .await?;
        if let Some(last) = patch_chain.last() {
            info!(from = %start.version, to = %last.to, patches = patch_chain.len(), "Update available");
        }

        Ok(Self {
            settings,
            downloader,
            lock_check,
            local_version,
            current_version: start.version,
            repair_forced: start.repair_forced,
            builds_index,
            patches_index,
            updater_definition,
            build_definition,
            local_files,
            pending_repair,
            patch_chain,
        })
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    pub fn downloader(&self) -> &dyn Downloader {
        self.downloader.as_ref()
    }

    pub fn lock_check(&self) -> Arc<dyn LockCheck> {
        self.lock_check.clone()
    }

    pub fn local_version(&self) -> Option<Version> {
        self.local_version
    }

    /// The version repair validates against and the patch chain starts from.
    pub fn current_version(&self) -> Version {
        self.current_version
    }

    pub fn repair_forced(&self) -> bool {
        self.repair_forced
    }

    pub fn builds_index(&self) -> &BuildsIndex {
        &self.builds_index
    }

    pub fn patches_index(&self) -> &PatchIndex {
        &self.patches_index
    }

    pub fn updater_definition(&self) -> &UpdaterDefinition {
        &self.updater_definition
    }

    pub fn build_definition(&self) -> &BuildDefinition {
        &self.build_definition
    }

    pub fn local_file(&self, relative_path: &str) -> Option<&LocalFileInfo> {
        self.local_files.get(relative_path)
    }

    pub fn local_files(&self) -> impl Iterator<Item = &LocalFileInfo> {
        self.local_files.values()
    }

    /// Files a previous update could not patch.
    pub fn pending_repair(&self) -> &[String] {
        &self.pending_repair.files
    }

    pub fn patch_chain(&self) -> &[PatchDefinition] {
        &self.patch_chain
    }

    pub fn is_update_available(&self) -> bool {
        resolver::is_update_available(self.current_version, &self.patches_index)
    }

    /// The version the installation ends up on once every step has run.
    pub fn target_version(&self) -> Version {
        self.patch_chain
            .last()
            .map(|p| p.to)
            .unwrap_or(self.current_version)
    }
}

impl std::fmt::Debug for UpdateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateContext")
            .field("root", &self.settings.root_path)
            .field("local_version", &self.local_version)
            .field("current_version", &self.current_version)
            .field("repair_forced", &self.repair_forced)
            .field("local_files", &self.local_files.len())
            .field("patch_chain", &self.patch_chain.len())
            .finish()
    }
}
