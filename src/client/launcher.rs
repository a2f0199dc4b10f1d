//! Self-update of the launcher's own files, which live directly under the root path.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info, warn};

use super::context::UpdateContext;
use super::progress::Progress;
use super::runner::UpdateStep;
use crate::download::DownloadEntry;
use crate::error::Result;
use crate::format::{same_second, PatchOperation, UpdaterDefinitionEntry};
use crate::fsops;
use crate::util;

#[derive(Debug, Default)]
pub struct LauncherUpdater {
    replaced: Vec<String>,
}

impl LauncherUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files whose content was replaced during this run.
    pub fn replaced(&self) -> &[String] {
        &self.replaced
    }

    /// A replaced file may be the running launcher itself.
    pub fn needs_restart(&self) -> bool {
        !self.replaced.is_empty()
    }

    async fn refresh(&mut self, ctx: &UpdateContext, entry: &UpdaterDefinitionEntry) -> Result<()> {
        let root = &ctx.settings().root_path;
        let target = util::join_relative(root, &entry.relative_path);
        let locks = ctx.lock_check();

        match util::file_info(root, &entry.relative_path).ok() {
            Some(local) if local.size != entry.size => {
                fsops::clear_path(&target, locks.as_ref())?;
                download(ctx, entry, &target).await?;
                self.replaced.push(entry.relative_path.clone());
            }
            Some(local)
                if same_second(&local.last_writing, &entry.last_writing)
                    && local.attributes == entry.attributes =>
            {
                return Ok(());
            }
            Some(_) => {
                fsops::unlock_in_place(&target, locks.as_ref())?;
            }
            None => download(ctx, entry, &target).await?,
        }
        fsops::stamp(&target, entry.attributes, entry.last_writing)?;
        Ok(())
    }

    async fn restamp(&self, ctx: &UpdateContext, entry: &UpdaterDefinitionEntry) -> Result<()> {
        let target = util::join_relative(&ctx.settings().root_path, &entry.relative_path);
        if target.exists() {
            fsops::unlock_in_place(&target, ctx.lock_check().as_ref())?;
        } else {
            download(ctx, entry, &target).await?;
        }
        fsops::stamp(&target, entry.attributes, entry.last_writing)?;
        Ok(())
    }
}

async fn download(ctx: &UpdateContext, entry: &UpdaterDefinitionEntry, target: &Path) -> Result<()> {
    debug!(file = %entry.relative_path, "Downloading launcher file");
    ctx.downloader()
        .fetch_one(&DownloadEntry {
            remote_url: ctx.settings().remote_updater_file_url(&entry.relative_path),
            destination_file: target.to_path_buf(),
            size: entry.size,
            relative_path: entry.relative_path.clone(),
        })
        .await
}

#[async_trait]
impl UpdateStep for LauncherUpdater {
    fn name(&self) -> &str {
        "launcher"
    }

    fn unit_count(&self, ctx: &UpdateContext) -> u64 {
        ctx.updater_definition().entries.len() as u64
    }

    async fn perform(&mut self, ctx: &UpdateContext, progress: &Progress) -> Result<()> {
        let definition = ctx.updater_definition();
        if definition.entries.is_empty() {
            warn!("No updater definition, the launcher cannot be validated");
            return Ok(());
        }
        info!(entries = definition.entries.len(), "Updating launcher");

        for entry in &definition.entries {
            match entry.operation {
                PatchOperation::Added | PatchOperation::Updated | PatchOperation::Unchanged => {
                    self.refresh(ctx, entry).await?
                }
                PatchOperation::Deleted => {
                    let target = util::join_relative(&ctx.settings().root_path, &entry.relative_path);
                    fsops::clear_path(&target, ctx.lock_check().as_ref())?;
                }
                PatchOperation::ChangedAttributes => self.restamp(ctx, entry).await?,
            }
            progress.report(format!("{:?} {}", entry.operation, entry.relative_path));
        }

        if self.needs_restart() {
            info!(files = self.replaced.len(), "Launcher files replaced, a restart is needed");
        }
        Ok(())
    }
}
