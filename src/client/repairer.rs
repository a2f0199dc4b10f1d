//! Brings the installed files back in line with the manifest of the current build.

use async_trait::async_trait;
use bitflags::bitflags;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::context::UpdateContext;
use super::progress::Progress;
use super::runner::UpdateStep;
use crate::download::DownloadEntry;
use crate::error::{PatchError, Result};
use crate::format::{same_second, BuildDefinitionEntry, LocalFileInfo};
use crate::fsops::{self, LockCheck};
use crate::util;

bitflags! {
    /// What is wrong with an installed file compared to its manifest entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileIntegrity: u8 {
        const NOT_EXISTING = 1 << 0;
        const INVALID_SIZE = 1 << 1;
        const INVALID_LAST_WRITING = 1 << 2;
        const INVALID_ATTRIBUTES = 1 << 3;
    }
}

impl FileIntegrity {
    /// Problems only a download can fix.
    pub const MISSING_CONTENT: Self = Self::NOT_EXISTING.union(Self::INVALID_SIZE);
}

pub fn classify(expected: &BuildDefinitionEntry, local: Option<&LocalFileInfo>) -> FileIntegrity {
    let Some(local) = local else {
        return FileIntegrity::NOT_EXISTING;
    };
    let mut integrity = FileIntegrity::empty();
    if local.size != expected.size {
        integrity |= FileIntegrity::INVALID_SIZE;
    }
    if !same_second(&local.last_writing, &expected.last_writing) {
        integrity |= FileIntegrity::INVALID_LAST_WRITING;
    }
    if local.attributes != expected.attributes {
        integrity |= FileIntegrity::INVALID_ATTRIBUTES;
    }
    integrity
}

/// Whether the installation is missing files, has files of the wrong size or has
/// files a previous update left stale. Cheap: nothing is hashed.
pub fn is_repair_needed(ctx: &UpdateContext) -> bool {
    ctx.repair_forced()
        || !ctx.pending_repair().is_empty()
        || ctx.build_definition().entries.iter().any(|entry| {
            classify(entry, ctx.local_file(&entry.relative_path))
                .intersects(FileIntegrity::MISSING_CONTENT)
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Valid,
    Restamped,
    Download,
}

/// Decide what an entry needs and fix what can be fixed locally. Files that must be
/// downloaded again are removed first. A `suspect` file is hashed even when its
/// metadata matches.
fn inspect(
    game: &Path,
    entry: &BuildDefinitionEntry,
    local: Option<&LocalFileInfo>,
    suspect: bool,
    locks: &dyn LockCheck,
) -> anyhow::Result<Verdict> {
    let integrity = classify(entry, local);
    if integrity.is_empty() && !suspect {
        return Ok(Verdict::Valid);
    }

    let target = util::join_relative(game, &entry.relative_path);
    if integrity.intersects(FileIntegrity::MISSING_CONTENT) {
        fsops::clear_path(&target, locks)?;
        return Ok(Verdict::Download);
    }
    if (suspect || integrity.contains(FileIntegrity::INVALID_LAST_WRITING))
        && util::hash_file(&target)? != entry.hash
    {
        debug!(file = %entry.relative_path, "Content differs from the manifest");
        fsops::clear_path(&target, locks)?;
        return Ok(Verdict::Download);
    }
    if integrity.is_empty() {
        return Ok(Verdict::Valid);
    }

    fsops::stamp(&target, entry.attributes, entry.last_writing)?;
    Ok(Verdict::Restamped)
}

#[derive(Debug, Default)]
pub struct Repairer {
    downloaded: usize,
    restamped: usize,
}

impl Repairer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downloaded(&self) -> usize {
        self.downloaded
    }

    pub fn restamped(&self) -> usize {
        self.restamped
    }
}

#[async_trait]
impl UpdateStep for Repairer {
    fn name(&self) -> &str {
        "repair"
    }

    fn unit_count(&self, ctx: &UpdateContext) -> u64 {
        ctx.build_definition().entries.len() as u64
    }

    async fn perform(&mut self, ctx: &UpdateContext, progress: &Progress) -> Result<()> {
        let settings = ctx.settings();
        let version = ctx.current_version();
        let definition = ctx.build_definition();
        info!(%version, files = definition.entries.len(), "Checking installed files");

        let game = settings.game_path();
        let locks: Arc<dyn LockCheck> = ctx.lock_check();
        let pending: HashSet<&str> = ctx.pending_repair().iter().map(String::as_str).collect();
        let checks: Vec<(BuildDefinitionEntry, Option<LocalFileInfo>, bool)> = definition
            .entries
            .iter()
            .map(|e| {
                (
                    e.clone(),
                    ctx.local_file(&e.relative_path).cloned(),
                    pending.contains(e.relative_path.as_str()),
                )
            })
            .collect();
        let verdicts = {
            let game = game.clone();
            tokio::task::spawn_blocking(move || {
                checks
                    .par_iter()
                    .map(|(entry, local, suspect)| {
                        inspect(&game, entry, local.as_ref(), *suspect, locks.as_ref())
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .await??
        };

        let mut downloads = Vec::new();
        for (entry, verdict) in definition.entries.iter().zip(verdicts) {
            match verdict {
                Verdict::Valid => progress.report(format!("Verified {}", entry.relative_path)),
                Verdict::Restamped => {
                    self.restamped += 1;
                    progress.report(format!("Restamped {}", entry.relative_path));
                }
                Verdict::Download => downloads.push(DownloadEntry {
                    remote_url: settings.remote_build_file_url(&version, &entry.relative_path),
                    destination_file: util::join_relative(&game, &entry.relative_path),
                    size: entry.size,
                    relative_path: entry.relative_path.clone(),
                }),
            }
        }
        if downloads.is_empty() {
            info!(restamped = self.restamped, "Installation is intact");
            return clear_pending(ctx);
        }

        downloads.sort_by_key(|d| d.size);
        info!(files = downloads.len(), "Restoring files");
        let expected: HashMap<String, BuildDefinitionEntry> = definition
            .entries
            .iter()
            .map(|e| (e.relative_path.clone(), e.clone()))
            .collect();
        let restored = progress.clone();
        let on_each = Arc::new(move |done: &DownloadEntry| -> Result<()> {
            if let Some(entry) = expected.get(&done.relative_path) {
                verify_and_stamp(&done.destination_file, entry)?;
            }
            restored.report(format!("Restored {}", done.relative_path));
            Ok(())
        });
        self.downloaded = ctx.downloader().fetch_many(downloads, on_each).await?;
        clear_pending(ctx)?;
        info!(
            downloaded = self.downloaded,
            restamped = self.restamped,
            "Installation repaired"
        );
        Ok(())
    }
}

/// Every listed file has now been checked.
fn clear_pending(ctx: &UpdateContext) -> Result<()> {
    if !ctx.pending_repair().is_empty() {
        fsops::remove_file(&ctx.settings().pending_repair_path())?;
    }
    Ok(())
}

fn verify_and_stamp(path: &Path, entry: &BuildDefinitionEntry) -> Result<()> {
    let actual = util::hash_file(path)?;
    if actual != entry.hash {
        fsops::remove_file(path)?;
        return Err(PatchError::Integrity {
            path: entry.relative_path.clone(),
            expected: entry.hash.clone(),
            actual,
        });
    }
    fsops::stamp(path, entry.attributes, entry.last_writing)?;
    Ok(())
}
