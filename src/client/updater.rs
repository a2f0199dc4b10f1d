//! Applies the resolved patch chain to the installed game, one patch at a time.

use anyhow::Context as _;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::UpdateContext;
use super::progress::Progress;
use super::runner::UpdateStep;
use crate::archive;
use crate::codec;
use crate::config::{staged_delta_path, FailurePolicy};
use crate::delta;
use crate::download::DownloadEntry;
use crate::error::{PatchError, Result};
use crate::format::{PatchDefinition, PatchDefinitionEntry, PatchOperation, PendingRepair};
use crate::fsops::{self, LockCheck};
use crate::util;

const BACKUP_EXTENSION: &str = "bak";

fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(BACKUP_EXTENSION);
    PathBuf::from(name)
}

#[derive(Debug, Default)]
pub struct Updater {
    applied: Vec<String>,
    skipped: Vec<String>,
}

impl Updater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names (`<from>_<to>`) of the patches applied so far.
    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    /// Files whose delta could not be applied and that kept their previous content.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Add the skipped files to the pending repair list so the next run restores them,
    /// even when they have the expected size.
    fn record_skipped(&self, ctx: &UpdateContext) -> Result<()> {
        if self.skipped.is_empty() {
            return Ok(());
        }
        let path = ctx.settings().pending_repair_path();
        let mut pending: PendingRepair = codec::read_document_or_default(&path)?;
        for file in &self.skipped {
            pending.add(file);
        }
        codec::write_document(&path, &pending)?;
        warn!(
            files = self.skipped.len(),
            "Some files kept older content, the next run repairs them"
        );
        Ok(())
    }

    async fn apply_patch(
        &mut self,
        ctx: &UpdateContext,
        patch: &PatchDefinition,
        progress: &Progress,
    ) -> Result<()> {
        let settings = ctx.settings();
        let name = patch.name();
        info!(patch = %name, entries = patch.entries.len(), "Applying patch");

        progress.log(format!("Downloading patch {name}"));
        let archive_path = download_archive(ctx, patch).await?;

        let staged = settings.uncompressed_patch_path(&patch.from, &patch.to);
        let result = self.apply_archive(ctx, patch, &archive_path, &staged, progress).await;

        let cleanup = tokio::task::spawn_blocking(move || {
            fsops::remove_dir_all(&staged)?;
            fsops::remove_file(&archive_path)
        })
        .await?;
        if let Err(e) = cleanup {
            warn!(patch = %name, error = %e, "Could not clean up the patch files");
        }

        result?;
        self.applied.push(name);
        Ok(())
    }

    async fn apply_archive(
        &mut self,
        ctx: &UpdateContext,
        patch: &PatchDefinition,
        archive_path: &Path,
        staged: &Path,
        progress: &Progress,
    ) -> Result<()> {
        progress.log(format!("Decompressing patch {}", patch.name()));
        let (archive_file, staged_dir) = (archive_path.to_path_buf(), staged.to_path_buf());
        let extracted = tokio::task::spawn_blocking(move || {
            fsops::remove_dir_all(&staged_dir)?;
            archive::decompress(&staged_dir, &archive_file)
        })
        .await??;
        debug!(patch = %patch.name(), files = extracted, "Patch decompressed");

        let game = ctx.settings().game_path();
        let policy = ctx.settings().failure_policy;
        for entry in &patch.entries {
            let job = EntryJob {
                game: game.clone(),
                staged: staged.to_path_buf(),
                entry: entry.clone(),
                locks: ctx.lock_check(),
            };
            match tokio::task::spawn_blocking(move || job.run()).await? {
                Ok(()) => {}
                Err(e) if entry.operation == PatchOperation::Updated && policy == FailurePolicy::Skip => {
                    warn!(
                        file = %entry.relative_path,
                        error = %e,
                        "Could not patch file, keeping the previous content"
                    );
                    self.skipped.push(entry.relative_path.clone());
                }
                Err(e) => return Err(e.into()),
            }
            progress.report(format!("{:?} {}", entry.operation, entry.relative_path));
        }
        Ok(())
    }
}

/// Download the patch archive into the temp folder and check it against the
/// definition's hash. A mismatch or failed download deletes the file and tries again.
async fn download_archive(ctx: &UpdateContext, patch: &PatchDefinition) -> Result<PathBuf> {
    let settings = ctx.settings();
    let destination = settings.downloaded_patch_archive_path(&patch.from, &patch.to);
    let entry = DownloadEntry {
        remote_url: settings.remote_patch_archive_url(&patch.from, &patch.to),
        destination_file: destination.clone(),
        size: patch.total_size,
        relative_path: format!("{}.zip", patch.name()),
    };

    let attempts = settings.patch_download_attempts;
    for attempt in 1..=attempts {
        match ctx.downloader().fetch_one(&entry).await {
            Ok(()) => {
                let path = destination.clone();
                let actual = tokio::task::spawn_blocking(move || util::hash_file(&path)).await??;
                if actual == patch.hash {
                    return Ok(destination);
                }
                warn!(
                    patch = %patch.name(),
                    attempt,
                    expected = %patch.hash,
                    actual = %actual,
                    "Patch archive is corrupted"
                );
            }
            Err(PatchError::Cancelled) => return Err(PatchError::Cancelled),
            Err(e) => warn!(patch = %patch.name(), attempt, error = %e, "Patch archive download failed"),
        }
        fsops::remove_file(&destination)?;
    }

    Err(PatchError::PatchUndownloadable {
        from: patch.from,
        to: patch.to,
        attempts,
    })
}

/// Put `backup` back under `target`, replacing whatever a failed patch left there.
/// The backup is never deleted before it has been moved.
fn restore_backup(backup: &Path, target: &Path) -> anyhow::Result<()> {
    if fs::rename(backup, target).is_ok() {
        return Ok(());
    }
    if let Err(e) = fsops::remove_file(target) {
        warn!(file = %target.display(), error = %e, "Could not remove the partly patched file");
    }
    fs::rename(backup, target)
        .with_context(|| format!("Failed to restore {} from its backup", target.display()))
}

/// One patch entry, owned so it can run on the blocking pool.
struct EntryJob {
    game: PathBuf,
    staged: PathBuf,
    entry: PatchDefinitionEntry,
    locks: Arc<dyn LockCheck>,
}

impl EntryJob {
    fn run(self) -> anyhow::Result<()> {
        let entry = &self.entry;
        let target = util::join_relative(&self.game, &entry.relative_path);
        match entry.operation {
            PatchOperation::Added => {
                let source = util::join_relative(&self.staged, &entry.relative_path);
                fsops::clear_path(&target, self.locks.as_ref())?;
                fsops::move_file(&source, &target)?;
                fsops::stamp(&target, entry.attributes, entry.last_writing)
            }
            PatchOperation::Deleted => {
                fsops::clear_path(&target, self.locks.as_ref())?;
                Ok(())
            }
            PatchOperation::Updated => self.update(&target),
            PatchOperation::ChangedAttributes => {
                fsops::stamp(&target, entry.attributes, entry.last_writing)
            }
            PatchOperation::Unchanged => Ok(()),
        }
    }

    /// The previous file stays as `<target>.bak` until the rebuilt file is verified
    /// and stamped; any failure puts it back.
    fn update(&self, target: &Path) -> anyhow::Result<()> {
        let delta = staged_delta_path(&self.staged, &self.entry.relative_path);
        let backup = backup_path(target);

        fsops::remove_file(&backup)?;
        fs::rename(target, &backup).with_context(|| {
            format!("Failed to back up {} before patching", target.display())
        })?;

        let patched = delta::apply_delta(&backup, &delta, target)
            .and_then(|()| fsops::stamp(target, self.entry.attributes, self.entry.last_writing));

        match patched {
            Ok(()) => {
                fsops::clear_path(&backup, self.locks.as_ref())?;
                Ok(())
            }
            Err(e) => {
                restore_backup(&backup, target)?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl UpdateStep for Updater {
    fn name(&self) -> &str {
        "update"
    }

    fn unit_count(&self, ctx: &UpdateContext) -> u64 {
        ctx.patch_chain()
            .iter()
            .map(|p| p.entries.len() as u64)
            .sum()
    }

    async fn perform(&mut self, ctx: &UpdateContext, progress: &Progress) -> Result<()> {
        let mut applied: Result<()> = Ok(());
        for patch in ctx.patch_chain() {
            applied = self.apply_patch(ctx, patch, progress).await;
            if applied.is_err() {
                break;
            }
        }
        self.record_skipped(ctx)?;
        applied?;

        if let Some(last) = ctx.patch_chain().last() {
            info!(version = %last.to, patches = self.applied.len(), "Game updated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fixture::Workspace;
    use crate::client::{is_repair_needed, Repairer};
    use crate::version::Version;

    fn large(seed: u8) -> Vec<u8> {
        (0..64 * 1024u32)
            .map(|i| (i.wrapping_mul(31) as u8) ^ seed)
            .collect()
    }

    async fn two_versions() -> Workspace {
        let workspace = Workspace::new();
        let original = large(7);
        let mut changed = original.clone();
        changed[1000] ^= 0xff;
        workspace
            .publish("1.0.0", &[("a.bin", original.as_slice()), ("b.txt", b"old file")])
            .await;
        workspace
            .publish("1.1.0", &[("a.bin", changed.as_slice()), ("c.txt", b"new file")])
            .await;
        workspace.patch("1.0.0", "1.1.0").await;
        workspace
    }

    #[tokio::test]
    async fn test_applies_patch_chain() {
        let workspace = two_versions().await;
        let client = workspace.client();
        client.install("1.0.0");

        let ctx = client.context().await;
        assert_eq!(ctx.patch_chain().len(), 1);
        let mut updater = Updater::new();
        let progress = Progress::new();
        progress.set_total(updater.unit_count(&ctx));
        updater.perform(&ctx, &progress).await.unwrap();

        assert_eq!(updater.applied(), ["1.0.0_1.1.0"]);
        assert!(updater.skipped().is_empty());
        assert_eq!(progress.current(), progress.total());
        client.assert_matches_build("1.1.0");
        assert_eq!(
            codec::read_version_marker(
                &ctx.settings().version_file_path(),
                &ctx.settings().encryption_keyphrase
            ),
            Some(Version::new(1, 1, 0))
        );
        assert!(!ctx.settings().temp_path().join("1.0.0_1.1.0.zip").exists());
        assert!(!ctx.settings().temp_path().join("1.0.0_1.1.0_uncompressed").exists());
    }

    #[tokio::test]
    async fn test_skip_keeps_previous_content() {
        let workspace = two_versions().await;
        let client = workspace.client();
        client.install("1.0.0");
        let damaged = b"not the file the delta was built against".to_vec();
        std::fs::write(client.game_file("a.bin"), &damaged).unwrap();

        let ctx = client.context().await;
        let mut updater = Updater::new();
        updater.perform(&ctx, &Progress::new()).await.unwrap();

        assert_eq!(updater.skipped(), ["a.bin"]);
        assert_eq!(std::fs::read(client.game_file("a.bin")).unwrap(), damaged);
        assert!(client.game_file("c.txt").exists());
        assert!(!client.game_file("b.txt").exists());
        assert!(!backup_path(&client.game_file("a.bin")).exists());
    }

    #[tokio::test]
    async fn test_skipped_file_of_the_same_size_is_repaired_next_run() {
        let workspace = two_versions().await;
        let client = workspace.client();
        client.install("1.0.0");
        let mut damaged = std::fs::read(client.game_file("a.bin")).unwrap();
        for i in (5..damaged.len()).step_by(512) {
            damaged[i] ^= 0xff;
        }
        std::fs::write(client.game_file("a.bin"), &damaged).unwrap();

        let ctx = client.context().await;
        let mut updater = Updater::new();
        updater.perform(&ctx, &Progress::new()).await.unwrap();
        assert_eq!(updater.skipped(), ["a.bin"]);
        assert_eq!(std::fs::read(client.game_file("a.bin")).unwrap(), damaged);

        let ctx = client.context().await;
        assert_eq!(ctx.current_version(), Version::new(1, 1, 0));
        assert!(!ctx.is_update_available());
        assert_eq!(ctx.pending_repair(), ["a.bin"]);
        assert!(is_repair_needed(&ctx));

        let mut repairer = Repairer::new();
        repairer.perform(&ctx, &Progress::new()).await.unwrap();
        assert_eq!(repairer.downloaded(), 1);
        client.assert_matches_build("1.1.0");

        let ctx = client.context().await;
        assert!(!is_repair_needed(&ctx));
        assert!(!ctx.settings().pending_repair_path().exists());
    }

    #[tokio::test]
    async fn test_abort_stops_the_chain() {
        let workspace = two_versions().await;
        let mut client = workspace.client();
        client.settings.failure_policy = FailurePolicy::Abort;
        client.install("1.0.0");
        std::fs::write(client.game_file("a.bin"), b"short").unwrap();

        let ctx = client.context().await;
        let mut updater = Updater::new();
        assert!(updater.perform(&ctx, &Progress::new()).await.is_err());
        assert_eq!(std::fs::read(client.game_file("a.bin")).unwrap(), b"short");
        assert!(updater.applied().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_archive_is_undownloadable() {
        let workspace = two_versions().await;
        let definition_path = workspace
            .admin
            .patch_definition_path(&Version::new(1, 0, 0), &Version::new(1, 1, 0));
        let mut definition: PatchDefinition = codec::read_document(&definition_path).unwrap();
        definition.hash = "0".repeat(64);
        codec::write_document(&definition_path, &definition).unwrap();

        let client = workspace.client();
        client.install("1.0.0");
        let ctx = client.context().await;
        let err = Updater::new()
            .perform(&ctx, &Progress::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PatchError::PatchUndownloadable { attempts: 3, .. }
        ));
        client.assert_matches_build("1.0.0");
    }

    #[test]
    fn test_restore_backup_replaces_a_partial_file() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("a.bin");
        let backup = backup_path(&target);
        std::fs::write(&backup, b"previous").unwrap();
        std::fs::write(&target, b"half writ").unwrap();

        restore_backup(&backup, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
        assert!(!backup.exists());

        std::fs::rename(&target, &backup).unwrap();
        restore_backup(&backup, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
    }

    #[test]
    fn test_restore_backup_keeps_the_backup_when_it_cannot_move() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("a.bin");
        let backup = backup_path(&target);
        std::fs::write(&backup, b"previous").unwrap();
        // A non-empty folder in the way can be neither deleted as a file nor replaced.
        std::fs::create_dir_all(target.join("inner")).unwrap();

        assert!(restore_backup(&backup, &target).is_err());
        assert_eq!(std::fs::read(&backup).unwrap(), b"previous");
    }

    #[test]
    fn test_staged_delta_path() {
        let staged = Path::new("staged");
        assert_eq!(
            staged_delta_path(staged, "data/a.bin"),
            staged.join("data").join("a.bin.patch")
        );
        assert_eq!(
            backup_path(Path::new("game/a.bin")),
            PathBuf::from("game/a.bin.bak")
        );
    }
}
