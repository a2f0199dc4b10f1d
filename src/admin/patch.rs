use rayon::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::archive;
use crate::codec;
use crate::config::{staged_delta_path, AdminSettings};
use crate::delta::{self, DeltaStats};
use crate::diff;
use crate::error::{PatchError, Result};
use crate::format::{BuildDefinition, OperationSummary, PatchDefinition, PatchOperation};
use crate::fsops;
use crate::index;
use crate::util;
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub from: Version,
    pub to: Version,
    pub summary: OperationSummary,
    pub archive_size: u64,
    /// Bytes the deltas reuse from the previous build.
    pub copied_bytes: u64,
}

/// Publish the patch that turns build `from` into build `to`.
///
/// Added files are staged as-is and updated files as deltas named
/// `<relative path>.patch`; the staging folder is zipped into
/// `patches/<from>_<to>.zip` and described by `patches/<from>_<to>.json`.
pub async fn build_patch(
    settings: &AdminSettings,
    from: Version,
    to: Version,
    level: u8,
) -> Result<PatchReport> {
    if from == to {
        return Err(PatchError::SameVersion { version: from });
    }

    let from_path = settings.build_definition_path(&from);
    let to_path = settings.build_definition_path(&to);
    let (from_definition, to_definition) = tokio::try_join!(
        tokio::task::spawn_blocking(move || codec::read_document::<BuildDefinition>(&from_path)),
        tokio::task::spawn_blocking(move || codec::read_document::<BuildDefinition>(&to_path)),
    )?;
    let (from_definition, to_definition) = (from_definition?, to_definition?);

    let operations = diff::diff(&from_definition, &to_definition);
    let summary = diff::summarize(&operations);
    info!(
        %from,
        %to,
        added = summary.added,
        updated = summary.updated,
        deleted = summary.deleted,
        changed_attributes = summary.changed_attributes,
        "Building patch"
    );

    let old_root = settings.build_path(&from);
    let new_root = settings.build_path(&to);
    let staging = settings.patch_staging_path(&from, &to);
    fsops::remove_dir_all(&staging)?;
    std::fs::create_dir_all(&staging).map_err(|e| PatchError::io(&staging, e))?;

    let added: Vec<(PathBuf, PathBuf)> = operations
        .iter()
        .filter(|op| op.operation == PatchOperation::Added)
        .map(|op| {
            (
                util::join_relative(&new_root, &op.relative_path),
                util::join_relative(&staging, &op.relative_path),
            )
        })
        .collect();
    let updated: Vec<(PathBuf, PathBuf, PathBuf)> = operations
        .iter()
        .filter(|op| op.operation == PatchOperation::Updated)
        .map(|op| {
            (
                util::join_relative(&old_root, &op.relative_path),
                util::join_relative(&new_root, &op.relative_path),
                staged_delta_path(&staging, &op.relative_path),
            )
        })
        .collect();

    let (staged_added, deltas) = tokio::try_join!(
        tokio::task::spawn_blocking(move || -> anyhow::Result<usize> {
            added
                .par_iter()
                .try_for_each(|(source, staged)| fsops::copy_preserving(source, staged))?;
            Ok(added.len())
        }),
        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<DeltaStats>> {
            updated
                .par_iter()
                .map(|(old, new, staged)| {
                    fsops::ensure_parent(staged)?;
                    delta::build_delta(old, new, staged)
                })
                .collect()
        }),
    )?;
    let (staged_added, deltas) = (staged_added?, deltas?);
    let copied_bytes: u64 = deltas.iter().map(|d| d.copied).sum();
    debug!(added = staged_added, deltas = deltas.len(), copied_bytes, "Patch staged");

    let archive_path = settings.patch_archive_path(&from, &to);
    let (staging_dir, archive_file) = (staging.clone(), archive_path.clone());
    let (hash, archive_size) = tokio::task::spawn_blocking(move || -> anyhow::Result<(String, u64)> {
        archive::compress(&staging_dir, &archive_file, level)?;
        fsops::remove_dir_all(&staging_dir)?;
        let size = std::fs::metadata(&archive_file)?.len();
        Ok((util::hash_file(&archive_file)?, size))
    })
    .await??;

    let definition = PatchDefinition {
        from,
        to,
        hash,
        total_size: archive_size,
        entries: operations,
    };
    codec::write_document(&settings.patch_definition_path(&from, &to), &definition)?;
    index::append_patch(&settings.patches_index_path(), from, to)?;

    info!(patch = %definition.name(), size = %util::format_size(archive_size), "Patch published");
    Ok(PatchReport {
        from,
        to,
        summary,
        archive_size,
        copied_bytes,
    })
}
