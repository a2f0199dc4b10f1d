use rayon::prelude::*;
use std::path::Path;
use tracing::info;

use crate::codec;
use crate::config::{AdminSettings, VERSION_FILE};
use crate::error::{PatchError, Result};
use crate::format::{BuildDefinition, BuildDefinitionEntry, BuildsIndex};
use crate::fsops;
use crate::index;
use crate::util;
use crate::version::{Bump, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub version: Version,
    pub files: usize,
    pub total_size: u64,
}

/// The version a new build gets when only a bump is asked for.
pub fn next_version(settings: &AdminSettings, bump: Bump) -> Result<Version> {
    let index = BuildsIndex::load(&settings.builds_index_path())?;
    match index.last() {
        None => Ok(Version::default()),
        Some(last) => bump.apply(&last).ok_or_else(|| {
            PatchError::configuration(format!("Cannot bump {bump:?} past build {last}"))
        }),
    }
}

/// Manifest of a folder: every file with its metadata and BLAKE3 hash, sorted by
/// path, with the version marker moved to the end.
pub fn definition_of(root: &Path) -> anyhow::Result<BuildDefinition> {
    let files = util::walk_files(root)?;
    let mut entries = files
        .par_iter()
        .map(|file| -> anyhow::Result<BuildDefinitionEntry> {
            Ok(BuildDefinitionEntry {
                relative_path: file.info.relative_path.clone(),
                size: file.info.size,
                last_writing: file.info.last_writing,
                attributes: file.info.attributes,
                hash: util::hash_file(&file.full_path)?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if let Some(position) = entries.iter().position(|e| e.relative_path == VERSION_FILE) {
        let marker = entries.remove(position);
        entries.push(marker);
    }
    Ok(BuildDefinition { entries })
}

/// Publish the app folder as `version`: copy it to `builds/<version>/`, seal the
/// version marker into it, write its manifest and add it to the builds index.
pub async fn build(settings: &AdminSettings, version: Option<Version>) -> Result<BuildReport> {
    let version =
        version.ok_or_else(|| PatchError::configuration("no version given for the build"))?;
    let definition_path = settings.build_definition_path(&version);
    if definition_path.exists() {
        return Err(PatchError::AlreadyExists { version });
    }
    let builds_index_path = settings.builds_index_path();
    if let Some(last) = BuildsIndex::load(&builds_index_path)?.last() {
        if version < last {
            return Err(PatchError::configuration(format!(
                "build {version} is older than the last published build {last}"
            )));
        }
    }

    let app = settings.app_path();
    let sources = util::walk_files(&app)?;
    if sources.is_empty() {
        return Err(PatchError::EmptyInput { path: app });
    }
    info!(%version, files = sources.len(), "Building");

    let build_dir = settings.build_path(&version);
    let keyphrase = settings.encryption_keyphrase.clone();
    let definition = tokio::task::spawn_blocking(move || -> anyhow::Result<BuildDefinition> {
        fsops::remove_dir_all(&build_dir)?;
        sources.par_iter().try_for_each(|file| {
            fsops::copy_preserving(
                &file.full_path,
                &util::join_relative(&build_dir, &file.info.relative_path),
            )
        })?;
        codec::write_version_marker(&build_dir.join(VERSION_FILE), &version, &keyphrase)?;
        definition_of(&build_dir)
    })
    .await??;

    codec::write_document(&definition_path, &definition)?;
    index::append_build(&builds_index_path, version)?;

    Ok(BuildReport {
        version,
        files: definition.entries.len(),
        total_size: definition.total_size(),
    })
}
