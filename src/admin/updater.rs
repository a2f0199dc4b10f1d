use std::collections::{HashMap, HashSet};
use tracing::info;

use crate::codec;
use crate::config::{AdminSettings, UPDATER_INDEX_FILE};
use crate::error::Result;
use crate::format::{
    same_second, LocalFileInfo, OperationSummary, PatchOperation, UpdaterDefinition,
    UpdaterDefinitionEntry,
};
use crate::util;

fn entry_for(operation: PatchOperation, info: &LocalFileInfo) -> UpdaterDefinitionEntry {
    UpdaterDefinitionEntry {
        operation,
        relative_path: info.relative_path.clone(),
        attributes: info.attributes,
        last_writing: info.last_writing,
        size: info.size,
    }
}

/// Inventory the launcher files in `updater/` and rewrite `updater/updater_index.json`.
///
/// Each file is compared with the previous index by size, modification time and
/// attributes. Files that disappeared become `Deleted`, and stay listed as deleted
/// for as long as they are absent so that clients skipping a release still remove them.
pub fn build_updater_index(settings: &AdminSettings) -> Result<UpdaterDefinition> {
    let root = settings.updater_path();
    let index_path = settings.updater_index_path();
    let previous: UpdaterDefinition = codec::read_document_or_default(&index_path)?;
    let known: HashMap<&str, &UpdaterDefinitionEntry> = previous
        .entries
        .iter()
        .map(|e| (e.relative_path.as_str(), e))
        .collect();

    let files: Vec<LocalFileInfo> = util::walk_files(&root)?
        .into_iter()
        .map(|f| f.info)
        .filter(|info| info.relative_path != UPDATER_INDEX_FILE)
        .collect();

    let mut entries: Vec<UpdaterDefinitionEntry> = files
        .iter()
        .map(|info| {
            let operation = match known.get(info.relative_path.as_str()) {
                None => PatchOperation::Added,
                Some(prev) if prev.operation == PatchOperation::Deleted => PatchOperation::Added,
                Some(prev)
                    if prev.size != info.size
                        || !same_second(&prev.last_writing, &info.last_writing) =>
                {
                    PatchOperation::Updated
                }
                Some(prev) if prev.attributes != info.attributes => {
                    PatchOperation::ChangedAttributes
                }
                Some(_) => PatchOperation::Unchanged,
            };
            entry_for(operation, info)
        })
        .collect();

    let present: HashSet<&str> = files.iter().map(|f| f.relative_path.as_str()).collect();
    entries.extend(
        previous
            .entries
            .iter()
            .filter(|e| !present.contains(e.relative_path.as_str()))
            .map(|e| UpdaterDefinitionEntry {
                operation: PatchOperation::Deleted,
                ..e.clone()
            }),
    );

    let definition = UpdaterDefinition { entries };
    codec::write_document(&index_path, &definition)?;

    let summary = OperationSummary::of(&definition.entries);
    info!(
        added = summary.added,
        updated = summary.updated,
        changed_attributes = summary.changed_attributes,
        deleted = summary.deleted,
        unchanged = summary.unchanged,
        "Updater index written"
    );
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FileAttributes;
    use crate::fsops;
    use chrono::{TimeZone, Utc};

    fn operations(definition: &UpdaterDefinition) -> Vec<(PatchOperation, &str)> {
        definition
            .entries
            .iter()
            .map(|e| (e.operation, e.relative_path.as_str()))
            .collect()
    }

    #[test]
    fn test_index_tracks_changes_between_runs() {
        let temp = tempfile::tempdir().unwrap();
        let settings = AdminSettings::new(temp.path());
        let updater = settings.updater_path();
        std::fs::create_dir_all(&updater).unwrap();
        for name in ["launcher.exe", "readme.txt", "old.dll"] {
            std::fs::write(updater.join(name), name.as_bytes()).unwrap();
        }

        let first = build_updater_index(&settings).unwrap();
        assert!(first.entries.iter().all(|e| e.operation == PatchOperation::Added));
        assert_eq!(first.entries.len(), 3);

        std::fs::write(updater.join("launcher.exe"), b"launcher v2").unwrap();
        let earlier = Utc.with_ymd_and_hms(2020, 5, 5, 0, 0, 0).unwrap();
        let readme_info = util::file_info(&updater, "readme.txt").unwrap();
        fsops::stamp(&updater.join("readme.txt"), FileAttributes::READ_ONLY, readme_info.last_writing)
            .unwrap();
        std::fs::remove_file(updater.join("old.dll")).unwrap();
        std::fs::write(updater.join("new.dll"), b"new").unwrap();
        fsops::stamp(&updater.join("new.dll"), FileAttributes::empty(), earlier).unwrap();

        let second = build_updater_index(&settings).unwrap();
        assert_eq!(
            operations(&second),
            [
                (PatchOperation::Updated, "launcher.exe"),
                (PatchOperation::Added, "new.dll"),
                (PatchOperation::ChangedAttributes, "readme.txt"),
                (PatchOperation::Deleted, "old.dll"),
            ]
        );

        let third = build_updater_index(&settings).unwrap();
        assert_eq!(
            operations(&third),
            [
                (PatchOperation::Unchanged, "launcher.exe"),
                (PatchOperation::Unchanged, "new.dll"),
                (PatchOperation::Unchanged, "readme.txt"),
                (PatchOperation::Deleted, "old.dll"),
            ]
        );
        assert_eq!(
            codec::read_document::<UpdaterDefinition>(&settings.updater_index_path()).unwrap(),
            third
        );
    }
}
