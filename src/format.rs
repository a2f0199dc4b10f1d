use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::Version;

bitflags! {
    /// File attributes tracked per manifest entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FileAttributes: u32 {
        const READ_ONLY = 1 << 0;
        const HIDDEN = 1 << 1;
        const SYSTEM = 1 << 2;
        const EXECUTABLE = 1 << 3;
    }
}

/// One file of a published build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDefinitionEntry {
    pub relative_path: String,
    pub size: u64,
    pub last_writing: DateTime<Utc>,
    pub attributes: FileAttributes,
    /// BLAKE3 hex digest of the file contents.
    pub hash: String,
}

/// The manifest of a published build. The version marker is always the last entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDefinition {
    pub entries: Vec<BuildDefinitionEntry>,
}

impl BuildDefinition {
    pub fn find(&self, relative_path: &str) -> Option<&BuildDefinitionEntry> {
        self.entries.iter().find(|e| e.relative_path == relative_path)
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildsIndex {
    pub available_builds: Vec<Version>,
}

impl BuildsIndex {
    pub fn first(&self) -> Option<Version> {
        self.available_builds.first().copied()
    }

    pub fn last(&self) -> Option<Version> {
        self.available_builds.last().copied()
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.available_builds.contains(version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchOperation {
    Added,
    Updated,
    ChangedAttributes,
    Deleted,
    Unchanged,
}

/// One operation of a patch, with the metadata the file must end up with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDefinitionEntry {
    pub operation: PatchOperation,
    pub relative_path: String,
    pub attributes: FileAttributes,
    pub last_writing: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDefinition {
    pub from: Version,
    pub to: Version,
    /// BLAKE3 hex digest of the compressed patch archive.
    pub hash: String,
    pub total_size: u64,
    pub entries: Vec<PatchDefinitionEntry>,
}

impl PatchDefinition {
    pub fn name(&self) -> String {
        format!("{}_{}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchIndexEntry {
    pub from: Version,
    pub to: Version,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchIndex {
    pub patches: Vec<PatchIndexEntry>,
}

impl PatchIndex {
    pub fn contains(&self, from: &Version, to: &Version) -> bool {
        self.patches.iter().any(|p| p.from == *from && p.to == *to)
    }
}

/// Self-update definition for the launcher files. Shares the shape of a patch entry.
pub type UpdaterDefinitionEntry = PatchDefinitionEntry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterDefinition {
    pub entries: Vec<UpdaterDefinitionEntry>,
}

/// Installed files whose patch could not be applied. They kept older content and are
/// hash-checked by the next repair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRepair {
    pub files: Vec<String>,
}

impl PendingRepair {
    /// Adds `relative_path` unless it is already listed.
    pub fn add(&mut self, relative_path: &str) {
        if !self.files.iter().any(|f| f == relative_path) {
            self.files.push(relative_path.to_string());
        }
    }
}

/// A file observed on disk, relative to the folder that was scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileInfo {
    pub relative_path: String,
    pub size: u64,
    pub last_writing: DateTime<Utc>,
    pub attributes: FileAttributes,
}

/// Counts of the operations in a patch or updater definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationSummary {
    pub added: usize,
    pub updated: usize,
    pub changed_attributes: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl OperationSummary {
    pub fn of(entries: &[PatchDefinitionEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            match entry.operation {
                PatchOperation::Added => summary.added += 1,
                PatchOperation::Updated => summary.updated += 1,
                PatchOperation::ChangedAttributes => summary.changed_attributes += 1,
                PatchOperation::Deleted => summary.deleted += 1,
                PatchOperation::Unchanged => summary.unchanged += 1,
            }
        }
        summary
    }
}

/// Whole-second comparison, the resolution timestamps survive across file systems.
pub fn same_second(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    a.timestamp() == b.timestamp()
}
