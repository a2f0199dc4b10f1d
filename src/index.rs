//! Build and patch catalogs, kept as JSON files in the publishing workspace.
//!
//! Each publish reads the whole catalog, appends, and rewrites it. Two publishers
//! working on the same workspace at once must be serialized by the caller.

use std::path::Path;
use tracing::{debug, info};

use crate::codec;
use crate::error::Result;
use crate::format::{BuildsIndex, PatchIndex, PatchIndexEntry};
use crate::version::Version;

impl BuildsIndex {
    pub fn load(path: &Path) -> Result<Self> {
        codec::read_document_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        codec::write_document(path, self)
    }

    /// Returns false when the version was already listed.
    pub fn push(&mut self, version: Version) -> bool {
        if self.contains(&version) {
            return false;
        }
        self.available_builds.push(version);
        true
    }
}

impl PatchIndex {
    pub fn load(path: &Path) -> Result<Self> {
        codec::read_document_or_default(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        codec::write_document(path, self)
    }

    /// Returns false when the edge was already listed.
    pub fn push(&mut self, from: Version, to: Version) -> bool {
        if self.contains(&from, &to) {
            return false;
        }
        self.patches.push(PatchIndexEntry { from, to });
        true
    }
}

/// Read-merge-append-write of the builds index.
pub fn append_build(path: &Path, version: Version) -> Result<BuildsIndex> {
    let mut index = BuildsIndex::load(path)?;
    if index.push(version) {
        index.save(path)?;
        info!(%version, "Builds index updated");
    } else {
        debug!(%version, "Build already indexed");
    }
    Ok(index)
}

/// Read-merge-append-write of the patch index. An edge already present is left alone.
pub fn append_patch(path: &Path, from: Version, to: Version) -> Result<PatchIndex> {
    let mut index = PatchIndex::load(path)?;
    if index.push(from, to) {
        index.save(path)?;
        info!(%from, %to, "Patch index updated");
    } else {
        debug!(%from, %to, "Patch already indexed");
    }
    Ok(index)
}
