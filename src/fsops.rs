//! File operations used while applying builds, patches and repairs.
//!
//! Files that are open for execution (the running launcher, for instance) cannot be
//! deleted or overwritten on every platform. Instead of failing, such a file is renamed
//! to `<name>.delete_tmp` and the new content is written under the original name. The
//! parked files are reclaimed by [`clean_workspace`] on the next start.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::format::FileAttributes;

pub const DELETE_TMP_EXTENSION: &str = "delete_tmp";

/// Decides whether a file is currently locked by a running process.
pub trait LockCheck: Send + Sync {
    fn is_locked(&self, path: &Path) -> bool;
}

/// Asks the OS: a locked file refuses to be opened for writing with a sharing
/// violation (Windows) or `ETXTBSY` (unix executables that are running).
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLockCheck;

impl LockCheck for OsLockCheck {
    fn is_locked(&self, path: &Path) -> bool {
        match OpenOptions::new().write(true).open(path) {
            Ok(_) => false,
            Err(e) => is_lock_violation(&e),
        }
    }
}

fn is_lock_violation(err: &std::io::Error) -> bool {
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        matches!(err.raw_os_error(), Some(32) | Some(33))
    }
    #[cfg(unix)]
    {
        // ETXTBSY
        err.raw_os_error() == Some(26)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = err;
        false
    }
}

pub fn read_attributes(path: &Path, meta: &fs::Metadata) -> FileAttributes {
    let mut attributes = FileAttributes::empty();
    if meta.permissions().readonly() {
        attributes |= FileAttributes::READ_ONLY;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 != 0 {
            attributes |= FileAttributes::EXECUTABLE;
        }
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden {
            attributes |= FileAttributes::HIDDEN;
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::MetadataExt;
        let _ = path;
        let raw = meta.file_attributes();
        if raw & 0x2 != 0 {
            attributes |= FileAttributes::HIDDEN;
        }
        if raw & 0x4 != 0 {
            attributes |= FileAttributes::SYSTEM;
        }
    }

    attributes
}

/// Apply the attributes that can be expressed through portable permissions.
/// `HIDDEN` and `SYSTEM` are recorded in manifests but not applied.
pub fn apply_attributes(path: &Path, attributes: FileAttributes) -> Result<()> {
    let mut permissions = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?
        .permissions();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut mode = permissions.mode();
        if attributes.contains(FileAttributes::EXECUTABLE) {
            mode |= 0o111 & ((mode & 0o444) >> 2);
            mode |= 0o100;
        } else {
            mode &= !0o111;
        }
        if attributes.contains(FileAttributes::READ_ONLY) {
            mode &= !0o222;
        } else {
            mode |= 0o200;
        }
        permissions.set_mode(mode);
    }

    #[cfg(not(unix))]
    permissions.set_readonly(attributes.contains(FileAttributes::READ_ONLY));

    fs::set_permissions(path, permissions)
        .with_context(|| format!("Failed to set attributes: {}", path.display()))
}

/// Restamp a file with the attributes and modification time it must have.
pub fn stamp(path: &Path, attributes: FileAttributes, last_writing: DateTime<Utc>) -> Result<()> {
    // The file has to be writable while its time is changed.
    apply_attributes(path, attributes - FileAttributes::READ_ONLY)?;
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open file for stamping: {}", path.display()))?;
    file.set_modified(SystemTime::from(last_writing))
        .with_context(|| format!("Failed to set modification time: {}", path.display()))?;
    drop(file);
    apply_attributes(path, attributes)
}

fn make_writable(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        let mut permissions = meta.permissions();
        if permissions.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            let _ = fs::set_permissions(path, permissions);
        }
    }
}

/// Delete a file; a missing file is not an error.
pub fn remove_file(path: &Path) -> Result<()> {
    make_writable(path);
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(anyhow::Error::from(e)).with_context(|| format!("Failed to delete file: {}", path.display()))
        }
    }
}

/// Delete a directory tree; a missing directory is not an error.
pub fn remove_dir_all(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::from(e))
            .with_context(|| format!("Failed to remove directory tree: {}", path.display())),
    }
}

/// `<path>.delete_tmp`
pub fn delete_tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(DELETE_TMP_EXTENSION);
    PathBuf::from(name)
}

/// Move a locked file out of the way so its name can be reused.
pub fn park_for_deletion(path: &Path) -> Result<PathBuf> {
    let parked = delete_tmp_path(path);
    // A leftover from an earlier run in the same session; if it is still locked too,
    // the rename below reports the problem.
    if let Err(e) = remove_file(&parked) {
        debug!(file = %parked.display(), error = %e, "Could not remove an earlier parked file");
    }
    fs::rename(path, &parked).with_context(|| {
        format!(
            "Failed to move locked file {} to {}",
            path.display(),
            parked.display()
        )
    })?;
    debug!(file = %path.display(), "Parked locked file for deletion");
    Ok(parked)
}

/// Remove `path` so that something else can take its name. Locked files are parked
/// instead of deleted. Returns true when the file had to be parked.
pub fn clear_path(path: &Path, locks: &dyn LockCheck) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    if locks.is_locked(path) {
        park_for_deletion(path)?;
        return Ok(true);
    }
    remove_file(path)?;
    Ok(false)
}

/// Keep a locked file's content available under its name while releasing the name
/// from the lock: the original is parked and a copy takes its place.
pub fn unlock_in_place(path: &Path, locks: &dyn LockCheck) -> Result<bool> {
    if !path.exists() || !locks.is_locked(path) {
        return Ok(false);
    }
    let parked = park_for_deletion(path)?;
    fs::copy(&parked, path).with_context(|| {
        format!("Failed to copy {} back to {}", parked.display(), path.display())
    })?;
    Ok(true)
}

/// Move a file into place, creating parent folders. Falls back to copy + delete when
/// the rename crosses file systems.
pub fn move_file(source: &Path, destination: &Path) -> Result<()> {
    ensure_parent(destination)?;
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    fs::copy(source, destination).with_context(|| {
        format!("Failed to move {} to {}", source.display(), destination.display())
    })?;
    remove_file(source)
}

/// Copy a file and carry its modification time and attributes over.
pub fn copy_preserving(source: &Path, destination: &Path) -> Result<()> {
    ensure_parent(destination)?;
    let meta = fs::metadata(source)
        .with_context(|| format!("Failed to read metadata: {}", source.display()))?;
    if destination.exists() {
        remove_file(destination)?;
    }
    fs::copy(source, destination).with_context(|| {
        format!("Failed to copy {} to {}", source.display(), destination.display())
    })?;
    let modified = meta
        .modified()
        .context("File system does not report modification times")?;
    stamp(
        destination,
        read_attributes(source, &meta),
        DateTime::<Utc>::from(modified),
    )
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

/// Delete every `*.delete_tmp` below `root` left over from a previous run.
/// Files that are still locked are skipped. Returns how many were removed.
pub fn clean_workspace(root: &Path) -> usize {
    if !root.exists() {
        return 0;
    }

    let mut removed = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let is_parked = entry.file_type().is_file()
            && entry
                .path()
                .extension()
                .is_some_and(|ext| ext == DELETE_TMP_EXTENSION);
        if !is_parked {
            continue;
        }
        match remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(file = %entry.path().display(), error = %e, "Parked file is still in use"),
        }
    }
    removed
}
