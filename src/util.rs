use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use memmap2::Mmap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::format::LocalFileInfo;
use crate::fsops;

/// A file found while scanning a folder.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub info: LocalFileInfo,
    pub full_path: PathBuf,
}

/// Walk a directory tree and collect every regular file with its metadata.
/// Relative paths use forward slashes and the result is sorted by relative path,
/// so manifests built from the same tree are byte-identical.
pub fn walk_files(root: &Path) -> Result<Vec<ScannedFile>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("Failed to read directory entry in {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(root)
            .with_context(|| "Failed to compute relative path")?;
        let relative_path = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");

        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to read metadata: {}", full_path.display()))?;

        files.push(ScannedFile {
            info: LocalFileInfo {
                relative_path,
                size: meta.len(),
                last_writing: last_writing(&meta)?,
                attributes: fsops::read_attributes(&full_path, &meta),
            },
            full_path,
        });
    }

    files.sort_by(|a, b| a.info.relative_path.cmp(&b.info.relative_path));
    Ok(files)
}

/// Metadata of a single file, relative to `root`.
pub fn file_info(root: &Path, relative_path: &str) -> Result<LocalFileInfo> {
    let full_path = join_relative(root, relative_path);
    let meta = std::fs::metadata(&full_path)
        .with_context(|| format!("Failed to read metadata: {}", full_path.display()))?;
    Ok(LocalFileInfo {
        relative_path: relative_path.to_string(),
        size: meta.len(),
        last_writing: last_writing(&meta)?,
        attributes: fsops::read_attributes(&full_path, &meta),
    })
}

fn last_writing(meta: &std::fs::Metadata) -> Result<DateTime<Utc>> {
    let modified = meta.modified().context("File system does not report modification times")?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Join a forward-slash relative path onto a native root.
pub fn join_relative(root: &Path, relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe {
        Mmap::map(&file).with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Stream-hash a file using BLAKE3 and return the lowercase hex digest.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("Failed to hash file: {}", path.display()))?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute the BLAKE3 hash of a byte slice.
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Join URL segments with single slashes. The base keeps its scheme untouched.
pub fn uri_combine(base: &str, parts: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for part in parts {
        let part = part.trim_matches('/');
        if part.is_empty() {
            continue;
        }
        url.push('/');
        url.push_str(part);
    }
    url
}

/// Last path segment of a URL, used as the local file name of a download.
pub fn url_file_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

/// Human-readable decimal size, e.g. `1.5 MB`.
pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
