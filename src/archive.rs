//! Zip container for patch archives.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::util;

/// Zip every file below `source` into `archive`. Level 0 stores entries, 1–9 deflate.
pub fn compress(source: &Path, archive: &Path, level: u8) -> Result<()> {
    if level > 9 {
        bail!("Compression level must be between 0 and 9, got {level}");
    }
    let options = if level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(level as i64))
    }
    .large_file(true);

    crate::fsops::ensure_parent(archive)?;
    let file = File::create(archive)
        .with_context(|| format!("Failed to create archive: {}", archive.display()))?;
    let mut writer = ZipWriter::new(BufWriter::new(file));

    for scanned in util::walk_files(source)? {
        let name = scanned.info.relative_path.as_str();
        writer
            .start_file(name, options)
            .with_context(|| format!("Failed to add {name} to archive"))?;
        let mut input = BufReader::new(
            File::open(&scanned.full_path)
                .with_context(|| format!("Failed to open file: {}", scanned.full_path.display()))?,
        );
        io::copy(&mut input, &mut writer).with_context(|| format!("Failed to compress {name}"))?;
    }

    writer
        .finish()
        .with_context(|| format!("Failed to finalize archive: {}", archive.display()))?;
    Ok(())
}

/// Unpack `archive` below `destination`. Entries that would escape the destination
/// are rejected.
pub fn decompress(destination: &Path, archive: &Path) -> Result<usize> {
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive: {}", archive.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).context("Failed to read zip archive")?;
    fs::create_dir_all(destination)
        .with_context(|| format!("Failed to create directory: {}", destination.display()))?;

    let mut extracted = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).context("Failed to read archive entry")?;
        let Some(relative) = entry.enclosed_name() else {
            bail!("Archive entry {} escapes the destination", entry.name());
        };
        let target = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
            continue;
        }

        crate::fsops::ensure_parent(&target)?;
        let mut output = BufWriter::new(
            File::create(&target)
                .with_context(|| format!("Failed to create file: {}", target.display()))?,
        );
        io::copy(&mut entry, &mut output)
            .with_context(|| format!("Failed to extract {}", target.display()))?;
        extracted += 1;
    }

    debug!(archive = %archive.display(), files = extracted, "Archive extracted");
    Ok(extracted)
}
