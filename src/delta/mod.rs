//! Binary delta codec for single files.
//!
//! A delta file is `SPDELTA1` followed by a zstd-compressed bincode [`Delta`]. The
//! delta carries the BLAKE3 hash and length of the file it rebuilds, and
//! [`apply_delta`] refuses to produce anything else.

mod apply;
mod matcher;
mod signature;

pub use matcher::DeltaOp;
pub use signature::{RollingChecksum, Signature};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::util;

pub const MAGIC: &[u8; 8] = b"SPDELTA1";
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Serialize, Deserialize)]
pub struct Delta {
    pub target_hash: [u8; 32],
    pub target_len: u64,
    pub ops: Vec<DeltaOp>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub copied: u64,
    pub literal: u64,
}

impl Delta {
    pub fn between(old: &[u8], new: &[u8]) -> Self {
        let ops = if old.is_empty() {
            vec![DeltaOp::Literal(new.to_vec())]
        } else {
            matcher::compute_ops(&Signature::compute(old), new)
        };
        Self::from_ops(new, ops)
    }

    /// A delta that ignores the old file entirely.
    pub fn literal(new: &[u8]) -> Self {
        Self::from_ops(new, vec![DeltaOp::Literal(new.to_vec())])
    }

    fn from_ops(new: &[u8], ops: Vec<DeltaOp>) -> Self {
        Self {
            target_hash: util::hash_bytes(new),
            target_len: new.len() as u64,
            ops,
        }
    }

    pub fn stats(&self) -> DeltaStats {
        self.ops.iter().fold(DeltaStats::default(), |mut acc, op| {
            match op {
                DeltaOp::Copy { len, .. } => acc.copied += len,
                DeltaOp::Literal(data) => acc.literal += data.len() as u64,
            }
            acc
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let encoded = bincode::serialize(self).context("Failed to serialize delta")?;
        let compressed =
            zstd::bulk::compress(&encoded, ZSTD_LEVEL).context("Failed to compress delta")?;

        let mut file = File::create(path)
            .with_context(|| format!("Failed to create delta file: {}", path.display()))?;
        file.write_all(MAGIC)?;
        file.write_all(&compressed)?;
        file.flush()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = util::mmap_file(path)?;
        if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
            bail!("Invalid delta file {}: missing magic header", path.display());
        }
        let decoder =
            zstd::Decoder::new(&raw[MAGIC.len()..]).context("Failed to create zstd decoder")?;
        bincode::deserialize_from(decoder)
            .with_context(|| format!("Failed to decode delta file: {}", path.display()))
    }
}

/// Already-compressed formats gain nothing from block matching.
pub fn is_incompressible(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "avif"
                | "mp4" | "mkv" | "webm" | "mov"
                | "mp3" | "ogg" | "flac" | "opus"
                | "zip" | "gz" | "xz" | "zst" | "7z" | "rar"
                | "woff2" | "pdf"
        )
    )
}

/// Run `f` over the bytes of a file. Empty files are not mapped.
fn with_contents<R>(path: &Path, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
    let len = std::fs::metadata(path)
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(f(&[]));
    }
    let map = util::mmap_file(path)?;
    Ok(f(&map))
}

/// Write the delta that turns `old` into `new` to `delta_out`.
pub fn build_delta(old: &Path, new: &Path, delta_out: &Path) -> Result<DeltaStats> {
    let delta = if is_incompressible(new) {
        with_contents(new, Delta::literal)?
    } else {
        with_contents(old, |old_bytes| {
            with_contents(new, |new_bytes| Delta::between(old_bytes, new_bytes))
        })??
    };
    delta.write_to(delta_out)?;
    Ok(delta.stats())
}

/// Rebuild `new_out` from `old` and the delta file. The output is checked against the
/// hash carried by the delta and removed when it does not match.
pub fn apply_delta(old: &Path, delta: &Path, new_out: &Path) -> Result<()> {
    let delta = Delta::read_from(delta)?;

    let file = File::create(new_out)
        .with_context(|| format!("Failed to create output file: {}", new_out.display()))?;
    let mut writer = HashingWriter {
        inner: BufWriter::new(file),
        hasher: blake3::Hasher::new(),
    };

    let written = with_contents(old, |old_bytes| {
        apply::reconstruct(old_bytes, &delta.ops, &mut writer)
    })
    .and_then(|r| r)
    .and_then(|written| {
        writer.inner.flush()?;
        Ok(written)
    });

    let written = match written {
        Ok(written) => written,
        Err(e) => {
            drop(writer);
            let _ = std::fs::remove_file(new_out);
            return Err(e.context(format!("Failed to apply delta to {}", old.display())));
        }
    };

    let actual = writer.hasher.finalize();
    drop(writer);
    if written != delta.target_len || *actual.as_bytes() != delta.target_hash {
        let _ = std::fs::remove_file(new_out);
        bail!(
            "Patched file {} does not match: expected {} ({} bytes), got {} ({} bytes)",
            new_out.display(),
            blake3::Hash::from(delta.target_hash).to_hex(),
            delta.target_len,
            actual.to_hex(),
            written
        );
    }
    Ok(())
}

struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
