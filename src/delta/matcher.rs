use serde::{Deserialize, Serialize};

use super::signature::{RollingChecksum, Signature};

/// One instruction for rebuilding the new file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `len` bytes from the old file starting at `offset`.
    Copy { offset: u64, len: u64 },
    /// Bytes that exist only in the new file.
    Literal(Vec<u8>),
}

/// Accumulates ops, merging adjacent copies of contiguous old ranges and buffering
/// literal bytes until the next copy.
#[derive(Default)]
struct OpWriter {
    ops: Vec<DeltaOp>,
    pending: Vec<u8>,
}

impl OpWriter {
    fn literal(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn copy(&mut self, offset: u64, len: u64) {
        self.flush_literal();
        if let Some(DeltaOp::Copy {
            offset: prev_offset,
            len: prev_len,
        }) = self.ops.last_mut()
        {
            if *prev_offset + *prev_len == offset {
                *prev_len += len;
                return;
            }
        }
        self.ops.push(DeltaOp::Copy { offset, len });
    }

    fn flush_literal(&mut self) {
        if !self.pending.is_empty() {
            self.ops.push(DeltaOp::Literal(std::mem::take(&mut self.pending)));
        }
    }

    fn finish(mut self) -> Vec<DeltaOp> {
        self.flush_literal();
        self.ops
    }
}

/// Scan `new` with a rolling window and express it as copies of `old` blocks plus
/// literal runs.
pub fn compute_ops(signature: &Signature, new: &[u8]) -> Vec<DeltaOp> {
    let mut out = OpWriter::default();
    let width = signature.block_size();

    if signature.is_empty() || new.len() < width {
        out.literal(new);
        return out.finish();
    }

    let mut pos = 0usize;
    let mut checksum = RollingChecksum::of(&new[..width]);

    while pos + width <= new.len() {
        let window = &new[pos..pos + width];
        if let Some(block) = signature.find(checksum.value(), window) {
            out.copy(block.offset, width as u64);
            pos += width;
            if pos + width <= new.len() {
                checksum = RollingChecksum::of(&new[pos..pos + width]);
            }
            continue;
        }

        out.literal(&new[pos..pos + 1]);
        pos += 1;
        if pos + width <= new.len() {
            checksum.roll(new[pos - 1], new[pos + width - 1]);
        }
    }

    out.literal(&new[pos..]);
    out.finish()
}
