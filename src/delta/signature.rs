use std::collections::HashMap;

/// Weak checksum over a sliding window, in the style of rsync: `a` is the plain byte
/// sum and `b` weights each byte by its distance from the window end. Both halves are
/// kept modulo 2^16 so the window can move one byte at a time in O(1).
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    pub fn of(window: &[u8]) -> Self {
        let len = window.len() as u32;
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        for (i, &byte) in window.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((len - i as u32).wrapping_mul(byte as u32));
        }
        Self {
            a: a & 0xffff,
            b: b & 0xffff,
            len,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let outgoing = outgoing as u32;
        let incoming = incoming as u32;
        self.a = self.a.wrapping_sub(outgoing).wrapping_add(incoming) & 0xffff;
        self.b = self
            .b
            .wrapping_sub(self.len.wrapping_mul(outgoing))
            .wrapping_add(self.a)
            & 0xffff;
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[derive(Debug, Clone)]
pub struct BlockSignature {
    pub weak: u32,
    pub strong: blake3::Hash,
    pub offset: u64,
}

/// Per-block checksums of the old file, indexed by weak checksum. Computed in memory
/// whenever a delta is built; never written to disk.
#[derive(Debug)]
pub struct Signature {
    block_size: usize,
    blocks: Vec<BlockSignature>,
    by_weak: HashMap<u32, Vec<usize>>,
}

pub const MIN_BLOCK_SIZE: usize = 512;
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Block size grows with the square root of the file so large files keep a
/// manageable signature, rounded to a multiple of 64.
pub fn block_size_for(len: usize) -> usize {
    let root = (len as f64).sqrt() as usize;
    (root.next_multiple_of(64)).clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
}

impl Signature {
    pub fn compute(data: &[u8]) -> Self {
        Self::with_block_size(data, block_size_for(data.len()))
    }

    /// Only full blocks are indexed; a short tail can never match a full window.
    pub fn with_block_size(data: &[u8], block_size: usize) -> Self {
        let blocks: Vec<BlockSignature> = data
            .chunks_exact(block_size)
            .enumerate()
            .map(|(i, block)| BlockSignature {
                weak: RollingChecksum::of(block).value(),
                strong: blake3::hash(block),
                offset: (i * block_size) as u64,
            })
            .collect();

        let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::with_capacity(blocks.len());
        for (idx, block) in blocks.iter().enumerate() {
            by_weak.entry(block.weak).or_default().push(idx);
        }

        Self {
            block_size,
            blocks,
            by_weak,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Find an old block with the same content as `window`. The strong hash is only
    /// computed when the weak checksum has candidates.
    pub fn find(&self, weak: u32, window: &[u8]) -> Option<&BlockSignature> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = blake3::hash(window);
        candidates
            .iter()
            .map(|&idx| &self.blocks[idx])
            .find(|block| block.strong == strong)
    }
}
