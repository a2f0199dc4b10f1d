use anyhow::{bail, Result};
use std::io::Write;

use super::matcher::DeltaOp;

/// Replay `ops` against `old`, streaming the rebuilt file into `out`.
/// Copies that point outside `old` are rejected instead of panicking, since the
/// delta comes from disk and may be damaged.
pub fn reconstruct<W: Write>(old: &[u8], ops: &[DeltaOp], out: &mut W) -> Result<u64> {
    let mut written = 0u64;
    for op in ops {
        let bytes = match op {
            DeltaOp::Copy { offset, len } => {
                let start = usize::try_from(*offset)?;
                let end = start
                    .checked_add(usize::try_from(*len)?)
                    .filter(|end| *end <= old.len());
                match end {
                    Some(end) => &old[start..end],
                    None => bail!(
                        "Delta copies {len} bytes at {offset}, beyond the {} byte source",
                        old.len()
                    ),
                }
            }
            DeltaOp::Literal(data) => data.as_slice(),
        };
        out.write_all(bytes)?;
        written += bytes.len() as u64;
    }
    Ok(written)
}
