/// Chunk planning
///
/// Maps a known total size onto a deterministic list of inclusive byte
/// ranges. The band table fixes the initial chunk count; sizes are
/// rounded up to a 64 KiB boundary and the last chunk absorbs the
/// remainder.
use crate::core::types::{CHUNK_ALIGN, SIMPLE_THRESHOLD};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// One planned range, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedChunk {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

/// Initial chunk count for a file of `total` bytes
///
/// Band table:
///   < 50 MB          -> 1 (simple downloader)
///   50 MB - 500 MB   -> 4
///   500 MB - 2 GB    -> 8
///   > 2 GB           -> 12
pub fn chunk_count(total: u64) -> u32 {
    if total < SIMPLE_THRESHOLD {
        1
    } else if total < 500 * MB {
        4
    } else if total <= 2 * GB {
        8
    } else {
        12
    }
}

/// Whether this size should use the simple downloader outright
pub fn wants_simple(total: u64) -> bool {
    chunk_count(total) == 1
}

/// Produce the range list for `total` bytes
///
/// Deterministic: same total, same plan. Returns an empty plan for a
/// zero-byte or simple-sized file.
pub fn plan(total: u64) -> Vec<PlannedChunk> {
    let count = chunk_count(total);
    if count <= 1 || total == 0 {
        return Vec::new();
    }

    // round the even split up to the alignment boundary
    let raw = total / count as u64;
    let chunk_size = raw.div_ceil(CHUNK_ALIGN) * CHUNK_ALIGN;

    let mut chunks = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    let mut index = 0u32;
    while start < total {
        let end = if index == count - 1 {
            // last chunk absorbs the remainder
            total - 1
        } else {
            std::cmp::min(start + chunk_size - 1, total - 1)
        };
        chunks.push(PlannedChunk { index, start, end });
        if end == total - 1 {
            break;
        }
        start = end + 1;
        index += 1;
    }
    chunks
}
