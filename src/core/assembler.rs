use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Chunk part assembly
///
/// Runs on a pool worker: concatenates completed chunk parts in index
/// order into a staging file, fsyncs, and renames atomically over the
/// final path. The cancel flag is honored between copy blocks so a
/// mid-merge cancel never leaves a half-written final file.
use crate::core::error::EngineError;
use crate::utils::filesystem;

/// Copy buffer for part concatenation
const COPY_BUF: usize = 1024 * 1024;

/// Merge `chunk_count` parts of `save_path` into the final file
///
/// Chunk parts are preserved on failure so a retry can reuse them; the
/// engine deletes them only after COMPLETED or on cancel.
pub fn merge_chunks(
    save_path: &Path,
    chunk_count: u32,
    expected_sizes: &[u64],
    total_bytes: Option<u64>,
    cancelled: &AtomicBool,
) -> Result<(), EngineError> {
    let target = filesystem::merge_target_path(save_path);

    if let Some(total) = total_bytes {
        // preallocation is best effort; a filesystem that cannot seek
        // past EOF still gets sequential writes below
        if let Err(e) = filesystem::allocate_sparse_file(&target, total) {
            debug!(path = ?target, error = %e, "Preallocation failed, writing sequentially");
        }
    }

    // write(true) without truncate keeps the preallocated extent
    let out = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(&target)
        .map_err(|e| EngineError::Disk(format!("create merge target: {e}")))?;
    let mut writer = BufWriter::with_capacity(COPY_BUF, out);
    let mut buffer = vec![0u8; COPY_BUF];
    let mut total_written = 0u64;

    for index in 0..chunk_count {
        if cancelled.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }
        let part_path = filesystem::chunk_part_path(save_path, index);
        let mut part = File::open(&part_path)
            .map_err(|e| EngineError::Disk(format!("open {}: {e}", part_path.display())))?;

        let part_len = part.metadata()?.len();
        if let Some(expected) = expected_sizes.get(index as usize) {
            if part_len != *expected {
                return Err(EngineError::Integrity(format!(
                    "chunk {index} part is {part_len} bytes, range is {expected}"
                )));
            }
        }

        let mut copied = 0u64;
        loop {
            if cancelled.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }
            let count = part.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            writer.write_all(&buffer[..count])?;
            copied += count as u64;
        }
        total_written += copied;
        debug!(chunk = index, bytes = copied, "Chunk part appended");
    }

    writer.flush()?;
    let out = writer
        .into_inner()
        .map_err(|e| EngineError::Disk(e.to_string()))?;
    // drop any stale preallocated or leftover tail past the payload
    out.set_len(total_written)?;
    if let Err(e) = out.sync_all() {
        debug!(error = %e, "fsync of merged file failed");
    }
    drop(out);

    filesystem::finalize(&target, save_path)?;
    info!(path = ?save_path, chunks = chunk_count, "Merge complete");
    Ok(())
}
