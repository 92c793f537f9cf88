use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info};

/// Download integrity verification
///
/// Two duties: the post-merge check of the assembled file against the
/// catalog's declared size/hash, and the tail-hash checkpoints that
/// validate partial-resume of chunk part files.
use crate::core::error::EngineError;
use crate::core::types::TAIL_HASH_LEN;

/// What the catalog declared about the file, if anything
#[derive(Debug, Clone, Default)]
pub struct Expected {
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// Verify the assembled file against declared size and hash
///
/// A missing declared value skips that check; a mismatch is an
/// integrity failure that ends the download.
pub fn verify_file(path: &Path, expected: &Expected) -> Result<(), EngineError> {
    let meta = std::fs::metadata(path)?;

    if let Some(size) = expected.size {
        if meta.len() != size {
            return Err(EngineError::Integrity(format!(
                "size mismatch: expected {size} bytes, found {}",
                meta.len()
            )));
        }
    }

    if let Some(declared) = &expected.sha256 {
        let actual = sha256_of(path)?;
        if !actual.eq_ignore_ascii_case(declared) {
            return Err(EngineError::Integrity(format!(
                "sha256 mismatch: expected {declared}, found {actual}"
            )));
        }
    }

    info!(path = ?path, size = meta.len(), "Integrity check passed");
    Ok(())
}

/// sha-256 of a whole file, lowercase hex
pub fn sha256_of(path: &Path) -> Result<String, EngineError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Checkpoint hash over the last TAIL_HASH_LEN bytes of a part file
///
/// Files shorter than the window hash their full contents. Returns None
/// for an empty or missing file, which callers treat as "no checkpoint".
pub fn tail_hash(path: &Path) -> Result<Option<String>, EngineError> {
    tail_hash_at(path, u64::MAX)
}

/// Decide whether a part file may resume from its recorded progress
///
/// The on-disk length must be at least the recorded count and the
/// checkpoint must match the stored one; anything else restarts the
/// chunk from zero.
pub fn checkpoint_matches(
    path: &Path,
    recorded_bytes: u64,
    stored_hash: Option<&str>,
) -> Result<bool, EngineError> {
    if recorded_bytes == 0 {
        return Ok(false);
    }
    let Some(stored) = stored_hash else {
        return Ok(false);
    };
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(false),
    };
    if len < recorded_bytes {
        debug!(path = ?path, len, recorded_bytes, "Part shorter than recorded progress");
        return Ok(false);
    }
    // hash the window that ends at the recorded byte count; bytes past
    // it (a torn trailing write) are truncated away by the caller
    let actual = tail_hash_at(path, recorded_bytes)?;
    Ok(actual.as_deref() == Some(stored))
}

/// Tail hash of the first `upto` bytes of a part file
pub fn tail_hash_at(path: &Path, upto: u64) -> Result<Option<String>, EngineError> {
    if upto == 0 {
        return Ok(None);
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len().min(upto);
    if len == 0 {
        return Ok(None);
    }
    let window = len.min(TAIL_HASH_LEN);
    file.seek(SeekFrom::Start(len - window))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut remaining = window as usize;
    while remaining > 0 {
        let want = remaining.min(buffer.len());
        let count = file.read(&mut buffer[..want])?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
        remaining -= count;
    }
    Ok(Some(format!("{:x}", hasher.finalize())))
}
