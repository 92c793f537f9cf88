/// File system utilities for download management
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::error::EngineError;

/// Staging directory suffix for chunked downloads
const STAGING_SUFFIX: &str = ".dpnh";

/// Staging directory for a chunked download: `<dir>/.<name>.dpnh/`
pub fn staging_dir(save_path: &Path) -> PathBuf {
    let name = save_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = save_path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{name}{STAGING_SUFFIX}"))
}

/// Part file for one chunk: `<staging>/chunk-0000.part`
pub fn chunk_part_path(save_path: &Path, chunk_index: u32) -> PathBuf {
    staging_dir(save_path).join(format!("chunk-{chunk_index:04}.part"))
}

/// Part file for a simple download: `<dir>/<name>.part`
pub fn simple_part_path(save_path: &Path) -> PathBuf {
    let name = save_path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = save_path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{name}.part"))
}

/// Staging-side merge target, renamed over the final path when done
pub fn merge_target_path(save_path: &Path) -> PathBuf {
    staging_dir(save_path).join("merged.part")
}

/// Allocates a sparse file of the given size
///
/// Seeks to the end and writes a single byte, reserving the range
/// without writing zeros through it.
pub fn allocate_sparse_file(path: &Path, size: u64) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    if size > 0 {
        file.seek(SeekFrom::Start(size - 1))?;
        file.write_all(&[0])?;
    }
    Ok(())
}

/// Directories a save path may never live in or under
fn reserved_roots() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        vec![
            PathBuf::from(r"C:\Windows"),
            PathBuf::from(r"C:\Program Files"),
            PathBuf::from(r"C:\Program Files (x86)"),
        ]
    }
    #[cfg(not(windows))]
    {
        vec![
            PathBuf::from("/bin"),
            PathBuf::from("/boot"),
            PathBuf::from("/dev"),
            PathBuf::from("/etc"),
            PathBuf::from("/lib"),
            PathBuf::from("/proc"),
            PathBuf::from("/sbin"),
            PathBuf::from("/sys"),
            PathBuf::from("/usr"),
            PathBuf::from("/var"),
        ]
    }
}

/// Validate a save path: absolute, named, outside reserved OS directories
pub fn validate_save_path(path: &Path) -> Result<(), EngineError> {
    if !path.is_absolute() {
        return Err(EngineError::Validation(format!(
            "save path must be absolute: {}",
            path.display()
        )));
    }
    let Some(name) = path.file_name().map(|s| s.to_string_lossy().to_string()) else {
        return Err(EngineError::Validation(format!(
            "save path has no file name: {}",
            path.display()
        )));
    };
    if sanitize_filename::sanitize(&name).is_empty() {
        return Err(EngineError::Validation(format!(
            "save name empty after sanitization: {name}"
        )));
    }
    for root in reserved_roots() {
        if path == root || path.starts_with(&root) {
            return Err(EngineError::Validation(format!(
                "save path under reserved directory {}: {}",
                root.display(),
                path.display()
            )));
        }
    }
    Ok(())
}

/// fsync (best effort) and atomically rename into the final path
pub fn finalize(from: &Path, to: &Path) -> Result<(), EngineError> {
    if let Ok(file) = File::open(from) {
        if let Err(e) = file.sync_all() {
            warn!(path = ?from, error = %e, "fsync before rename failed");
        }
    }
    std::fs::rename(from, to).map_err(|e| {
        EngineError::Disk(format!(
            "rename {} -> {}: {e}",
            from.display(),
            to.display()
        ))
    })?;
    debug!(path = ?to, "Finalized file in place");
    Ok(())
}

/// Remove the staging directory and simple part file of a download
///
/// Used by cancel and remove; pause keeps everything.
pub fn cleanup_artifacts(save_path: &Path) {
    let staging = staging_dir(save_path);
    if staging.exists() {
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            warn!(path = ?staging, error = %e, "Failed to remove staging directory");
        }
    }
    let part = simple_part_path(save_path);
    if part.exists() {
        if let Err(e) = std::fs::remove_file(&part) {
            warn!(path = ?part, error = %e, "Failed to remove part file");
        }
    }
}

/// Size and mtime of an existing target, for the overwrite prompt
pub fn existing_file_info(path: &Path) -> Option<(u64, Option<String>)> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta
        .modified()
        .ok()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339());
    Some((meta.len(), modified))
}
