use chrono::{DateTime, Utc};
/// Core download engine types and constants
use serde::{Deserialize, Serialize};

use crate::core::state::{ChunkState, DownloadState};

/// Number of trailing part-file bytes covered by the resume checkpoint
pub const TAIL_HASH_LEN: u64 = 65536;

/// Chunk sizes are rounded up to this boundary
pub const CHUNK_ALIGN: u64 = 64 * 1024;

/// Files below this size always use the simple downloader
pub const SIMPLE_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Minimum interval between durable progress flushes per download
pub const PROGRESS_FLUSH_MS: u64 = 500;

/// Download priority, low to high; ties broken by insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
}

impl Priority {
    pub fn from_i64(v: i64) -> Option<Self> {
        Some(match v {
            1 => Priority::Low,
            2 => Priority::Normal,
            3 => Priority::High,
            _ => return None,
        })
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Transfer mode, decided once at start from the probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// One streamed GET into `<name>.part`
    Simple,
    /// Parallel ranged GETs into a staging directory
    Chunked,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Simple => "simple",
            TransferMode::Chunked => "chunked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "simple" => TransferMode::Simple,
            "chunked" => TransferMode::Chunked,
            _ => return None,
        })
    }
}

/// Durable download row
///
/// The engine exclusively owns these rows; external code reads snapshots
/// but never mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    /// Monotonic integer id, >= 1
    pub id: i64,

    /// Source URL (https, allow-listed host)
    pub url: String,

    /// Absolute final path, pre-validated at add
    pub save_path: String,

    /// Total file size in bytes; None until headers or probe resolve it
    pub total_bytes: Option<u64>,

    /// Bytes confirmed written so far
    pub downloaded_bytes: u64,

    /// Current state in the canonical machine
    pub state: DownloadState,

    /// Scheduling priority
    pub priority: Priority,

    /// Transfer mode; None before the first start
    pub mode: Option<TransferMode>,

    /// Declared hash from the catalog (sha-256 hex), if any
    pub expected_sha256: Option<String>,

    /// Last human-readable error message
    pub error_message: Option<String>,

    /// Error kind tag matching `EngineError::kind`, or a marker code
    /// such as AWAIT_OVERWRITE
    pub error_code: Option<String>,

    /// When the row was created
    pub created_at: DateTime<Utc>,

    /// When any column last changed
    pub updated_at: DateTime<Utc>,

    /// When `state` last changed
    pub state_changed_at: DateTime<Utc>,
}

impl Download {
    /// Progress as a percentage; 0 while the size is unknown
    pub fn progress_percent(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.downloaded_bytes as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// File name component of the save path
    pub fn save_name(&self) -> String {
        std::path::Path::new(&self.save_path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.save_path.clone())
    }
}

/// Durable chunk row; only present while mode is chunked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub download_id: i64,
    pub chunk_index: u32,

    /// Inclusive byte range; ranges partition [0, total_bytes - 1]
    pub start_byte: u64,
    pub end_byte: u64,

    pub state: ChunkState,

    /// Bytes written to the part file, in [0, end - start + 1]
    pub written_bytes: u64,

    /// Network attempts so far
    pub attempts: u32,

    /// sha-256 of the last TAIL_HASH_LEN bytes on disk, set on clean
    /// suspension and checked before resuming
    pub tail_hash: Option<String>,
}

impl Chunk {
    /// Total length of the range in bytes
    pub fn range_len(&self) -> u64 {
        self.end_byte - self.start_byte + 1
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Completed
    }
}

/// Append-only attempt log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub download_id: i64,
    /// None for whole-download attempts (simple mode, probe)
    pub chunk_index: Option<u32>,
    pub attempt_number: u32,
    pub error_text: String,
    pub error_code: String,
    pub bytes_transferred: u64,
    pub timestamp: DateTime<Utc>,
}

/// Row shape handed to the UI in snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub id: i64,
    pub url: String,
    pub save_path: String,
    pub state: DownloadState,
    pub priority: Priority,
    pub mode: Option<TransferMode>,
    pub total_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub percent: f64,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Atomic queue snapshot: version plus summaries
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub version: u64,
    pub items: Vec<DownloadSummary>,
}

/// Aggregate per-state counts for the UI sidebar
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSummary {
    pub queued: u64,
    pub starting: u64,
    pub downloading: u64,
    pub paused: u64,
    pub merging: u64,
    pub verifying: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Validated add request, produced at the bus boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRequest {
    /// Explicit id supplied by the catalog/romset builder; None lets the
    /// store assign the next id
    pub id: Option<i64>,
    pub url: String,
    pub save_path: String,
    pub total_bytes_hint: Option<u64>,
    pub priority: Option<Priority>,
    pub expected_sha256: Option<String>,
}
