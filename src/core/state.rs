use serde::{Deserialize, Serialize};
/// Download state management
///
/// This module defines the canonical state machines for downloads and
/// chunks. Every durable transition goes through `can_transition`; the
/// store rejects anything the table does not allow.

/// Download state enum - represents all possible states a download can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    /// Waiting for the scheduler to pick it up
    Queued,
    /// Probe and plan in progress, no payload bytes yet
    Starting,
    /// Payload bytes are being transferred
    Downloading,
    /// Halted by the user or by a pending overwrite confirmation
    Paused,
    /// Chunk parts are being concatenated into the final file
    Merging,
    /// Assembled file is being checked against declared size/hash
    Verifying,
    /// Finished; final file is in place
    Completed,
    /// Ended with an error; retry re-queues it
    Failed,
    /// Removed by the user; artifacts deleted
    Cancelled,
}

impl DownloadState {
    /// Allowed transitions out of this state
    pub fn allowed_next(&self) -> &'static [DownloadState] {
        use DownloadState::*;
        match self {
            Queued => &[Starting, Cancelled, Paused],
            Starting => &[Downloading, Paused, Failed, Cancelled],
            Downloading => &[Paused, Merging, Verifying, Failed, Cancelled, Completed],
            Paused => &[Queued, Starting, Cancelled, Failed],
            Merging => &[Verifying, Completed, Failed, Cancelled],
            Verifying => &[Completed, Failed, Cancelled],
            Completed => &[],
            Failed => &[Queued, Cancelled],
            Cancelled => &[],
        }
    }

    /// Check whether the table permits `self -> next`
    pub fn can_transition(&self, next: DownloadState) -> bool {
        self.allowed_next().contains(&next)
    }

    /// Check if download is in a terminal state (no further action possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Completed | DownloadState::Cancelled)
    }

    /// Check if download currently owns network or disk activity
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DownloadState::Starting
                | DownloadState::Downloading
                | DownloadState::Merging
                | DownloadState::Verifying
        )
    }

    /// Check if download can be resumed from this state
    pub fn can_resume(&self) -> bool {
        matches!(self, DownloadState::Paused)
    }

    /// Serialized form used in the database and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Queued => "queued",
            DownloadState::Starting => "starting",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Merging => "merging",
            DownloadState::Verifying => "verifying",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        }
    }

    /// Parse the serialized form back; unknown strings are a state error
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => DownloadState::Queued,
            "starting" => DownloadState::Starting,
            "downloading" => DownloadState::Downloading,
            "paused" => DownloadState::Paused,
            "merging" => DownloadState::Merging,
            "verifying" => DownloadState::Verifying,
            "completed" => DownloadState::Completed,
            "failed" => DownloadState::Failed,
            "cancelled" => DownloadState::Cancelled,
            _ => return None,
        })
    }
}

/// Chunk state enum - lifecycle of a single byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// Not yet picked up by a worker
    Pending,
    /// A worker is streaming bytes into the part file
    Downloading,
    /// Full range written and flushed
    Completed,
    /// Exhausted its retries
    Failed,
    /// Suspended with a valid tail-hash checkpoint
    Paused,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::Downloading => "downloading",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
            ChunkState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => ChunkState::Pending,
            "downloading" => ChunkState::Downloading,
            "completed" => ChunkState::Completed,
            "failed" => ChunkState::Failed,
            "paused" => ChunkState::Paused,
            _ => return None,
        })
    }
}

/// Error code stored alongside a `Paused` download that is waiting for
/// the user to confirm an overwrite. Kept as a code instead of a tenth
/// state so the UI renders an "awaiting" badge without a new state.
pub const AWAIT_OVERWRITE: &str = "AWAIT_OVERWRITE";
