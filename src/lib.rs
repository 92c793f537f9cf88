// Module declarations
pub mod bus;
pub mod config;
pub mod core;
pub mod network;
pub mod utils;

#[cfg(test)]
mod testsupport;

// Public surface re-exports
pub use crate::bus::EngineBus;
pub use crate::config::{BreakerMode, EngineConfig};
pub use crate::core::engine::{DownloadEngine, SessionMetrics};
pub use crate::core::error::EngineError;
pub use crate::core::events::EngineEvent;
pub use crate::core::state::{ChunkState, DownloadState};
pub use crate::core::types::{
    AddRequest, Download, DownloadSummary, Priority, Snapshot, TransferMode,
};
