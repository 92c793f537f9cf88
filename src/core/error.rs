/// Custom error types for the download engine

/// Main error type for engine operations
///
/// Each variant corresponds to one error kind on the wire; `kind()` is
/// the stable string the UI matches on.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize)]
pub enum EngineError {
    /// Bad URL, disallowed host, bad path, malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Connect/read timeout, DNS, reset, TLS
    #[error("Network error: {0}")]
    Network(String),

    /// Non-retryable 4xx (other than 408/429), or exhausted retries on 5xx
    #[error("Server error: HTTP {status}: {message}")]
    Server { status: u16, message: String },

    /// Size mismatch, hash mismatch, resume checkpoint mismatch
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// ENOSPC, EACCES, rename failure and other filesystem trouble
    #[error("Disk error: {0}")]
    Disk(String),

    /// Illegal state transition, stale session callback, duplicate add
    #[error("State error: {0}")]
    State(String),

    /// User-initiated cancellation; silent on the UI side
    #[error("Cancelled")]
    Cancelled,

    /// Circuit breaker rejected the attempt without touching the network
    #[error("Circuit open for {0}")]
    CircuitOpen(String),
}

impl EngineError {
    /// Stable wire tag for this error kind
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Network(_) => "network",
            EngineError::Server { .. } => "server",
            EngineError::Integrity(_) => "integrity",
            EngineError::Disk(_) => "disk",
            EngineError::State(_) => "state",
            EngineError::Cancelled => "cancelled",
            EngineError::CircuitOpen(_) => "circuit_open",
        }
    }

    /// Whether a chunk/download attempt that failed with this error may
    /// be retried locally with backoff.
    ///
    /// 408 and 429 are the only retryable 4xx codes; 5xx is retryable
    /// until the attempt budget runs out.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Network(_) => true,
            EngineError::Server { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            EngineError::CircuitOpen(_) => true,
            EngineError::Validation(_)
            | EngineError::Integrity(_)
            | EngineError::Disk(_)
            | EngineError::State(_)
            | EngineError::Cancelled => false,
        }
    }

    /// Shorthand used when classifying HTTP status failures
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        EngineError::Server {
            status,
            message: message.into(),
        }
    }
}

/// Convert reqwest::Error to EngineError
impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            EngineError::Server {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            EngineError::Network(err.to_string())
        }
    }
}

/// Convert std::io::Error to EngineError
impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Disk(err.to_string())
    }
}

/// Convert rusqlite::Error to EngineError
///
/// Store failures surface as disk errors: the database lives on the same
/// volume as the downloads and fails for the same reasons.
impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Disk(err.to_string())
    }
}

/// Convert tokio::task::JoinError to EngineError
impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            EngineError::Cancelled
        } else {
            EngineError::State(err.to_string())
        }
    }
}
