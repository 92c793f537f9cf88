use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
/// Session token management
///
/// Every logical run of a download gets a fresh token; all tasks spawned
/// for that run capture it. Pause/cancel invalidates the token, so a late
/// HTTP response or timer callback that still holds the old one becomes a
/// no-op instead of mutating state the user already moved past.
use uuid::Uuid;

/// Opaque per-run token; cheap to clone and compare
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    fn fresh() -> Self {
        SessionToken(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Default)]
pub struct SessionManager {
    current: Mutex<HashMap<i64, SessionToken>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new token for a download, invalidating any previous one
    pub fn issue(&self, download_id: i64) -> SessionToken {
        let token = SessionToken::fresh();
        let mut current = self.current.lock().unwrap();
        current.insert(download_id, token.clone());
        debug!(download_id, session = %token.as_str(), "Issued session token");
        token
    }

    /// Check whether `token` is still the live session for the download
    pub fn is_current(&self, download_id: i64, token: &SessionToken) -> bool {
        let current = self.current.lock().unwrap();
        current.get(&download_id) == Some(token)
    }

    /// Invalidate the live session, turning all of its pending callbacks
    /// into no-ops
    pub fn invalidate(&self, download_id: i64) {
        let mut current = self.current.lock().unwrap();
        if current.remove(&download_id).is_some() {
            debug!(download_id, "Session invalidated");
        }
    }

    /// Invalidate every session; used on shutdown and pause-all
    pub fn invalidate_all(&self) {
        self.current.lock().unwrap().clear();
    }
}
