use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Request/response boundary
///
/// The UI shell talks to the engine through JSON-shaped calls. Every
/// call is parsed into a typed `Request` up front; handlers only ever
/// see validated data. Every response is an envelope:
/// `{ok: true, data}` or `{ok: false, error: {kind, message}}`.
use crate::core::engine::DownloadEngine;
use crate::core::error::EngineError;
use crate::core::events::EngineEvent;
use crate::core::state::DownloadState;
use crate::core::types::{AddRequest, Priority};

/// A fully validated operation, ready to dispatch
#[derive(Debug)]
pub enum Request {
    Add(AddRequest),
    Pause { id: i64 },
    PauseAll,
    Resume { id: i64 },
    ResumeAll,
    Cancel { id: i64 },
    CancelAll,
    Retry { id: i64 },
    Remove { id: i64 },
    ConfirmOverwrite { id: i64, accept: bool },
    SetPriority { id: i64, priority: Priority },
    Snapshot { min_version: Option<u64> },
    List { state: DownloadState, limit: usize },
    Summary,
    SessionMetrics,
    Debug { id: i64 },
}

impl Request {
    /// Parse a wire call; anything malformed is a validation error
    pub fn parse(method: &str, params: &Value) -> Result<Self, EngineError> {
        match method {
            "engine.add" => Ok(Request::Add(parse_add(params)?)),
            "engine.pause" => Ok(Request::Pause { id: require_id(params)? }),
            "engine.pause_all" => Ok(Request::PauseAll),
            "engine.resume" => Ok(Request::Resume { id: require_id(params)? }),
            "engine.resume_all" => Ok(Request::ResumeAll),
            "engine.cancel" => Ok(Request::Cancel { id: require_id(params)? }),
            "engine.cancel_all" => Ok(Request::CancelAll),
            "engine.retry" => Ok(Request::Retry { id: require_id(params)? }),
            "engine.remove" => Ok(Request::Remove { id: require_id(params)? }),
            "engine.confirm_overwrite" => Ok(Request::ConfirmOverwrite {
                id: require_id(params)?,
                accept: params
                    .get("accept")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| EngineError::Validation("accept must be a bool".into()))?,
            }),
            "engine.set_priority" => Ok(Request::SetPriority {
                id: require_id(params)?,
                priority: parse_priority(
                    params
                        .get("priority")
                        .ok_or_else(|| EngineError::Validation("priority is required".into()))?,
                )?,
            }),
            "engine.snapshot" => Ok(Request::Snapshot {
                min_version: params.get("min_version").and_then(Value::as_u64),
            }),
            "engine.list" => {
                let state = params
                    .get("state")
                    .and_then(Value::as_str)
                    .and_then(DownloadState::parse)
                    .ok_or_else(|| EngineError::Validation("unknown state filter".into()))?;
                let limit = params
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(100) as usize;
                Ok(Request::List { state, limit })
            }
            "engine.summary" => Ok(Request::Summary),
            "engine.session_metrics" => Ok(Request::SessionMetrics),
            "engine.debug" => Ok(Request::Debug { id: require_id(params)? }),
            other => Err(EngineError::Validation(format!("unknown method {other}"))),
        }
    }
}

fn require_id(params: &Value) -> Result<i64, EngineError> {
    params
        .get("id")
        .and_then(Value::as_i64)
        .filter(|id| *id >= 1)
        .ok_or_else(|| EngineError::Validation("id must be an integer >= 1".into()))
}

fn parse_priority(value: &Value) -> Result<Priority, EngineError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(Priority::from_i64)
            .ok_or_else(|| EngineError::Validation("priority must be 1..=3".into())),
        Value::String(s) => match s.as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            _ => Err(EngineError::Validation(format!("unknown priority {s}"))),
        },
        _ => Err(EngineError::Validation("priority must be 1..=3".into())),
    }
}

fn parse_add(params: &Value) -> Result<AddRequest, EngineError> {
    let url = params
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Validation("url is required".into()))?
        .to_string();
    let save_path = params
        .get("save_path")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Validation("save_path is required".into()))?
        .to_string();
    let id = match params.get("id") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_i64()
                .filter(|id| *id >= 1)
                .ok_or_else(|| EngineError::Validation("id must be an integer >= 1".into()))?,
        ),
    };
    let priority = match params.get("priority") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_priority(v)?),
    };
    let total_bytes_hint = params.get("total_bytes").and_then(Value::as_u64);
    let expected_sha256 = params
        .get("sha256")
        .and_then(Value::as_str)
        .map(|s| s.to_ascii_lowercase());

    Ok(AddRequest {
        id,
        url,
        save_path,
        total_bytes_hint,
        priority,
        expected_sha256,
    })
}

/// Dispatches validated requests against one engine
pub struct EngineBus {
    engine: Arc<DownloadEngine>,
}

impl EngineBus {
    pub fn new(engine: Arc<DownloadEngine>) -> Self {
        Self { engine }
    }

    /// Handle one wire call from `channel`
    ///
    /// Never returns an Err: failures come back inside the envelope.
    pub fn handle(&self, channel: &str, method: &str, params: &Value) -> Value {
        if !self.engine.limiters().ipc.allow(channel) {
            warn!(channel, method, "IPC call rate limited");
            return error_envelope(&EngineError::Validation(format!(
                "rate limit exceeded for channel {channel}"
            )));
        }
        debug!(channel, method, "Bus call");
        let request = match Request::parse(method, params) {
            Ok(request) => request,
            Err(err) => return error_envelope(&err),
        };
        match self.dispatch(request) {
            Ok(data) => json!({ "ok": true, "data": data }),
            Err(err) => error_envelope(&err),
        }
    }

    fn dispatch(&self, request: Request) -> Result<Value, EngineError> {
        let engine = &self.engine;
        match request {
            Request::Add(req) => {
                let id = engine.add(req)?;
                Ok(json!({ "id": id }))
            }
            Request::Pause { id } => {
                engine.pause(id)?;
                Ok(Value::Null)
            }
            Request::PauseAll => {
                let count = engine.pause_all()?;
                Ok(json!({ "paused": count }))
            }
            Request::Resume { id } => {
                engine.resume(id)?;
                Ok(Value::Null)
            }
            Request::ResumeAll => {
                let count = engine.resume_all()?;
                Ok(json!({ "resumed": count }))
            }
            Request::Cancel { id } => {
                engine.cancel(id)?;
                Ok(Value::Null)
            }
            Request::CancelAll => {
                let count = engine.cancel_all()?;
                Ok(json!({ "cancelled": count }))
            }
            Request::Retry { id } => {
                engine.retry(id)?;
                Ok(Value::Null)
            }
            Request::Remove { id } => {
                engine.remove(id)?;
                Ok(Value::Null)
            }
            Request::ConfirmOverwrite { id, accept } => {
                engine.confirm_overwrite(id, accept)?;
                Ok(Value::Null)
            }
            Request::SetPriority { id, priority } => {
                engine.set_priority(id, priority)?;
                Ok(Value::Null)
            }
            Request::Snapshot { min_version } => match engine.snapshot(min_version)? {
                Some(snapshot) => Ok(serde_json::to_value(snapshot)
                    .map_err(|e| EngineError::State(e.to_string()))?),
                None => Ok(Value::Null),
            },
            Request::List { state, limit } => {
                let items = engine.list(state, limit)?;
                Ok(serde_json::to_value(items).map_err(|e| EngineError::State(e.to_string()))?)
            }
            Request::Summary => {
                let summary = engine.summary()?;
                Ok(serde_json::to_value(summary).map_err(|e| EngineError::State(e.to_string()))?)
            }
            Request::SessionMetrics => {
                let metrics = engine.session_metrics();
                Ok(serde_json::to_value(metrics).map_err(|e| EngineError::State(e.to_string()))?)
            }
            Request::Debug { id } => {
                let dump = engine.debug(id)?;
                Ok(serde_json::to_value(dump).map_err(|e| EngineError::State(e.to_string()))?)
            }
        }
    }
}

fn error_envelope(err: &EngineError) -> Value {
    json!({
        "ok": false,
        "error": { "kind": err.kind(), "message": err.to_string() }
    })
}

/// Serialize an event for the push side of the boundary
pub fn event_to_wire(event: &EngineEvent) -> (&'static str, Value) {
    let payload = serde_json::to_value(event).unwrap_or(Value::Null);
    (event.name(), payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::store::StateStore;
    use tempfile::tempdir;

    fn bus() -> EngineBus {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let engine = DownloadEngine::with_store_for_test(EngineConfig::default(), store);
        EngineBus::new(engine)
    }

    #[test]
    fn test_parse_add() {
        let request = Request::parse(
            "engine.add",
            &json!({
                "url": "https://files.example.org/a.bin",
                "save_path": "/downloads/a.bin",
                "total_bytes": 1000,
                "priority": 3,
                "sha256": "ABCDEF"
            }),
        )
        .unwrap();
        let Request::Add(req) = request else {
            panic!("wrong variant");
        };
        assert_eq!(req.url, "https://files.example.org/a.bin");
        assert_eq!(req.total_bytes_hint, Some(1000));
        assert_eq!(req.priority, Some(Priority::High));
        assert_eq!(req.expected_sha256.as_deref(), Some("abcdef"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Request::parse("engine.add", &json!({})).is_err());
        assert!(Request::parse("engine.pause", &json!({})).is_err());
        assert!(Request::parse("engine.pause", &json!({"id": 0})).is_err());
        assert!(Request::parse("engine.pause", &json!({"id": "seven"})).is_err());
        assert!(Request::parse("engine.confirm_overwrite", &json!({"id": 1})).is_err());
        assert!(Request::parse("engine.list", &json!({"state": "bogus"})).is_err());
        assert!(Request::parse("engine.nope", &json!({})).is_err());
    }

    #[test]
    fn test_parse_priority_forms() {
        assert_eq!(parse_priority(&json!(1)).unwrap(), Priority::Low);
        assert_eq!(parse_priority(&json!("high")).unwrap(), Priority::High);
        assert!(parse_priority(&json!(7)).is_err());
        assert!(parse_priority(&json!("urgent")).is_err());
    }

    #[tokio::test]
    async fn test_envelope_shapes() {
        let bus = bus();
        let dir = tempdir().unwrap();
        let save = dir.path().join("a.bin");

        let response = bus.handle(
            "ui",
            "engine.add",
            &json!({
                "url": "https://files.example.org/a.bin",
                "save_path": save.to_string_lossy(),
            }),
        );
        assert_eq!(response["ok"], json!(true));
        let id = response["data"]["id"].as_i64().unwrap();
        assert!(id >= 1);

        // error envelope carries kind + message
        let response = bus.handle("ui", "engine.pause", &json!({"id": 9999}));
        assert_eq!(response["ok"], json!(false));
        assert_eq!(response["error"]["kind"], json!("state"));
        assert!(response["error"]["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_over_bus() {
        let bus = bus();
        let dir = tempdir().unwrap();
        let response = bus.handle(
            "ui",
            "engine.add",
            &json!({
                "url": "https://files.example.org/a.bin",
                "save_path": dir.path().join("a.bin").to_string_lossy(),
            }),
        );
        assert_eq!(response["ok"], json!(true));

        let snap = bus.handle("ui", "engine.snapshot", &json!({}));
        assert_eq!(snap["ok"], json!(true));
        let version = snap["data"]["version"].as_u64().unwrap();
        assert_eq!(snap["data"]["items"].as_array().unwrap().len(), 1);

        // already current -> null data
        let again = bus.handle("ui", "engine.snapshot", &json!({"min_version": version}));
        assert_eq!(again["ok"], json!(true));
        assert!(again["data"].is_null());
    }

    #[tokio::test]
    async fn test_ipc_rate_limit() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mut config = EngineConfig::default();
        config.ipc_rate_limit = 2;
        let engine = DownloadEngine::with_store_for_test(config, store);
        let bus = EngineBus::new(engine);

        assert_eq!(bus.handle("ui", "engine.summary", &json!({}))["ok"], json!(true));
        assert_eq!(bus.handle("ui", "engine.summary", &json!({}))["ok"], json!(true));
        let limited = bus.handle("ui", "engine.summary", &json!({}));
        assert_eq!(limited["ok"], json!(false));
        // other channels have their own budget
        assert_eq!(
            bus.handle("wizard", "engine.summary", &json!({}))["ok"],
            json!(true)
        );
    }

    #[tokio::test]
    async fn test_event_to_wire() {
        let (name, payload) = event_to_wire(&EngineEvent::ChunkCompleted { id: 3, chunk_index: 1 });
        assert_eq!(name, "chunk-completed");
        assert_eq!(payload["id"], json!(3));
        assert_eq!(payload["chunk_index"], json!(1));
    }
}
