pub mod http;
pub mod memory;

use crate::error::{Result, SyncError};
use crate::model::{Attachment, IdempotencyTag, RemoteEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub use http::HttpRemoteStore;
pub use memory::MemoryRemoteStore;

/// One logical operation inside a batched request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub method: String,
    pub params: Value,
}

impl ApiCall {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// `events.get` filtered to events carrying any of `tags`.
    ///
    /// `limit` is set explicitly because the API caps untimed queries to a
    /// small default page.
    pub fn events_with_tags(tags: &[IdempotencyTag], limit: usize) -> Self {
        let tags: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
        Self::new("events.get", json!({ "tags": tags, "limit": limit }))
    }

    pub fn events_create(params: Value) -> Self {
        Self::new("events.create", params)
    }

    pub fn events_delete(id: &str) -> Self {
        Self::new("events.delete", json!({ "id": id }))
    }

    pub fn streams_create(id: &str, name: &str, parent_id: Option<&str>) -> Self {
        let mut params = json!({ "id": id, "name": name });
        if let Some(parent) = parent_id {
            params["parentId"] = json!(parent);
        }
        Self::new("streams.create", params)
    }
}

/// Error reported by the remote store for one sub-call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCallError {
    pub id: String,
    #[serde(default)]
    pub message: String,
}

impl ApiCallError {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn into_sync_error(self, method: &str) -> SyncError {
        SyncError::remote_call(method, format!("{} ({})", self.message, self.id))
    }
}

/// Outcome of one sub-call of a batch, in request order
pub type CallOutcome = std::result::Result<Value, ApiCallError>;

/// Split a raw result object into success or error
pub fn parse_outcome(result: Value) -> CallOutcome {
    match result.get("error") {
        Some(error) => Err(serde_json::from_value(error.clone())
            .unwrap_or_else(|_| ApiCallError::new("unknown-error", error.to_string()))),
        None => Ok(result),
    }
}

/// Extract the `events` array of an `events.get` result
pub fn events_of(result: &Value) -> Result<Vec<RemoteEvent>> {
    match result.get("events") {
        Some(events) => Ok(serde_json::from_value(events.clone())?),
        None => Err(SyncError::InvalidResponse(
            "events.get result has no 'events' field".to_string(),
        )),
    }
}

/// Extract the `event` object of an `events.create` result
pub fn event_of(result: &Value) -> Result<RemoteEvent> {
    match result.get("event") {
        Some(event) => Ok(serde_json::from_value(event.clone())?),
        None => Err(SyncError::InvalidResponse(
            "events.create result has no 'event' field".to_string(),
        )),
    }
}

/// Remote event store reached through a batched API
///
/// Implementations must return exactly one outcome per call, in order. An
/// `Err` from `call_batch` means the request as a whole failed and no
/// sub-call is known to have run.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Stable, credential-free name of this store, used to key anchors
    fn identity(&self) -> String;

    /// Send `calls` in one request and return per-call outcomes
    async fn call_batch(&self, calls: Vec<ApiCall>) -> Result<Vec<CallOutcome>>;

    /// Create one event with a single binary part
    async fn create_with_attachment(
        &self,
        params: Value,
        attachment: &Attachment,
    ) -> Result<RemoteEvent>;

    /// Streaming `events.get` for large result sets
    ///
    /// `on_event` is invoked once per event as results arrive; the returned
    /// count is delivered when the stream completes.
    async fn stream_events(
        &self,
        params: Value,
        on_event: &mut (dyn FnMut(RemoteEvent) + Send),
    ) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_with_tags_call() {
        let tags = vec![IdempotencyTag::for_record("a"), IdempotencyTag::for_record("b")];
        let call = ApiCall::events_with_tags(&tags, 8);
        assert_eq!(call.method, "events.get");
        assert_eq!(call.params, json!({"tags": ["a", "b"], "limit": 8}));
    }

    #[test]
    fn test_streams_create_call() {
        let root = ApiCall::streams_create("health", "health", None);
        assert!(root.params.get("parentId").is_none());

        let child = ApiCall::streams_create("bodyMass", "bodyMass", Some("health"));
        assert_eq!(child.params["parentId"], "health");
    }

    #[test]
    fn test_parse_outcome() {
        let ok = parse_outcome(json!({"event": {"id": "e1"}}));
        assert!(ok.is_ok());

        let err = parse_outcome(json!({"error": {"id": "unknown-resource", "message": "nope"}}))
            .unwrap_err();
        assert_eq!(err.id, "unknown-resource");
        assert_eq!(err.message, "nope");

        let odd = parse_outcome(json!({"error": "flat string"})).unwrap_err();
        assert_eq!(odd.id, "unknown-error");
    }

    #[test]
    fn test_events_of() {
        let result = json!({"events": [{"id": "e1", "tags": ["a"]}]});
        let events = events_of(&result).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tags, vec!["a".to_string()]);

        assert!(events_of(&json!({})).is_err());
    }

    #[test]
    fn test_call_error_conversion() {
        let err = ApiCallError::new("invalid-parameters-format", "bad type")
            .into_sync_error("events.create");
        assert!(err.is_remote_call_failure());
        assert!(err.to_string().contains("events.create"));
        assert!(err.to_string().contains("invalid-parameters-format"));
    }
}
