use super::{ApiCall, ApiCallError, CallOutcome, RemoteStore};
use crate::error::{Result, SyncError};
use crate::model::{to_unix_seconds, Attachment, RemoteEvent};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Page size the API applies to `events.get` without an explicit limit
const DEFAULT_GET_LIMIT: usize = 20;

/// A request as seen by the in-memory store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedRequest {
    /// Batched request with the method of every sub-call
    Batch(Vec<String>),
    /// Multipart create carrying one file
    Attachment { filename: String },
    /// Streaming query
    Stream,
}

#[derive(Default)]
struct Inner {
    events: BTreeMap<String, StoredEvent>,
    streams: HashSet<String>,
    next_seq: u64,
    requests: Vec<RecordedRequest>,
    fail_next_batch: bool,
    failing_methods: HashSet<String>,
    failing_tags: HashSet<String>,
    fail_attachments: bool,
}

struct StoredEvent {
    seq: u64,
    event: RemoteEvent,
}

/// In-process remote store with the API's batch semantics
///
/// Keeps events in memory, records every request it receives and supports
/// failure injection. Useful for tests and for dry runs of a host
/// application.
pub struct MemoryRemoteStore {
    name: String,
    inner: Mutex<Inner>,
    latency: Mutex<Duration>,
}

impl MemoryRemoteStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Delay applied before every request is processed
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Make the next batched request fail as a whole
    pub fn fail_next_batch(&self) {
        self.lock().fail_next_batch = true;
    }

    /// Make every sub-call with this method fail
    pub fn fail_method(&self, method: &str) {
        self.lock().failing_methods.insert(method.to_string());
    }

    /// Make creation of events carrying this tag fail
    pub fn fail_tag(&self, tag: &str) {
        self.lock().failing_tags.insert(tag.to_string());
    }

    pub fn fail_attachments(&self, fail: bool) {
        self.lock().fail_attachments = fail;
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.fail_next_batch = false;
        inner.failing_methods.clear();
        inner.failing_tags.clear();
        inner.fail_attachments = false;
    }

    /// Insert an event directly, bypassing request accounting
    pub fn insert_event(&self, params: Value) -> Result<RemoteEvent> {
        let mut inner = self.lock();
        create_event(&mut inner, &params).map_err(|e| e.into_sync_error("events.create"))
    }

    pub fn events(&self) -> Vec<RemoteEvent> {
        self.lock().events.values().map(|s| s.event.clone()).collect()
    }

    pub fn events_with_tag(&self, tag: &str) -> Vec<RemoteEvent> {
        self.lock()
            .events
            .values()
            .filter(|s| s.event.tags.iter().any(|t| t == tag))
            .map(|s| s.event.clone())
            .collect()
    }

    pub fn has_stream(&self, id: &str) -> bool {
        self.lock().streams.contains(id)
    }

    pub fn request_log(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn clear_request_log(&self) {
        self.lock().requests.clear();
    }

    /// Number of batched requests containing at least one call to `method`
    pub fn batches_with(&self, method: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| matches!(r, RecordedRequest::Batch(methods) if methods.iter().any(|m| m == method)))
            .count()
    }

    /// Total sub-calls to `method` across all batched requests
    pub fn calls_to(&self, method: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .map(|r| match r {
                RecordedRequest::Batch(methods) => methods.iter().filter(|m| *m == method).count(),
                _ => 0,
            })
            .sum()
    }

    pub fn attachment_uploads(&self) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| matches!(r, RecordedRequest::Attachment { .. }))
            .count()
    }
}

fn string_list(params: &Value, key: &str) -> Option<Vec<String>> {
    params.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

fn query_events(inner: &Inner, params: &Value) -> Vec<RemoteEvent> {
    let tags = string_list(params, "tags");
    let streams = string_list(params, "streams");
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .map(|l| l as usize)
        .unwrap_or(DEFAULT_GET_LIMIT);
    let skip = params
        .get("skip")
        .and_then(Value::as_u64)
        .map(|s| s as usize)
        .unwrap_or(0);

    let mut matching: Vec<&StoredEvent> = inner
        .events
        .values()
        .filter(|s| match &tags {
            Some(tags) => s.event.tags.iter().any(|t| tags.contains(t)),
            None => true,
        })
        .filter(|s| match &streams {
            Some(streams) => s.event.stream_ids.iter().any(|id| streams.contains(id)),
            None => true,
        })
        .collect();

    // Most recent first, like the API
    matching.sort_by(|a, b| {
        let ta = a.event.time.unwrap_or(0.0);
        let tb = b.event.time.unwrap_or(0.0);
        tb.total_cmp(&ta).then(b.seq.cmp(&a.seq))
    });

    matching
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|s| s.event.clone())
        .collect()
}

fn create_event(inner: &mut Inner, params: &Value) -> std::result::Result<RemoteEvent, ApiCallError> {
    let stream_ids = string_list(params, "streamIds").unwrap_or_default();
    let event_type = params.get("type").and_then(Value::as_str).unwrap_or_default();
    if stream_ids.is_empty() || event_type.is_empty() {
        return Err(ApiCallError::new(
            "invalid-parameters-format",
            "events.create requires streamIds and type",
        ));
    }

    let tags = string_list(params, "tags").unwrap_or_default();
    if let Some(tag) = tags.iter().find(|t| inner.failing_tags.contains(*t)) {
        return Err(ApiCallError::new(
            "injected-failure",
            format!("creation rejected for tag {}", tag),
        ));
    }

    inner.next_seq += 1;
    let seq = inner.next_seq;
    let event = RemoteEvent {
        id: format!("ev-{}", seq),
        stream_ids,
        event_type: event_type.to_string(),
        content: params.get("content").cloned().unwrap_or(Value::Null),
        tags,
        time: Some(
            params
                .get("time")
                .and_then(Value::as_f64)
                .unwrap_or_else(|| to_unix_seconds(chrono::Utc::now())),
        ),
        attachments: Vec::new(),
    };
    inner.events.insert(
        event.id.clone(),
        StoredEvent {
            seq,
            event: event.clone(),
        },
    );
    Ok(event)
}

fn execute(inner: &mut Inner, call: &ApiCall) -> CallOutcome {
    if inner.failing_methods.contains(&call.method) {
        return Err(ApiCallError::new(
            "injected-failure",
            format!("{} is configured to fail", call.method),
        ));
    }

    match call.method.as_str() {
        "events.get" => {
            let events = query_events(inner, &call.params);
            Ok(json!({ "events": events }))
        }
        "events.create" => {
            let event = create_event(inner, &call.params)?;
            Ok(json!({ "event": event }))
        }
        "events.delete" => {
            let id = call.params.get("id").and_then(Value::as_str).unwrap_or_default();
            match inner.events.remove(id) {
                Some(_) => Ok(json!({ "eventDeletion": { "id": id } })),
                None => Err(ApiCallError::new(
                    "unknown-resource",
                    format!("unknown event \"{}\"", id),
                )),
            }
        }
        "streams.create" => {
            let id = call.params.get("id").and_then(Value::as_str).unwrap_or_default();
            if id.is_empty() {
                return Err(ApiCallError::new("invalid-parameters-format", "missing stream id"));
            }
            if let Some(parent) = call.params.get("parentId").and_then(Value::as_str) {
                if !inner.streams.contains(parent) {
                    return Err(ApiCallError::new(
                        "unknown-referenced-resource",
                        format!("unknown parent stream \"{}\"", parent),
                    ));
                }
            }
            if !inner.streams.insert(id.to_string()) {
                return Err(ApiCallError::new(
                    "item-already-exists",
                    format!("stream \"{}\" already exists", id),
                ));
            }
            Ok(json!({ "stream": call.params }))
        }
        other => Err(ApiCallError::new(
            "unknown-method",
            format!("method \"{}\" is not supported", other),
        )),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn identity(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn call_batch(&self, calls: Vec<ApiCall>) -> Result<Vec<CallOutcome>> {
        self.simulate_latency().await;

        let mut inner = self.lock();
        inner
            .requests
            .push(RecordedRequest::Batch(calls.iter().map(|c| c.method.clone()).collect()));

        if std::mem::take(&mut inner.fail_next_batch) {
            return Err(SyncError::remote_call("batch", "injected request failure"));
        }

        Ok(calls.iter().map(|call| execute(&mut inner, call)).collect())
    }

    async fn create_with_attachment(
        &self,
        params: Value,
        attachment: &Attachment,
    ) -> Result<RemoteEvent> {
        self.simulate_latency().await;

        let mut inner = self.lock();
        inner.requests.push(RecordedRequest::Attachment {
            filename: attachment.filename.clone(),
        });

        if inner.fail_attachments {
            return Err(SyncError::remote_call("events.create", "injected upload failure"));
        }

        let mut event =
            create_event(&mut inner, &params).map_err(|e| e.into_sync_error("events.create"))?;
        let file = json!({
            "fileName": attachment.filename,
            "type": attachment.mime_type,
            "size": attachment.data.len(),
        });
        event.attachments.push(file);
        if let Some(stored) = inner.events.get_mut(&event.id) {
            stored.event.attachments = event.attachments.clone();
        }
        Ok(event)
    }

    async fn stream_events(
        &self,
        params: Value,
        on_event: &mut (dyn FnMut(RemoteEvent) + Send),
    ) -> Result<usize> {
        self.simulate_latency().await;

        let events = {
            let mut inner = self.lock();
            inner.requests.push(RecordedRequest::Stream);
            let mut params = params;
            // Streaming has no implicit page cap
            if params.get("limit").is_none() {
                params["limit"] = json!(usize::MAX);
            }
            query_events(&inner, &params)
        };

        let count = events.len();
        for event in events {
            on_event(event);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdempotencyTag;

    fn create(tag: &str) -> ApiCall {
        ApiCall::events_create(json!({
            "streamIds": ["diary"],
            "type": "note/txt",
            "content": tag,
            "tags": [tag],
        }))
    }

    #[tokio::test]
    async fn test_batch_create_and_get() {
        let store = MemoryRemoteStore::new("test");
        let outcomes = store.call_batch(vec![create("a"), create("b")]).await.unwrap();
        assert!(outcomes.iter().all(|o| o.is_ok()));

        let tags = vec![IdempotencyTag::for_record("a")];
        let outcomes = store
            .call_batch(vec![ApiCall::events_with_tags(&tags, 10)])
            .await
            .unwrap();
        let events = crate::api::events_of(outcomes[0].as_ref().unwrap()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].content, json!("a"));

        assert_eq!(store.batches_with("events.create"), 1);
        assert_eq!(store.calls_to("events.create"), 2);
    }

    #[tokio::test]
    async fn test_default_get_limit() {
        let store = MemoryRemoteStore::new("test");
        for i in 0..30 {
            store.insert_event(json!({
                "streamIds": ["diary"], "type": "note/txt", "tags": [format!("t{}", i)]
            }))
            .unwrap();
        }

        let outcomes = store
            .call_batch(vec![ApiCall::new("events.get", json!({}))])
            .await
            .unwrap();
        let events = crate::api::events_of(outcomes[0].as_ref().unwrap()).unwrap();
        assert_eq!(events.len(), DEFAULT_GET_LIMIT);

        let mut streamed = 0;
        let count = store
            .stream_events(json!({}), &mut |_| streamed += 1)
            .await
            .unwrap();
        assert_eq!(count, 30);
        assert_eq!(streamed, 30);
    }

    #[tokio::test]
    async fn test_per_call_failure_does_not_abort_batch() {
        let store = MemoryRemoteStore::new("test");
        store.fail_tag("b");

        let outcomes = store
            .call_batch(vec![create("a"), create("b"), create("c")])
            .await
            .unwrap();
        assert!(outcomes[0].is_ok());
        assert_eq!(outcomes[1].as_ref().unwrap_err().id, "injected-failure");
        assert!(outcomes[2].is_ok());
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_batch_is_one_shot() {
        let store = MemoryRemoteStore::new("test");
        store.fail_next_batch();
        assert!(store.call_batch(vec![create("a")]).await.is_err());
        assert!(store.call_batch(vec![create("a")]).await.is_ok());
        assert_eq!(store.request_log().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_unknown_event() {
        let store = MemoryRemoteStore::new("test");
        let outcomes = store
            .call_batch(vec![ApiCall::events_delete("missing")])
            .await
            .unwrap();
        assert_eq!(outcomes[0].as_ref().unwrap_err().id, "unknown-resource");
    }

    #[tokio::test]
    async fn test_streams_create_semantics() {
        let store = MemoryRemoteStore::new("test");
        let outcomes = store
            .call_batch(vec![
                ApiCall::streams_create("child", "child", Some("health")),
                ApiCall::streams_create("health", "health", None),
                ApiCall::streams_create("health", "health", None),
            ])
            .await
            .unwrap();

        assert_eq!(outcomes[0].as_ref().unwrap_err().id, "unknown-referenced-resource");
        assert!(outcomes[1].is_ok());
        assert_eq!(outcomes[2].as_ref().unwrap_err().id, "item-already-exists");
        assert!(store.has_stream("health"));
    }

    #[tokio::test]
    async fn test_attachment_upload() {
        let store = MemoryRemoteStore::new("test");
        let attachment = Attachment {
            filename: "fhir".to_string(),
            mime_type: "application/json".to_string(),
            data: b"{}".to_vec(),
        };
        let event = store
            .create_with_attachment(
                json!({"streamIds": ["records"], "type": "document/fhir", "tags": ["x"]}),
                &attachment,
            )
            .await
            .unwrap();

        assert_eq!(event.attachments.len(), 1);
        assert_eq!(store.attachment_uploads(), 1);
        assert_eq!(store.events_with_tag("x")[0].attachments.len(), 1);
    }

    #[test]
    fn test_identity() {
        assert_eq!(MemoryRemoteStore::new("alice").identity(), "memory://alice");
    }
}
