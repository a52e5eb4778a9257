use super::{event_of, events_of, parse_outcome, ApiCall, CallOutcome, RemoteStore};
use crate::error::{format_bytes, Result, SyncError};
use crate::model::{Attachment, RemoteEvent};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Page size used by `stream_events`
const STREAM_PAGE_SIZE: usize = 1000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Pryv HTTP API client
///
/// Batches are posted to the API root, attachments to `events` as
/// multipart bodies.
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpRemoteStore {
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let mut endpoint = endpoint.to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Ok(Self {
            client,
            endpoint,
            token: token.to_string(),
        })
    }

    /// Build from an API endpoint carrying its token, e.g.
    /// `https://ck12abc@alice.pryv.me/`
    pub fn from_api_endpoint(api_endpoint: &str) -> Result<Self> {
        let (endpoint, token) = split_api_endpoint(api_endpoint)?;
        Self::new(&endpoint, &token)
    }

    async fn read_json(response: reqwest::Response, method: &str) -> Result<Value> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let message = match body.get("error") {
                Some(error) => error
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
                None => format!("HTTP {}", status),
            };
            return Err(SyncError::remote_call(method, message));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// Split `https://<token>@<host>/<path>` into the bare endpoint and token
pub fn split_api_endpoint(api_endpoint: &str) -> Result<(String, String)> {
    let invalid = || SyncError::InvalidEndpoint {
        endpoint: api_endpoint.to_string(),
    };

    let (scheme, rest) = api_endpoint.split_once("://").ok_or_else(invalid)?;
    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, "/"),
    };
    let (token, host) = authority.rsplit_once('@').ok_or_else(invalid)?;
    if token.is_empty() || host.is_empty() {
        return Err(invalid());
    }

    Ok((format!("{}://{}{}", scheme, host, path), token.to_string()))
}

/// Flatten `events.get` params into query pairs; arrays use `key[]`
fn query_pairs(params: &Value) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(map) = params.as_object() {
        for (key, value) in map {
            match value {
                Value::Array(items) => {
                    for item in items {
                        pairs.push((format!("{}[]", key), scalar_to_string(item)));
                    }
                }
                Value::Null => {}
                other => pairs.push((key.clone(), scalar_to_string(other))),
            }
        }
    }
    pairs
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn identity(&self) -> String {
        self.endpoint.clone()
    }

    async fn call_batch(&self, calls: Vec<ApiCall>) -> Result<Vec<CallOutcome>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!("POST {} ({} calls)", self.endpoint, calls.len());
        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, &self.token)
            .json(&calls)
            .send()
            .await?;
        let body = Self::read_json(response, "batch").await?;

        let results = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::InvalidResponse("batch response has no 'results'".into()))?;

        if results.len() != calls.len() {
            return Err(SyncError::InvalidResponse(format!(
                "batch of {} calls returned {} results",
                calls.len(),
                results.len()
            )));
        }

        Ok(results.iter().cloned().map(parse_outcome).collect())
    }

    async fn create_with_attachment(
        &self,
        params: Value,
        attachment: &Attachment,
    ) -> Result<RemoteEvent> {
        let key = format!("file-{}", uuid::Uuid::new_v4());
        tracing::debug!(
            "Uploading attachment {} ({}) as {}",
            attachment.filename,
            format_bytes(attachment.data.len() as u64),
            key
        );

        let file = Part::bytes(attachment.data.clone())
            .file_name(attachment.filename.clone())
            .mime_str(&attachment.mime_type)?;
        let form = Form::new().text("event", params.to_string()).part(key, file);

        let response = self
            .client
            .post(format!("{}events", self.endpoint))
            .header(AUTHORIZATION, &self.token)
            .multipart(form)
            .send()
            .await?;
        let body = Self::read_json(response, "events.create").await?;
        event_of(&body)
    }

    async fn stream_events(
        &self,
        params: Value,
        on_event: &mut (dyn FnMut(RemoteEvent) + Send),
    ) -> Result<usize> {
        let requested = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize);
        let mut base = params;
        if let Some(map) = base.as_object_mut() {
            map.remove("limit");
            map.remove("skip");
        }
        let base_pairs = query_pairs(&base);

        let mut delivered = 0usize;
        loop {
            let page_size = match requested {
                Some(total) => STREAM_PAGE_SIZE.min(total.saturating_sub(delivered)),
                None => STREAM_PAGE_SIZE,
            };
            if page_size == 0 {
                break;
            }

            let mut pairs = base_pairs.clone();
            pairs.push(("skip".to_string(), delivered.to_string()));
            pairs.push(("limit".to_string(), page_size.to_string()));

            let response = self
                .client
                .get(format!("{}events", self.endpoint))
                .header(AUTHORIZATION, &self.token)
                .query(&pairs)
                .send()
                .await?;
            let body = Self::read_json(response, "events.get").await?;
            let events = events_of(&body)?;
            let page_len = events.len();

            for event in events {
                on_event(event);
            }
            delivered += page_len;
            tracing::trace!("Streamed page of {} events ({} total)", page_len, delivered);

            if page_len < page_size {
                break;
            }
        }

        Ok(delivered)
    }
}
