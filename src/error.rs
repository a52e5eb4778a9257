use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to fetch changes from source '{source_id}': {message}\nThe anchor was left unchanged; the next cycle retries from the same point.")]
    SourceQueryFailed { source_id: String, message: String },

    #[error("Remote call {method} failed: {message}")]
    RemoteCallFailed { method: String, message: String },

    #[error("Attachment upload failed for record {record_id}: {message}")]
    AttachmentUploadFailed { record_id: String, message: String },

    #[error("Duplicate lookup failed: {message}\nNo records were created this cycle to avoid duplicates.")]
    DedupLookupFailed { message: String },

    #[error("Idempotency tag '{tag}' matches {} remote events ({})\nRefusing to merge ambiguous records; inspect the remote store.", remote_ids.len(), remote_ids.join(", "))]
    TagCollision { tag: String, remote_ids: Vec<String> },

    #[error("Invalid API endpoint: {endpoint}\nExpected a URL of the form https://<token>@<host>/")]
    InvalidEndpoint { endpoint: String },

    #[error("Unexpected response from remote store: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}\nCheck your network connection and try again.")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Anchor database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// True for failures that make the creation phase unsafe to run.
    pub fn is_dedup_failure(&self) -> bool {
        matches!(
            self,
            SyncError::DedupLookupFailed { .. } | SyncError::TagCollision { .. }
        )
    }

    /// True for failures scoped to a single remote sub-call.
    pub fn is_remote_call_failure(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteCallFailed { .. } | SyncError::AttachmentUploadFailed { .. }
        )
    }

    pub(crate) fn remote_call(method: &str, message: impl Into<String>) -> Self {
        SyncError::RemoteCallFailed {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Format bytes for human-readable display in log and summary lines
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
