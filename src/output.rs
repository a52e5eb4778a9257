use crate::engine::{CycleReport, CycleState};
use serde::Serialize;

/// JSON output mode for machine-readable sync events
/// Uses NDJSON format (newline-delimited JSON)
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Start {
        source: String,
        remote: String,
        anchor: String,
    },
    Stream {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Snapshot {
        record_id: String,
        /// Remote id of the new event; absent when the value was unchanged
        #[serde(skip_serializing_if = "Option::is_none")]
        remote_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Create {
        record_id: String,
        remote_id: String,
    },
    Delete {
        remote_id: String,
    },
    Error {
        state: CycleState,
        record_ids: Vec<String>,
        error: String,
    },
    Summary {
        records_created: usize,
        records_skipped: usize,
        records_deleted: usize,
        deletions_absent: usize,
        failures: usize,
        anchor: String,
        anchor_advanced: bool,
        duration_secs: f64,
    },
}

impl SyncEvent {
    /// Emit this event as JSON to stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    /// Per-record events of a finished cycle followed by its summary
    pub fn from_report(report: &CycleReport) -> Vec<SyncEvent> {
        let mut events = Vec::new();

        for created in &report.created {
            events.push(SyncEvent::Create {
                record_id: created.record_id.clone(),
                remote_id: created.remote_id.clone(),
            });
        }
        for remote_id in &report.deleted {
            events.push(SyncEvent::Delete {
                remote_id: remote_id.clone(),
            });
        }
        for failure in &report.failures {
            events.push(SyncEvent::Error {
                state: failure.state,
                record_ids: failure.record_ids.clone(),
                error: failure.error.to_string(),
            });
        }

        events.push(SyncEvent::Summary {
            records_created: report.created.len(),
            records_skipped: report.duplicates_skipped,
            records_deleted: report.deleted.len(),
            deletions_absent: report.deletions_absent,
            failures: report.failures.len(),
            anchor: report.next_anchor.to_string(),
            anchor_advanced: report.anchor_advanced,
            duration_secs: report.duration.as_secs_f64(),
        });

        events
    }
}
