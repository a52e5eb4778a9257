use crate::error::SyncError;
use crate::model::ChangeToken;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Steps of one sync cycle, in the order they are visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    FetchingChanges,
    DeduplicatingAdditions,
    CreatingRecords,
    ResolvingDeletions,
    DeletingRecords,
    PersistingAnchor,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::FetchingChanges => "fetching changes",
            CycleState::DeduplicatingAdditions => "deduplicating additions",
            CycleState::CreatingRecords => "creating records",
            CycleState::ResolvingDeletions => "resolving deletions",
            CycleState::DeletingRecords => "deleting records",
            CycleState::PersistingAnchor => "persisting anchor",
        };
        f.write_str(name)
    }
}

/// A local record that now has a remote counterpart
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedRecord {
    pub record_id: String,
    pub remote_id: String,
}

/// One failed sub-call (or group of records sharing one failed request)
#[derive(Debug)]
pub struct CycleFailure {
    /// State the cycle was in when the failure happened
    pub state: CycleState,
    /// Local record ids affected
    pub record_ids: Vec<String>,
    pub error: SyncError,
}

/// Outcome of one cycle
///
/// `next_anchor` is the anchor to persist. When `anchor_advanced` is false
/// it equals `previous_anchor` and the same changes will be offered again.
#[derive(Debug)]
pub struct CycleReport {
    pub previous_anchor: ChangeToken,
    pub next_anchor: ChangeToken,
    pub anchor_advanced: bool,
    pub additions_received: usize,
    /// Additions that already had a remote counterpart or were repeated in
    /// the same delivery
    pub duplicates_skipped: usize,
    /// Additions deleted again within the same delivery
    pub superseded: usize,
    pub created: Vec<CreatedRecord>,
    /// Remote ids removed
    pub deleted: Vec<String>,
    /// Deletions with no remote counterpart
    pub deletions_absent: usize,
    /// Creation did not run because duplicates could not be ruled out
    pub creation_skipped: bool,
    pub failures: Vec<CycleFailure>,
    pub states: Vec<CycleState>,
    pub duration: Duration,
}

impl CycleReport {
    pub(crate) fn new(previous_anchor: ChangeToken) -> Self {
        Self {
            next_anchor: previous_anchor.clone(),
            previous_anchor,
            anchor_advanced: false,
            additions_received: 0,
            duplicates_skipped: 0,
            superseded: 0,
            created: Vec::new(),
            deleted: Vec::new(),
            deletions_absent: 0,
            creation_skipped: false,
            failures: Vec::new(),
            states: vec![CycleState::Idle],
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn enter(&mut self, state: CycleState) {
        tracing::debug!("Cycle state: {}", state);
        self.states.push(state);
    }

    /// Anchor advanced and every sub-call succeeded
    pub fn is_clean(&self) -> bool {
        self.anchor_advanced && self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} created, {} skipped, {} deleted",
            self.created.len(),
            self.duplicates_skipped,
            self.deleted.len()
        );
        if !self.failures.is_empty() {
            summary.push_str(&format!(", {} failed", self.failures.len()));
        }
        if !self.anchor_advanced {
            summary.push_str(" (anchor held)");
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_report_holds_anchor() {
        let report = CycleReport::new(ChangeToken::from_u64(3));
        assert_eq!(report.next_anchor, ChangeToken::from_u64(3));
        assert!(!report.anchor_advanced);
        assert!(!report.is_clean());
        assert_eq!(report.states, vec![CycleState::Idle]);
    }

    #[test]
    fn test_summary() {
        let mut report = CycleReport::new(ChangeToken::bootstrap());
        report.anchor_advanced = true;
        report.created.push(CreatedRecord {
            record_id: "a".to_string(),
            remote_id: "r".to_string(),
        });
        assert_eq!(report.summary(), "1 created, 0 skipped, 0 deleted");

        report.anchor_advanced = false;
        report.failures.push(CycleFailure {
            state: CycleState::DeduplicatingAdditions,
            record_ids: vec!["b".to_string()],
            error: SyncError::DedupLookupFailed {
                message: "down".to_string(),
            },
        });
        assert_eq!(
            report.summary(),
            "1 created, 0 skipped, 0 deleted, 1 failed (anchor held)"
        );
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&CycleState::DeduplicatingAdditions).unwrap();
        assert_eq!(json, r#""deduplicating_additions""#);
    }
}
