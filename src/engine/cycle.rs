// One synchronization cycle
//
// fetch → dedup lookup → create (one plain batch + one upload per attachment)
//       → resolve deletions → delete (one batch) → anchor
//
// Creation and deletion touch disjoint records and run concurrently.

use super::dedup;
use super::report::{CreatedRecord, CycleFailure, CycleReport, CycleState};
use crate::api::{event_of, events_of, ApiCall, RemoteStore};
use crate::error::{Result, SyncError};
use crate::model::{ChangeSet, ChangeToken, Deletion, IdempotencyTag, LocalRecord, RemoteEvent};
use crate::source::ChangeSource;
use futures::future::join_all;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// Run one pull cycle from `anchor`
///
/// Fails only when the source cannot be queried; the caller must then keep
/// `anchor`. Every remote failure is reported inside the returned report.
pub async fn run_cycle(
    source: &dyn ChangeSource,
    remote: &dyn RemoteStore,
    anchor: &ChangeToken,
) -> Result<CycleReport> {
    let start = Instant::now();
    let mut report = CycleReport::new(anchor.clone());
    report.enter(CycleState::FetchingChanges);

    let changes = source
        .changes_since(anchor)
        .await
        .map_err(|e| match e {
            SyncError::SourceQueryFailed { .. } => e,
            other => SyncError::SourceQueryFailed {
                source_id: source.id().to_string(),
                message: other.to_string(),
            },
        })?;

    tracing::debug!(
        "Source {} reported {} additions, {} deletions since {}",
        source.id(),
        changes.additions.len(),
        changes.deletions.len(),
        anchor
    );

    dispatch(remote, changes, &mut report).await;
    report.duration = start.elapsed();
    Ok(report)
}

/// Apply an already fetched delivery (push mode)
pub async fn apply_changes(
    remote: &dyn RemoteStore,
    previous_anchor: &ChangeToken,
    changes: ChangeSet,
) -> CycleReport {
    let start = Instant::now();
    let mut report = CycleReport::new(previous_anchor.clone());
    dispatch(remote, changes, &mut report).await;
    report.duration = start.elapsed();
    report
}

#[derive(Default)]
struct PhaseOutcome {
    states: Vec<CycleState>,
    failures: Vec<CycleFailure>,
    /// False when the phase could not be dispatched at all
    dispatched: bool,
}

impl PhaseOutcome {
    fn new() -> Self {
        Self {
            dispatched: true,
            ..Default::default()
        }
    }

    fn fail(&mut self, state: CycleState, record_ids: Vec<String>, error: SyncError) {
        tracing::warn!("{} ({} records)", error, record_ids.len());
        self.failures.push(CycleFailure {
            state,
            record_ids,
            error,
        });
    }
}

#[derive(Default)]
struct Creation {
    outcome: PhaseOutcome,
    created: Vec<CreatedRecord>,
    duplicates: usize,
    skipped: bool,
}

#[derive(Default)]
struct Removal {
    outcome: PhaseOutcome,
    deleted: Vec<String>,
    absent: usize,
}

async fn dispatch(remote: &dyn RemoteStore, changes: ChangeSet, report: &mut CycleReport) {
    let ChangeSet {
        additions,
        deletions,
        next_anchor,
    } = changes;

    report.additions_received = additions.len();
    let (additions, repeats) = dedup::collapse_repeats(additions);
    report.duplicates_skipped += repeats;

    let deleted_ids: HashSet<&str> = deletions.iter().map(|d| d.id.as_str()).collect();
    let (superseded, additions): (Vec<LocalRecord>, Vec<LocalRecord>) = additions
        .into_iter()
        .partition(|r| deleted_ids.contains(r.id.as_str()));
    report.superseded = superseded.len();

    let (creation, removal) = futures::join!(
        create_phase(remote, additions),
        delete_phase(remote, &deletions)
    );

    report.duplicates_skipped += creation.duplicates;
    report.created = creation.created;
    report.creation_skipped = creation.skipped;
    report.deleted = removal.deleted;
    report.deletions_absent = removal.absent;

    let dispatched = creation.outcome.dispatched && removal.outcome.dispatched;
    for outcome in [creation.outcome, removal.outcome] {
        report.states.extend(outcome.states);
        report.failures.extend(outcome.failures);
    }

    if dispatched {
        report.enter(CycleState::PersistingAnchor);
        report.next_anchor = next_anchor;
        report.anchor_advanced = true;
    } else {
        tracing::warn!(
            "Holding anchor at {}; these changes will be offered again",
            report.previous_anchor
        );
    }
    report.enter(CycleState::Idle);
}

/// One batched `events.get` by tags. Falls back to the streaming query when
/// the page comes back full.
async fn lookup_tags(remote: &dyn RemoteStore, tags: &[IdempotencyTag]) -> Result<Vec<RemoteEvent>> {
    let limit = dedup::lookup_limit(tags.len());
    let mut outcomes = remote
        .call_batch(vec![ApiCall::events_with_tags(tags, limit)])
        .await?;

    let result = match outcomes.pop() {
        Some(Ok(result)) => result,
        Some(Err(e)) => return Err(e.into_sync_error("events.get")),
        None => return Err(SyncError::InvalidResponse("empty batch response".into())),
    };
    let events = events_of(&result)?;

    if events.len() < limit {
        return Ok(events);
    }

    tracing::debug!("Tag lookup hit its limit of {}; streaming full result", limit);
    let mut all = Vec::new();
    let tag_list: Vec<&str> = tags.iter().map(IdempotencyTag::as_str).collect();
    remote
        .stream_events(json!({ "tags": tag_list }), &mut |event| all.push(event))
        .await?;
    Ok(all)
}

async fn create_phase(remote: &dyn RemoteStore, additions: Vec<LocalRecord>) -> Creation {
    let mut creation = Creation {
        outcome: PhaseOutcome::new(),
        ..Default::default()
    };
    if additions.is_empty() {
        return creation;
    }

    creation.outcome.states.push(CycleState::DeduplicatingAdditions);
    tracing::debug!("Cycle state: {}", CycleState::DeduplicatingAdditions);

    let tags = dedup::tags_for(additions.iter().map(|r| r.id.as_str()));
    let existing = match lookup_tags(remote, &tags).await {
        Ok(events) => events,
        Err(e) => {
            let ids = additions.into_iter().map(|r| r.id).collect();
            creation.outcome.fail(
                CycleState::DeduplicatingAdditions,
                ids,
                SyncError::DedupLookupFailed {
                    message: e.to_string(),
                },
            );
            creation.outcome.dispatched = false;
            creation.skipped = true;
            return creation;
        }
    };

    let plan = dedup::partition(additions, &existing);
    creation.duplicates = plan.already_synced.len();
    for (record, error) in plan.collisions {
        creation
            .outcome
            .fail(CycleState::DeduplicatingAdditions, vec![record.id], error);
    }

    if plan.to_create.is_empty() {
        return creation;
    }

    creation.outcome.states.push(CycleState::CreatingRecords);
    tracing::debug!("Cycle state: {}", CycleState::CreatingRecords);

    let (with_attachment, plain): (Vec<LocalRecord>, Vec<LocalRecord>) = plan
        .to_create
        .into_iter()
        .partition(|r| r.attachment.is_some());

    let (plain_result, uploads) = futures::join!(
        create_plain(remote, &plain),
        join_all(with_attachment.iter().map(|record| upload(remote, record)))
    );

    match plain_result {
        Ok(outcomes) => {
            for (record, outcome) in plain.iter().zip(outcomes) {
                match outcome {
                    Ok(event) => creation.created.push(CreatedRecord {
                        record_id: record.id.clone(),
                        remote_id: event.id,
                    }),
                    Err(e) => creation.outcome.fail(
                        CycleState::CreatingRecords,
                        vec![record.id.clone()],
                        e,
                    ),
                }
            }
        }
        Err(e) => {
            let ids = plain.iter().map(|r| r.id.clone()).collect();
            creation.outcome.fail(
                CycleState::CreatingRecords,
                ids,
                SyncError::remote_call("events.create", e.to_string()),
            );
        }
    }

    for (record, result) in with_attachment.iter().zip(uploads) {
        match result {
            Ok(event) => creation.created.push(CreatedRecord {
                record_id: record.id.clone(),
                remote_id: event.id,
            }),
            Err(e) => creation.outcome.fail(
                CycleState::CreatingRecords,
                vec![record.id.clone()],
                SyncError::AttachmentUploadFailed {
                    record_id: record.id.clone(),
                    message: e.to_string(),
                },
            ),
        }
    }

    creation
}

/// All attachment-free creates in one request. The outer error means the
/// request failed as a whole.
async fn create_plain(
    remote: &dyn RemoteStore,
    records: &[LocalRecord],
) -> Result<Vec<Result<RemoteEvent>>> {
    if records.is_empty() {
        return Ok(Vec::new());
    }

    let calls = records
        .iter()
        .map(|r| ApiCall::events_create(r.to_event_params()))
        .collect();
    let outcomes = remote.call_batch(calls).await?;

    Ok(outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(result) => event_of(&result),
            Err(e) => Err(e.into_sync_error("events.create")),
        })
        .collect())
}

async fn upload(remote: &dyn RemoteStore, record: &LocalRecord) -> Result<RemoteEvent> {
    match &record.attachment {
        Some(attachment) => {
            remote
                .create_with_attachment(record.to_event_params(), attachment)
                .await
        }
        None => Err(SyncError::InvalidResponse(format!(
            "record {} has no attachment",
            record.id
        ))),
    }
}

async fn delete_phase(remote: &dyn RemoteStore, deletions: &[Deletion]) -> Removal {
    let mut removal = Removal {
        outcome: PhaseOutcome::new(),
        ..Default::default()
    };
    if deletions.is_empty() {
        return removal;
    }

    removal.outcome.states.push(CycleState::ResolvingDeletions);
    tracing::debug!("Cycle state: {}", CycleState::ResolvingDeletions);

    let tags = dedup::tags_for(deletions.iter().map(|d| d.id.as_str()));
    let events = match lookup_tags(remote, &tags).await {
        Ok(events) => events,
        Err(e) => {
            let ids = deletions.iter().map(|d| d.id.clone()).collect();
            removal.outcome.fail(
                CycleState::ResolvingDeletions,
                ids,
                SyncError::remote_call("events.get", e.to_string()),
            );
            removal.outcome.dispatched = false;
            return removal;
        }
    };

    // remote id → local ids it stands for
    let mut targets: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let index = dedup::index_by_tag(&events, &tags);
    for tag in &tags {
        match index.get(tag) {
            Some(remote_ids) => {
                for remote_id in remote_ids {
                    targets
                        .entry(remote_id.clone())
                        .or_default()
                        .push(tag.to_string());
                }
            }
            None => {
                tracing::trace!("Deletion of {} has no remote counterpart", tag);
                removal.absent += 1;
            }
        }
    }

    if targets.is_empty() {
        return removal;
    }

    removal.outcome.states.push(CycleState::DeletingRecords);
    tracing::debug!("Cycle state: {}", CycleState::DeletingRecords);

    let calls = targets.keys().map(|id| ApiCall::events_delete(id)).collect();
    match remote.call_batch(calls).await {
        Ok(outcomes) => {
            for ((remote_id, local_ids), outcome) in targets.into_iter().zip(outcomes) {
                match outcome {
                    Ok(_) => removal.deleted.push(remote_id),
                    // Removed by someone else since the lookup
                    Err(e) if e.id == "unknown-resource" => removal.absent += 1,
                    Err(e) => removal.outcome.fail(
                        CycleState::DeletingRecords,
                        local_ids,
                        e.into_sync_error("events.delete"),
                    ),
                }
            }
        }
        Err(e) => {
            let ids = targets.into_values().flatten().collect();
            removal.outcome.fail(
                CycleState::DeletingRecords,
                ids,
                SyncError::remote_call("events.delete", e.to_string()),
            );
        }
    }

    removal
}
