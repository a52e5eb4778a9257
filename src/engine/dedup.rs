// Duplicate detection by idempotency tag

use crate::error::SyncError;
use crate::model::{IdempotencyTag, LocalRecord, RemoteEvent};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Matches per requested tag the lookup leaves room for. A full page means
/// the result may be truncated.
const LOOKUP_FANOUT: usize = 4;

pub fn lookup_limit(tag_count: usize) -> usize {
    tag_count.max(1) * LOOKUP_FANOUT
}

/// Drop repeated ids within one delivery; the first occurrence wins
pub fn collapse_repeats(additions: Vec<LocalRecord>) -> (Vec<LocalRecord>, usize) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<LocalRecord> = Vec::with_capacity(additions.len());
    let mut dropped = 0;

    for record in additions {
        match seen.get(&record.id) {
            Some(&index) => {
                if kept[index] != record {
                    tracing::warn!(
                        "Record {} delivered twice with different payloads; keeping the first",
                        record.id
                    );
                }
                dropped += 1;
            }
            None => {
                seen.insert(record.id.clone(), kept.len());
                kept.push(record);
            }
        }
    }

    (kept, dropped)
}

/// Sorted, unique tags for a set of ids
pub fn tags_for<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<IdempotencyTag> {
    ids.into_iter()
        .map(IdempotencyTag::for_record)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Remote ids per wanted tag
pub fn index_by_tag(
    events: &[RemoteEvent],
    wanted: &[IdempotencyTag],
) -> HashMap<IdempotencyTag, Vec<String>> {
    let wanted: HashSet<&str> = wanted.iter().map(IdempotencyTag::as_str).collect();
    let mut index: HashMap<IdempotencyTag, Vec<String>> = HashMap::new();

    for event in events {
        for tag in event.tags.iter().filter(|t| wanted.contains(t.as_str())) {
            let ids = index.entry(IdempotencyTag::for_record(tag)).or_default();
            if !ids.contains(&event.id) {
                ids.push(event.id.clone());
            }
        }
    }

    index
}

/// Additions split by whether a remote counterpart exists
#[derive(Debug, Default)]
pub struct DedupPlan {
    pub to_create: Vec<LocalRecord>,
    pub already_synced: Vec<LocalRecord>,
    /// Tags matching more than one remote event; these records are neither
    /// created nor merged
    pub collisions: Vec<(LocalRecord, SyncError)>,
}

pub fn partition(additions: Vec<LocalRecord>, events: &[RemoteEvent]) -> DedupPlan {
    let tags = tags_for(additions.iter().map(|r| r.id.as_str()));
    let index = index_by_tag(events, &tags);
    let mut plan = DedupPlan::default();

    for record in additions {
        match index.get(&record.tag()) {
            None => plan.to_create.push(record),
            Some(ids) if ids.len() == 1 => plan.already_synced.push(record),
            Some(ids) => {
                let error = SyncError::TagCollision {
                    tag: record.tag().to_string(),
                    remote_ids: ids.clone(),
                };
                tracing::warn!("{}", error);
                plan.collisions.push((record, error));
            }
        }
    }

    plan
}
