use super::{ChangeSource, ChangeStream, SubscribableSource};
use crate::error::{Result, SyncError};
use crate::model::{ChangeSet, ChangeToken, Deletion, LocalRecord};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum Change {
    Add(LocalRecord),
    Delete(Deletion),
}

struct Shared {
    log: Mutex<Vec<Change>>,
    version: watch::Sender<usize>,
    fail_next: AtomicBool,
}

/// In-process change log
///
/// The anchor is the number of log entries already delivered. Pushing a
/// change wakes every subscriber.
#[derive(Clone)]
pub struct MemorySource {
    id: String,
    shared: Arc<Shared>,
}

impl MemorySource {
    pub fn new(id: impl Into<String>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            id: id.into(),
            shared: Arc::new(Shared {
                log: Mutex::new(Vec::new()),
                version,
                fail_next: AtomicBool::new(false),
            }),
        }
    }

    fn push(&self, change: Change) {
        let len = {
            let mut log = self.shared.log.lock().unwrap_or_else(|e| e.into_inner());
            log.push(change);
            log.len()
        };
        self.shared.version.send_replace(len);
    }

    pub fn push_addition(&self, record: LocalRecord) {
        self.push(Change::Add(record));
    }

    pub fn push_deletion(&self, id: impl Into<String>) {
        self.push(Change::Delete(Deletion::new(id)));
    }

    /// Make the next query fail with `SourceQueryFailed`
    pub fn fail_next_query(&self) {
        self.shared.fail_next.store(true, Ordering::SeqCst);
    }

    fn query(&self, anchor: &ChangeToken) -> Result<ChangeSet> {
        if self.shared.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SyncError::SourceQueryFailed {
                source_id: self.id.clone(),
                message: "injected query failure".to_string(),
            });
        }

        let log = self.shared.log.lock().unwrap_or_else(|e| e.into_inner());
        let start = anchor
            .as_u64()
            .map(|n| n as usize)
            .filter(|&n| n <= log.len())
            .ok_or_else(|| SyncError::SourceQueryFailed {
                source_id: self.id.clone(),
                message: format!("anchor {} is not a position in this log", anchor),
            })?;

        let mut changes = ChangeSet {
            next_anchor: ChangeToken::from_u64(log.len() as u64),
            ..Default::default()
        };
        for change in &log[start..] {
            match change {
                Change::Add(record) => changes.additions.push(record.clone()),
                Change::Delete(deletion) => changes.deletions.push(deletion.clone()),
            }
        }
        Ok(changes)
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn changes_since(&self, anchor: &ChangeToken) -> Result<ChangeSet> {
        self.query(anchor)
    }
}

impl SubscribableSource for MemorySource {
    fn subscribe(&self, from: ChangeToken) -> ChangeStream {
        let rx = self.shared.version.subscribe();
        stream::unfold(
            (self.clone(), from, rx),
            |(source, mut anchor, mut rx)| async move {
                loop {
                    // Mark the current version seen before querying so a push
                    // racing with the query still wakes us
                    let _seen = *rx.borrow_and_update();
                    match source.query(&anchor) {
                        Ok(changes) if changes.is_empty() => {}
                        Ok(changes) => {
                            anchor = changes.next_anchor.clone();
                            return Some((Ok(changes), (source, anchor, rx)));
                        }
                        Err(e) => return Some((Err(e), (source, anchor, rx))),
                    }
                    if rx.changed().await.is_err() {
                        return None;
                    }
                }
            },
        )
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> LocalRecord {
        LocalRecord::new(id, "bodyMass", "mass/kg", json!(70))
    }

    #[tokio::test]
    async fn test_changes_since_bootstrap() {
        let source = MemorySource::new("mem");
        source.push_addition(record("a1"));
        source.push_addition(record("a2"));
        source.push_deletion("a1");

        let changes = source.changes_since(&ChangeToken::bootstrap()).await.unwrap();
        assert_eq!(changes.additions.len(), 2);
        assert_eq!(changes.deletions, vec![Deletion::new("a1")]);
        assert_eq!(changes.next_anchor, ChangeToken::from_u64(3));
    }

    #[tokio::test]
    async fn test_changes_since_is_replayable() {
        let source = MemorySource::new("mem");
        source.push_addition(record("a1"));

        let anchor = ChangeToken::bootstrap();
        let first = source.changes_since(&anchor).await.unwrap();
        let again = source.changes_since(&anchor).await.unwrap();
        assert_eq!(first, again);

        let after = source.changes_since(&first.next_anchor).await.unwrap();
        assert!(after.is_empty());
        assert_eq!(after.next_anchor, first.next_anchor);
    }

    #[tokio::test]
    async fn test_anchor_past_end_is_rejected() {
        let source = MemorySource::new("mem");
        let err = source
            .changes_since(&ChangeToken::from_u64(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceQueryFailed { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_wakes_on_push() {
        let source = MemorySource::new("mem");
        let mut deliveries = source.subscribe(ChangeToken::bootstrap());

        let pusher = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            pusher.push_addition(record("late"));
        });

        let changes = deliveries.next().await.unwrap().unwrap();
        assert_eq!(changes.additions[0].id, "late");
    }
}
