// Sync engine: runs cycles per (source, remote) pair and owns anchor persistence

mod cycle;
pub mod dedup;
mod report;

pub use cycle::{apply_changes, run_cycle};
pub use report::{CreatedRecord, CycleFailure, CycleReport, CycleState};

use crate::anchor::{AnchorKey, AnchorStore};
use crate::api::RemoteStore;
use crate::error::{Result, SyncError};
use crate::model::ChangeToken;
use crate::source::{ChangeSource, SubscribableSource};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// First retry after a held push cycle; doubles up to `MAX_RETRY_DELAY`
pub const RETRY_DELAY: Duration = Duration::from_secs(5);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

type PairLock = Arc<tokio::sync::Mutex<()>>;

/// Drives sync cycles against one remote store
///
/// Cycles for the same pair are serialized; cycles for different sources
/// run concurrently. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    anchors: Arc<dyn AnchorStore>,
    locks: Arc<Mutex<HashMap<AnchorKey, PairLock>>>,
    retry_delay: Duration,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, anchors: Arc<dyn AnchorStore>) -> Self {
        Self {
            remote,
            anchors,
            locks: Arc::new(Mutex::new(HashMap::new())),
            retry_delay: RETRY_DELAY,
        }
    }

    /// Delay before `follow` retries a held cycle on its own
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn key_for(&self, source: &dyn ChangeSource) -> AnchorKey {
        AnchorKey::new(source.id(), self.remote.identity())
    }

    /// Currently persisted anchor for `source`
    pub fn anchor(&self, source: &dyn ChangeSource) -> Result<ChangeToken> {
        self.anchors.load(&self.key_for(source))
    }

    fn pair_lock(&self, key: &AnchorKey) -> PairLock {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    fn persist(&self, key: &AnchorKey, report: &CycleReport) -> Result<()> {
        if !report.anchor_advanced {
            return Ok(());
        }
        // A push delivery can trail a pull cycle that already moved further
        if let (Some(next), Some(previous)) =
            (report.next_anchor.as_u64(), report.previous_anchor.as_u64())
        {
            if next < previous {
                tracing::debug!(
                    "Keeping anchor {} for {}; delivery ended at {}",
                    report.previous_anchor,
                    key,
                    report.next_anchor
                );
                return Ok(());
            }
        }
        self.anchors.save(key, &report.next_anchor)?;
        tracing::debug!("Anchor for {} now {}", key, report.next_anchor);
        Ok(())
    }

    /// Run one pull cycle for `source` and persist the resulting anchor
    ///
    /// The cycle runs on its own task so the caller is never blocked by
    /// remote I/O beyond awaiting the result.
    pub async fn sync_once(&self, source: Arc<dyn ChangeSource>) -> Result<CycleReport> {
        let engine = self.clone();
        let task = tokio::spawn(async move {
            let key = engine.key_for(source.as_ref());
            let _guard = engine.pair_lock(&key).lock_owned().await;

            let anchor = engine.anchors.load(&key)?;
            tracing::info!("Syncing {} from anchor {}", key, anchor);

            let report = cycle::run_cycle(source.as_ref(), engine.remote.as_ref(), &anchor).await?;
            engine.persist(&key, &report)?;

            tracing::info!("Cycle for {} finished: {}", key, report.summary());
            Ok(report)
        });

        task.await.map_err(|e| {
            SyncError::Io(std::io::Error::other(format!("sync task failed: {}", e)))
        })?
    }

    /// One cycle for each source, concurrently. Results are in input order.
    pub async fn sync_all(&self, sources: Vec<Arc<dyn ChangeSource>>) -> Vec<Result<CycleReport>> {
        futures::future::join_all(sources.into_iter().map(|source| self.sync_once(source))).await
    }

    /// Follow a push subscription until it ends
    ///
    /// Each delivery is applied as one cycle. When a cycle holds the anchor,
    /// or a delivery fails, the next cycle is a pull from the persisted
    /// anchor. It runs on the next wake-up or once the retry delay elapses,
    /// whichever comes first; the delay doubles while cycles keep failing.
    pub async fn follow<S, F>(&self, source: Arc<S>, mut on_report: F) -> Result<()>
    where
        S: SubscribableSource + 'static,
        F: FnMut(Result<CycleReport>) + Send,
    {
        let key = self.key_for(source.as_ref());
        let lock = self.pair_lock(&key);
        let start = self.anchors.load(&key)?;
        tracing::info!("Following {} from anchor {}", key, start);

        let mut deliveries = source.subscribe(start);
        let mut retry: Option<Duration> = None;

        loop {
            let delivery = match retry {
                Some(delay) => tokio::select! {
                    next = deliveries.next() => match next {
                        Some(delivery) => Some(delivery),
                        None => break,
                    },
                    _ = tokio::time::sleep(delay) => {
                        tracing::debug!("Retrying {} after {:?}", key, delay);
                        None
                    }
                },
                None => match deliveries.next().await {
                    Some(delivery) => Some(delivery),
                    None => break,
                },
            };

            let _guard = lock.lock().await;

            let result = match (retry.is_some(), delivery) {
                (false, Some(Ok(changes))) => match self.anchors.load(&key) {
                    Ok(anchor) => Ok(cycle::apply_changes(self.remote.as_ref(), &anchor, changes).await),
                    Err(e) => Err(e),
                },
                (false, Some(Err(e))) => Err(e),
                _ => {
                    tracing::debug!("Replaying {} from its persisted anchor", key);
                    match self.anchors.load(&key) {
                        Ok(anchor) => {
                            cycle::run_cycle(source.as_ref(), self.remote.as_ref(), &anchor).await
                        }
                        Err(e) => Err(e),
                    }
                }
            };

            let result = result.and_then(|report| {
                self.persist(&key, &report)?;
                Ok(report)
            });

            let held = match &result {
                Ok(report) => !report.anchor_advanced,
                Err(e) => {
                    tracing::warn!("Delivery for {} failed: {}", key, e);
                    true
                }
            };
            retry = match (held, retry) {
                (false, _) => None,
                (true, None) => Some(self.retry_delay),
                (true, Some(delay)) => Some((delay * 2).min(MAX_RETRY_DELAY)),
            };

            if let Ok(report) = &result {
                tracing::info!("Cycle for {} finished: {}", key, report.summary());
            }
            on_report(result);
        }

        tracing::info!("Subscription for {} ended", key);
        Ok(())
    }

    /// Forget the persisted anchor; the next cycle re-reads the whole source
    /// and relies on deduplication
    pub async fn reset(&self, source: &dyn ChangeSource) -> Result<()> {
        let key = self.key_for(source);
        let _guard = self.pair_lock(&key).lock_owned().await;
        self.anchors.clear(&key)?;
        tracing::info!("Cleared anchor for {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::MemoryAnchorStore;
    use crate::api::MemoryRemoteStore;
    use crate::model::LocalRecord;
    use crate::source::MemorySource;
    use serde_json::json;

    fn engine() -> (SyncEngine, Arc<MemoryRemoteStore>, Arc<MemoryAnchorStore>) {
        let remote = Arc::new(MemoryRemoteStore::new("remote"));
        let anchors = Arc::new(MemoryAnchorStore::new());
        (SyncEngine::new(remote.clone(), anchors.clone()), remote, anchors)
    }

    #[tokio::test]
    async fn test_sync_once_persists_anchor() {
        let (engine, remote, _) = engine();
        let source = Arc::new(MemorySource::new("src"));
        source.push_addition(LocalRecord::new("a1", "s", "note/txt", json!("hi")));

        let report = engine.sync_once(source.clone()).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(engine.anchor(source.as_ref()).unwrap(), ChangeToken::from_u64(1));
        assert_eq!(remote.events().len(), 1);

        // Nothing new: no creation, anchor unchanged
        let report = engine.sync_once(source.clone()).await.unwrap();
        assert!(report.created.is_empty());
        assert_eq!(engine.anchor(source.as_ref()).unwrap(), ChangeToken::from_u64(1));
    }

    #[tokio::test]
    async fn test_held_anchor_is_not_persisted() {
        let (engine, remote, _) = engine();
        let source = Arc::new(MemorySource::new("src"));
        source.push_addition(LocalRecord::new("a1", "s", "note/txt", json!("hi")));
        remote.fail_method("events.get");

        let report = engine.sync_once(source.clone()).await.unwrap();
        assert!(!report.anchor_advanced);
        assert!(engine.anchor(source.as_ref()).unwrap().is_bootstrap());
    }

    #[tokio::test]
    async fn test_reset_replays_without_duplicates() {
        let (engine, remote, _) = engine();
        let source = Arc::new(MemorySource::new("src"));
        source.push_addition(LocalRecord::new("a1", "s", "note/txt", json!("hi")));
        engine.sync_once(source.clone()).await.unwrap();

        engine.reset(source.as_ref()).await.unwrap();
        assert!(engine.anchor(source.as_ref()).unwrap().is_bootstrap());

        let report = engine.sync_once(source.clone()).await.unwrap();
        assert_eq!(report.duplicates_skipped, 1);
        assert_eq!(remote.events_with_tag("a1").len(), 1);
    }

    #[test]
    fn test_trailing_delivery_does_not_move_anchor_back() {
        let (engine, _, anchors) = engine();
        let key = AnchorKey::new("src", "memory://remote");
        anchors.save(&key, &ChangeToken::from_u64(5)).unwrap();

        let mut report = CycleReport::new(ChangeToken::from_u64(5));
        report.next_anchor = ChangeToken::from_u64(3);
        report.anchor_advanced = true;
        engine.persist(&key, &report).unwrap();
        assert_eq!(anchors.load(&key).unwrap(), ChangeToken::from_u64(5));

        report.next_anchor = ChangeToken::from_u64(7);
        engine.persist(&key, &report).unwrap();
        assert_eq!(anchors.load(&key).unwrap(), ChangeToken::from_u64(7));
    }

    #[test]
    fn test_key_uses_remote_identity() {
        let (engine, _, _) = engine();
        let source = MemorySource::new("journal:x");
        let key = engine.key_for(&source);
        assert_eq!(key, AnchorKey::new("journal:x", "memory://remote"));
    }
}
