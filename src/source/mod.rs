pub mod journal;
pub mod memory;

use crate::error::Result;
use crate::model::{ChangeSet, ChangeToken};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;

pub use journal::{JournalEntry, JournalSource};
pub use memory::MemorySource;

/// Local data source queried by anchor
///
/// Querying again from an unchanged anchor must be safe: the engine relies
/// on it to retry after a failed fetch.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Stable identity, used to key persisted anchors
    fn id(&self) -> &str;

    /// Everything added or deleted since `anchor`
    async fn changes_since(&self, anchor: &ChangeToken) -> Result<ChangeSet>;
}

/// Push deliveries: one `ChangeSet` per batch of changes, never ending on
/// its own
pub type ChangeStream = BoxStream<'static, Result<ChangeSet>>;

/// Source that can push changes as they happen
pub trait SubscribableSource: ChangeSource {
    /// Subscribe starting at `from`. The backlog since `from` is delivered
    /// first, then one delivery per observed change.
    fn subscribe(&self, from: ChangeToken) -> ChangeStream;
}

/// Turn a pull-only source into a push stream by polling every `interval`
///
/// Empty results are swallowed. A failed query is delivered as an error and
/// polling continues from the same anchor.
pub fn poll_subscription(
    source: Arc<dyn ChangeSource>,
    from: ChangeToken,
    interval: Duration,
) -> ChangeStream {
    stream::unfold(
        (source, from, true),
        move |(source, mut anchor, mut first)| async move {
            loop {
                if !first {
                    tokio::time::sleep(interval).await;
                }
                first = false;

                match source.changes_since(&anchor).await {
                    Ok(changes) if changes.is_empty() && changes.next_anchor == anchor => {
                        continue;
                    }
                    Ok(changes) => {
                        anchor = changes.next_anchor.clone();
                        return Some((Ok(changes), (source, anchor, false)));
                    }
                    Err(e) => return Some((Err(e), (source, anchor, false))),
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocalRecord;
    use serde_json::json;

    #[tokio::test]
    async fn test_poll_subscription_delivers_backlog_then_updates() {
        let source = Arc::new(MemorySource::new("poll"));
        source.push_addition(LocalRecord::new("a1", "s", "count/generic", json!(1)));

        let mut deliveries = poll_subscription(
            source.clone(),
            ChangeToken::bootstrap(),
            Duration::from_millis(10),
        );

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.additions.len(), 1);
        assert_eq!(first.next_anchor, ChangeToken::from_u64(1));

        source.push_deletion("a1");
        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.additions.is_empty());
        assert_eq!(second.deletions.len(), 1);
        assert_eq!(second.next_anchor, ChangeToken::from_u64(2));
    }

    #[tokio::test]
    async fn test_poll_subscription_reports_errors_and_retries() {
        let source = Arc::new(MemorySource::new("poll"));
        source.push_addition(LocalRecord::new("a1", "s", "count/generic", json!(1)));
        source.fail_next_query();

        let mut deliveries = poll_subscription(
            source.clone(),
            ChangeToken::bootstrap(),
            Duration::from_millis(10),
        );

        assert!(deliveries.next().await.unwrap().is_err());
        let retried = deliveries.next().await.unwrap().unwrap();
        assert_eq!(retried.additions.len(), 1);
    }
}
