// Remote stream bootstrap

use crate::api::{ApiCall, RemoteStore};
use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::str::FromStr;

/// A stream that must exist before records are pushed into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub id: String,
    pub name: String,
    pub parent: Option<String>,
}

impl StreamSpec {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

impl FromStr for StreamSpec {
    type Err = SyncError;

    /// `id` or `parent/id`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('/') {
            Some((parent, id)) if !parent.is_empty() && !id.is_empty() && !id.contains('/') => {
                Ok(StreamSpec::new(id).with_parent(parent))
            }
            None if !s.is_empty() => Ok(StreamSpec::new(s)),
            _ => Err(SyncError::Config(format!("Invalid stream '{}': expected ID or PARENT/ID", s))),
        }
    }
}

/// Order specs so every parent listed comes before its children
fn parents_first(specs: &[StreamSpec]) -> Vec<&StreamSpec> {
    let by_id: HashMap<&str, &StreamSpec> = specs.iter().map(|s| (s.id.as_str(), s)).collect();

    let depth = |spec: &StreamSpec| {
        let mut depth = 0;
        let mut current = spec;
        while let Some(parent) = current.parent.as_deref().and_then(|p| by_id.get(p).copied()) {
            depth += 1;
            current = parent;
            // Cycles in the input cannot be satisfied anyway
            if depth > specs.len() {
                break;
            }
        }
        depth
    };

    let mut ordered: Vec<&StreamSpec> = specs.iter().collect();
    ordered.sort_by_key(|spec| depth(*spec));
    ordered
}

/// Create each stream that does not exist yet, one request per stream
///
/// A stream that already exists counts as success. Results are returned per
/// stream id, parents first.
pub async fn ensure_streams(
    remote: &dyn RemoteStore,
    specs: &[StreamSpec],
) -> Vec<(String, Result<()>)> {
    let mut results = Vec::with_capacity(specs.len());

    for spec in parents_first(specs) {
        let call = ApiCall::streams_create(&spec.id, &spec.name, spec.parent.as_deref());
        let outcome = match remote.call_batch(vec![call]).await {
            Ok(mut outcomes) => match outcomes.pop() {
                Some(Ok(_)) => {
                    tracing::info!("Created stream {}", spec.id);
                    Ok(())
                }
                Some(Err(e)) if e.id == "item-already-exists" => {
                    tracing::debug!("Stream {} already exists", spec.id);
                    Ok(())
                }
                Some(Err(e)) => Err(e.into_sync_error("streams.create")),
                None => Err(SyncError::InvalidResponse("empty batch response".into())),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            tracing::warn!("Could not create stream {}: {}", spec.id, e);
        }
        results.push((spec.id.clone(), outcome));
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryRemoteStore;

    #[test]
    fn test_parse_stream_spec() {
        assert_eq!("health".parse::<StreamSpec>().unwrap(), StreamSpec::new("health"));
        assert_eq!(
            "health/bodyMass".parse::<StreamSpec>().unwrap(),
            StreamSpec::new("bodyMass").with_parent("health")
        );
        assert!("".parse::<StreamSpec>().is_err());
        assert!("/x".parse::<StreamSpec>().is_err());
        assert!("a/b/c".parse::<StreamSpec>().is_err());
    }

    #[tokio::test]
    async fn test_parents_created_first() {
        let remote = MemoryRemoteStore::new("r");
        let specs = vec![
            StreamSpec::new("bodyMass").with_parent("health"),
            StreamSpec::new("health"),
        ];

        let results = ensure_streams(&remote, &specs).await;
        assert_eq!(results[0].0, "health");
        assert_eq!(results[1].0, "bodyMass");
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(remote.has_stream("bodyMass"));
        assert_eq!(remote.batches_with("streams.create"), 2);
    }

    #[tokio::test]
    async fn test_existing_stream_is_ok() {
        let remote = MemoryRemoteStore::new("r");
        let specs = vec![StreamSpec::new("health")];
        ensure_streams(&remote, &specs).await;

        let results = ensure_streams(&remote, &specs).await;
        assert!(results[0].1.is_ok());
    }

    #[tokio::test]
    async fn test_missing_parent_fails_that_stream_only() {
        let remote = MemoryRemoteStore::new("r");
        let specs = vec![
            StreamSpec::new("orphan").with_parent("nowhere"),
            StreamSpec::new("diary"),
        ];

        let results = ensure_streams(&remote, &specs).await;
        let orphan = results.iter().find(|(id, _)| id == "orphan").unwrap();
        assert!(orphan.1.as_ref().unwrap_err().is_remote_call_failure());
        assert!(remote.has_stream("diary"));
    }
}
