// Static values (date of birth, sex, ...) read once per run rather than
// through a change log. A new event is created only when the value moved.

use crate::api::{event_of, events_of, ApiCall, RemoteStore};
use crate::error::{Result, SyncError};
use crate::model::LocalRecord;
use serde_json::json;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The latest remote event already holds this value
    Unchanged,
    /// A new event was created; carries its remote id
    Created(String),
}

pub async fn sync_snapshot(remote: &dyn RemoteStore, record: &LocalRecord) -> Result<SnapshotOutcome> {
    let lookup = ApiCall::new(
        "events.get",
        json!({ "streams": [record.stream_id], "limit": 1 }),
    );
    let latest = match remote.call_batch(vec![lookup]).await?.pop() {
        Some(Ok(result)) => events_of(&result)?.into_iter().next(),
        Some(Err(e)) => return Err(e.into_sync_error("events.get")),
        None => return Err(SyncError::InvalidResponse("empty batch response".into())),
    };

    if let Some(event) = &latest {
        if event.event_type == record.event_type && event.content == record.content {
            tracing::debug!("Snapshot {} unchanged (remote {})", record.stream_id, event.id);
            return Ok(SnapshotOutcome::Unchanged);
        }
    }

    let created = match &record.attachment {
        Some(attachment) => {
            remote
                .create_with_attachment(record.to_event_params(), attachment)
                .await?
        }
        None => {
            let call = ApiCall::events_create(record.to_event_params());
            match remote.call_batch(vec![call]).await?.pop() {
                Some(Ok(result)) => event_of(&result)?,
                Some(Err(e)) => return Err(e.into_sync_error("events.create")),
                None => return Err(SyncError::InvalidResponse("empty batch response".into())),
            }
        }
    };

    tracing::info!("Snapshot {} updated as {}", record.stream_id, created.id);
    Ok(SnapshotOutcome::Created(created.id))
}

/// Read snapshot values: JSON records, one after the other (NDJSON works),
/// in the same shape as journal `add` lines without the `op` field
pub fn read_snapshot_file(path: &Path) -> Result<Vec<LocalRecord>> {
    let contents = std::fs::read_to_string(path)?;
    let records = serde_json::Deserializer::from_str(&contents)
        .into_iter::<LocalRecord>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Run `sync_snapshot` for every record concurrently. Results are in input
/// order, keyed by record id.
pub async fn sync_snapshots(
    remote: &dyn RemoteStore,
    records: &[LocalRecord],
) -> Vec<(String, Result<SnapshotOutcome>)> {
    let outcomes =
        futures::future::join_all(records.iter().map(|record| sync_snapshot(remote, record))).await;
    records
        .iter()
        .map(|record| record.id.clone())
        .zip(outcomes)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MemoryRemoteStore;
    use crate::model::Attachment;

    fn birth_date(value: &str) -> LocalRecord {
        LocalRecord::new("dob", "birthDate", "date/iso-8601", json!(value))
    }

    #[tokio::test]
    async fn test_creates_only_on_change() {
        let remote = MemoryRemoteStore::new("r");

        let first = sync_snapshot(&remote, &birth_date("1990-01-01")).await.unwrap();
        assert!(matches!(first, SnapshotOutcome::Created(_)));

        let again = sync_snapshot(&remote, &birth_date("1990-01-01")).await.unwrap();
        assert_eq!(again, SnapshotOutcome::Unchanged);

        let changed = sync_snapshot(&remote, &birth_date("1990-01-02")).await.unwrap();
        assert!(matches!(changed, SnapshotOutcome::Created(_)));
        assert_eq!(remote.events().len(), 2);
    }

    #[tokio::test]
    async fn test_attachment_goes_through_upload() {
        let remote = MemoryRemoteStore::new("r");
        let record = birth_date("1990-01-01").with_attachment(Attachment {
            filename: "patient".to_string(),
            mime_type: "application/json".to_string(),
            data: b"{}".to_vec(),
        });

        sync_snapshot(&remote, &record).await.unwrap();
        assert_eq!(remote.attachment_uploads(), 1);
        assert_eq!(remote.calls_to("events.create"), 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_an_error() {
        let remote = MemoryRemoteStore::new("r");
        remote.fail_method("events.get");
        let err = sync_snapshot(&remote, &birth_date("1990-01-01")).await.unwrap_err();
        assert!(err.is_remote_call_failure());
        assert!(remote.events().is_empty());
    }

    #[test]
    fn test_read_snapshot_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static.ndjson");
        std::fs::write(
            &path,
            concat!(
                r#"{"id":"dob","stream_id":"birthDate","type":"date/iso-8601","content":"1990-01-01"}"#,
                "\n",
                r#"{"id":"sex","stream_id":"sex","type":"note/txt","content":"female"}"#,
                "\n"
            ),
        )
        .unwrap();

        let records = read_snapshot_file(&path).unwrap();
        assert_eq!(records, vec![
            birth_date("1990-01-01"),
            LocalRecord::new("sex", "sex", "note/txt", json!("female")),
        ]);

        std::fs::write(&path, "{\"id\": 3}").unwrap();
        assert!(read_snapshot_file(&path).is_err());
        assert!(read_snapshot_file(&dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_sync_snapshots_reports_each_record() {
        let remote = MemoryRemoteStore::new("r");
        let records = vec![
            birth_date("1990-01-01"),
            LocalRecord::new("sex", "sex", "note/txt", json!("female")),
        ];
        sync_snapshot(&remote, &records[0]).await.unwrap();

        let results = sync_snapshots(&remote, &records).await;
        assert_eq!(results[0].0, "dob");
        assert_eq!(results[0].1.as_ref().unwrap(), &SnapshotOutcome::Unchanged);
        assert_eq!(results[1].0, "sex");
        assert!(matches!(results[1].1, Ok(SnapshotOutcome::Created(_))));
        assert_eq!(remote.events().len(), 2);
    }
}
