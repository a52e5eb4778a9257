// Change journal source
//
// Tails an append-only NDJSON file. Each line is one change:
//   {"op":"add","id":"...","stream_id":"...","type":"...","content":...}
//   {"op":"delete","id":"..."}
// The anchor is the byte offset just past the last complete line consumed.

use super::{ChangeSource, ChangeStream, SubscribableSource};
use crate::error::{Result, SyncError};
use crate::model::{ChangeSet, ChangeToken, Deletion, LocalRecord};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Re-read the journal at least this often even without watch events
pub const FALLBACK_POLL: Duration = Duration::from_secs(30);

/// One line of the journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    Add(LocalRecord),
    Delete(Deletion),
}

#[derive(Debug, Clone)]
pub struct JournalSource {
    id: String,
    path: PathBuf,
    poll_interval: Duration,
}

impl JournalSource {
    /// Source identified by the journal path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            id: format!("journal:{}", path.display()),
            path,
            poll_interval: FALLBACK_POLL,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Upper bound between two reads while subscribed
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append entries as complete lines
    pub fn append(&self, entries: &[JournalEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    fn query_failed(&self, message: impl Into<String>) -> SyncError {
        SyncError::SourceQueryFailed {
            source_id: self.id.clone(),
            message: message.into(),
        }
    }

    fn read_since(&self, anchor: &ChangeToken) -> Result<ChangeSet> {
        let offset = anchor
            .as_u64()
            .ok_or_else(|| self.query_failed(format!("unrecognized anchor {}", anchor)))?;

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && offset == 0 => {
                // Nothing written yet
                return Ok(ChangeSet {
                    next_anchor: ChangeToken::from_u64(0),
                    ..Default::default()
                });
            }
            Err(e) => {
                return Err(self.query_failed(format!(
                    "cannot open {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let len = file
            .metadata()
            .map_err(|e| self.query_failed(e.to_string()))?
            .len();
        if offset > len {
            return Err(self.query_failed(format!(
                "journal is {} bytes but anchor points at byte {}; was it truncated?",
                len, offset
            )));
        }

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| self.query_failed(e.to_string()))?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail)
            .map_err(|e| self.query_failed(e.to_string()))?;

        // A trailing partial line is still being written
        let consumed = match tail.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };

        let mut changes = ChangeSet {
            next_anchor: ChangeToken::from_u64(offset + consumed as u64),
            ..Default::default()
        };

        let mut line_start = offset;
        for line in tail[..consumed].split(|&b| b == b'\n') {
            let line_offset = line_start;
            line_start += line.len() as u64 + 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<JournalEntry>(line) {
                Ok(JournalEntry::Add(record)) => changes.additions.push(record),
                Ok(JournalEntry::Delete(deletion)) => changes.deletions.push(deletion),
                Err(e) => {
                    tracing::warn!(
                        "Skipping malformed journal line at byte {} of {}: {}",
                        line_offset,
                        self.path.display(),
                        e
                    );
                }
            }
        }

        tracing::trace!(
            "Read {} additions, {} deletions from {} (bytes {}..{})",
            changes.additions.len(),
            changes.deletions.len(),
            self.path.display(),
            offset,
            offset + consumed as u64
        );
        Ok(changes)
    }
}

#[async_trait]
impl ChangeSource for JournalSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn changes_since(&self, anchor: &ChangeToken) -> Result<ChangeSet> {
        let source = self.clone();
        let anchor = anchor.clone();
        tokio::task::spawn_blocking(move || source.read_since(&anchor))
            .await
            .map_err(|e| self.query_failed(e.to_string()))?
    }
}

impl SubscribableSource for JournalSource {
    fn subscribe(&self, from: ChangeToken) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();

        // Watch the parent directory so the journal may be created later
        let watch_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })
        .and_then(|mut watcher| {
            watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        });

        let watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                let err = self.query_failed(format!("cannot watch {}: {}", watch_dir.display(), e));
                return stream::once(async move { Err(err) }).boxed();
            }
        };

        tracing::debug!("Watching {} for changes", self.path.display());
        self.deliveries(from, rx, watcher)
    }
}

impl JournalSource {
    /// Re-read on every wake-up from `rx` and at least every poll interval.
    /// `guard` lives as long as the stream (the file watcher).
    fn deliveries<G: Send + 'static>(
        &self,
        from: ChangeToken,
        rx: mpsc::UnboundedReceiver<()>,
        guard: G,
    ) -> ChangeStream {
        stream::unfold(
            (self.clone(), from, rx, guard, true),
            |(source, mut anchor, mut rx, guard, mut first)| async move {
                loop {
                    if !first {
                        tokio::select! {
                            event = rx.recv() => {
                                if event.is_none() {
                                    return None;
                                }
                                // Collapse bursts of events into one re-read
                                while rx.try_recv().is_ok() {}
                            }
                            _ = tokio::time::sleep(source.poll_interval) => {}
                        }
                    }
                    first = false;

                    match source.changes_since(&anchor).await {
                        Ok(changes) if changes.is_empty() => {
                            anchor = changes.next_anchor;
                        }
                        Ok(changes) => {
                            anchor = changes.next_anchor.clone();
                            return Some((Ok(changes), (source, anchor, rx, guard, false)));
                        }
                        Err(e) => return Some((Err(e), (source, anchor, rx, guard, false))),
                    }
                }
            },
        )
        .boxed()
    }
}
