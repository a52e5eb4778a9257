//! Incremental change sync between local data sources and a Pryv event store.
//!
//! A [`ChangeSource`] reports what was added or deleted since an opaque
//! [`ChangeToken`]. The [`SyncEngine`] pushes those changes to a
//! [`RemoteStore`] in batched requests, skips records the remote already has
//! (matched by idempotency tag), propagates deletions and persists the next
//! token through an [`AnchorStore`].

pub mod anchor;
pub mod api;
pub mod engine;
pub mod error;
pub mod model;
pub mod output;
pub mod snapshot;
pub mod source;
pub mod streams;

pub use anchor::{AnchorKey, AnchorStore, FileAnchorStore, MemoryAnchorStore, SqliteAnchorStore};
pub use api::{ApiCall, HttpRemoteStore, MemoryRemoteStore, RemoteStore};
pub use engine::{CycleReport, CycleState, SyncEngine};
pub use error::{Result, SyncError};
pub use model::{Attachment, ChangeSet, ChangeToken, Deletion, IdempotencyTag, LocalRecord};
pub use source::{ChangeSource, JournalSource, MemorySource, SubscribableSource};
