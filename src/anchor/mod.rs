// Anchor persistence
//
// One ChangeToken per (source, remote store) pair, owned by the host and
// replaced as a whole after each dispatched cycle.

pub mod file;
pub mod sqlite;

use crate::error::{Result, SyncError};
use crate::model::ChangeToken;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

pub use file::FileAnchorStore;
pub use sqlite::SqliteAnchorStore;

/// Identifies the sync pair an anchor belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorKey {
    pub source: String,
    pub remote: String,
}

impl AnchorKey {
    pub fn new(source: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            remote: remote.into(),
        }
    }

    /// Stable hash of the pair, safe to use as a file name
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source.as_bytes());
        // Separator keeps ("ab","c") and ("a","bc") apart
        hasher.update(&[0]);
        hasher.update(self.remote.as_bytes());
        hex::encode(&hasher.finalize().as_bytes()[..16])
    }
}

impl std::fmt::Display for AnchorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} → {}", self.source, self.remote)
    }
}

/// Host-owned mapping from sync pair to its last persisted anchor
pub trait AnchorStore: Send + Sync {
    /// Last persisted anchor, or the bootstrap token if none
    fn load(&self, key: &AnchorKey) -> Result<ChangeToken>;

    /// Replace the anchor for `key` in one step
    fn save(&self, key: &AnchorKey, token: &ChangeToken) -> Result<()>;

    /// Forget the anchor so the next cycle starts from the beginning
    fn clear(&self, key: &AnchorKey) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryAnchorStore {
    anchors: Mutex<HashMap<AnchorKey, ChangeToken>>,
}

impl MemoryAnchorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnchorStore for MemoryAnchorStore {
    fn load(&self, key: &AnchorKey) -> Result<ChangeToken> {
        let anchors = self.anchors.lock().unwrap_or_else(|e| e.into_inner());
        Ok(anchors.get(key).cloned().unwrap_or_default())
    }

    fn save(&self, key: &AnchorKey, token: &ChangeToken) -> Result<()> {
        let mut anchors = self.anchors.lock().unwrap_or_else(|e| e.into_inner());
        anchors.insert(key.clone(), token.clone());
        Ok(())
    }

    fn clear(&self, key: &AnchorKey) -> Result<()> {
        let mut anchors = self.anchors.lock().unwrap_or_else(|e| e.into_inner());
        anchors.remove(key);
        Ok(())
    }
}

/// Default state directory (~/.cache/pryv-sync/anchors/)
pub fn default_state_dir() -> Result<PathBuf> {
    let cache_dir = if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg_cache)
    } else if let Some(cache) = dirs::cache_dir() {
        cache
    } else {
        return Err(SyncError::Config(
            "Cannot determine cache directory (HOME not set)".to_string(),
        ));
    };

    Ok(cache_dir.join("pryv-sync").join("anchors"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_and_distinct() {
        let a = AnchorKey::new("journal:/tmp/a", "https://alice.pryv.me/");
        let b = AnchorKey::new("journal:/tmp/b", "https://alice.pryv.me/");
        assert_eq!(a.digest(), a.clone().digest());
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 32);

        let split1 = AnchorKey::new("ab", "c");
        let split2 = AnchorKey::new("a", "bc");
        assert_ne!(split1.digest(), split2.digest());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryAnchorStore::new();
        let key = AnchorKey::new("s", "r");
        assert!(store.load(&key).unwrap().is_bootstrap());

        store.save(&key, &ChangeToken::from_u64(7)).unwrap();
        assert_eq!(store.load(&key).unwrap(), ChangeToken::from_u64(7));

        let other = AnchorKey::new("s", "r2");
        assert!(store.load(&other).unwrap().is_bootstrap());

        store.clear(&key).unwrap();
        assert!(store.load(&key).unwrap().is_bootstrap());
    }
}
