use super::{AnchorKey, AnchorStore};
use crate::error::{Result, SyncError};
use crate::model::ChangeToken;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

const STATE_VERSION: u32 = 1;

/// On-disk form of one anchor
#[derive(Debug, Serialize, Deserialize)]
struct AnchorFile {
    version: u32,
    source: String,
    remote: String,
    anchor: ChangeToken,
    updated_at: String,
}

/// One JSON file per sync pair, replaced atomically (temp file + rename)
pub struct FileAnchorStore {
    dir: PathBuf,
}

impl FileAnchorStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, key: &AnchorKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }
}

impl AnchorStore for FileAnchorStore {
    fn load(&self, key: &AnchorKey) -> Result<ChangeToken> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(ChangeToken::bootstrap());
        }

        tracing::debug!("Loading anchor for {} from {}", key, path.display());

        let file = File::open(&path)?;
        let state: AnchorFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Corrupted anchor file {}: {}", path.display(), e),
            ))
        })?;

        if state.version != STATE_VERSION {
            tracing::warn!(
                "Anchor file version mismatch: expected {}, got {}; starting from the beginning",
                STATE_VERSION,
                state.version
            );
            return Ok(ChangeToken::bootstrap());
        }

        if state.source != key.source || state.remote != key.remote {
            return Err(SyncError::Config(format!(
                "Anchor file {} belongs to {} → {}, not {}",
                path.display(),
                state.source,
                state.remote,
                key
            )));
        }

        Ok(state.anchor)
    }

    fn save(&self, key: &AnchorKey, token: &ChangeToken) -> Result<()> {
        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");

        tracing::trace!("Saving anchor {} for {} to {}", token, key, path.display());

        let state = AnchorFile {
            version: STATE_VERSION,
            source: key.source.clone(),
            remote: key.remote.clone(),
            anchor: token.clone(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };

        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &state)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn clear(&self, key: &AnchorKey) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
