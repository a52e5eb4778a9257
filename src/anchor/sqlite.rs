// SQLite anchor store
//
// All pairs share one database; rows are keyed by the pair digest.

use super::{AnchorKey, AnchorStore};
use crate::error::Result;
use crate::model::ChangeToken;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

pub struct SqliteAnchorStore {
    conn: Mutex<Connection>,
}

impl SqliteAnchorStore {
    /// Database schema version
    const SCHEMA_VERSION: i32 = 1;

    /// Database file name inside the state directory
    pub const DB_FILE: &'static str = "anchors.db";

    /// Open or create the anchor database in `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(Self::DB_FILE))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS anchors (
                pair_hash TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                remote TEXT NOT NULL,
                token BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if version.is_none() {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES ('schema_version', ?1)",
                params![Self::SCHEMA_VERSION.to_string()],
            )?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AnchorStore for SqliteAnchorStore {
    fn load(&self, key: &AnchorKey) -> Result<ChangeToken> {
        let token: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT token FROM anchors WHERE pair_hash = ?1",
                params![key.digest()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(token.map(ChangeToken::from_bytes).unwrap_or_default())
    }

    fn save(&self, key: &AnchorKey, token: &ChangeToken) -> Result<()> {
        let updated_at = chrono::Utc::now().timestamp();
        self.conn().execute(
            "INSERT OR REPLACE INTO anchors (pair_hash, source, remote, token, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.digest(),
                key.source,
                key.remote,
                token.as_bytes(),
                updated_at
            ],
        )?;
        Ok(())
    }

    fn clear(&self, key: &AnchorKey) -> Result<()> {
        self.conn().execute(
            "DELETE FROM anchors WHERE pair_hash = ?1",
            params![key.digest()],
        )?;
        Ok(())
    }
}
