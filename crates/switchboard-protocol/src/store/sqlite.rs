//! SQLite-backed membership store.
//!
//! One row per (set, member). Every batch runs in a single transaction on a
//! blocking thread, so several processes on one host can share the file.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection};

use super::{apply_batch, MembershipStore, SetBackend, StoreCommand, StoreError, StoreReply};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS members (
    set_name TEXT NOT NULL,
    member   TEXT NOT NULL,
    PRIMARY KEY (set_name, member)
) WITHOUT ROWID;";

/// Durable membership store on a SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// A private store that vanishes with the process.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Set access inside an open transaction.
struct TxBackend<'a>(&'a Connection);

impl SetBackend for TxBackend<'_> {
    fn members(&mut self, set: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut stmt = self
            .0
            .prepare_cached("SELECT member FROM members WHERE set_name = ?1")?;
        let rows = stmt.query_map(params![set], |row| row.get::<_, String>(0))?;
        let mut out = BTreeSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    fn insert(&mut self, set: &str, member: &str) -> Result<bool, StoreError> {
        let n = self.0.execute(
            "INSERT OR IGNORE INTO members (set_name, member) VALUES (?1, ?2)",
            params![set, member],
        )?;
        Ok(n > 0)
    }

    fn remove(&mut self, set: &str, member: &str) -> Result<bool, StoreError> {
        let n = self.0.execute(
            "DELETE FROM members WHERE set_name = ?1 AND member = ?2",
            params![set, member],
        )?;
        Ok(n > 0)
    }

    fn replace(&mut self, set: &str, members: BTreeSet<String>) -> Result<(), StoreError> {
        self.delete(set)?;
        for m in &members {
            self.insert(set, m)?;
        }
        Ok(())
    }

    fn delete(&mut self, set: &str) -> Result<bool, StoreError> {
        let n = self
            .0
            .execute("DELETE FROM members WHERE set_name = ?1", params![set])?;
        Ok(n > 0)
    }
}

#[async_trait::async_trait]
impl MembershipStore for SqliteStore {
    async fn exec(&self, batch: Vec<StoreCommand>) -> Result<Vec<StoreReply>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<StoreReply>, StoreError> {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            let tx = conn.transaction()?;
            let replies = apply_batch(&mut TxBackend(&tx), batch)?;
            tx.commit()?;
            Ok(replies)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}
