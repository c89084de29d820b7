use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use crate::StoreResult;

/// Shared connection to the authoritative SQLite store. All substrate
/// modules (blackboard, log, locks, archive) ride the same database file
/// so cross-table writes stay transactional.
#[derive(Clone)]
pub struct StoreDatabase {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl StoreDatabase {
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| crate::StoreError::Invalid(format!("create state dir: {e}")))?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;

        // WAL keeps readers unblocked while the single writer commits.
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS projects (
                project_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                doc TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                assigned_to TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS approvals (
                approval_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_approvals_project ON approvals(project_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                event_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                actor TEXT NOT NULL,
                causation_id TEXT,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL,
                blackboard_pointer TEXT,
                metadata TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_project_ts ON events(project_id, timestamp)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS log_messages (
                topic TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event_id TEXT NOT NULL,
                body TEXT NOT NULL,
                appended_at_ms INTEGER NOT NULL,
                PRIMARY KEY (topic, seq)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS log_groups (
                topic TEXT NOT NULL,
                grp TEXT NOT NULL,
                next_seq INTEGER NOT NULL,
                PRIMARY KEY (topic, grp)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS log_pending (
                topic TEXT NOT NULL,
                grp TEXT NOT NULL,
                seq INTEGER NOT NULL,
                consumer TEXT NOT NULL,
                delivered_at_ms INTEGER NOT NULL,
                delivery_count INTEGER NOT NULL,
                PRIMARY KEY (topic, grp, seq)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS locks (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS processed_events (
                handler TEXT NOT NULL,
                event_id TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                PRIMARY KEY (handler, event_id)
            )",
            [],
        )?;

        Ok(())
    }

    /// Idempotency guard for at-least-once delivery: returns true exactly
    /// once per (handler, event_id); redeliveries observe false.
    pub async fn mark_processed(&self, handler: &str, event_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_events (handler, event_id, processed_at)
             VALUES (?1, ?2, ?3)",
            params![handler, event_id, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    pub async fn is_processed(&self, handler: &str, event_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_events WHERE handler = ?1 AND event_id = ?2",
            params![handler, event_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (StoreDatabase, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = StoreDatabase::open(&dir.path().join("showrunner.db"))
            .await
            .unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn mark_processed_dedupes_redelivery() {
        let (db, _dir) = open_temp().await;
        assert!(db.mark_processed("budget", "evt-1").await.unwrap());
        assert!(!db.mark_processed("budget", "evt-1").await.unwrap());
        // A different handler sees the same event fresh.
        assert!(db.mark_processed("approval", "evt-1").await.unwrap());
    }

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("showrunner.db");
        let _first = StoreDatabase::open(&path).await.unwrap();
        let _second = StoreDatabase::open(&path).await.unwrap();
    }
}
