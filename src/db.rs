//! SQLite ledger of threads already handed to the posting integration

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

/// Database handle for the posting ledger
pub struct Database {
    conn: Connection,
}

/// One ledger row
#[derive(Debug, Clone, PartialEq)]
pub struct PostedThread {
    pub thread_id: u64,
    pub external_id: String,
    pub posted_at: i64,
}

impl Database {
    /// Open (or create) the ledger file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS posted_threads (
                thread_id INTEGER PRIMARY KEY,
                external_id TEXT NOT NULL,
                posted_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_posted_at ON posted_threads(posted_at);
            "#,
        )?;
        Ok(())
    }

    pub fn is_posted(&self, thread_id: u64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM posted_threads WHERE thread_id = ?1",
            params![thread_id as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record a successful post; returns false if the thread was already recorded
    pub fn record_post(&self, thread_id: u64, external_id: &str) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO posted_threads (thread_id, external_id, posted_at) VALUES (?1, ?2, ?3)",
            params![thread_id as i64, external_id, chrono::Utc::now().timestamp()],
        )?;
        Ok(inserted > 0)
    }

    pub fn get_post(&self, thread_id: u64) -> Result<Option<PostedThread>> {
        let row = self
            .conn
            .query_row(
                "SELECT thread_id, external_id, posted_at FROM posted_threads WHERE thread_id = ?1",
                params![thread_id as i64],
                |row| {
                    Ok(PostedThread {
                        thread_id: row.get::<_, i64>(0)? as u64,
                        external_id: row.get(1)?,
                        posted_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn posted_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM posted_threads", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
