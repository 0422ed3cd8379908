use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Db;
use crate::error::StoreError;
use crate::types::FileVersion;

/// History of prior-read file content, consumed by edit-class tools to
/// detect concurrent modification. See spec §6 `files` table.
pub struct FileHistory {
    db: Db,
}

impl FileHistory {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Record a new version snapshot for `path` within `session_id`,
    /// assigning it the next version number.
    pub async fn record_version(
        &self,
        session_id: &str,
        path: &str,
        content: Option<String>,
    ) -> Result<FileVersion, StoreError> {
        let session_id = session_id.to_string();
        let path = path.to_string();
        let recorded_at = Utc::now();
        self.db
            .with_conn(move |conn| {
                let next_version: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(version), 0) + 1 FROM files WHERE session_id = ?1 AND path = ?2",
                    params![session_id, path],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO files (session_id, path, version, content, recorded_at) \
                     VALUES (?1,?2,?3,?4,?5)",
                    params![session_id, path, next_version, content, recorded_at],
                )?;
                Ok(FileVersion {
                    session_id,
                    path,
                    version: next_version,
                    content,
                    recorded_at,
                })
            })
            .await
    }

    pub async fn latest_version(
        &self,
        session_id: &str,
        path: &str,
    ) -> Result<Option<FileVersion>, StoreError> {
        let session_id = session_id.to_string();
        let path = path.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT session_id, path, version, content, recorded_at FROM files \
                     WHERE session_id = ?1 AND path = ?2 ORDER BY version DESC LIMIT 1",
                    params![session_id, path],
                    |row| {
                        Ok(FileVersion {
                            session_id: row.get(0)?,
                            path: row.get(1)?,
                            version: row.get(2)?,
                            content: row.get(3)?,
                            recorded_at: row.get(4)?,
                        })
                    },
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await
    }

    pub async fn list_versions(
        &self,
        session_id: &str,
        path: &str,
    ) -> Result<Vec<FileVersion>, StoreError> {
        let session_id = session_id.to_string();
        let path = path.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, path, version, content, recorded_at FROM files \
                     WHERE session_id = ?1 AND path = ?2 ORDER BY version ASC",
                )?;
                let rows = stmt.query_map(params![session_id, path], |row| {
                    Ok(FileVersion {
                        session_id: row.get(0)?,
                        path: row.get(1)?,
                        version: row.get(2)?,
                        content: row.get(3)?,
                        recorded_at: row.get(4)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::SessionStore;
    use crush_broker::Broker;
    use std::sync::Arc;

    #[tokio::test]
    async fn records_successive_versions() {
        let db = Db::open_in_memory().unwrap();
        let sessions = SessionStore::new(db.clone(), Arc::new(Broker::new(64)));
        let session = sessions.create("s").await.unwrap();
        let files = FileHistory::new(db);

        let v1 = files.record_version(&session.id, "/tmp/a.txt", Some("foo".into())).await.unwrap();
        assert_eq!(v1.version, 1);
        let v2 = files
            .record_version(&session.id, "/tmp/a.txt", Some("bar".into()))
            .await
            .unwrap();
        assert_eq!(v2.version, 2);

        let latest = files.latest_version(&session.id, "/tmp/a.txt").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(files.list_versions(&session.id, "/tmp/a.txt").await.unwrap().len(), 2);
    }
}
