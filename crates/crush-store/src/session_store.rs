use std::sync::Arc;

use chrono::Utc;
use crush_broker::{Broker, Event};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::Db;
use crate::error::StoreError;
use crate::message_store::MessageStore;
use crate::types::{Session, TodoEntry};

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let todos_json: String = row.get("todos_json")?;
    let todos: Vec<TodoEntry> = serde_json::from_str(&todos_json).unwrap_or_default();
    Ok(Session {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        title: row.get("title")?,
        summary_message_id: row.get("summary_message_id")?,
        prompt_tokens: row.get::<_, i64>("prompt_tokens")? as u64,
        completion_tokens: row.get::<_, i64>("completion_tokens")? as u64,
        cache_read_tokens: row.get::<_, i64>("cache_read_tokens")? as u64,
        cache_write_tokens: row.get::<_, i64>("cache_write_tokens")? as u64,
        cost: row.get("cost")?,
        todos,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Persistent ordered set of sessions. See spec §4.B.
pub struct SessionStore {
    db: Db,
    broker: Arc<Broker<Session>>,
}

impl SessionStore {
    pub fn new(db: Db, broker: Arc<Broker<Session>>) -> Self {
        Self { db, broker }
    }

    pub fn subscribe(&self) -> crush_broker::Subscription<Session> {
        self.broker.subscribe()
    }

    pub async fn create(&self, title: impl Into<String>) -> Result<Session, StoreError> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            title: title.into(),
            summary_message_id: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            cost: 0.0,
            todos: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        insert_session(&self.db, &session).await?;
        self.broker.publish(Event::created(session.clone()));
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row("SELECT * FROM sessions WHERE id = ?1", params![id], row_to_session)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Session>, StoreError> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY created_at ASC")?;
                let rows = stmt.query_map([], row_to_session)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }

    /// Persist the mutable fields of `session` (title, token/cost counters,
    /// summary pointer, todos). `id`/`parent_id`/`created_at` are immutable
    /// after creation.
    pub async fn update(&self, session: &Session) -> Result<(), StoreError> {
        let mut updated = session.clone();
        updated.updated_at = Utc::now();
        let todos_json = serde_json::to_string(&updated.todos)?;
        let s = updated.clone();
        self.db
            .with_conn(move |conn| {
                let changed = conn.execute(
                    "UPDATE sessions SET title=?1, summary_message_id=?2, prompt_tokens=?3, \
                     completion_tokens=?4, cache_read_tokens=?5, cache_write_tokens=?6, cost=?7, \
                     todos_json=?8, updated_at=?9 WHERE id=?10",
                    params![
                        s.title,
                        s.summary_message_id,
                        s.prompt_tokens as i64,
                        s.completion_tokens as i64,
                        s.cache_read_tokens as i64,
                        s.cache_write_tokens as i64,
                        s.cost,
                        todos_json,
                        s.updated_at,
                        s.id,
                    ],
                )?;
                if changed == 0 {
                    return Err(StoreError::SessionNotFound(s.id.clone()));
                }
                Ok(())
            })
            .await?;
        self.broker.publish(Event::updated(updated));
        Ok(())
    }

    /// Deletes `id`'s own messages (cascades via FK) and clears `parent_id`
    /// on any session forked from it (the child survives; see SPEC_FULL.md's
    /// resolution of the §4.B/§9 tension).
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let id_owned = id.to_string();
        self.db
            .with_conn(move |conn| {
                let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id_owned])?;
                if changed == 0 {
                    return Err(StoreError::SessionNotFound(id_owned));
                }
                Ok(())
            })
            .await?;
        self.broker.publish(Event::deleted(Session {
            id: id.to_string(),
            parent_id: None,
            title: String::new(),
            summary_message_id: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            cost: 0.0,
            todos: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }));
        Ok(())
    }

    /// Creates a new session forked from `source_id` at `up_to_message_id`
    /// (exclusive), copying role/parts/provider/model of every earlier
    /// message under fresh ids. See spec §4.B.
    pub async fn fork(
        &self,
        source_id: &str,
        up_to_message_id: &str,
        messages: &MessageStore,
    ) -> Result<Session, StoreError> {
        let source = self
            .get(source_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(source_id.to_string()))?;
        let source_messages = messages.list(source_id).await?;
        let boundary = source_messages
            .iter()
            .position(|m| m.id == up_to_message_id)
            .ok_or(StoreError::MessageNotFound)?;

        let now = Utc::now();
        let forked = Session {
            id: Uuid::new_v4().to_string(),
            parent_id: Some(source_id.to_string()),
            title: format!("Forked: {}", source.title),
            summary_message_id: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            cost: 0.0,
            todos: source.todos.clone(),
            created_at: now,
            updated_at: now,
        };
        insert_session(&self.db, &forked).await?;

        for original in &source_messages[..boundary] {
            messages
                .create_with_parts(
                    &forked.id,
                    original.role,
                    original.parts.clone(),
                    original.provider.clone(),
                    original.model.clone(),
                )
                .await?;
        }

        self.broker.publish(Event::created(forked.clone()));
        Ok(forked)
    }
}

async fn insert_session(db: &Db, session: &Session) -> Result<(), StoreError> {
    let s = session.clone();
    let todos_json = serde_json::to_string(&s.todos)?;
    db.with_conn(move |conn: &Connection| {
        conn.execute(
            "INSERT INTO sessions (id, parent_id, title, summary_message_id, prompt_tokens, \
             completion_tokens, cache_read_tokens, cache_write_tokens, cost, todos_json, \
             created_at, updated_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                s.id,
                s.parent_id,
                s.title,
                s.summary_message_id,
                s.prompt_tokens as i64,
                s.completion_tokens as i64,
                s.cache_read_tokens as i64,
                s.cache_write_tokens as i64,
                s.cost,
                todos_json,
                s.created_at,
                s.updated_at,
            ],
        )?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FinishReason, Part, Role};

    fn stores() -> (SessionStore, MessageStore) {
        let db = Db::open_in_memory().unwrap();
        let sessions = SessionStore::new(db.clone(), Arc::new(Broker::new(64)));
        let messages = MessageStore::new(db, Arc::new(Broker::new(64)));
        (sessions, messages)
    }

    #[tokio::test]
    async fn create_get_list_roundtrip() {
        let (sessions, _messages) = stores();
        let created = sessions.create("hello").await.unwrap();
        let fetched = sessions.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "hello");
        assert_eq!(sessions.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let (sessions, _messages) = stores();
        assert!(sessions.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_errors() {
        let (sessions, _messages) = stores();
        assert!(sessions.delete("nope").await.is_err());
    }

    #[tokio::test]
    async fn delete_clears_parent_id_on_children() {
        let (sessions, messages) = stores();
        let parent = sessions.create("parent").await.unwrap();
        let m = messages
            .create(&parent.id, Role::User, vec![Part::Text { text: "hi".into() }], None, None)
            .await
            .unwrap();
        let child = sessions.fork(&parent.id, &m.id, &messages).await.unwrap();
        sessions.delete(&parent.id).await.unwrap();
        let child_after = sessions.get(&child.id).await.unwrap().unwrap();
        assert_eq!(child_after.parent_id, None, "weak back-reference: child survives parent delete");
    }

    #[tokio::test]
    async fn fork_copies_prefix_with_fresh_ids() {
        let (sessions, messages) = stores();
        let source = sessions.create("source").await.unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let m = messages
                .create(&source.id, role, vec![Part::Text { text: format!("msg{i}") }], None, None)
                .await
                .unwrap();
            ids.push(m.id);
        }
        let forked = sessions.fork(&source.id, &ids[3], &messages).await.unwrap();
        assert!(forked.title.starts_with("Forked: "));
        assert_eq!(forked.parent_id.as_deref(), Some(source.id.as_str()));

        let source_list = messages.list(&source.id).await.unwrap();
        let forked_list = messages.list(&forked.id).await.unwrap();
        assert_eq!(forked_list.len(), 3);
        for (orig, copy) in source_list[..3].iter().zip(forked_list.iter()) {
            assert_eq!(orig.role, copy.role);
            assert_eq!(orig.parts, copy.parts);
            assert_ne!(orig.id, copy.id);
        }
    }

    #[tokio::test]
    async fn fork_missing_message_id_fails() {
        let (sessions, messages) = stores();
        let source = sessions.create("source").await.unwrap();
        messages
            .create(&source.id, Role::User, vec![Part::Text { text: "hi".into() }], None, None)
            .await
            .unwrap();
        let err = sessions.fork(&source.id, "does-not-exist", &messages).await.unwrap_err();
        assert!(matches!(err, StoreError::MessageNotFound));
    }

    #[tokio::test]
    async fn persistence_round_trip_after_finish() {
        let (sessions, messages) = stores();
        let session = sessions.create("s").await.unwrap();
        let m = messages
            .create(&session.id, Role::Assistant, vec![], None, None)
            .await
            .unwrap();
        messages
            .update_tail_part(&m.id, Part::Text { text: "Hello".into() })
            .await
            .unwrap();
        messages.finish(&m.id, FinishReason::EndTurn).await.unwrap();

        let reloaded = messages.list(&session.id).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded[0].is_finished());
    }
}
