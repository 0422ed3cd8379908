use std::sync::Arc;

use chrono::Utc;
use crush_broker::{Broker, Event};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::Db;
use crate::error::StoreError;
use crate::types::{FinishReason, Message, Part, Role};

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let parts_json: String = row.get("parts_json")?;
    let parts: Vec<Part> = serde_json::from_str(&parts_json).unwrap_or_default();
    let role_str: String = row.get("role")?;
    Ok(Message {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        role: Role::parse(&role_str).unwrap_or(Role::User),
        parts,
        provider: row.get("provider")?,
        model: row.get("model")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Append-only parts within a session. See spec §4.C.
pub struct MessageStore {
    db: Db,
    broker: Arc<Broker<Message>>,
}

impl MessageStore {
    pub fn new(db: Db, broker: Arc<Broker<Message>>) -> Self {
        Self { db, broker }
    }

    pub fn subscribe(&self) -> crush_broker::Subscription<Message> {
        self.broker.subscribe()
    }

    pub async fn create(
        &self,
        session_id: &str,
        role: Role,
        parts: Vec<Part>,
        provider: Option<String>,
        model: Option<String>,
    ) -> Result<Message, StoreError> {
        self.create_with_parts(session_id, role, parts, provider, model).await
    }

    /// Insert a fully-formed message (used directly by the model loop for a
    /// user prompt message, and by `SessionStore::fork` to copy history).
    pub async fn create_with_parts(
        &self,
        session_id: &str,
        role: Role,
        parts: Vec<Part>,
        provider: Option<String>,
        model: Option<String>,
    ) -> Result<Message, StoreError> {
        let now = Utc::now();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            parts,
            provider,
            model,
            created_at: now,
            updated_at: now,
        };
        self.insert(&message).await?;
        self.broker.publish(Event::created(message.clone()));
        Ok(message)
    }

    async fn insert(&self, message: &Message) -> Result<(), StoreError> {
        let m = message.clone();
        let parts_json = serde_json::to_string(&m.parts)?;
        let finish_reason = m.finish_reason().map(|r| serde_json::to_value(r).unwrap());
        self.db
            .with_conn(move |conn: &Connection| {
                conn.execute(
                    "INSERT INTO messages (id, session_id, role, parts_json, provider, model, \
                     finish_reason, created_at, updated_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    params![
                        m.id,
                        m.session_id,
                        m.role.as_str(),
                        parts_json,
                        m.provider,
                        m.model,
                        finish_reason.map(|v| v.as_str().unwrap_or_default().to_string()),
                        m.created_at,
                        m.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Append `part` as a new trailing part.
    pub async fn append(&self, message_id: &str, part: Part) -> Result<Message, StoreError> {
        self.mutate(message_id, move |parts| {
            parts.push(part);
            Ok(())
        })
        .await
    }

    /// Update the tail part of the message: if the current last part is in
    /// the same streaming "slot" as `part` (same variant for Text/Reasoning,
    /// same id for ToolCall), replace it in place; otherwise append. Text
    /// and Reasoning updates must be length-monotonic, per spec §3.
    pub async fn update_tail_part(&self, message_id: &str, part: Part) -> Result<Message, StoreError> {
        self.mutate(message_id, move |parts| {
            if let Some(last) = parts.last() {
                if last.same_slot_as(&part) {
                    check_monotonic(last, &part)?;
                    let idx = parts.len() - 1;
                    parts[idx] = part;
                    return Ok(());
                }
            }
            parts.push(part);
            Ok(())
        })
        .await
    }

    pub async fn finish(&self, message_id: &str, reason: FinishReason) -> Result<Message, StoreError> {
        let timestamp = Utc::now();
        self.mutate(message_id, move |parts| {
            parts.push(Part::Finish { reason, timestamp });
            Ok(())
        })
        .await
    }

    async fn mutate<F>(&self, message_id: &str, f: F) -> Result<Message, StoreError>
    where
        F: FnOnce(&mut Vec<Part>) -> Result<(), StoreError> + Send + 'static,
    {
        let mut message = self.get(message_id).await?.ok_or(StoreError::MessageNotFound)?;
        if message.is_finished() {
            return Err(StoreError::MessageFinished(message_id.to_string()));
        }
        f(&mut message.parts)?;
        message.updated_at = Utc::now();
        self.update_parts(&message).await?;
        self.broker.publish(Event::updated(message.clone()));
        Ok(message)
    }

    async fn update_parts(&self, message: &Message) -> Result<(), StoreError> {
        let m = message.clone();
        let parts_json = serde_json::to_string(&m.parts)?;
        let finish_reason = m.finish_reason().map(|r| serde_json::to_value(r).unwrap());
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE messages SET parts_json=?1, finish_reason=?2, updated_at=?3 WHERE id=?4",
                    params![
                        parts_json,
                        finish_reason.map(|v| v.as_str().unwrap_or_default().to_string()),
                        m.updated_at,
                        m.id,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let id = id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.query_row("SELECT * FROM messages WHERE id = ?1", params![id], row_to_message)
                    .optional()
                    .map_err(StoreError::from)
            })
            .await
    }

    /// Ascending by creation order.
    pub async fn list(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let session_id = session_id.to_string();
        self.db
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT * FROM messages WHERE session_id = ?1 ORDER BY rowid ASC")?;
                let rows = stmt.query_map(params![session_id], row_to_message)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
    }
}

fn check_monotonic(old: &Part, new: &Part) -> Result<(), StoreError> {
    match (old, new) {
        (Part::Text { text: a }, Part::Text { text: b }) if b.len() < a.len() => {
            Err(StoreError::NonMonotonic)
        }
        (Part::Reasoning { thinking: a }, Part::Reasoning { thinking: b }) if b.len() < a.len() => {
            Err(StoreError::NonMonotonic)
        }
        _ => Ok(()),
    }
}
