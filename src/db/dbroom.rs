use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Error as SqlxError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

use crate::models::{ChatMessageOut, RoomMember};

/// Default document state for rooms that have no persisted document yet.
pub const DEFAULT_CONTENT: &str = "Code here...";
pub const DEFAULT_LANGUAGE: &str = "javascript";

// Global database instance
static DB: OnceCell<Arc<DbRoom>> = OnceCell::const_new();

/// Initialize the global database connection
///
/// # Arguments
/// * `database_url` - PostgreSQL connection string
pub async fn init_db(database_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = DbRoom::new(database_url).await?;
    DB.set(Arc::new(db))
        .map_err(|_| "Database already initialized")?;
    Ok(())
}

/// Get the global database instance
pub fn get_db() -> Option<Arc<DbRoom>> {
    DB.get().cloned()
}

/// Room row from the database. The member set is the source of truth for
/// admission and is loaded fresh on every join attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoomRow {
    pub room_id: String,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Room with its authorized member roster.
#[derive(Debug, Clone)]
pub struct Room {
    pub room: RoomRow,
    pub members: Vec<RoomMemberRow>,
}

impl Room {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    pub fn roster(&self) -> Vec<RoomMember> {
        self.members
            .iter()
            .map(|m| RoomMember {
                user_id: m.user_id.clone(),
                username: m.username.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoomMemberRow {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
}

/// Per-room document state. One logical row per room, last writer wins.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentRow {
    pub room_id: String,
    pub language: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: uuid::Uuid,
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl From<MessageRow> for ChatMessageOut {
    fn from(row: MessageRow) -> Self {
        ChatMessageOut {
            id: row.id,
            room_id: row.room_id,
            sender_id: row.sender_id,
            sender_name: row.sender_name,
            text: row.text,
            time: row.created_at,
        }
    }
}

/// Database connection pool
pub struct DbRoom {
    pool: PgPool,
}

impl DbRoom {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self, SqlxError> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600)) // Close idle connections after 10 minutes
            .max_lifetime(Duration::from_secs(1800)) // Recycle connections after 30 minutes
            .connect(database_url)
            .await?;

        info!("Database connection pool created successfully");

        Ok(Self { pool })
    }

    /// Load a room and its authorized member roster.
    ///
    /// # Arguments
    /// * `room_id` - Room identifier
    ///
    /// # Returns
    /// * `Result<Option<Room>, SqlxError>` - The room if it exists
    pub async fn load_room(&self, room_id: &str) -> Result<Option<Room>, SqlxError> {
        let room = sqlx::query_as::<_, RoomRow>(
            "SELECT room_id, name, created_by, created_at FROM rooms WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(room) = room else {
            return Ok(None);
        };

        let members = sqlx::query_as::<_, RoomMemberRow>(
            "SELECT room_id, user_id, username FROM room_members WHERE room_id = $1 ORDER BY username",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Room { room, members }))
    }

    /// Load the current document state for a room, falling back to the
    /// default content when no row exists yet.
    pub async fn load_document(&self, room_id: &str) -> Result<DocumentRow, SqlxError> {
        let doc = sqlx::query_as::<_, DocumentRow>(
            "SELECT room_id, language, content FROM documents WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(doc.unwrap_or_else(|| DocumentRow {
            room_id: room_id.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            content: DEFAULT_CONTENT.to_string(),
        }))
    }

    /// Persist new document content for a room, unconditionally.
    ///
    /// Last writer wins: no version check, no diffing. Concurrent edits race
    /// and the second write to land overwrites the first.
    pub async fn save_document(&self, room_id: &str, content: &str) -> Result<(), SqlxError> {
        sqlx::query(
            r#"
            INSERT INTO documents (room_id, language, content, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (room_id)
            DO UPDATE SET content = EXCLUDED.content, updated_at = now()
            "#,
        )
        .bind(room_id)
        .bind(DEFAULT_LANGUAGE)
        .bind(content)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a chat message with a server-assigned id and timestamp.
    ///
    /// # Returns
    /// * `Result<MessageRow, SqlxError>` - The persisted row, including the
    ///   assigned id and creation time
    pub async fn insert_message(
        &self,
        room_id: &str,
        sender_id: &str,
        sender_name: &str,
        text: &str,
    ) -> Result<MessageRow, SqlxError> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO messages (id, room_id, sender_id, sender_name, text, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, $4, now())
            RETURNING id, room_id, sender_id, sender_name, text, created_at
            "#,
        )
        .bind(room_id)
        .bind(sender_id)
        .bind(sender_name)
        .bind(text)
        .fetch_one(&self.pool)
        .await
    }

    /// Fetch chat history for a room, ascending by creation time, capped to
    /// the most recent `limit` messages to bound the payload.
    pub async fn list_messages(
        &self,
        room_id: &str,
        limit: i64,
    ) -> Result<Vec<MessageRow>, SqlxError> {
        sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, room_id, sender_id, sender_name, text, created_at FROM (
                SELECT id, room_id, sender_id, sender_name, text, created_at
                FROM messages
                WHERE room_id = $1
                ORDER BY created_at DESC, id DESC
                LIMIT $2
            ) recent
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}
