// ABOUTME: SQLite-backed storage for manifold messages and backend sessions
// ABOUTME: Persistence for conversation history plus broadcast fan-out for live observers

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use manifold_core::sink::{Envelope, MessageSink};
use manifold_core::types::{BackendType, MessageType, Role, UnifiedMessage};
use manifold_core::SessionStore;
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::path::Path;
use std::str::FromStr;
use tokio::sync::broadcast;

/// How many published envelopes a slow observer may lag behind.
const BROADCAST_CAPACITY: usize = 256;

/// Persistent storage for unified messages and backend session ids.
///
/// Doubles as the engine's message sink: `persist` writes through to SQLite,
/// `publish` fans out over a broadcast channel that observers `subscribe` to.
pub struct SqliteStore {
    pool: SqlitePool,
    events: broadcast::Sender<(String, Envelope)>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().display());

        let options = SqliteConnectOptions::from_str(&url)?
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        // Messages table - one row per normalized event, append-only
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                session_id TEXT,
                role TEXT NOT NULL,
                message_type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        // Backend session registry - one live value per (project, backend)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_sessions (
                project_id TEXT NOT NULL,
                backend TEXT NOT NULL,
                session_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (project_id, backend)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id)",
        )
        .execute(&pool)
        .await?;

        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Self { pool, events })
    }

    /// Subscribe to published envelopes. Each receiver sees every visible
    /// message published after it subscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, Envelope)> {
        self.events.subscribe()
    }

    /// All messages for a conversation, oldest first
    pub async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<UnifiedMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, project_id, conversation_id, session_id, role, message_type, content, metadata, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    /// Count of stored messages for a project
    pub async fn message_count(&self, project_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Bulk-delete a project: all of its messages and stored sessions.
    /// The only way a persisted message is ever destroyed.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM project_sessions WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageSink for SqliteStore {
    async fn persist(&self, message: &UnifiedMessage) -> Result<()> {
        let metadata = Value::Object(message.metadata.clone()).to_string();

        sqlx::query(
            "INSERT INTO messages (id, project_id, conversation_id, session_id, role, message_type, content, metadata, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.project_id)
        .bind(&message.conversation_id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(message.message_type.as_str())
        .bind(&message.content)
        .bind(metadata)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn publish(&self, project_id: &str, envelope: &Envelope) -> Result<()> {
        // No receivers is a normal state, not a failure.
        if let Err(e) = self
            .events
            .send((project_id.to_string(), envelope.clone()))
        {
            tracing::debug!(error = %e, "No live subscribers for published message");
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get(&self, project_id: &str, backend: BackendType) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT session_id FROM project_sessions WHERE project_id = ? AND backend = ?",
        )
        .bind(project_id)
        .bind(backend.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(sid,)| sid))
    }

    async fn set(&self, project_id: &str, backend: BackendType, session_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_sessions (project_id, backend, session_id, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(project_id, backend)
            DO UPDATE SET session_id = excluded.session_id, updated_at = excluded.updated_at
            "#,
        )
        .bind(project_id)
        .bind(backend.as_str())
        .bind(session_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear(&self, project_id: &str, backend: BackendType) -> Result<()> {
        sqlx::query("DELETE FROM project_sessions WHERE project_id = ? AND backend = ?")
            .bind(project_id)
            .bind(backend.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_for_project(&self, project_id: &str) -> Result<Vec<(BackendType, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT backend, session_id FROM project_sessions WHERE project_id = ? ORDER BY backend ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(backend, sid)| match backend.parse::<BackendType>() {
                Ok(backend) => Some((backend, sid)),
                Err(e) => {
                    tracing::warn!(backend = %backend, error = %e, "Skipping unknown backend row");
                    None
                }
            })
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    project_id: String,
    conversation_id: String,
    session_id: Option<String>,
    role: String,
    message_type: String,
    content: String,
    metadata: String,
    created_at: String,
}

impl From<MessageRow> for UnifiedMessage {
    fn from(row: MessageRow) -> Self {
        let metadata = match serde_json::from_str::<Value>(&row.metadata) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };

        UnifiedMessage {
            id: row.id,
            project_id: row.project_id,
            conversation_id: row.conversation_id,
            session_id: row.session_id,
            role: Role::normalize(&row.role),
            message_type: MessageType::parse(&row.message_type).unwrap_or(MessageType::Chat),
            content: row.content,
            metadata,
            created_at: chrono::DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }
    }
}
