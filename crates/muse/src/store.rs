//! Durable conversation store.
//!
//! Two write paths share these tables and must not conflict: the streaming
//! proxy best-effort appends rows while tokens are produced, and the client
//! later performs an authoritative upsert of the whole conversation. The
//! upsert is last-write-wins on the conversation id and replaces the message
//! list outright, so it always supersedes whatever the stream path wrote.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use muse_protocol::{ConversationPayload, ConversationSummary, MessagePayload, Role};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    title TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    position INTEGER NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'system')),
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, position);
CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);
"#;

/// Sqlite-backed conversation repository.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    /// Open or create the store at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&database_url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to database: {}", path.display()))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("initializing conversation schema")?;
        Ok(())
    }

    /// Authoritative upsert: replace the conversation row and its entire
    /// message list in one transaction. Last write wins on the id.
    pub async fn upsert_conversation(
        &self,
        user_id: Option<&str>,
        conv: &ConversationPayload,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning transaction")?;

        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                updated_at = excluded.updated_at,
                user_id = COALESCE(excluded.user_id, conversations.user_id)
            "#,
        )
        .bind(&conv.id)
        .bind(user_id)
        .bind(&conv.title)
        .bind(conv.created_at)
        .bind(conv.updated_at)
        .execute(&mut *tx)
        .await
        .context("upserting conversation")?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(&conv.id)
            .execute(&mut *tx)
            .await
            .context("clearing prior messages")?;

        for (position, message) in conv.messages.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO messages (id, conversation_id, position, role, content, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&message.id)
            .bind(&conv.id)
            .bind(position as i64)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await
            .context("inserting message")?;
        }

        tx.commit().await.context("committing upsert")?;
        Ok(())
    }

    /// Read a conversation back with its ordered messages.
    pub async fn get_conversation(&self, id: &str) -> Result<Option<ConversationPayload>> {
        let row = sqlx::query(
            "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("loading conversation")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message_rows = sqlx::query(
            r#"
            SELECT id, role, content, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .context("loading messages")?;

        let messages = message_rows
            .into_iter()
            .map(|m| {
                let role: String = m.get("role");
                MessagePayload {
                    id: m.get("id"),
                    role: parse_role(&role),
                    content: m.get("content"),
                    created_at: m.get("created_at"),
                }
            })
            .collect();

        Ok(Some(ConversationPayload {
            id: row.get("id"),
            title: row.get("title"),
            messages,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    /// List conversations for a caller, most recently updated first.
    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, updated_at FROM conversations
            WHERE user_id = ? OR user_id IS NULL
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("listing conversations")?;

        Ok(rows
            .into_iter()
            .map(|row| ConversationSummary {
                id: row.get("id"),
                title: row.get("title"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Make sure a conversation row exists before stream rows reference it.
    /// Does not disturb an existing row.
    pub async fn ensure_conversation(
        &self,
        id: &str,
        user_id: Option<&str>,
        now_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, created_at, updated_at)
            VALUES (?, ?, '', ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("ensuring conversation row")?;
        Ok(())
    }

    /// Insert an empty streamed-message row at the end of the conversation.
    pub async fn insert_stream_row(
        &self,
        conversation_id: &str,
        message_id: &str,
        role: Role,
        now_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, position, role, content, created_at)
            VALUES (
                ?, ?,
                (SELECT COALESCE(MAX(position), -1) + 1 FROM messages WHERE conversation_id = ?),
                ?, '', ?
            )
            "#,
        )
        .bind(message_id)
        .bind(conversation_id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("inserting stream row")?;
        Ok(())
    }

    /// Append streamed content to an existing row.
    pub async fn append_stream_content(&self, message_id: &str, delta: &str) -> Result<()> {
        sqlx::query("UPDATE messages SET content = content || ? WHERE id = ?")
            .bind(delta)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("appending stream content")?;
        Ok(())
    }
}

fn parse_role(role: &str) -> Role {
    match role {
        "user" => Role::User,
        "system" => Role::System,
        _ => Role::Assistant,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_conversation() -> ConversationPayload {
        ConversationPayload {
            id: "conv-1".to_string(),
            title: "Caption ideas".to_string(),
            messages: vec![
                MessagePayload {
                    id: "m-1".to_string(),
                    role: Role::User,
                    content: "Caption ideas for my beach photo?".to_string(),
                    created_at: 1_000,
                },
                MessagePayload {
                    id: "m-2".to_string(),
                    role: Role::Assistant,
                    content: "Salt in the air, sand in my soul.".to_string(),
                    created_at: 2_000,
                },
            ],
            created_at: 1_000,
            updated_at: 2_000,
        }
    }

    #[tokio::test]
    async fn upsert_and_read_back_round_trip() {
        let store = ConversationStore::in_memory().await.unwrap();
        let conv = sample_conversation();

        store.upsert_conversation(Some("user-1"), &conv).await.unwrap();
        let loaded = store.get_conversation("conv-1").await.unwrap().unwrap();
        assert_eq!(loaded, conv);
    }

    #[tokio::test]
    async fn upsert_is_last_write_wins() {
        let store = ConversationStore::in_memory().await.unwrap();
        let mut conv = sample_conversation();
        store.upsert_conversation(Some("user-1"), &conv).await.unwrap();

        conv.title = "Renamed".to_string();
        conv.messages.truncate(1);
        conv.updated_at = 3_000;
        store.upsert_conversation(Some("user-1"), &conv).await.unwrap();

        let loaded = store.get_conversation("conv-1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn upsert_supersedes_stream_rows() {
        let store = ConversationStore::in_memory().await.unwrap();
        store
            .ensure_conversation("conv-1", Some("user-1"), 500)
            .await
            .unwrap();
        store
            .insert_stream_row("conv-1", "stream-1", Role::Assistant, 600)
            .await
            .unwrap();
        store.append_stream_content("stream-1", "partial").await.unwrap();

        let conv = sample_conversation();
        store.upsert_conversation(Some("user-1"), &conv).await.unwrap();

        let loaded = store.get_conversation("conv-1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert!(loaded.messages.iter().all(|m| m.id != "stream-1"));
    }

    #[tokio::test]
    async fn stream_rows_accumulate_in_order() {
        let store = ConversationStore::in_memory().await.unwrap();
        store.ensure_conversation("conv-2", None, 100).await.unwrap();
        store
            .insert_stream_row("conv-2", "row-user", Role::User, 100)
            .await
            .unwrap();
        store.append_stream_content("row-user", "hello").await.unwrap();
        store
            .insert_stream_row("conv-2", "row-asst", Role::Assistant, 200)
            .await
            .unwrap();
        store.append_stream_content("row-asst", "hi ").await.unwrap();
        store.append_stream_content("row-asst", "there").await.unwrap();

        let loaded = store.get_conversation("conv-2").await.unwrap().unwrap();
        assert_eq!(loaded.messages[0].content, "hello");
        assert_eq!(loaded.messages[1].content, "hi there");
    }

    #[tokio::test]
    async fn listing_orders_by_recency() {
        let store = ConversationStore::in_memory().await.unwrap();
        let mut a = sample_conversation();
        a.id = "a".to_string();
        a.updated_at = 100;
        let mut b = sample_conversation();
        b.id = "b".to_string();
        b.updated_at = 200;

        store.upsert_conversation(Some("user-1"), &a).await.unwrap();
        store.upsert_conversation(Some("user-1"), &b).await.unwrap();

        let list = store.list_conversations("user-1").await.unwrap();
        assert_eq!(list[0].id, "b");
        assert_eq!(list[1].id, "a");
    }

    #[tokio::test]
    async fn missing_conversation_reads_as_none() {
        let store = ConversationStore::in_memory().await.unwrap();
        assert!(store.get_conversation("nope").await.unwrap().is_none());
    }
}
