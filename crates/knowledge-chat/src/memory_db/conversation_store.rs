use crate::memory::TurnStore;
use crate::memory_db::schema::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info};

const TURN_COLUMNS: &str =
    "id, conversation_id, role, text, encrypted, progress, sequence, preview, attachments, created_at";

/// Turn and conversation persistence
#[derive(Clone)]
pub struct SqliteConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    fn update_turn(&self, sql: &str, turn_id: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(sql, params![turn_id, value])?;
        if updated == 0 {
            return Err(anyhow::anyhow!("Turn {} not found", turn_id));
        }
        Ok(())
    }

    fn row_to_turn(row: &Row) -> anyhow::Result<ConversationTurn> {
        let role: String = row.get(2)?;
        let progress: String = row.get(5)?;
        let attachments_json: String = row.get(8)?;
        let created_at_str: String = row.get(9)?;

        let attachments: Vec<String> = serde_json::from_str(&attachments_json)
            .map_err(|e| anyhow::anyhow!("Failed to parse attachments: {}", e))?;
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc);

        Ok(ConversationTurn {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            role: Role::parse(&role)?,
            text: row.get(3)?,
            encrypted: row.get(4)?,
            progress: Progress::parse(&progress)?,
            sequence: row.get(6)?,
            preview: row.get(7)?,
            attachments,
            created_at,
        })
    }
}

#[async_trait]
impl TurnStore for SqliteConversationStore {
    async fn create_turn(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO conversations (id, title, created_at) VALUES (?1, NULL, ?2)",
            params![&turn.conversation_id, turn.created_at.to_rfc3339()],
        )?;
        tx.execute(
            "INSERT INTO turns
             (id, conversation_id, role, text, encrypted, progress, sequence, preview, attachments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &turn.id,
                &turn.conversation_id,
                turn.role.as_str(),
                &turn.text,
                turn.encrypted,
                turn.progress.as_str(),
                turn.sequence,
                &turn.preview,
                serde_json::to_string(&turn.attachments)?,
                turn.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        debug!(
            "Stored {} turn {} (seq {}) in conversation {}",
            turn.role.as_str(),
            turn.id,
            turn.sequence,
            turn.conversation_id
        );
        Ok(())
    }

    async fn delete_turn(&self, turn_id: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM turns WHERE id = ?1", [turn_id])?;
        Ok(())
    }

    async fn delete_conversation(&self, conversation_id: &str) -> anyhow::Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM turns WHERE conversation_id = ?1", [conversation_id])?;
        tx.execute(
            "DELETE FROM conversation_summaries WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        tx.execute("DELETE FROM pinned_documents WHERE conversation_id = ?1", [conversation_id])?;
        tx.execute("DELETE FROM conversations WHERE id = ?1", [conversation_id])?;
        tx.commit()?;

        debug!("Removed {} turns of conversation {}", deleted, conversation_id);
        Ok(deleted)
    }

    async fn get_turn(&self, turn_id: &str) -> anyhow::Result<Option<ConversationTurn>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM turns WHERE id = ?1", TURN_COLUMNS))?;
        let mut rows = stmt.query([turn_id])?;

        match rows.next()? {
            Some(row) => Ok(Some(Self::row_to_turn(row)?)),
            None => Ok(None),
        }
    }

    async fn latest_sequence(&self, conversation_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let sequence: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM turns WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(sequence)
    }

    async fn list_turns_after(
        &self,
        conversation_id: &str,
        after_turn_id: Option<&str>,
    ) -> anyhow::Result<Vec<ConversationTurn>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM turns
             WHERE conversation_id = ?1 AND (?2 IS NULL OR id > ?2)
             ORDER BY id ASC",
            TURN_COLUMNS
        ))?;

        let mut rows = stmt.query(params![conversation_id, after_turn_id])?;
        let mut turns = Vec::new();
        while let Some(row) = rows.next()? {
            turns.push(Self::row_to_turn(row)?);
        }
        Ok(turns)
    }

    async fn append_text(&self, turn_id: &str, chunk: &str) -> anyhow::Result<()> {
        self.update_turn("UPDATE turns SET text = text || ?2 WHERE id = ?1", turn_id, chunk)
    }

    async fn rewrite_text(&self, turn_id: &str, text: &str) -> anyhow::Result<()> {
        self.update_turn("UPDATE turns SET text = ?2 WHERE id = ?1", turn_id, text)
    }

    async fn set_preview(&self, turn_id: &str, preview: &str) -> anyhow::Result<()> {
        self.update_turn("UPDATE turns SET preview = ?2 WHERE id = ?1", turn_id, preview)
    }

    async fn set_progress(&self, turn_id: &str, progress: Progress) -> anyhow::Result<()> {
        self.update_turn("UPDATE turns SET progress = ?2 WHERE id = ?1", turn_id, progress.as_str())
    }

    async fn conversation_title(&self, conversation_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.get_conn()?;
        let title: Option<Option<String>> = conn
            .query_row(
                "SELECT title FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(title.flatten())
    }

    async fn set_conversation_title(&self, conversation_id: &str, title: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO conversations (id, title, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET title = excluded.title",
            params![conversation_id, title, Utc::now().to_rfc3339()],
        )?;
        info!("Updated conversation {} title to: {}", conversation_id, title);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::ChatDatabase;

    fn turn(id: &str, sequence: i64, text: &str) -> ConversationTurn {
        ConversationTurn {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            role: Role::User,
            text: text.to_string(),
            encrypted: false,
            progress: Progress::Complete,
            sequence,
            preview: None,
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_list_turns_after_boundary_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChatDatabase::open(&dir.path().join("chat.db")).unwrap();
        let store = &db.conversations;

        store.create_turn(&turn("0003", 3, "c")).await.unwrap();
        store.create_turn(&turn("0001", 1, "a")).await.unwrap();
        store.create_turn(&turn("0002", 2, "b")).await.unwrap();

        let all = store.list_turns_after("c1", None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["0001", "0002", "0003"]);

        let after = store.list_turns_after("c1", Some("0001")).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(store.latest_sequence("c1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_append_rewrite_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChatDatabase::open(&dir.path().join("chat.db")).unwrap();
        let store = &db.conversations;

        let mut t = turn("0001", 1, "");
        t.role = Role::Assistant;
        t.progress = Progress::Uncomplete;
        store.create_turn(&t).await.unwrap();

        store.append_text("0001", "Hello").await.unwrap();
        store.append_text("0001", " world").await.unwrap();
        store.set_progress("0001", Progress::Complete).await.unwrap();

        let stored = store.get_turn("0001").await.unwrap().unwrap();
        assert_eq!(stored.text, "Hello world");
        assert_eq!(stored.progress, Progress::Complete);

        store.rewrite_text("0001", "replaced").await.unwrap();
        let stored = store.get_turn("0001").await.unwrap().unwrap();
        assert_eq!(stored.text, "replaced");

        assert!(store.append_text("missing", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_sequence_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChatDatabase::open(&dir.path().join("chat.db")).unwrap();

        db.conversations.create_turn(&turn("0001", 1, "a")).await.unwrap();
        assert!(db.conversations.create_turn(&turn("0002", 1, "b")).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChatDatabase::open(&dir.path().join("chat.db")).unwrap();

        db.conversations.create_turn(&turn("0001", 1, "a")).await.unwrap();
        db.conversations.set_conversation_title("c1", "Greeting").await.unwrap();
        assert_eq!(
            db.conversations.conversation_title("c1").await.unwrap().as_deref(),
            Some("Greeting")
        );

        assert_eq!(db.conversations.delete_conversation("c1").await.unwrap(), 1);
        assert!(db.conversations.list_turns_after("c1", None).await.unwrap().is_empty());
        assert!(db.conversations.conversation_title("c1").await.unwrap().is_none());
    }
}
