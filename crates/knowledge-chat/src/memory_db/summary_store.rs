//! Summary storage and retrieval operations
use crate::memory::SummaryStore;
use crate::memory_db::schema::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct SqliteSummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteSummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    fn row_to_summary(&self, row: &Row) -> anyhow::Result<ConversationSummary> {
        let created_at_str: String = row.get(4)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)?
            .with_timezone(&Utc);

        Ok(ConversationSummary {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            boundary_turn_id: row.get(2)?,
            digest: row.get(3)?,
            created_at,
        })
    }
}

#[async_trait]
impl SummaryStore for SqliteSummaryStore {
    async fn latest_summary(&self, conversation_id: &str) -> anyhow::Result<Option<ConversationSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, boundary_turn_id, digest, created_at
             FROM conversation_summaries
             WHERE conversation_id = ?1
             ORDER BY boundary_turn_id DESC, id DESC LIMIT 1"
        )?;

        let mut rows = stmt.query([conversation_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(self.row_to_summary(row)?)),
            None => Ok(None),
        }
    }

    async fn create_summary(
        &self,
        conversation_id: &str,
        boundary_turn_id: &str,
        digest: &str,
    ) -> anyhow::Result<ConversationSummary> {
        let conn = self.get_conn()?;
        let now = Utc::now();

        conn.execute(
            "INSERT INTO conversation_summaries (conversation_id, boundary_turn_id, digest, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, boundary_turn_id, digest, now.to_rfc3339()],
        )?;

        info!(
            "Stored summary for conversation {} up to turn {} ({} chars)",
            conversation_id,
            boundary_turn_id,
            digest.len()
        );

        Ok(ConversationSummary {
            id: conn.last_insert_rowid(),
            conversation_id: conversation_id.to_string(),
            boundary_turn_id: boundary_turn_id.to_string(),
            digest: digest.to_string(),
            created_at: now,
        })
    }
}
