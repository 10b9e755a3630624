use crate::memory::PinStore;
use crate::memory_db::schema::PinnedDocumentSet;
use async_trait::async_trait;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pinned-document payloads, one JSON blob per conversation
#[derive(Clone)]
pub struct SqlitePinStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqlitePinStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }
}

#[async_trait]
impl PinStore for SqlitePinStore {
    async fn get_pins(&self, conversation_id: &str) -> anyhow::Result<PinnedDocumentSet> {
        let conn = self.get_conn()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM pinned_documents WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(payload) = payload else {
            return Ok(PinnedDocumentSet::default());
        };

        let pins: PinnedDocumentSet = serde_json::from_str(&payload)?;
        if pins.version > PinnedDocumentSet::CURRENT_VERSION {
            warn!(
                "Pinned documents for {} have newer payload version {}",
                conversation_id, pins.version
            );
        }
        Ok(pins)
    }

    async fn set_pins(&self, conversation_id: &str, pins: &PinnedDocumentSet) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO pinned_documents (conversation_id, payload, updated_at)
             VALUES (?1, ?2, ?3)",
            params![conversation_id, serde_json::to_string(pins)?, Utc::now().to_rfc3339()],
        )?;
        debug!("Stored {} pinned documents for {}", pins.knowledge_ids.len(), conversation_id);
        Ok(())
    }
}
