//! Memory database module - SQLite-backed storage for turns, summaries, knowledge and pins
pub mod schema;
pub mod migration;
pub mod conversation_store;
pub mod summary_store;
pub mod embedding_store;
pub mod pin_store;
pub mod lock_store;
pub use schema::*;
pub use migration::{migrate, schema_version};
pub use conversation_store::SqliteConversationStore;
pub use summary_store::SqliteSummaryStore;
pub use embedding_store::{EmbeddingStats, SqliteEmbeddingStore};
pub use pin_store::SqlitePinStore;
pub use lock_store::SqliteDedupLock;
use std::path::Path;
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub const DEFAULT_EMBEDDING_MODEL: &str = "default";

pub struct ChatDatabase {
    pub conversations: SqliteConversationStore,
    pub summaries: SqliteSummaryStore,
    pub embeddings: SqliteEmbeddingStore,
    pub pins: SqlitePinStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ChatDatabase {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        Self::open_with_model(db_path, DEFAULT_EMBEDDING_MODEL)
    }

    /// Open (or create) the database file; vectors are read and written under `embedding_model`.
    pub fn open_with_model(db_path: &Path, embedding_model: &str) -> anyhow::Result<Self> {
        info!("Opening chat database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
            migrate(&mut conn)?;
        }
        info!("Chat database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool), embedding_model))
    }

    /// Single-connection in-memory database. Every store shares that connection,
    /// so callers must not hold a connection across store calls.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;
        {
            let mut conn = pool.get()?;
            migrate(&mut conn)?;
        }
        Ok(Self::from_pool(Arc::new(pool), DEFAULT_EMBEDDING_MODEL))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>, embedding_model: &str) -> Self {
        Self {
            conversations: SqliteConversationStore::new(Arc::clone(&pool)),
            summaries: SqliteSummaryStore::new(Arc::clone(&pool)),
            embeddings: SqliteEmbeddingStore::new(Arc::clone(&pool), embedding_model),
            pins: SqlitePinStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn pool(&self) -> Arc<Pool<SqliteConnectionManager>> {
        Arc::clone(&self.pool)
    }

    /// A lease lock sharing this database.
    pub fn dedup_lock(&self) -> SqliteDedupLock {
        SqliteDedupLock::new(self.pool())
    }
}

impl Drop for ChatDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TurnStore;

    #[tokio::test]
    async fn test_in_memory_database_is_usable() {
        let db = ChatDatabase::new_in_memory().unwrap();
        assert_eq!(db.conversations.latest_sequence("c1").await.unwrap(), 0);
        assert_eq!(db.embeddings.get_stats().unwrap().total_vectors, 0);
    }
}
