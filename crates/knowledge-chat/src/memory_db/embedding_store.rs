//! Knowledge and chunk-vector storage with a linear cosine scan
use crate::memory::KnowledgeStore;
use crate::memory_db::schema::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Row};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmbeddingStats {
    pub total_vectors: usize,
    pub total_knowledge: usize,
    pub dimension: usize,
}

#[derive(Clone)]
pub struct SqliteEmbeddingStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
    embedding_model: String,
}

impl SqliteEmbeddingStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>, embedding_model: impl Into<String>) -> Self {
        Self {
            pool,
            embedding_model: embedding_model.into(),
        }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn store_knowledge(&self, knowledge: &Knowledge) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO knowledge
             (id, user_id, space_id, resource, title, content, encrypted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &knowledge.id,
                &knowledge.user_id,
                &knowledge.space_id,
                &knowledge.resource,
                &knowledge.title,
                &knowledge.content,
                knowledge.encrypted,
                knowledge.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Store one chunk vector. `original_length` is the chunk's length in characters.
    pub fn store_vector(&self, knowledge_id: &str, embedding: &[f32], original_length: usize) -> anyhow::Result<()> {
        let embedding_bytes = bincode::serialize(embedding)?;
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO knowledge_vectors (knowledge_id, embedding, embedding_model, original_length)
             VALUES (?1, ?2, ?3, ?4)",
            params![knowledge_id, embedding_bytes, &self.embedding_model, original_length as i64],
        )?;
        Ok(())
    }

    pub fn get_stats(&self) -> anyhow::Result<EmbeddingStats> {
        let conn = self.get_conn()?;
        let total_vectors: i64 = conn.query_row("SELECT COUNT(*) FROM knowledge_vectors", [], |row| row.get(0))?;
        let total_knowledge: i64 = conn.query_row("SELECT COUNT(*) FROM knowledge", [], |row| row.get(0))?;

        let mut stmt = conn.prepare("SELECT embedding FROM knowledge_vectors LIMIT 1")?;
        let dimension = if let Some(row) = stmt.query([])?.next()? {
            let embedding_bytes: Vec<u8> = row.get(0)?;
            let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
                .map_err(|e| anyhow::anyhow!("Deserialization error: {}", e))?;
            embedding.len()
        } else {
            0
        };

        Ok(EmbeddingStats {
            total_vectors: total_vectors as usize,
            total_knowledge: total_knowledge as usize,
            dimension,
        })
    }

    fn row_to_knowledge(row: &Row) -> anyhow::Result<Knowledge> {
        let created_at_str: String = row.get(7)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)?.with_timezone(&Utc);

        Ok(Knowledge {
            id: row.get(0)?,
            user_id: row.get(1)?,
            space_id: row.get(2)?,
            resource: row.get(3)?,
            title: row.get(4)?,
            content: row.get(5)?,
            encrypted: row.get(6)?,
            created_at,
        })
    }
}

#[async_trait]
impl KnowledgeStore for SqliteEmbeddingStore {
    async fn query_similar(
        &self,
        filter: &VectorFilter,
        query: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<VectorHit>> {
        let conn = self.get_conn()?;

        let mut sql = String::from(
            "SELECT v.knowledge_id, v.embedding, v.original_length
             FROM knowledge_vectors v
             JOIN knowledge k ON k.id = v.knowledge_id
             WHERE v.embedding_model = ? AND k.user_id = ?",
        );
        let mut bind: Vec<String> = vec![self.embedding_model.clone(), filter.user_id.clone()];
        if let Some(space_id) = &filter.space_id {
            sql.push_str(" AND k.space_id = ?");
            bind.push(space_id.clone());
        }
        if !filter.resources.is_empty() {
            let placeholders = vec!["?"; filter.resources.len()].join(",");
            sql.push_str(&format!(" AND k.resource IN ({})", placeholders));
            bind.extend(filter.resources.iter().cloned());
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind.iter()))?;

        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let embedding_bytes: Vec<u8> = row.get(1)?;
            let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
                .map_err(|e| anyhow::anyhow!("Bincode error: {}", e))?;
            let original_length: i64 = row.get(2)?;

            hits.push(VectorHit {
                knowledge_id: row.get(0)?,
                similarity: cosine_similarity(query, &embedding),
                original_length: original_length.max(0) as usize,
            });
        }

        hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        debug!("Vector query for user {} returned {} hits", filter.user_id, hits.len());
        Ok(hits)
    }

    async fn get_knowledge(&self, ids: &[String]) -> anyhow::Result<Vec<Knowledge>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let mut stmt = conn.prepare(&format!(
            "SELECT id, user_id, space_id, resource, title, content, encrypted, created_at
             FROM knowledge WHERE id IN ({})",
            placeholders
        ))?;

        let mut rows = stmt.query(params_from_iter(ids.iter()))?;
        let mut found = Vec::new();
        while let Some(row) = rows.next()? {
            found.push(Self::row_to_knowledge(row)?);
        }

        // keep the caller's order
        found.sort_by_key(|k| ids.iter().position(|id| id == &k.id).unwrap_or(usize::MAX));
        Ok(found)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() { return 0.0; }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}
