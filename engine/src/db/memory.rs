/// Memory persistence: scopes and memory records
///
/// Scopes form a forest; a child sees its ancestors' records. The parent
/// link is validated against cycles inside a transaction before it lands.
/// Record content is mirrored into an FTS5 table by this repository (no
/// triggers), which backs lexical retrieval when no embedding is
/// available.
use sdk::errors::CoreError;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use super::{db_err, now_secs};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub scope_id: String,
    /// Records sharing a key shadow each other down the scope chain.
    /// Keyless records are never shadowed.
    pub key: Option<String>,
    pub category: String,
    pub content: String,
    pub tags: Vec<String>,
    pub importance: f64,
    pub embedding: Option<Vec<f32>>,
    /// Set when the record was stored without an embedding because the
    /// similarity backend was unavailable.
    pub text_only: bool,
    pub parent_record_id: Option<String>,
    pub execution_id: Option<String>,
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A lexical candidate with its FTS rank (lower bm25 is better)
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub record: MemoryRecord,
    pub bm25: f64,
}

/// Memory repository for database operations
pub struct MemoryRepository {
    pool: SqlitePool,
}

impl MemoryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ---- scopes ----

    pub async fn create_scope(
        &self,
        id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<(), CoreError> {
        if let Some(parent) = parent_id {
            self.scope_exists(parent).await?;
        }
        sqlx::query("INSERT INTO scopes (id, name, parent_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(parent_id)
            .bind(now_secs())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_scope(&self, id: &str) -> Result<Option<Scope>, CoreError> {
        let row = sqlx::query("SELECT * FROM scopes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| Scope {
            id: r.get("id"),
            name: r.get("name"),
            parent_id: r.get("parent_id"),
            created_at: r.get("created_at"),
        }))
    }

    /// Look a scope up by name; the oldest wins when names collide
    pub async fn find_scope_by_name(&self, name: &str) -> Result<Option<Scope>, CoreError> {
        let row = sqlx::query(
            "SELECT * FROM scopes WHERE name = ? ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| Scope {
            id: r.get("id"),
            name: r.get("name"),
            parent_id: r.get("parent_id"),
            created_at: r.get("created_at"),
        }))
    }

    async fn scope_exists(&self, id: &str) -> Result<(), CoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM scopes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        if found.is_none() {
            return Err(CoreError::NotFound(format!("scope '{}'", id)));
        }
        Ok(())
    }

    /// Link a child scope under a parent
    ///
    /// The cycle check and the update run in one transaction so two
    /// concurrent links cannot close a loop between them. The check walks
    /// the descendants of the child: if the proposed parent is among them
    /// (or is the child itself), the link would form a cycle.
    pub async fn set_scope_parent(&self, child: &str, parent: &str) -> Result<(), CoreError> {
        if child == parent {
            return Err(CoreError::CycleDetected {
                child: child.to_string(),
                parent: parent.to_string(),
            });
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let parent_found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM scopes WHERE id = ?")
            .bind(parent)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if parent_found.is_none() {
            return Err(CoreError::NotFound(format!("scope '{}'", parent)));
        }

        let cycle: Option<i64> = sqlx::query_scalar(
            "WITH RECURSIVE descendants (id) AS ( \
                 SELECT id FROM scopes WHERE parent_id = ? \
                 UNION ALL \
                 SELECT s.id FROM scopes s JOIN descendants d ON s.parent_id = d.id \
             ) \
             SELECT 1 FROM descendants WHERE id = ?",
        )
        .bind(child)
        .bind(parent)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if cycle.is_some() {
            return Err(CoreError::CycleDetected {
                child: child.to_string(),
                parent: parent.to_string(),
            });
        }

        let result = sqlx::query("UPDATE scopes SET parent_id = ? WHERE id = ?")
            .bind(parent)
            .bind(child)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("scope '{}'", child)));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Scope ids from the given scope up to its root, nearest first
    pub async fn scope_chain(&self, scope_id: &str) -> Result<Vec<String>, CoreError> {
        self.scope_exists(scope_id).await?;

        let rows = sqlx::query(
            "WITH RECURSIVE chain (id, parent_id, depth) AS ( \
                 SELECT id, parent_id, 0 FROM scopes WHERE id = ? \
                 UNION ALL \
                 SELECT s.id, s.parent_id, c.depth + 1 \
                 FROM scopes s JOIN chain c ON s.id = c.parent_id \
             ) \
             SELECT id FROM chain ORDER BY depth",
        )
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }

    // ---- records ----

    pub async fn insert_record(&self, record: &MemoryRecord) -> Result<(), CoreError> {
        self.scope_exists(&record.scope_id).await?;

        let tags = serde_json::to_string(&record.tags)
            .map_err(|e| CoreError::Validation(format!("Unserializable tags: {}", e)))?;
        let embedding = record.embedding.as_deref().map(encode_embedding);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "INSERT INTO memory_records (id, scope_id, key, category, content, tags, importance, \
             embedding, text_only, parent_record_id, execution_id, deleted, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.scope_id)
        .bind(&record.key)
        .bind(&record.category)
        .bind(&record.content)
        .bind(&tags)
        .bind(record.importance)
        .bind(embedding)
        .bind(record.text_only as i32)
        .bind(&record.parent_record_id)
        .bind(&record.execution_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("INSERT INTO memory_fts (record_id, content) VALUES (?, ?)")
            .bind(&record.id)
            .bind(&record.content)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<MemoryRecord>, CoreError> {
        let row = sqlx::query("SELECT * FROM memory_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(row_to_record).transpose()
    }

    /// Update mutable fields of a live record and resync the FTS mirror
    pub async fn update_record(
        &self,
        id: &str,
        content: &str,
        tags: &[String],
        importance: f64,
        embedding: Option<&[f32]>,
        text_only: bool,
    ) -> Result<(), CoreError> {
        let tags_json = serde_json::to_string(tags)
            .map_err(|e| CoreError::Validation(format!("Unserializable tags: {}", e)))?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            "UPDATE memory_records SET content = ?, tags = ?, importance = ?, embedding = ?, \
             text_only = ?, updated_at = ? WHERE id = ? AND deleted = 0",
        )
        .bind(content)
        .bind(&tags_json)
        .bind(importance)
        .bind(embedding.map(encode_embedding))
        .bind(text_only as i32)
        .bind(now_secs())
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("memory record '{}'", id)));
        }

        sqlx::query("DELETE FROM memory_fts WHERE record_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("INSERT INTO memory_fts (record_id, content) VALUES (?, ?)")
            .bind(id)
            .bind(content)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Remove a record
    ///
    /// A record referenced by a finished execution is tombstoned so the
    /// audit trail keeps resolving; anything else is deleted outright.
    /// Either way the record stops appearing in retrieval.
    pub async fn delete_record(&self, id: &str) -> Result<(), CoreError> {
        let record = self
            .get_record(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("memory record '{}'", id)))?;

        let tombstone = match &record.execution_id {
            Some(exec_id) => {
                let status: Option<String> =
                    sqlx::query_scalar("SELECT status FROM executions WHERE id = ?")
                        .bind(exec_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(db_err)?;
                !matches!(status.as_deref(), Some("pending") | Some("running") | None)
            }
            None => false,
        };

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if tombstone {
            sqlx::query("UPDATE memory_records SET deleted = 1, updated_at = ? WHERE id = ?")
                .bind(now_secs())
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        } else {
            sqlx::query("DELETE FROM memory_records WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        sqlx::query("DELETE FROM memory_fts WHERE record_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// All live records in the given scopes that carry an embedding.
    /// Similarity ranking happens in-process over the decoded vectors.
    pub async fn embedded_records_in_scopes(
        &self,
        scope_ids: &[String],
    ) -> Result<Vec<MemoryRecord>, CoreError> {
        if scope_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; scope_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM memory_records \
             WHERE deleted = 0 AND embedding IS NOT NULL AND scope_id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in scope_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter().map(row_to_record).collect()
    }

    /// (key, scope_id) pairs for every live keyed record in the given
    /// scopes. Shadowing is decided over this full set, not over
    /// whichever records happened to match a query.
    pub async fn keyed_records_in_scopes(
        &self,
        scope_ids: &[String],
    ) -> Result<Vec<(String, String)>, CoreError> {
        if scope_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; scope_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT key, scope_id FROM memory_records \
             WHERE deleted = 0 AND key IS NOT NULL AND scope_id IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in scope_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("key"), r.get("scope_id")))
            .collect())
    }

    /// Lexical candidates from FTS, best bm25 first
    pub async fn lexical_candidates(
        &self,
        scope_ids: &[String],
        query_text: &str,
        limit: i64,
    ) -> Result<Vec<LexicalHit>, CoreError> {
        if scope_ids.is_empty() || query_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        // Quote the query as a phrase set so punctuation cannot reach the
        // FTS query parser
        let match_expr = query_text
            .split_whitespace()
            .map(|w| format!("\"{}\"", w.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; scope_ids.len()].join(", ");
        let sql = format!(
            "SELECT m.*, bm25(memory_fts) AS rank FROM memory_fts \
             JOIN memory_records m ON m.id = memory_fts.record_id \
             WHERE memory_fts MATCH ? AND m.deleted = 0 AND m.scope_id IN ({}) \
             ORDER BY rank ASC, m.created_at DESC \
             LIMIT ?",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(&match_expr);
        for id in scope_ids {
            query = query.bind(id);
        }
        let rows = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter()
            .map(|r| {
                let bm25: f64 = r.get("rank");
                Ok(LexicalHit {
                    record: row_to_record(r)?,
                    bm25,
                })
            })
            .collect()
    }

    /// Newest live records in the given scopes, a recency fallback when
    /// neither embeddings nor lexical matches exist
    pub async fn recent_records_in_scopes(
        &self,
        scope_ids: &[String],
        limit: i64,
    ) -> Result<Vec<MemoryRecord>, CoreError> {
        if scope_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; scope_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM memory_records WHERE deleted = 0 AND scope_id IN ({}) \
             ORDER BY created_at DESC, id DESC LIMIT ?",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in scope_ids {
            query = query.bind(id);
        }
        let rows = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(row_to_record).collect()
    }
}

fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn row_to_record(r: sqlx::sqlite::SqliteRow) -> Result<MemoryRecord, CoreError> {
    let tags: Vec<String> =
        serde_json::from_str(&r.get::<String, _>("tags")).unwrap_or_default();
    let embedding = r
        .get::<Option<Vec<u8>>, _>("embedding")
        .map(|b| decode_embedding(&b));

    Ok(MemoryRecord {
        id: r.get("id"),
        scope_id: r.get("scope_id"),
        key: r.get("key"),
        category: r.get("category"),
        content: r.get("content"),
        tags,
        importance: r.get("importance"),
        embedding,
        text_only: r.get::<i64, _>("text_only") != 0,
        parent_record_id: r.get("parent_record_id"),
        execution_id: r.get("execution_id"),
        deleted: r.get::<i64, _>("deleted") != 0,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}
