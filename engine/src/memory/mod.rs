/// Memory Guild
///
/// Scoped storage and retrieval of memory records. Scopes inherit down a
/// parent chain; keyed records in a nearer scope shadow same-keyed
/// records further up. Retrieval prefers semantic similarity when an
/// embedding backend is reachable and falls back to lexical search when
/// it is not. Degraded mode is a normal operating mode, not an error.
pub mod embedding;

use sdk::errors::CoreError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::db::{Database, MemoryRecord};
use embedding::{cosine_similarity, EmbeddingProvider};

/// Which path produced a retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Semantic,
    Lexical,
}

#[derive(Debug, Clone)]
pub struct Retrieved {
    pub record: MemoryRecord,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub mode: RetrievalMode,
    pub items: Vec<Retrieved>,
}

/// What to store; ids and timestamps are assigned by the guild
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub scope_id: String,
    pub key: Option<String>,
    pub category: String,
    pub content: String,
    pub tags: Vec<String>,
    pub importance: f64,
    pub execution_id: Option<String>,
}

pub struct MemoryGuild {
    db: Arc<Database>,
    config: MemoryConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl MemoryGuild {
    pub fn new(
        db: Arc<Database>,
        config: MemoryConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Self {
        Self {
            db,
            config,
            embedder,
        }
    }

    // ---- scopes ----

    /// Create a scope, optionally under a parent
    pub async fn create_scope(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String, CoreError> {
        let id = Uuid::new_v4().to_string();
        self.db.memory().create_scope(&id, name, parent_id).await?;
        info!(scope_id = %id, name = %name, "Created scope");
        Ok(id)
    }

    /// Link an existing scope under a parent. Rejected when the link
    /// would close a cycle.
    pub async fn inherit(&self, child: &str, parent: &str) -> Result<(), CoreError> {
        self.db.memory().set_scope_parent(child, parent).await?;
        info!(child = %child, parent = %parent, "Linked scope inheritance");
        Ok(())
    }

    // ---- records ----

    /// Store a record in a scope
    ///
    /// Embedding failure downgrades the record to text-only rather than
    /// failing the store; the record is still retrievable lexically.
    pub async fn store(&self, request: StoreRequest) -> Result<String, CoreError> {
        if request.content.trim().is_empty() {
            return Err(CoreError::Validation("Memory content is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&request.importance) {
            return Err(CoreError::Validation(format!(
                "Importance {} is outside [0, 1]",
                request.importance
            )));
        }

        let (embedding, text_only) = self.try_embed(&request.content).await;
        let now = chrono::Utc::now().timestamp();
        let id = Uuid::new_v4().to_string();
        let record = MemoryRecord {
            id: id.clone(),
            scope_id: request.scope_id,
            key: request.key,
            category: request.category,
            content: request.content,
            tags: request.tags,
            importance: request.importance,
            embedding,
            text_only,
            parent_record_id: None,
            execution_id: request.execution_id,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        self.db.memory().insert_record(&record).await?;
        debug!(record_id = %id, text_only = text_only, "Stored memory record");
        Ok(id)
    }

    /// Update a record's content, re-embedding when possible
    pub async fn update(
        &self,
        record_id: &str,
        content: &str,
        tags: &[String],
        importance: f64,
    ) -> Result<(), CoreError> {
        if content.trim().is_empty() {
            return Err(CoreError::Validation("Memory content is empty".to_string()));
        }
        let (embedding, text_only) = self.try_embed(content).await;
        self.db
            .memory()
            .update_record(
                record_id,
                content,
                tags,
                importance,
                embedding.as_deref(),
                text_only,
            )
            .await
    }

    /// Remove a record; audit-referenced records are tombstoned
    pub async fn delete(&self, record_id: &str) -> Result<(), CoreError> {
        self.db.memory().delete_record(record_id).await
    }

    pub async fn get(&self, record_id: &str) -> Result<Option<MemoryRecord>, CoreError> {
        self.db.memory().get_record(record_id).await
    }

    /// Retrieve the records most relevant to a query, seen from a scope
    ///
    /// The visible set is the scope chain up to the root, with keyed
    /// shadowing applied. Semantic ranking runs when the query embeds;
    /// otherwise lexical search with an exact-content match pinned first.
    pub async fn retrieve(
        &self,
        scope_id: &str,
        query: &str,
        k: Option<usize>,
    ) -> Result<RetrievalResult, CoreError> {
        let k = k.unwrap_or(self.config.retrieve_k).max(1);
        let chain = self.db.memory().scope_chain(scope_id).await?;
        let nearest = self.shadow_depths(&chain).await?;

        if let Some(query_vec) = self.embed_query(query).await {
            let items = self.semantic_rank(&chain, &nearest, &query_vec, k).await?;
            // An embedded corpus can still be empty; lexical picks up
            if !items.is_empty() {
                return Ok(RetrievalResult {
                    mode: RetrievalMode::Semantic,
                    items,
                });
            }
        }

        let items = self.lexical_rank(&chain, &nearest, query, k).await?;
        Ok(RetrievalResult {
            mode: RetrievalMode::Lexical,
            items,
        })
    }

    /// For each key visible from the chain, the nearest chain depth that
    /// holds a live record with that key. Built over all keyed records,
    /// so an overriding record suppresses its ancestors even when the
    /// override itself does not match the query at hand.
    async fn shadow_depths(
        &self,
        chain: &[String],
    ) -> Result<HashMap<String, usize>, CoreError> {
        let keyed = self.db.memory().keyed_records_in_scopes(chain).await?;
        let mut nearest: HashMap<String, usize> = HashMap::new();
        for (key, scope_id) in keyed {
            let depth = chain
                .iter()
                .position(|s| s == &scope_id)
                .unwrap_or(usize::MAX);
            let entry = nearest.entry(key).or_insert(depth);
            if depth < *entry {
                *entry = depth;
            }
        }
        Ok(nearest)
    }

    async fn semantic_rank(
        &self,
        chain: &[String],
        nearest: &HashMap<String, usize>,
        query_vec: &[f32],
        k: usize,
    ) -> Result<Vec<Retrieved>, CoreError> {
        let candidates = self.db.memory().embedded_records_in_scopes(chain).await?;
        let mut scored: Vec<Retrieved> = candidates
            .into_iter()
            .filter_map(|record| {
                let vec = record.embedding.as_deref()?;
                let score = cosine_similarity(query_vec, vec);
                Some(Retrieved { record, score })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        });
        Ok(apply_shadowing(scored, chain, nearest, k))
    }

    async fn lexical_rank(
        &self,
        chain: &[String],
        nearest: &HashMap<String, usize>,
        query: &str,
        k: usize,
    ) -> Result<Vec<Retrieved>, CoreError> {
        // Over-fetch so shadowing cannot empty the page
        let fetch = (k * 4).max(20) as i64;
        let hits = self
            .db
            .memory()
            .lexical_candidates(chain, query, fetch)
            .await?;

        let mut scored: Vec<Retrieved> = hits
            .into_iter()
            .map(|hit| {
                // bm25 is lower-is-better; negate so higher score wins.
                // An exact content match outranks any bm25 score.
                let exact = hit.record.content == query;
                let score = if exact { f64::INFINITY } else { -hit.bm25 };
                Retrieved {
                    record: hit.record,
                    score,
                }
            })
            .collect();

        if scored.is_empty() {
            // Nothing matched lexically; fall back to recency so the
            // caller still gets context
            scored = self
                .db
                .memory()
                .recent_records_in_scopes(chain, fetch)
                .await?
                .into_iter()
                .map(|record| Retrieved { record, score: 0.0 })
                .collect();
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.created_at.cmp(&a.record.created_at))
        });
        Ok(apply_shadowing(scored, chain, nearest, k))
    }

    async fn try_embed(&self, text: &str) -> (Option<Vec<f32>>, bool) {
        match &self.embedder {
            Some(embedder) => match embedder.embed(text).await {
                Ok(vec) => (Some(vec), false),
                Err(e) => {
                    warn!(error = %e, "Embedding unavailable, storing text-only");
                    (None, true)
                }
            },
            None => (None, true),
        }
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        match embedder.embed(query).await {
            Ok(vec) => Some(vec),
            Err(e) => {
                warn!(error = %e, "Embedding unavailable, degrading to lexical retrieval");
                None
            }
        }
    }
}

/// Drop records whose key is held at a nearer chain depth, then truncate
/// to k. Keyless records never shadow or get shadowed.
fn apply_shadowing(
    ranked: Vec<Retrieved>,
    chain: &[String],
    nearest: &HashMap<String, usize>,
    k: usize,
) -> Vec<Retrieved> {
    let mut seen_keys: HashSet<String> = HashSet::new();
    ranked
        .into_iter()
        .filter(|item| match item.record.key.as_deref() {
            Some(key) => {
                let depth = chain
                    .iter()
                    .position(|s| s == &item.record.scope_id)
                    .unwrap_or(usize::MAX);
                if nearest.get(key).is_some_and(|d| depth != *d) {
                    return false;
                }
                // One record per key even within the winning scope
                seen_keys.insert(key.to_string())
            }
            None => true,
        })
        .take(k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Deterministic embedder: maps known words onto axes so similarity
    /// is predictable
    struct AxisEmbedder;

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, CoreError> {
            let lower = text.to_lowercase();
            let axes = ["rust", "cooking", "music"];
            let mut vec = vec![0.0f32; axes.len()];
            for (i, word) in axes.iter().enumerate() {
                if lower.contains(word) {
                    vec[i] = 1.0;
                }
            }
            if vec.iter().all(|v| *v == 0.0) {
                vec[0] = 0.01;
            }
            Ok(vec)
        }

        fn name(&self) -> &str {
            "axis-test"
        }
    }

    /// Embedder that always fails, for degraded-mode coverage
    struct DownEmbedder;

    #[async_trait]
    impl EmbeddingProvider for DownEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, CoreError> {
            Err(CoreError::DependencyUnavailable("down".to_string()))
        }

        fn name(&self) -> &str {
            "down-test"
        }
    }

    async fn guild_with(
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> (TempDir, MemoryGuild) {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("test.db")).await.unwrap();
        let guild = MemoryGuild::new(Arc::new(db), MemoryConfig::default(), embedder);
        (temp, guild)
    }

    fn request(scope: &str, content: &str) -> StoreRequest {
        StoreRequest {
            scope_id: scope.to_string(),
            key: None,
            category: "note".to_string(),
            content: content.to_string(),
            tags: vec![],
            importance: 0.5,
            execution_id: None,
        }
    }

    #[tokio::test]
    async fn test_semantic_retrieval_ranks_by_similarity() {
        let (_temp, guild) = guild_with(Some(Arc::new(AxisEmbedder))).await;
        let scope = guild.create_scope("s", None).await.unwrap();

        guild.store(request(&scope, "notes about rust lifetimes")).await.unwrap();
        guild.store(request(&scope, "cooking pasta at home")).await.unwrap();

        let result = guild
            .retrieve(&scope, "rust borrow checker", Some(5))
            .await
            .unwrap();
        assert_eq!(result.mode, RetrievalMode::Semantic);
        assert!(result.items[0].record.content.contains("rust"));
        assert!(result.items[0].score > result.items[1].score);
    }

    #[tokio::test]
    async fn test_degraded_mode_still_retrieves() {
        let (_temp, guild) = guild_with(Some(Arc::new(DownEmbedder))).await;
        let scope = guild.create_scope("s", None).await.unwrap();

        // Store succeeds despite the backend being down
        let id = guild
            .store(request(&scope, "lexical fallback content"))
            .await
            .unwrap();
        let record = guild.get(&id).await.unwrap().unwrap();
        assert!(record.text_only);
        assert!(record.embedding.is_none());

        let result = guild
            .retrieve(&scope, "fallback", Some(5))
            .await
            .unwrap();
        assert_eq!(result.mode, RetrievalMode::Lexical);
        assert_eq!(result.items.len(), 1);
    }

    #[tokio::test]
    async fn test_lexical_exact_match_pinned_first() {
        let (_temp, guild) = guild_with(None).await;
        let scope = guild.create_scope("s", None).await.unwrap();

        guild
            .store(request(&scope, "deploy checklist with extra words about deploy"))
            .await
            .unwrap();
        guild.store(request(&scope, "deploy checklist")).await.unwrap();

        let result = guild
            .retrieve(&scope, "deploy checklist", Some(5))
            .await
            .unwrap();
        assert_eq!(result.mode, RetrievalMode::Lexical);
        assert_eq!(result.items[0].record.content, "deploy checklist");
    }

    #[tokio::test]
    async fn test_inheritance_makes_parent_records_visible() {
        let (_temp, guild) = guild_with(None).await;
        let parent = guild.create_scope("parent", None).await.unwrap();
        let child = guild.create_scope("child", Some(&parent)).await.unwrap();

        guild
            .store(request(&parent, "shared deployment runbook"))
            .await
            .unwrap();

        let from_child = guild
            .retrieve(&child, "runbook", Some(5))
            .await
            .unwrap();
        assert_eq!(from_child.items.len(), 1);

        // Sibling scopes see nothing of each other
        let sibling = guild.create_scope("sibling", None).await.unwrap();
        let from_sibling = guild
            .retrieve(&sibling, "runbook", Some(5))
            .await
            .unwrap();
        assert!(from_sibling.items.is_empty());
    }

    #[tokio::test]
    async fn test_keyed_records_shadow_down_the_chain() {
        let (_temp, guild) = guild_with(None).await;
        let parent = guild.create_scope("parent", None).await.unwrap();
        let child = guild.create_scope("child", Some(&parent)).await.unwrap();

        let mut inherited = request(&parent, "endpoint is staging.internal");
        inherited.key = Some("endpoint".to_string());
        guild.store(inherited).await.unwrap();

        let mut overriding = request(&child, "endpoint is prod.internal");
        overriding.key = Some("endpoint".to_string());
        guild.store(overriding).await.unwrap();

        // Child sees only its own version
        let from_child = guild
            .retrieve(&child, "endpoint", Some(5))
            .await
            .unwrap();
        let contents: Vec<_> = from_child
            .items
            .iter()
            .map(|i| i.record.content.as_str())
            .collect();
        assert_eq!(contents, vec!["endpoint is prod.internal"]);

        // Parent still sees its own, unshadowed
        let from_parent = guild
            .retrieve(&parent, "endpoint", Some(5))
            .await
            .unwrap();
        assert_eq!(from_parent.items.len(), 1);
        assert_eq!(
            from_parent.items[0].record.content,
            "endpoint is staging.internal"
        );
    }

    #[tokio::test]
    async fn test_shadowed_ancestor_hidden_even_when_override_misses_query() {
        let (_temp, guild) = guild_with(None).await;
        let parent = guild.create_scope("parent", None).await.unwrap();
        let child = guild.create_scope("child", Some(&parent)).await.unwrap();

        let mut inherited = request(&parent, "endpoint is the staging host");
        inherited.key = Some("endpoint".to_string());
        guild.store(inherited).await.unwrap();

        // The override shares the key but none of the query's words
        let mut overriding = request(&child, "prod configuration values");
        overriding.key = Some("endpoint".to_string());
        guild.store(overriding).await.unwrap();

        let from_child = guild.retrieve(&child, "staging", Some(5)).await.unwrap();
        assert!(
            from_child
                .items
                .iter()
                .all(|i| !i.record.content.contains("staging")),
            "shadowed parent record leaked: {:?}",
            from_child.items
        );

        // The parent's own view is untouched
        let from_parent = guild.retrieve(&parent, "staging", Some(5)).await.unwrap();
        assert_eq!(from_parent.items.len(), 1);
    }

    #[tokio::test]
    async fn test_keyless_records_never_shadowed() {
        let (_temp, guild) = guild_with(None).await;
        let parent = guild.create_scope("parent", None).await.unwrap();
        let child = guild.create_scope("child", Some(&parent)).await.unwrap();

        guild
            .store(request(&parent, "observation alpha noted"))
            .await
            .unwrap();
        guild
            .store(request(&child, "observation beta noted"))
            .await
            .unwrap();

        let result = guild
            .retrieve(&child, "observation", Some(5))
            .await
            .unwrap();
        assert_eq!(result.items.len(), 2);
    }

    #[tokio::test]
    async fn test_inherit_rejects_cycles() {
        let (_temp, guild) = guild_with(None).await;
        let a = guild.create_scope("a", None).await.unwrap();
        let b = guild.create_scope("b", Some(&a)).await.unwrap();

        let err = guild.inherit(&a, &b).await.unwrap_err();
        assert!(matches!(err, CoreError::CycleDetected { .. }));
    }

    #[tokio::test]
    async fn test_store_validates_importance() {
        let (_temp, guild) = guild_with(None).await;
        let scope = guild.create_scope("s", None).await.unwrap();

        let mut bad = request(&scope, "content");
        bad.importance = 1.5;
        let err = guild.store(bad).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
