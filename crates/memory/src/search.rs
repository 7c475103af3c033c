//! Hybrid retrieval: exhaustive cosine scan blended with FTS5 BM25 relevance.
//!
//! 1. Embed the query through the [`EmbeddingCache`] (skipped in keyword-only mode).
//! 2. Score every candidate chunk whose model matches the active one by cosine
//!    similarity, clamped to `[0, 1]`.
//! 3. Score FTS matches by `r / (1 + r)` where `r = -bm25`.
//! 4. Blend `vector_weight * v + text_weight * t`, drop anything under
//!    `min_score`, sort by score, then recency, then id. Chunks with no
//!    usable vector are scored on `t` alone.

use std::{cmp::Ordering, collections::HashMap};

use {
    serde::Serialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    cache::EmbeddingCache,
    embeddings::cosine_similarity,
    error::MemoryError,
    schema::Source,
    store::MemoryStore,
};

/// Longest snippet returned with a result, in characters.
pub const SNIPPET_MAX_CHARS: usize = 700;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub max_results: usize,
    pub min_score: f32,
    pub include_sessions: bool,
    pub include_memory: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: 6,
            min_score: 0.35,
            include_sessions: true,
            include_memory: true,
        }
    }
}

impl SearchOptions {
    /// Reject options that can never produce a meaningful search.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.max_results == 0 {
            return Err(MemoryError::invalid_options("max_results must be greater than zero"));
        }
        if !self.min_score.is_finite() || !(0.0..=1.0).contains(&self.min_score) {
            return Err(MemoryError::invalid_options(format!(
                "min_score must be within 0.0..=1.0, got {}",
                self.min_score
            )));
        }
        if !self.include_sessions && !self.include_memory {
            return Err(MemoryError::invalid_options(
                "at least one of include_memory / include_sessions must be set",
            ));
        }
        Ok(())
    }

    pub fn sources(&self) -> Vec<Source> {
        let mut sources = Vec::with_capacity(2);
        if self.include_memory {
            sources.push(Source::Memory);
        }
        if self.include_sessions {
            sources.push(Source::Sessions);
        }
        sources
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub vector: f32,
    pub text: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            vector: 0.7,
            text: 0.3,
        }
    }
}

impl HybridWeights {
    /// Weighted score over the signals actually available for a chunk.
    ///
    /// `vector` is `None` when the query could not be embedded or the chunk
    /// has no vector for the active model. The lexical score is then scaled
    /// by the text weight alone, so keyword-only matches and chunks still
    /// waiting for an embedding can clear the same `min_score` as blended
    /// ones.
    pub fn blend(&self, vector: Option<f32>, text: f32) -> f32 {
        match vector {
            Some(v) => self.vector * v + self.text * text,
            None if self.text > 0.0 => text,
            None => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub path: String,
    pub source: Source,
    pub start_line: i64,
    pub end_line: i64,
    pub snippet: String,
    pub score: f32,
    pub vector_score: f32,
    pub text_score: f32,
    #[serde(skip)]
    updated_at: i64,
}

/// Build an FTS5 expression: every alphanumeric term quoted, OR-joined.
pub fn build_fts_query(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Map a (negative) `bm25()` rank onto `[0, 1)`.
pub fn bm25_to_score(rank: f64) -> f32 {
    let relevance = if rank.is_finite() { (-rank).max(0.0) } else { 0.0 };
    (relevance / (1.0 + relevance)) as f32
}

pub fn truncate_snippet(text: &str) -> String {
    match text.char_indices().nth(SNIPPET_MAX_CHARS) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Run a hybrid search. `cache` is `None` in keyword-only mode; a failure
/// to embed the query degrades to lexical ranking.
pub async fn hybrid_search(
    store: &dyn MemoryStore,
    cache: Option<&EmbeddingCache>,
    query: &str,
    opts: &SearchOptions,
    weights: HybridWeights,
    cancel: &CancellationToken,
) -> Result<Vec<SearchResult>, MemoryError> {
    opts.validate()?;
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    let sources = opts.sources();

    let query_vec = match cache {
        Some(cache) => match cache.resolve(query).await {
            Ok(v) => Some((v, cache.model().to_string())),
            Err(e) => {
                warn!(error = %e, "query embedding failed, using keyword ranking only");
                None
            },
        },
        None => None,
    };
    if cancel.is_cancelled() {
        return Err(MemoryError::Cancelled);
    }

    let fts_query = build_fts_query(query);
    let text_scores: HashMap<String, f32> = store
        .keyword_search(&fts_query, &sources)
        .await?
        .into_iter()
        .map(|hit| (hit.id, bm25_to_score(hit.rank)))
        .collect();
    if cancel.is_cancelled() {
        return Err(MemoryError::Cancelled);
    }

    let candidates = store.scan_chunks(&sources).await?;
    let scanned = candidates.len();

    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .filter_map(|c| {
            let vector_score = match (&query_vec, &c.embedding) {
                (Some((qv, model)), Some(emb)) if *model == c.model => {
                    Some(cosine_similarity(qv, emb).clamp(0.0, 1.0))
                },
                _ => None,
            };
            let text_score = text_scores.get(&c.id).copied().unwrap_or(0.0);
            let score = weights.blend(vector_score, text_score);
            let vector_score = vector_score.unwrap_or(0.0);
            if vector_score <= 0.0 && text_score <= 0.0 {
                return None;
            }
            (score >= opts.min_score).then(|| SearchResult {
                snippet: truncate_snippet(&c.text),
                chunk_id: c.id,
                path: c.path,
                source: c.source,
                start_line: c.start_line,
                end_line: c.end_line,
                score,
                vector_score,
                text_score,
                updated_at: c.updated_at,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(opts.max_results);

    debug!(
        query,
        scanned,
        lexical_hits = text_scores.len(),
        returned = results.len(),
        "memory search"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use {
        super::*,
        crate::{
            chunker::sha256_hex,
            embeddings::EmbeddingProvider,
            schema::{ChunkRow, FileRow},
            store_sqlite::SqliteMemoryStore,
        },
        async_trait::async_trait,
        rstest::rstest,
    };

    struct AxisEmbedder;

    #[async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let lower = text.to_lowercase();
            Ok(vec![
                if lower.contains("rust") { 1.0 } else { 0.0 },
                if lower.contains("garden") { 1.0 } else { 0.0 },
            ])
        }

        fn model_name(&self) -> &str {
            "axis"
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("offline")
        }

        fn model_name(&self) -> &str {
            "axis"
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn chunk(
        path: &str,
        source: Source,
        text: &str,
        model: &str,
        embedding: Option<Vec<f32>>,
        updated_at: i64,
    ) -> ChunkRow {
        ChunkRow {
            id: ChunkRow::chunk_id(source, path, 0),
            path: path.into(),
            source,
            start_line: 1,
            end_line: 1,
            hash: sha256_hex(text),
            model: model.into(),
            text: text.into(),
            embedding,
            updated_at,
        }
    }

    async fn seeded(rows: Vec<ChunkRow>) -> Arc<SqliteMemoryStore> {
        let store = Arc::new(SqliteMemoryStore::open(":memory:").await.unwrap());
        for row in rows {
            let file = FileRow {
                path: row.path.clone(),
                source: row.source,
                hash: row.hash.clone(),
                mtime: 0,
                size: 0,
                indexed_at: 0,
            };
            store.replace_file(&file, &[row]).await.unwrap();
        }
        store
    }

    fn opts(min_score: f32) -> SearchOptions {
        SearchOptions {
            min_score,
            ..Default::default()
        }
    }

    #[rstest]
    #[case("when does the deploy key rotate?", "\"when\" OR \"does\" OR \"the\" OR \"deploy\" OR \"key\" OR \"rotate\"")]
    #[case("  ", "")]
    #[case("a\"b OR c", "\"a\" OR \"b\" OR \"or\" OR \"c\"")]
    fn fts_query_is_quoted_terms(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(build_fts_query(input), expected);
    }

    #[test]
    fn bm25_score_is_monotonic_and_bounded() {
        assert_eq!(bm25_to_score(0.0), 0.0);
        assert!(bm25_to_score(-1.0) < bm25_to_score(-2.0));
        assert!(bm25_to_score(-1e9) < 1.0);
        assert_eq!(bm25_to_score(f64::NAN), 0.0);
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let text = "é".repeat(SNIPPET_MAX_CHARS + 10);
        assert_eq!(truncate_snippet(&text).chars().count(), SNIPPET_MAX_CHARS);
    }

    #[test]
    fn invalid_options_rejected() {
        let mut o = SearchOptions::default();
        o.max_results = 0;
        assert!(o.validate().unwrap_err().is_misuse());
        let o = SearchOptions {
            min_score: 1.5,
            ..Default::default()
        };
        assert!(o.validate().is_err());
        let o = SearchOptions {
            include_memory: false,
            include_sessions: false,
            ..Default::default()
        };
        assert!(o.validate().is_err());
    }

    #[tokio::test]
    async fn vector_and_text_are_blended() {
        let store = seeded(vec![
            chunk("rust.md", Source::Memory, "notes about rust", "axis", Some(vec![1.0, 0.0]), 1),
            chunk("garden.md", Source::Memory, "garden notes", "axis", Some(vec![0.0, 1.0]), 1),
        ])
        .await;
        let cache = EmbeddingCache::new(store.clone(), Arc::new(AxisEmbedder), 8, true);
        let results = hybrid_search(
            store.as_ref(),
            Some(&cache),
            "rust",
            &opts(0.0),
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "rust.md");
        assert!((results[0].vector_score - 1.0).abs() < 1e-6);
        assert!(results[0].text_score > 0.0);
        let expected = 0.7 * results[0].vector_score + 0.3 * results[0].text_score;
        assert!((results[0].score - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn missing_embedding_keeps_lexical_score() {
        let store = seeded(vec![chunk(
            "pending.md",
            Source::Memory,
            "rust pending chunk",
            "axis",
            None,
            1,
        )])
        .await;
        let cache = EmbeddingCache::new(store.clone(), Arc::new(AxisEmbedder), 8, true);
        let results = hybrid_search(
            store.as_ref(),
            Some(&cache),
            "pending",
            &opts(0.0),
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].vector_score, 0.0);
        assert!(results[0].text_score > 0.0);
        assert_eq!(results[0].score, results[0].text_score);
    }

    #[test]
    fn blend_uses_available_signals() {
        let w = HybridWeights::default();
        assert!((w.blend(Some(1.0), 0.5) - 0.85).abs() < 1e-6);
        // A zero cosine still counts as a vector signal.
        assert!((w.blend(Some(0.0), 0.5) - 0.15).abs() < 1e-6);
        assert_eq!(w.blend(None, 0.5), 0.5);
        let vector_only = HybridWeights {
            vector: 1.0,
            text: 0.0,
        };
        assert_eq!(vector_only.blend(None, 0.5), 0.0);
    }

    #[tokio::test]
    async fn lexical_match_clears_default_min_score() {
        let mut rows: Vec<ChunkRow> = (0..10)
            .map(|i| chunk(&format!("filler-{i}.md"), Source::Memory, "unrelated filler text", "axis", None, 1))
            .collect();
        rows.push(chunk("log.md", Source::Memory, "rust programming notes", "axis", None, 1));
        let store = seeded(rows).await;
        let results = hybrid_search(
            store.as_ref(),
            None,
            "programming",
            &SearchOptions::default(),
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "log.md");
        assert!(results[0].score >= SearchOptions::default().min_score);
    }

    #[tokio::test]
    async fn other_model_vectors_are_ignored() {
        let store = seeded(vec![chunk(
            "old.md",
            Source::Memory,
            "unrelated words",
            "legacy-model",
            Some(vec![1.0, 0.0]),
            1,
        )])
        .await;
        let cache = EmbeddingCache::new(store.clone(), Arc::new(AxisEmbedder), 8, true);
        let results = hybrid_search(
            store.as_ref(),
            Some(&cache),
            "rust",
            &opts(0.0),
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn source_filters_apply() {
        let store = seeded(vec![
            chunk("a.md", Source::Memory, "rust memory note", "axis", None, 1),
            chunk("s.md", Source::Sessions, "rust session transcript", "axis", None, 1),
        ])
        .await;
        let only_sessions = SearchOptions {
            include_memory: false,
            min_score: 0.0,
            ..Default::default()
        };
        let results = hybrid_search(
            store.as_ref(),
            None,
            "rust",
            &only_sessions,
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, Source::Sessions);
    }

    #[tokio::test]
    async fn ties_break_by_recency_then_id() {
        let store = seeded(vec![
            chunk("old.md", Source::Memory, "alpha", "axis", None, 10),
            chunk("new.md", Source::Memory, "alpha", "axis", None, 20),
            chunk("also-new.md", Source::Memory, "alpha", "axis", None, 20),
        ])
        .await;
        let results = hybrid_search(
            store.as_ref(),
            None,
            "alpha",
            &opts(0.0),
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        let paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["also-new.md", "new.md", "old.md"]);
    }

    #[tokio::test]
    async fn min_score_and_max_results_apply() {
        let rows = (0..5)
            .map(|i| chunk(&format!("{i}.md"), Source::Memory, "rust", "axis", Some(vec![1.0, 0.0]), i))
            .collect();
        let store = seeded(rows).await;
        let cache = EmbeddingCache::new(store.clone(), Arc::new(AxisEmbedder), 8, true);
        let limited = SearchOptions {
            max_results: 2,
            min_score: 0.0,
            ..Default::default()
        };
        let results = hybrid_search(
            store.as_ref(),
            Some(&cache),
            "rust",
            &limited,
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 2);

        let strict = hybrid_search(
            store.as_ref(),
            Some(&cache),
            "garden",
            &opts(0.9),
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(strict.is_empty());
    }

    #[tokio::test]
    async fn query_embedding_failure_degrades_to_keyword() {
        let store = seeded(vec![chunk(
            "a.md",
            Source::Memory,
            "rust notes",
            "axis",
            Some(vec![1.0, 0.0]),
            1,
        )])
        .await;
        let cache = EmbeddingCache::new(store.clone(), Arc::new(FailingEmbedder), 8, true);
        let results = hybrid_search(
            store.as_ref(),
            Some(&cache),
            "rust",
            &opts(0.0),
            HybridWeights::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].vector_score, 0.0);
    }

    #[tokio::test]
    async fn repeated_searches_are_deterministic() {
        let rows = (0..10)
            .map(|i| {
                chunk(
                    &format!("{i}.md"),
                    Source::Memory,
                    &format!("rust garden item {i}"),
                    "axis",
                    Some(vec![1.0, (i % 3) as f32]),
                    i % 2,
                )
            })
            .collect();
        let store = seeded(rows).await;
        let cache = EmbeddingCache::new(store.clone(), Arc::new(AxisEmbedder), 8, true);
        let run = || async {
            hybrid_search(
                store.as_ref(),
                Some(&cache),
                "rust garden",
                &opts(0.0),
                HybridWeights::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.chunk_id, r.score.to_bits()))
            .collect::<Vec<_>>()
        };
        let first = run().await;
        assert_eq!(first.len(), 6);
        assert_eq!(first, run().await);
    }
}
