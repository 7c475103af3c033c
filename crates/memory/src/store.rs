/// Storage abstraction for indexed files, chunks, embedding cache and index metadata.
use async_trait::async_trait;

use crate::schema::{ChunkRow, FileRow, Source};

/// A chunk as seen by the search scan: everything but nothing more.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub id: String,
    pub path: String,
    pub source: Source,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    pub model: String,
    pub embedding: Option<Vec<f32>>,
    pub updated_at: i64,
}

/// Lexical hit from the full-text index. `rank` is SQLite's `bm25()` value
/// (more negative is more relevant).
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub id: String,
    pub rank: f64,
}

/// A chunk whose embedding is still missing.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub id: String,
    pub text: String,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    // ---- files ----
    async fn get_file(&self, source: Source, path: &str) -> anyhow::Result<Option<FileRow>>;
    async fn list_files(&self, source: Option<Source>) -> anyhow::Result<Vec<FileRow>>;
    /// Refresh a file's mtime/size without touching its chunks.
    async fn touch_file(&self, file: &FileRow) -> anyhow::Result<()>;
    /// Write a file row and its complete chunk set in one transaction.
    /// Previous chunks of that file are removed.
    async fn replace_file(&self, file: &FileRow, chunks: &[ChunkRow]) -> anyhow::Result<()>;
    /// Remove a file and all its chunks in one transaction.
    async fn delete_file(&self, source: Source, path: &str) -> anyhow::Result<()>;

    // ---- chunks ----
    async fn get_chunks_for_file(&self, source: Source, path: &str)
    -> anyhow::Result<Vec<ChunkRow>>;
    async fn get_chunk_by_id(&self, id: &str) -> anyhow::Result<Option<ChunkRow>>;
    async fn count_chunks(&self) -> anyhow::Result<usize>;
    async fn pending_embedding_chunks(&self, limit: usize) -> anyhow::Result<Vec<PendingChunk>>;
    async fn count_pending_embeddings(&self) -> anyhow::Result<usize>;
    /// Attach embeddings computed with `model` to existing chunks.
    async fn set_chunk_embeddings(
        &self,
        model: &str,
        updates: &[(String, Vec<f32>)],
    ) -> anyhow::Result<()>;

    // ---- embedding cache ----
    async fn get_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        hash: &str,
    ) -> anyhow::Result<Option<Vec<u8>>>;

    async fn put_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        hash: &str,
        embedding: &[f32],
    ) -> anyhow::Result<()>;

    async fn delete_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        hash: &str,
    ) -> anyhow::Result<()>;

    /// Count the number of rows in the embedding cache.
    async fn count_cached_embeddings(&self) -> anyhow::Result<usize>;

    /// Evict the oldest cache rows, keeping at most `keep` entries.
    async fn evict_embedding_cache(&self, keep: usize) -> anyhow::Result<usize>;

    // ---- meta ----
    async fn get_meta(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set_meta(&self, key: &str, value: &str) -> anyhow::Result<()>;

    // ---- search ----
    /// Every chunk from the given sources, for the exhaustive vector scan.
    async fn scan_chunks(&self, sources: &[Source]) -> anyhow::Result<Vec<ChunkCandidate>>;

    /// Full-text match restricted to `sources`. `fts_query` is an FTS5 expression.
    async fn keyword_search(
        &self,
        fts_query: &str,
        sources: &[Source],
    ) -> anyhow::Result<Vec<KeywordHit>>;
}
