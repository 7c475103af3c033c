/// SQLite-backed [`MemoryStore`]: files, chunks, an FTS5 mirror of chunk text,
/// the embedding cache and index metadata all live in one database.
use std::{str::FromStr, time::Duration};

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    },
    tracing::debug,
};

use crate::{
    schema::{ChunkRow, FileRow, Source, blob_to_vec, now_ms, run_migrations, vec_to_blob},
    store::{ChunkCandidate, KeywordHit, MemoryStore, PendingChunk},
};

pub struct SqliteMemoryStore {
    pool: SqlitePool,
}

impl SqliteMemoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `db_path` in WAL mode and run migrations.
    pub async fn open(db_path: &str) -> anyhow::Result<Self> {
        let base = if db_path == ":memory:" {
            SqliteConnectOptions::from_str(":memory:")?
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        let options = base.foreign_keys(true).busy_timeout(Duration::from_secs(5));

        // Shared-cache in-memory databases lock per table; one connection avoids that.
        let max_connections = if db_path == ":memory:" { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        run_migrations(&pool).await?;
        debug!(db_path, "memory index opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn file_from_row(row: &SqliteRow) -> anyhow::Result<FileRow> {
    Ok(FileRow {
        path: row.try_get("path")?,
        source: row.try_get::<String, _>("source")?.parse()?,
        hash: row.try_get("hash")?,
        mtime: row.try_get("mtime")?,
        size: row.try_get("size")?,
        indexed_at: row.try_get("indexed_at")?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> anyhow::Result<ChunkRow> {
    let blob: Option<Vec<u8>> = row.try_get("embedding")?;
    Ok(ChunkRow {
        id: row.try_get("id")?,
        path: row.try_get("path")?,
        source: row.try_get::<String, _>("source")?.parse()?,
        start_line: row.try_get("start_line")?,
        end_line: row.try_get("end_line")?,
        hash: row.try_get("hash")?,
        model: row.try_get("model")?,
        text: row.try_get("text")?,
        embedding: blob.as_deref().and_then(blob_to_vec),
        updated_at: row.try_get("updated_at")?,
    })
}

const CHUNK_COLUMNS: &str =
    "id, path, source, start_line, end_line, hash, model, text, embedding, updated_at";

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn get_file(&self, source: Source, path: &str) -> anyhow::Result<Option<FileRow>> {
        let row = sqlx::query(
            "SELECT path, source, hash, mtime, size, indexed_at FROM files WHERE source = ? AND path = ?",
        )
        .bind(source.as_str())
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn list_files(&self, source: Option<Source>) -> anyhow::Result<Vec<FileRow>> {
        let rows = match source {
            Some(source) => {
                sqlx::query(
                    "SELECT path, source, hash, mtime, size, indexed_at FROM files WHERE source = ? ORDER BY path",
                )
                .bind(source.as_str())
                .fetch_all(&self.pool)
                .await?
            },
            None => {
                sqlx::query(
                    "SELECT path, source, hash, mtime, size, indexed_at FROM files ORDER BY source, path",
                )
                .fetch_all(&self.pool)
                .await?
            },
        };
        rows.iter().map(file_from_row).collect()
    }

    async fn touch_file(&self, file: &FileRow) -> anyhow::Result<()> {
        sqlx::query("UPDATE files SET mtime = ?, size = ? WHERE source = ? AND path = ?")
            .bind(file.mtime)
            .bind(file.size)
            .bind(file.source.as_str())
            .bind(&file.path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_file(&self, file: &FileRow, chunks: &[ChunkRow]) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO files (path, source, hash, mtime, size, indexed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, path) DO UPDATE SET
                hash = excluded.hash,
                mtime = excluded.mtime,
                size = excluded.size,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&file.path)
        .bind(file.source.as_str())
        .bind(&file.hash)
        .bind(file.mtime)
        .bind(file.size)
        .bind(file.indexed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE source = ? AND path = ?")
            .bind(file.source.as_str())
            .bind(&file.path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE source = ? AND path = ?")
            .bind(file.source.as_str())
            .bind(&file.path)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.path)
            .bind(chunk.source.as_str())
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .bind(&chunk.hash)
            .bind(&chunk.model)
            .bind(&chunk.text)
            .bind(chunk.embedding.as_deref().map(vec_to_blob))
            .bind(chunk.updated_at)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (text, id, path, source) VALUES (?, ?, ?, ?)")
                .bind(&chunk.text)
                .bind(&chunk.id)
                .bind(&chunk.path)
                .bind(chunk.source.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_file(&self, source: Source, path: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM chunks_fts WHERE source = ? AND path = ?",
            "DELETE FROM chunks WHERE source = ? AND path = ?",
            "DELETE FROM files WHERE source = ? AND path = ?",
        ] {
            sqlx::query(sql)
                .bind(source.as_str())
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_chunks_for_file(
        &self,
        source: Source,
        path: &str,
    ) -> anyhow::Result<Vec<ChunkRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE source = ? AND path = ? ORDER BY start_line, id"
        ))
        .bind(source.as_str())
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn get_chunk_by_id(&self, id: &str) -> anyhow::Result<Option<ChunkRow>> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn count_chunks(&self) -> anyhow::Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn pending_embedding_chunks(&self, limit: usize) -> anyhow::Result<Vec<PendingChunk>> {
        let rows = sqlx::query(
            "SELECT id, text FROM chunks WHERE embedding IS NULL ORDER BY updated_at, id LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(PendingChunk {
                    id: r.try_get("id")?,
                    text: r.try_get("text")?,
                })
            })
            .collect()
    }

    async fn count_pending_embeddings(&self) -> anyhow::Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn set_chunk_embeddings(
        &self,
        model: &str,
        updates: &[(String, Vec<f32>)],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = now_ms();
        for (id, embedding) in updates {
            sqlx::query("UPDATE chunks SET embedding = ?, model = ?, updated_at = ? WHERE id = ?")
                .bind(vec_to_blob(embedding))
                .bind(model)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        hash: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let blob: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT embedding FROM embedding_cache WHERE provider = ? AND model = ? AND hash = ?",
        )
        .bind(provider)
        .bind(model)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(blob)
    }

    async fn put_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        hash: &str,
        embedding: &[f32],
    ) -> anyhow::Result<()> {
        // Entries are immutable: a concurrent writer of the same key wins.
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (provider, model, hash, embedding, dims, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, model, hash) DO NOTHING
            "#,
        )
        .bind(provider)
        .bind(model)
        .bind(hash)
        .bind(vec_to_blob(embedding))
        .bind(embedding.len() as i64)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_cached_embedding(
        &self,
        provider: &str,
        model: &str,
        hash: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM embedding_cache WHERE provider = ? AND model = ? AND hash = ?")
            .bind(provider)
            .bind(model)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_cached_embeddings(&self) -> anyhow::Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn evict_embedding_cache(&self, keep: usize) -> anyhow::Result<usize> {
        let result = sqlx::query(
            r#"
            DELETE FROM embedding_cache WHERE rowid NOT IN (
                SELECT rowid FROM embedding_cache ORDER BY created_at DESC, rowid DESC LIMIT ?
            )
            "#,
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn get_meta(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_meta(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scan_chunks(&self, sources: &[Source]) -> anyhow::Result<Vec<ChunkCandidate>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, path, source, start_line, end_line, text, model, embedding, updated_at \
             FROM chunks WHERE source IN ({})",
            placeholders(sources.len())
        );
        let mut query = sqlx::query(&sql);
        for s in sources {
            query = query.bind(s.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let blob: Option<Vec<u8>> = row.try_get("embedding")?;
                Ok(ChunkCandidate {
                    id: row.try_get("id")?,
                    path: row.try_get("path")?,
                    source: row.try_get::<String, _>("source")?.parse()?,
                    start_line: row.try_get("start_line")?,
                    end_line: row.try_get("end_line")?,
                    text: row.try_get("text")?,
                    model: row.try_get("model")?,
                    embedding: blob.as_deref().and_then(blob_to_vec),
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn keyword_search(
        &self,
        fts_query: &str,
        sources: &[Source],
    ) -> anyhow::Result<Vec<KeywordHit>> {
        if sources.is_empty() || fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, bm25(chunks_fts) AS rank FROM chunks_fts \
             WHERE chunks_fts MATCH ? AND source IN ({}) ORDER BY rank",
            placeholders(sources.len())
        );
        let mut query = sqlx::query(&sql).bind(fts_query);
        for s in sources {
            query = query.bind(s.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                Ok(KeywordHit {
                    id: r.try_get("id")?,
                    rank: r.try_get("rank")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    async fn store() -> SqliteMemoryStore {
        SqliteMemoryStore::open(":memory:").await.unwrap()
    }

    fn file(path: &str, hash: &str) -> FileRow {
        FileRow {
            path: path.into(),
            source: Source::Memory,
            hash: hash.into(),
            mtime: 1,
            size: 10,
            indexed_at: 1,
        }
    }

    fn chunk(path: &str, idx: usize, text: &str, embedding: Option<Vec<f32>>) -> ChunkRow {
        ChunkRow {
            id: ChunkRow::chunk_id(Source::Memory, path, idx),
            path: path.into(),
            source: Source::Memory,
            start_line: idx as i64 + 1,
            end_line: idx as i64 + 1,
            hash: crate::chunker::sha256_hex(text),
            model: "m".into(),
            text: text.into(),
            embedding,
            updated_at: 1,
        }
    }

    #[tokio::test]
    async fn replace_file_prunes_stale_chunks() {
        let s = store().await;
        let f = file("a.md", "h1");
        s.replace_file(&f, &[
            chunk("a.md", 0, "one", None),
            chunk("a.md", 1, "two", None),
            chunk("a.md", 2, "three", None),
        ])
        .await
        .unwrap();
        s.replace_file(&file("a.md", "h2"), &[chunk("a.md", 0, "uno", None)])
            .await
            .unwrap();

        let chunks = s.get_chunks_for_file(Source::Memory, "a.md").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "uno");
        assert_eq!(s.get_file(Source::Memory, "a.md").await.unwrap().unwrap().hash, "h2");
        assert!(s.keyword_search("three", &[Source::Memory]).await.unwrap().is_empty());
        assert_eq!(s.keyword_search("uno", &[Source::Memory]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_file_removes_chunks_and_fts_rows() {
        let s = store().await;
        s.replace_file(&file("a.md", "h"), &[chunk("a.md", 0, "deploy key", None)])
            .await
            .unwrap();
        s.delete_file(Source::Memory, "a.md").await.unwrap();
        assert!(s.get_file(Source::Memory, "a.md").await.unwrap().is_none());
        assert_eq!(s.count_chunks().await.unwrap(), 0);
        assert!(s.keyword_search("deploy", &[Source::Memory]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keyword_search_filters_by_source() {
        let s = store().await;
        s.replace_file(&file("a.md", "h"), &[chunk("a.md", 0, "rust notes", None)])
            .await
            .unwrap();
        assert_eq!(s.keyword_search("rust", &[Source::Memory]).await.unwrap().len(), 1);
        assert!(s.keyword_search("rust", &[Source::Sessions]).await.unwrap().is_empty());
        assert!(s.keyword_search("rust", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn embeddings_roundtrip_and_pending_tracking() {
        let s = store().await;
        s.replace_file(&file("a.md", "h"), &[
            chunk("a.md", 0, "one", Some(vec![1.0, 0.0])),
            chunk("a.md", 1, "two", None),
        ])
        .await
        .unwrap();
        assert_eq!(s.count_pending_embeddings().await.unwrap(), 1);
        let pending = s.pending_embedding_chunks(10).await.unwrap();
        assert_eq!(pending[0].text, "two");

        s.set_chunk_embeddings("m2", &[(pending[0].id.clone(), vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(s.count_pending_embeddings().await.unwrap(), 0);
        let row = s.get_chunk_by_id(&pending[0].id).await.unwrap().unwrap();
        assert_eq!(row.embedding, Some(vec![0.0, 1.0]));
        assert_eq!(row.model, "m2");
    }

    #[tokio::test]
    async fn cache_entries_are_immutable_and_evictable() {
        let s = store().await;
        s.put_cached_embedding("p", "m", "h1", &[1.0]).await.unwrap();
        s.put_cached_embedding("p", "m", "h1", &[2.0]).await.unwrap();
        let blob = s.get_cached_embedding("p", "m", "h1").await.unwrap().unwrap();
        assert_eq!(blob_to_vec(&blob).unwrap(), vec![1.0]);

        s.put_cached_embedding("p", "m", "h2", &[2.0]).await.unwrap();
        s.put_cached_embedding("p", "m", "h3", &[3.0]).await.unwrap();
        assert_eq!(s.count_cached_embeddings().await.unwrap(), 3);
        assert_eq!(s.evict_embedding_cache(1).await.unwrap(), 2);
        assert_eq!(s.count_cached_embeddings().await.unwrap(), 1);
        // The newest entry survives.
        assert!(s.get_cached_embedding("p", "m", "h3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn meta_upserts() {
        let s = store().await;
        assert!(s.get_meta("dirty").await.unwrap().is_none());
        s.set_meta("dirty", "1").await.unwrap();
        s.set_meta("dirty", "0").await.unwrap();
        assert_eq!(s.get_meta("dirty").await.unwrap().as_deref(), Some("0"));
    }
}
