//! Change-aware indexing of the memory and sessions folders.
//!
//! A run scans both roots and hashes every file. Files whose content hash is
//! unchanged are skipped (a moved mtime or size is just refreshed); the rest
//! are chunked and resolves their embeddings through the
//! cache in waves spanning several files. Each file is reconciled in its own
//! transaction, so a cancelled or failed run leaves every committed file
//! consistent. Files that vanished from disk are removed last.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use {
    serde::Serialize,
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    walkdir::{DirEntry, WalkDir},
};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use crate::{
    cache::EmbeddingCache,
    chunker::{ChunkerOptions, TextChunk, chunk_text, sha256_hex},
    config::MemoryConfig,
    error::MemoryError,
    schema::{ChunkRow, FileRow, SCHEMA_VERSION, Source, meta_keys, now_ms},
    store::MemoryStore,
};

/// Upper bound on chunks re-embedded by the pending pass in one run.
const PENDING_RETRY_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Re-chunk and re-embed every file regardless of stored state.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub files_failed: usize,
    pub chunks_created: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub pending_retried: usize,
    /// Whether this run reindexed everything.
    pub full: bool,
    /// The embedding provider was unreachable; later files were committed
    /// with cached vectors only.
    pub provider_unavailable: bool,
}

/// Progress events emitted while a sync runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncProgress {
    Started { files: usize, full: bool },
    FileIndexed { source: Source, path: String, chunks: usize },
    FileSkipped { source: Source, path: String },
    FileFailed { source: Source, path: String, error: String },
    FileRemoved { source: Source, path: String },
    Finished(SyncReport),
}

pub type ProgressSender = mpsc::UnboundedSender<SyncProgress>;

fn emit(progress: Option<&ProgressSender>, event: SyncProgress) {
    if let Some(tx) = progress {
        // A dropped receiver just means nobody is listening any more.
        let _ = tx.send(event);
    }
}

/// A file discovered by the scan.
#[derive(Debug, Clone)]
struct ScannedFile {
    source: Source,
    rel_path: String,
    abs_path: PathBuf,
    mtime: i64,
}

/// A changed file that has been read and chunked but not yet committed.
struct PreparedFile {
    row: FileRow,
    chunks: Vec<TextChunk>,
}

/// Fingerprint of everything that changes what the index would contain.
pub fn index_fingerprint(config: &MemoryConfig, cache: Option<&EmbeddingCache>) -> String {
    let provider = match cache {
        Some(cache) => format!(
            "{}|{}|{}",
            cache.provider().provider_key(),
            cache.model(),
            cache.provider().dimensions()
        ),
        None => "keyword-only".to_string(),
    };
    sha256_hex(&format!(
        "{provider}|tokens={}|overlap={}|markdown={}",
        config.chunk_tokens, config.chunk_overlap, config.markdown_aware
    ))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn modified_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
        .unwrap_or(0)
}

pub struct SyncEngine {
    config: MemoryConfig,
    store: Arc<dyn MemoryStore>,
    cache: Option<Arc<EmbeddingCache>>,
}

impl SyncEngine {
    pub fn new(
        config: MemoryConfig,
        store: Arc<dyn MemoryStore>,
        cache: Option<Arc<EmbeddingCache>>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
        }
    }

    fn chunker_options(&self) -> ChunkerOptions {
        ChunkerOptions {
            max_tokens: self.config.chunk_tokens,
            overlap_tokens: self.config.chunk_overlap,
            markdown_aware: self.config.markdown_aware,
        }
    }

    fn model(&self) -> &str {
        self.cache.as_deref().map(EmbeddingCache::model).unwrap_or("")
    }

    pub fn fingerprint(&self) -> String {
        index_fingerprint(&self.config, self.cache.as_deref())
    }

    /// Whether stored metadata was written by a different layout or provider.
    pub async fn needs_full_reindex(&self) -> anyhow::Result<bool> {
        let version = self.store.get_meta(meta_keys::SCHEMA_VERSION).await?;
        if version.as_deref() != Some(SCHEMA_VERSION.to_string().as_str()) {
            return Ok(true);
        }
        let fingerprint = self.store.get_meta(meta_keys::INDEX_FINGERPRINT).await?;
        Ok(fingerprint.as_deref() != Some(self.fingerprint().as_str()))
    }

    /// Walk both roots. Files under the sessions folder never count as memory,
    /// however the two folders are spelled.
    fn scan(&self) -> Vec<ScannedFile> {
        let sessions_dir = self.config.sessions_dir.as_deref().map(canonical);
        let mut roots = vec![(self.config.memory_dir.as_path(), Source::Memory)];
        if let Some(dir) = self.config.active_sessions_dir() {
            roots.push((dir, Source::Sessions));
        }

        let mut files = Vec::new();
        for (root, source) in roots {
            if !root.is_dir() {
                debug!(root = %root.display(), %source, "source folder missing, skipping");
                continue;
            }
            let walker = WalkDir::new(root)
                .follow_links(true)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| {
                    !is_hidden(e)
                        && !(source == Source::Memory
                            && e.depth() > 0
                            && e.file_type().is_dir()
                            && sessions_dir
                                .as_deref()
                                .is_some_and(|s| canonical(e.path()) == s))
                });
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(root = %root.display(), error = %e, "failed to walk source folder");
                        continue;
                    },
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if !self
                    .config
                    .extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
                {
                    continue;
                }
                let Some(rel_path) = relative_path(root, path) else {
                    continue;
                };
                // Unreadable metadata is left for the read step to report.
                let mtime = entry.metadata().map(|m| modified_ms(&m)).unwrap_or(0);
                files.push(ScannedFile {
                    source,
                    rel_path,
                    abs_path: path.to_path_buf(),
                    mtime,
                });
            }
        }
        files
    }

    /// Re-embed chunks that were committed without a vector.
    async fn retry_pending(
        &self,
        cache: &EmbeddingCache,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<(), MemoryError> {
        let pending = self
            .store
            .pending_embedding_chunks(PENDING_RETRY_LIMIT)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = pending.iter().map(|p| p.text.clone()).collect();
        let resolved = cache.resolve_many(&texts, cancel).await?;
        report.provider_unavailable |= resolved.provider_unavailable;
        let updates: Vec<(String, Vec<f32>)> = pending
            .into_iter()
            .zip(resolved.vectors)
            .filter_map(|(chunk, vector)| vector.map(|v| (chunk.id, v)))
            .collect();
        if !updates.is_empty() {
            self.store
                .set_chunk_embeddings(cache.model(), &updates)
                .await?;
        }
        info!(
            retried = updates.len(),
            still_pending = resolved.failures.len(),
            "pending embeddings retried"
        );
        report.pending_retried = updates.len();
        Ok(())
    }

    /// Run one sync pass.
    pub async fn run(
        &self,
        opts: SyncOptions,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, MemoryError> {
        let started = Instant::now();
        let mut report = SyncReport {
            full: opts.force || self.needs_full_reindex().await?,
            ..Default::default()
        };

        let result = self.run_inner(&mut report, progress, cancel).await;
        if let Err(e) = &result {
            // Whatever was committed stays; flag the index for the next run.
            warn!(error = %e, "memory sync aborted");
            self.store.set_meta(meta_keys::DIRTY, "1").await?;
        }
        result?;

        // Chunks still waiting for a vector keep the index dirty.
        let pending = match self.cache {
            Some(_) => self.store.count_pending_embeddings().await?,
            None => 0,
        };
        let dirty = report.files_failed > 0 || pending > 0;

        let now = now_ms().to_string();
        self.store.set_meta(meta_keys::LAST_SYNC_AT, &now).await?;
        self.store
            .set_meta(meta_keys::DIRTY, if dirty { "1" } else { "0" })
            .await?;
        self.store
            .set_meta(meta_keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())
            .await?;
        self.store
            .set_meta(meta_keys::INDEX_FINGERPRINT, &self.fingerprint())
            .await?;
        if report.full {
            self.store
                .set_meta(meta_keys::LAST_FULL_SYNC_AT, &now)
                .await?;
        }

        #[cfg(feature = "metrics")]
        {
            histogram!("memdex_memory_sync_duration_seconds").record(started.elapsed().as_secs_f64());
            counter!("memdex_memory_files_indexed_total").increment(report.files_indexed as u64);
            counter!("memdex_memory_files_failed_total").increment(report.files_failed as u64);
        }

        info!(
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            removed = report.files_removed,
            failed = report.files_failed,
            chunks = report.chunks_created,
            full = report.full,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "memory sync complete"
        );
        emit(progress, SyncProgress::Finished(report.clone()));
        Ok(report)
    }

    async fn run_inner(
        &self,
        report: &mut SyncReport,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<(), MemoryError> {
        if !report.full
            && let Some(cache) = self.cache.as_deref()
        {
            self.retry_pending(cache, report, cancel).await?;
        }

        let scanned = self.scan();
        emit(progress, SyncProgress::Started {
            files: scanned.len(),
            full: report.full,
        });

        let chunk_opts = self.chunker_options();
        let mut seen: HashSet<(Source, String)> = HashSet::with_capacity(scanned.len());
        let mut wave: Vec<PreparedFile> = Vec::new();
        let mut wave_chunks = 0usize;

        for file in scanned {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            seen.insert((file.source, file.rel_path.clone()));

            let existing = self.store.get_file(file.source, &file.rel_path).await?;
            let bytes = match tokio::fs::read(&file.abs_path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %file.rel_path, error = %e, "failed to read memory file");
                    report.files_failed += 1;
                    emit(progress, SyncProgress::FileFailed {
                        source: file.source,
                        path: file.rel_path,
                        error: e.to_string(),
                    });
                    continue;
                },
            };
            let row = FileRow {
                path: file.rel_path.clone(),
                source: file.source,
                hash: sha256_hex(&bytes),
                mtime: file.mtime,
                size: bytes.len() as i64,
                indexed_at: now_ms(),
            };

            if !report.full
                && let Some(existing) = &existing
                && existing.hash == row.hash
            {
                if existing.mtime != row.mtime || existing.size != row.size {
                    self.store.touch_file(&row).await?;
                }
                report.files_unchanged += 1;
                emit(progress, SyncProgress::FileSkipped {
                    source: file.source,
                    path: file.rel_path,
                });
                continue;
            }

            let chunks = chunk_text(&String::from_utf8_lossy(&bytes), &chunk_opts);
            wave_chunks += chunks.len();
            wave.push(PreparedFile { row, chunks });

            if wave_chunks >= self.config.batch_size {
                self.commit_wave(std::mem::take(&mut wave), report, progress, cancel)
                    .await?;
                wave_chunks = 0;
            }
        }
        if !wave.is_empty() {
            self.commit_wave(wave, report, progress, cancel).await?;
        }

        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        for indexed in self.store.list_files(None).await? {
            if seen.contains(&(indexed.source, indexed.path.clone())) {
                continue;
            }
            self.store.delete_file(indexed.source, &indexed.path).await?;
            info!(path = %indexed.path, source = %indexed.source, "removed deleted file from memory");
            report.files_removed += 1;
            emit(progress, SyncProgress::FileRemoved {
                source: indexed.source,
                path: indexed.path,
            });
        }

        if self.cache.is_some() && self.config.cache_enabled {
            let evicted = self
                .store
                .evict_embedding_cache(self.config.cache_max_entries)
                .await?;
            if evicted > 0 {
                debug!(evicted, "embedding cache trimmed");
            }
        }
        Ok(())
    }

    /// Embed every chunk in the wave with shared batches, then commit each
    /// file on its own.
    async fn commit_wave(
        &self,
        wave: Vec<PreparedFile>,
        report: &mut SyncReport,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<(), MemoryError> {
        let total: usize = wave.iter().map(|f| f.chunks.len()).sum();
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; total];
        let mut failed_slots: HashSet<usize> = HashSet::new();

        if let Some(cache) = self.cache.as_deref()
            && total > 0
        {
            let texts: Vec<String> = wave
                .iter()
                .flat_map(|f| f.chunks.iter().map(|c| c.text.clone()))
                .collect();
            let resolved = if report.provider_unavailable {
                cache.resolve_cached(&texts).await?
            } else {
                cache.resolve_many(&texts, cancel).await?
            };
            report.provider_unavailable |= resolved.provider_unavailable;
            report.cache_hits += resolved.hits;
            report.cache_misses += resolved.misses;
            failed_slots.extend(resolved.failures.iter().map(|(i, _)| *i));
            vectors = resolved.vectors;
        }

        let model = self.model().to_string();
        let mut offset = 0usize;
        for PreparedFile { row, chunks } in wave {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            let updated_at = now_ms();
            let slots = offset..offset + chunks.len();
            offset += chunks.len();
            let embed_failures = slots.clone().filter(|i| failed_slots.contains(i)).count();

            let rows: Vec<ChunkRow> = chunks
                .into_iter()
                .zip(slots)
                .enumerate()
                .map(|(idx, (chunk, slot))| ChunkRow {
                    id: ChunkRow::chunk_id(row.source, &row.path, idx),
                    path: row.path.clone(),
                    source: row.source,
                    start_line: chunk.start_line as i64,
                    end_line: chunk.end_line as i64,
                    hash: chunk.hash,
                    model: model.clone(),
                    text: chunk.text,
                    embedding: vectors[slot].take(),
                    updated_at,
                })
                .collect();

            self.store.replace_file(&row, &rows).await?;
            report.chunks_created += rows.len();

            if embed_failures > 0 {
                warn!(
                    path = %row.path,
                    failed_chunks = embed_failures,
                    "file indexed without some embeddings, will retry next sync"
                );
                report.files_failed += 1;
                emit(progress, SyncProgress::FileFailed {
                    source: row.source,
                    path: row.path,
                    error: format!("{embed_failures} chunk(s) failed to embed"),
                });
            } else {
                info!(path = %row.path, source = %row.source, chunks = rows.len(), "synced file");
                report.files_indexed += 1;
                emit(progress, SyncProgress::FileIndexed {
                    source: row.source,
                    path: row.path,
                    chunks: rows.len(),
                });
            }
        }
        Ok(())
    }
}
