/// Memory manager: the facade the host application talks to. Owns the store,
/// the embedding cache and the sync engine, and serializes sync runs.
use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::sync::{Mutex, RwLock},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    cache::EmbeddingCache,
    config::MemoryConfig,
    embeddings::{EmbeddingProvider, provider_from_config},
    error::MemoryError,
    schema::{FileRow, Source, meta_keys},
    search::{self, HybridWeights, SearchOptions, SearchResult},
    store::MemoryStore,
    store_sqlite::SqliteMemoryStore,
    sync::{ProgressSender, SyncEngine, SyncOptions, SyncReport},
};

#[cfg(feature = "file-watcher")]
use crate::{debounce::SyncDebouncer, watcher::MemoryWatcher};

pub struct MemoryManager {
    config: MemoryConfig,
    store: Arc<dyn MemoryStore>,
    cache: Option<Arc<EmbeddingCache>>,
    engine: SyncEngine,
    sync_lock: Mutex<()>,
    syncing: AtomicBool,
    sync_pending: AtomicBool,
    last_report: RwLock<Option<SyncReport>>,
    shutdown: CancellationToken,
}

/// Status info about the memory system.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub memory_files: usize,
    pub session_files: usize,
    pub total_chunks: usize,
    pub pending_embeddings: usize,
    pub cache_entries: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub dirty: bool,
    pub syncing: bool,
    pub sync_pending: bool,
    /// `None` in keyword-only mode.
    pub embedding_model: Option<String>,
    pub db_size_bytes: Option<u64>,
    pub last_report: Option<SyncReport>,
}

/// A saved conversation transcript known to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEntry {
    pub path: String,
    pub size: i64,
    pub modified_at: Option<DateTime<Utc>>,
    pub indexed_at: Option<DateTime<Utc>>,
}

impl From<FileRow> for SessionEntry {
    fn from(row: FileRow) -> Self {
        Self {
            path: row.path,
            size: row.size,
            modified_at: DateTime::from_timestamp_millis(row.mtime),
            indexed_at: DateTime::from_timestamp_millis(row.indexed_at),
        }
    }
}

/// Clears a flag when dropped, so an aborted sync future does not leave it set.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn parse_ms(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

impl MemoryManager {
    /// Build a manager over an existing store. `embedder = None` runs in
    /// keyword-only mode.
    pub fn new(
        config: MemoryConfig,
        store: Arc<dyn MemoryStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, MemoryError> {
        config.validate()?;
        let cache = embedder.map(|provider| {
            Arc::new(EmbeddingCache::new(
                Arc::clone(&store),
                provider,
                config.batch_size,
                config.cache_enabled,
            ))
        });
        let engine = SyncEngine::new(config.clone(), Arc::clone(&store), cache.clone());
        Ok(Self {
            config,
            store,
            cache,
            engine,
            sync_lock: Mutex::new(()),
            syncing: AtomicBool::new(false),
            sync_pending: AtomicBool::new(false),
            last_report: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Create a manager without an embedding provider.
    pub fn keyword_only(
        config: MemoryConfig,
        store: Arc<dyn MemoryStore>,
    ) -> Result<Self, MemoryError> {
        Self::new(config, store, None)
    }

    /// Open the SQLite index at `config.db_path` and the configured provider.
    pub async fn open(config: MemoryConfig) -> Result<Arc<Self>, MemoryError> {
        config.validate()?;
        if config.db_path != ":memory:"
            && let Some(parent) = Path::new(&config.db_path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let store: Arc<dyn MemoryStore> = Arc::new(SqliteMemoryStore::open(&config.db_path).await?);
        let embedder: Option<Arc<dyn EmbeddingProvider>> = match &config.embeddings {
            Some(backend) => {
                let provider = provider_from_config(backend)
                    .map_err(|e| MemoryError::Embedding(e.to_string()))?;
                info!(model = provider.model_name(), "memory embeddings enabled");
                Some(Arc::from(provider))
            },
            None => {
                info!("no embedding backend configured, memory search is keyword-only");
                None
            },
        };
        Ok(Arc::new(Self::new(config, store, embedder)?))
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Run a sync, waiting for any sync already in flight to finish first.
    pub async fn sync(
        &self,
        options: SyncOptions,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, MemoryError> {
        let _lock = self.sync_lock.lock().await;
        self.sync_locked(options, progress, cancel).await
    }

    async fn sync_locked(
        &self,
        options: SyncOptions,
        progress: Option<&ProgressSender>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, MemoryError> {
        let _syncing = FlagGuard::raise(&self.syncing);
        let report = self.engine.run(options, progress, cancel).await?;
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    /// Queue an incremental sync in the background. Requests made while one
    /// is already queued collapse into it.
    pub fn request_sync(self: &Arc<Self>) {
        if self.sync_pending.swap(true, Ordering::SeqCst) {
            debug!("memory sync already queued");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _lock = this.sync_lock.lock().await;
            this.sync_pending.store(false, Ordering::SeqCst);
            let cancel = this.shutdown.child_token();
            if let Err(e) = this
                .sync_locked(SyncOptions::default(), None, &cancel)
                .await
            {
                warn!(error = %e, "background memory sync failed");
            }
        });
    }

    /// Search options seeded from the configured defaults.
    pub fn default_search_options(&self) -> SearchOptions {
        SearchOptions {
            max_results: self.config.max_results,
            min_score: self.config.min_score,
            include_sessions: self.config.sessions_enabled,
            include_memory: true,
        }
    }

    /// Hybrid search. Never waits for a running sync.
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, MemoryError> {
        search::hybrid_search(
            self.store.as_ref(),
            self.cache.as_deref(),
            query,
            options,
            HybridWeights {
                vector: self.config.vector_weight,
                text: self.config.text_weight,
            },
            cancel,
        )
        .await
    }

    /// Indexed session transcripts, most recently modified first.
    pub async fn list_sessions(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<SessionEntry>, MemoryError> {
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        let mut rows = self.store.list_files(Some(Source::Sessions)).await?;
        rows.sort_by(|a, b| b.mtime.cmp(&a.mtime).then_with(|| a.path.cmp(&b.path)));
        Ok(rows.into_iter().map(SessionEntry::from).collect())
    }

    /// Get status information about the memory system.
    pub async fn status(&self) -> Result<MemoryStatus, MemoryError> {
        let memory_files = self.store.list_files(Some(Source::Memory)).await?.len();
        let session_files = self.store.list_files(Some(Source::Sessions)).await?.len();
        let db_size_bytes = if self.config.db_path == ":memory:" {
            None
        } else {
            tokio::fs::metadata(&self.config.db_path)
                .await
                .ok()
                .map(|m| m.len())
        };

        Ok(MemoryStatus {
            memory_files,
            session_files,
            total_chunks: self.store.count_chunks().await?,
            pending_embeddings: match self.cache {
                Some(_) => self.store.count_pending_embeddings().await?,
                None => 0,
            },
            cache_entries: self.store.count_cached_embeddings().await?,
            last_sync_at: parse_ms(self.store.get_meta(meta_keys::LAST_SYNC_AT).await?),
            last_full_sync_at: parse_ms(self.store.get_meta(meta_keys::LAST_FULL_SYNC_AT).await?),
            dirty: self.store.get_meta(meta_keys::DIRTY).await?.as_deref() == Some("1"),
            syncing: self.is_syncing(),
            sync_pending: self.sync_pending.load(Ordering::SeqCst),
            embedding_model: self.cache.as_ref().map(|c| c.model().to_string()),
            db_size_bytes,
            last_report: self.last_report.read().await.clone(),
        })
    }

    /// Watch the source folders and sync after each quiet window. Returns
    /// `None` when watching is disabled. Drop the watcher to stop.
    #[cfg(feature = "file-watcher")]
    pub fn start_watching(self: &Arc<Self>) -> Result<Option<MemoryWatcher>, MemoryError> {
        if !self.config.watch_enabled {
            debug!("memory file watching disabled");
            return Ok(None);
        }
        let manager = Arc::downgrade(self);
        let debouncer = SyncDebouncer::spawn(
            self.config.debounce(),
            self.shutdown.child_token(),
            move || {
                if let Some(manager) = manager.upgrade() {
                    manager.request_sync();
                }
            },
        );

        let mut roots = vec![self.config.memory_dir.clone()];
        if let Some(dir) = self.config.active_sessions_dir()
            && !dir.starts_with(&self.config.memory_dir)
        {
            roots.push(dir.to_path_buf());
        }
        MemoryWatcher::start(&roots, self.config.extensions.clone(), debouncer).map(Some)
    }

    /// Stop background work: pending debounced syncs and queued runs observe
    /// cancellation.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
