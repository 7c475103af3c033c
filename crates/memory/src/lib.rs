//! Local semantic memory: markdown and transcript files → chunked → embedded
//! through a persistent cache → hybrid vector + FTS5 search in SQLite.

pub mod cache;
pub mod chunker;
pub mod config;
pub mod debounce;
pub mod embeddings;
pub mod embeddings_openai;
pub mod error;
pub mod manager;
pub mod schema;
pub mod search;
pub mod store;
pub mod store_sqlite;
pub mod sync;
#[cfg(feature = "file-watcher")]
pub mod watcher;

pub use {
    config::MemoryConfig,
    error::{MemoryError, Result},
    manager::{MemoryManager, MemoryStatus, SessionEntry},
    search::{SearchOptions, SearchResult},
    sync::{SyncOptions, SyncProgress, SyncReport},
};
