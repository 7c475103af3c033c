//! Row types persisted by the index store, plus migrations.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Bumped whenever the on-disk layout or chunk semantics change. A mismatch
/// with the stored `meta.schema_version` forces a full reindex.
pub const SCHEMA_VERSION: i64 = 1;

/// Well-known `meta` keys.
pub mod meta_keys {
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const INDEX_FINGERPRINT: &str = "index_fingerprint";
    pub const LAST_SYNC_AT: &str = "last_sync_at";
    pub const LAST_FULL_SYNC_AT: &str = "last_full_sync_at";
    pub const DIRTY: &str = "dirty";
}

/// Which source folder a file was discovered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Memory,
    Sessions,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sessions => "sessions",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "sessions" => Ok(Self::Sessions),
            other => anyhow::bail!("unknown memory source: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    /// Path relative to its source folder, `/`-separated.
    pub path: String,
    pub source: Source,
    /// SHA-256 hex of the file bytes.
    pub hash: String,
    /// Modification time in milliseconds since the epoch.
    pub mtime: i64,
    pub size: i64,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: String,
    pub path: String,
    pub source: Source,
    pub start_line: i64,
    pub end_line: i64,
    pub hash: String,
    /// Embedding model the vector was computed with; empty when keyword-only.
    pub model: String,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub updated_at: i64,
}

impl ChunkRow {
    pub fn chunk_id(source: Source, path: &str, index: usize) -> String {
        format!("{source}:{path}:{index}")
    }
}

/// Run the embedded migrations against `pool`.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a little-endian f32 blob. `None` when the length is not a multiple of 4.
pub fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn blob_roundtrip_preserves_bits() {
        let v = vec![0.25_f32, -1.5, f32::MIN_POSITIVE];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)).unwrap(), v);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(blob_to_vec(&[0, 0, 128]).is_none());
    }

    #[test]
    fn source_parses_and_displays() {
        assert_eq!("sessions".parse::<Source>().unwrap(), Source::Sessions);
        assert_eq!(Source::Memory.to_string(), "memory");
        assert!("daily".parse::<Source>().is_err());
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = sqlx::SqlitePool::connect(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for t in ["chunks", "embedding_cache", "files", "meta"] {
            assert!(tables.iter().any(|n| n == t), "missing table {t}");
        }
        assert!(tables.iter().any(|n| n == "chunks_fts"));
    }
}
