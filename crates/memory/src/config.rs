use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Configuration for the memory subsystem.
///
/// Every field has a default, so an empty `[memory]` table is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Path to the SQLite database file (or `:memory:` for tests).
    pub db_path: String,
    /// Folder of free-form notes (source `memory`).
    pub memory_dir: PathBuf,
    /// Folder of saved conversation transcripts (source `sessions`).
    pub sessions_dir: Option<PathBuf>,
    /// Index the sessions folder at all.
    pub sessions_enabled: bool,
    /// File extensions (without the dot) picked up by the scanner.
    pub extensions: Vec<String>,
    /// Maximum chunk size in tokens.
    pub chunk_tokens: usize,
    /// Overlap between consecutive chunks in tokens.
    pub chunk_overlap: usize,
    /// Align chunk boundaries to headings, paragraphs and code fences.
    pub markdown_aware: bool,
    /// Default number of search results.
    pub max_results: usize,
    /// Default minimum blended score for a result to be returned.
    pub min_score: f32,
    /// Weight for vector similarity in hybrid search (0.0–1.0).
    pub vector_weight: f32,
    /// Weight for lexical (FTS) relevance in hybrid search (0.0–1.0).
    pub text_weight: f32,
    /// Quiet period before a watcher-triggered sync runs.
    pub debounce_ms: u64,
    /// Start the file watcher alongside the manager.
    pub watch_enabled: bool,
    /// Maximum texts per embedding provider request.
    pub batch_size: usize,
    /// Persist embeddings keyed by (provider, model, text hash).
    pub cache_enabled: bool,
    /// Cache rows kept after eviction.
    pub cache_max_entries: usize,
    /// Embedding backend. `None` runs keyword-only.
    pub embeddings: Option<EmbeddingsConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: "memory.db".into(),
            memory_dir: PathBuf::from("memory"),
            sessions_dir: Some(PathBuf::from("memory/sessions")),
            sessions_enabled: true,
            extensions: vec!["md".into(), "markdown".into(), "txt".into()],
            chunk_tokens: 400,
            chunk_overlap: 80,
            markdown_aware: true,
            max_results: 6,
            min_score: 0.35,
            vector_weight: 0.7,
            text_weight: 0.3,
            debounce_ms: 1000,
            watch_enabled: true,
            batch_size: 64,
            cache_enabled: true,
            cache_max_entries: 50_000,
            embeddings: None,
        }
    }
}

/// Closed set of embedding backends. All of them speak the OpenAI-compatible
/// `/v1/embeddings` protocol; the variant only picks defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum EmbeddingsConfig {
    OpenAi {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        dimensions: Option<usize>,
    },
    Ollama {
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        dimensions: Option<usize>,
    },
    Custom {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
        model: String,
        dimensions: usize,
    },
}

impl MemoryConfig {
    /// Parse a TOML document. Accepts either a bare table or one nested under `[memory]`.
    pub fn from_toml_str(raw: &str) -> Result<Self, MemoryError> {
        #[derive(Deserialize)]
        struct Wrapped {
            memory: MemoryConfig,
        }

        let to_config_err = |e: toml::de::Error| MemoryError::InvalidConfig(e.to_string());

        let table: toml::Table = toml::from_str(raw).map_err(to_config_err)?;
        let config = if table.contains_key("memory") {
            toml::from_str::<Wrapped>(raw)
                .map(|w| w.memory)
                .map_err(to_config_err)?
        } else {
            toml::from_str::<MemoryConfig>(raw).map_err(to_config_err)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, MemoryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), MemoryError> {
        let invalid = |msg: String| Err(MemoryError::InvalidConfig(msg));

        if self.chunk_tokens == 0 {
            return invalid("chunk_tokens must be greater than zero".into());
        }
        if self.chunk_overlap >= self.chunk_tokens {
            return invalid(format!(
                "chunk_overlap ({}) must be smaller than chunk_tokens ({})",
                self.chunk_overlap, self.chunk_tokens
            ));
        }
        for (name, w) in [
            ("vector_weight", self.vector_weight),
            ("text_weight", self.text_weight),
        ] {
            if !w.is_finite() || !(0.0..=1.0).contains(&w) {
                return invalid(format!("{name} must be within 0.0..=1.0, got {w}"));
            }
        }
        if ((self.vector_weight + self.text_weight) - 1.0).abs() > 1e-3 {
            return invalid(format!(
                "vector_weight + text_weight must equal 1.0, got {}",
                self.vector_weight + self.text_weight
            ));
        }
        if !self.min_score.is_finite() || !(0.0..=1.0).contains(&self.min_score) {
            return invalid(format!("min_score must be within 0.0..=1.0, got {}", self.min_score));
        }
        if self.max_results == 0 {
            return invalid("max_results must be greater than zero".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero".into());
        }
        if self.extensions.is_empty() {
            return invalid("at least one file extension is required".into());
        }
        Ok(())
    }

    /// Sessions folder, if sessions indexing is on.
    pub fn active_sessions_dir(&self) -> Option<&Path> {
        if self.sessions_enabled {
            self.sessions_dir.as_deref()
        } else {
            None
        }
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms)
    }
}
