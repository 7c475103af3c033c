//! Error type returned by the public memory API.
//!
//! Internals mostly propagate `anyhow::Error`; at the manager boundary those
//! are folded into [`MemoryError`] so callers can tell misuse apart from
//! storage or provider trouble.

/// Errors surfaced by [`crate::manager::MemoryManager`].
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The caller passed options that can never succeed (rejected before I/O).
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The configuration failed validation.
    #[error("invalid memory config: {0}")]
    InvalidConfig(String),

    /// The operation observed its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    #[error("index store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("index migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The embedding provider failed for a request that could not degrade.
    #[error("embedding provider error: {0}")]
    Embedding(String),

    #[error("file watcher error: {0}")]
    Watch(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    pub fn invalid_options(msg: impl Into<String>) -> Self {
        Self::InvalidOptions(msg.into())
    }

    /// Whether this error came from the caller rather than the environment.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::InvalidOptions(_) | Self::InvalidConfig(_))
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_classification() {
        assert!(MemoryError::invalid_options("max_results must be > 0").is_misuse());
        assert!(MemoryError::InvalidConfig("weights".into()).is_misuse());
        assert!(!MemoryError::Cancelled.is_misuse());
    }

    #[test]
    fn display_includes_reason() {
        let err = MemoryError::invalid_options("min_score out of range");
        assert_eq!(err.to_string(), "invalid options: min_score out of range");
    }
}
