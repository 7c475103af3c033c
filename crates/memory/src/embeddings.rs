/// Embedding provider abstraction and backend selection.
use async_trait::async_trait;

use crate::{
    config::EmbeddingsConfig,
    embeddings_openai::{
        OPENAI_BASE_URL, OPENAI_DEFAULT_DIMS, OPENAI_DEFAULT_MODEL, OpenAiEmbeddingProvider,
    },
};

const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const OLLAMA_DEFAULT_MODEL: &str = "nomic-embed-text";
const OLLAMA_DEFAULT_DIMS: usize = 768;

/// The backend could not be reached or is shedding load. Every other input
/// would fail the same way, so callers stop instead of retrying item by item.
#[derive(Debug, thiserror::Error)]
#[error("embedding provider unavailable: {0}")]
pub struct ProviderUnavailable(pub String);

impl ProviderUnavailable {
    pub fn is(err: &anyhow::Error) -> bool {
        err.downcast_ref::<Self>().is_some()
    }
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embed several texts in one request. The result has one vector per
    /// input, in order. An `Err` fails the whole request; callers that need
    /// per-item isolation fall back to [`EmbeddingProvider::embed`].
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Stable identifier of the backend instance, used as the cache key prefix.
    fn provider_key(&self) -> &str {
        self.model_name()
    }
}

/// Build the provider selected by `config`. The OpenAI backend falls back to
/// the `OPENAI_API_KEY` environment variable when no key is configured.
pub fn provider_from_config(
    config: &EmbeddingsConfig,
) -> anyhow::Result<Box<dyn EmbeddingProvider>> {
    let provider = match config {
        EmbeddingsConfig::OpenAi {
            api_key,
            model,
            dimensions,
        } => {
            let key = api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .ok_or_else(|| anyhow::anyhow!("OpenAI embeddings need an api_key"))?;
            OpenAiEmbeddingProvider::new(
                OPENAI_BASE_URL,
                Some(key),
                model.as_deref().unwrap_or(OPENAI_DEFAULT_MODEL),
                dimensions.unwrap_or(OPENAI_DEFAULT_DIMS),
            )?
        },
        EmbeddingsConfig::Ollama {
            base_url,
            model,
            dimensions,
        } => OpenAiEmbeddingProvider::new(
            base_url.as_deref().unwrap_or(OLLAMA_BASE_URL),
            None,
            model.as_deref().unwrap_or(OLLAMA_DEFAULT_MODEL),
            dimensions.unwrap_or(OLLAMA_DEFAULT_DIMS),
        )?,
        EmbeddingsConfig::Custom {
            base_url,
            api_key,
            model,
            dimensions,
        } => OpenAiEmbeddingProvider::new(base_url, api_key.clone(), model.as_str(), *dimensions)?,
    };
    Ok(Box::new(provider))
}

/// Cosine similarity of two vectors. Zero when lengths differ or either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn ollama_backend_defaults() {
        let p = provider_from_config(&EmbeddingsConfig::Ollama {
            base_url: None,
            model: None,
            dimensions: None,
        })
        .unwrap();
        assert_eq!(p.model_name(), "nomic-embed-text");
        assert_eq!(p.dimensions(), 768);
    }

    #[test]
    fn custom_backend_keys_differ_by_base_url() {
        let a = provider_from_config(&EmbeddingsConfig::Custom {
            base_url: "http://a.local/v1".into(),
            api_key: None,
            model: "m".into(),
            dimensions: 8,
        })
        .unwrap();
        let b = provider_from_config(&EmbeddingsConfig::Custom {
            base_url: "http://b.local/v1".into(),
            api_key: None,
            model: "m".into(),
            dimensions: 8,
        })
        .unwrap();
        assert_ne!(a.provider_key(), b.provider_key());
    }
}
