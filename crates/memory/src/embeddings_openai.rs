//! Embeddings over the OpenAI-compatible `/embeddings` endpoint. Serves the
//! OpenAI, Ollama and custom backends alike.
use std::time::Duration;

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tracing::debug,
};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use crate::embeddings::{EmbeddingProvider, ProviderUnavailable};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const OPENAI_DEFAULT_MODEL: &str = "text-embedding-3-small";
pub const OPENAI_DEFAULT_DIMS: usize = 1536;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    /// Empty for local servers that take no credentials.
    api_key: Secret<String>,
    endpoint: String,
    model: String,
    dims: usize,
    provider_key: String,
}

/// Resolve the request URL for a configured base: bare hosts get `/v1`,
/// versioned bases (`.../v1`, `.../v2`) and explicit endpoints are kept.
fn resolve_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/embeddings") {
        return base.to_string();
    }
    let versioned = base
        .rsplit('/')
        .next()
        .and_then(|segment| segment.strip_prefix('v'))
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()));
    if versioned {
        format!("{base}/embeddings")
    } else {
        format!("{base}/v1/embeddings")
    }
}

/// Short stable key for the embedding cache: same endpoint and model, same vectors.
fn provider_key(endpoint: &str, model: &str) -> String {
    let digest = Sha256::new()
        .chain_update(b"openai-compatible\0")
        .chain_update(endpoint.as_bytes())
        .chain_update(b"\0")
        .chain_update(model.as_bytes())
        .finalize();
    format!("{digest:x}")[..16].to_string()
}

impl OpenAiEmbeddingProvider {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        dims: usize,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let endpoint = resolve_endpoint(base_url);
        let model = model.into();
        let provider_key = provider_key(&endpoint, &model);
        debug!(endpoint, model, dims, "embedding endpoint configured");
        Ok(Self {
            client,
            api_key: Secret::new(api_key.unwrap_or_default()),
            endpoint,
            model,
            dims,
            provider_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Unreachable hosts, timeouts, rate limits and 5xx answers mean the backend
/// is down; anything else is blamed on the request.
fn classify(err: reqwest::Error) -> anyhow::Error {
    let unavailable = err.is_connect()
        || err.is_timeout()
        || err.status().is_some_and(|status| {
            status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        });
    if unavailable {
        ProviderUnavailable(err.to_string()).into()
    } else {
        err.into()
    }
}

/// Order vectors by their `index` field and check one came back per input.
fn into_ordered(mut data: Vec<EmbeddingData>, expected: usize) -> anyhow::Result<Vec<Vec<f32>>> {
    if data.len() != expected {
        anyhow::bail!(
            "embedding response has {} vectors for {} inputs",
            data.len(),
            expected
        );
    }
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        #[cfg(feature = "metrics")]
        counter!("memdex_memory_embeddings_requested_total").increment(texts.len() as u64);

        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        let key = self.api_key.expose_secret();
        if !key.is_empty() {
            request = request.bearer_auth(key);
        }
        let response = match request.send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response.json::<EmbeddingResponse>().await.map_err(anyhow::Error::from),
            Err(e) => Err(classify(e)),
        };

        #[cfg(feature = "metrics")]
        histogram!("memdex_memory_embedding_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        into_ordered(response?.data, texts.len())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }
}
