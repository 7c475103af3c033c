//! Content-addressed embedding cache in front of an [`EmbeddingProvider`].
//!
//! Keys are `(provider_key, model, sha256(text))`. A hit never reaches the
//! provider; misses are de-duplicated, sent in batches of `batch_size`, and
//! persisted before the call returns. When a batch request fails, its items
//! are retried one by one so a single bad input only fails itself, unless the
//! provider itself is unreachable, in which case the rest are failed untried.

use std::{collections::HashMap, sync::Arc};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::{
    chunker::sha256_hex,
    embeddings::{EmbeddingProvider, ProviderUnavailable},
    error::MemoryError,
    schema::blob_to_vec,
    store::MemoryStore,
};

/// Outcome of [`EmbeddingCache::resolve_many`].
#[derive(Debug, Default)]
pub struct ResolvedBatch {
    /// One slot per input; `None` where embedding failed.
    pub vectors: Vec<Option<Vec<f32>>>,
    /// `(input index, error message)` for every failed input.
    pub failures: Vec<(usize, String)>,
    pub hits: usize,
    pub misses: usize,
    /// The provider stopped answering; later misses were not attempted.
    pub provider_unavailable: bool,
}

impl ResolvedBatch {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Miss hash -> (first input slot, every slot with that text).
type MissSlots = HashMap<String, (usize, Vec<usize>)>;

pub struct EmbeddingCache {
    store: Arc<dyn MemoryStore>,
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    enabled: bool,
}

impl EmbeddingCache {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
        enabled: bool,
    ) -> Self {
        Self {
            store,
            provider,
            batch_size: batch_size.max(1),
            enabled,
        }
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn model(&self) -> &str {
        self.provider.model_name()
    }

    /// Resolve a single text.
    pub async fn resolve(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let batch = self
            .resolve_many(&[text.to_string()], &CancellationToken::new())
            .await?;
        if let Some((_, err)) = batch.failures.into_iter().next() {
            anyhow::bail!(err);
        }
        batch
            .vectors
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| anyhow::anyhow!("embedding missing from resolved batch"))
    }

    /// Look up a cached vector, evicting entries that fail to decode.
    async fn lookup(&self, hash: &str) -> anyhow::Result<Option<Vec<f32>>> {
        if !self.enabled {
            return Ok(None);
        }
        let provider_key = self.provider.provider_key();
        let model = self.provider.model_name();
        let Some(blob) = self
            .store
            .get_cached_embedding(provider_key, model, hash)
            .await?
        else {
            return Ok(None);
        };
        match blob_to_vec(&blob) {
            Some(v) if !v.is_empty() && self.dims_ok(&v) => Ok(Some(v)),
            _ => {
                warn!(hash, model, "dropping corrupt embedding cache entry");
                self.store
                    .delete_cached_embedding(provider_key, model, hash)
                    .await?;
                Ok(None)
            },
        }
    }

    fn dims_ok(&self, v: &[f32]) -> bool {
        let dims = self.provider.dimensions();
        dims == 0 || v.len() == dims
    }

    /// Split inputs into cache hits, filled in directly, and distinct misses
    /// in first-seen order, each remembering every input slot it fills.
    async fn partition(
        &self,
        texts: &[String],
        out: &mut ResolvedBatch,
    ) -> Result<(Vec<String>, MissSlots), MemoryError> {
        let mut miss_order: Vec<String> = Vec::new();
        let mut miss_slots = MissSlots::new();

        for (i, text) in texts.iter().enumerate() {
            let hash = sha256_hex(text);
            if let Some((_, slots)) = miss_slots.get_mut(&hash) {
                slots.push(i);
                continue;
            }
            match self.lookup(&hash).await? {
                Some(v) => {
                    out.vectors[i] = Some(v);
                    out.hits += 1;
                },
                None => {
                    miss_slots.insert(hash.clone(), (i, vec![i]));
                    miss_order.push(hash);
                },
            }
        }
        out.misses = miss_order.len();

        #[cfg(feature = "metrics")]
        {
            counter!("memdex_memory_embedding_cache_hits_total").increment(out.hits as u64);
            counter!("memdex_memory_embedding_cache_misses_total").increment(out.misses as u64);
        }
        Ok((miss_order, miss_slots))
    }

    /// Serve cached vectors only and fail every miss without calling the
    /// provider. For callers that already saw the provider go down.
    pub async fn resolve_cached(&self, texts: &[String]) -> Result<ResolvedBatch, MemoryError> {
        let mut out = ResolvedBatch {
            vectors: vec![None; texts.len()],
            provider_unavailable: true,
            ..Default::default()
        };
        let (miss_order, miss_slots) = self.partition(texts, &mut out).await?;
        for hash in &miss_order {
            for &slot in &miss_slots[hash].1 {
                out.failures.push((slot, "embedding provider unavailable".into()));
            }
        }
        out.failures.sort_by_key(|(i, _)| *i);
        Ok(out)
    }

    /// Resolve many texts. Store errors abort; provider errors are reported
    /// per input in [`ResolvedBatch::failures`]. Cancellation is checked
    /// between provider requests.
    ///
    /// Once the provider reports [`ProviderUnavailable`], no further requests
    /// are made: the remaining misses fail with that reason and
    /// [`ResolvedBatch::provider_unavailable`] is set.
    pub async fn resolve_many(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<ResolvedBatch, MemoryError> {
        let mut out = ResolvedBatch {
            vectors: vec![None; texts.len()],
            ..Default::default()
        };
        let (miss_order, miss_slots) = self.partition(texts, &mut out).await?;
        let mut down: Option<String> = None;

        for group in miss_order.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            let group_texts: Vec<String> = group
                .iter()
                .map(|h| texts[miss_slots[h].0].clone())
                .collect();

            let results: Vec<anyhow::Result<Vec<f32>>> = if let Some(reason) = &down {
                group.iter().map(|_| Err(unavailable(reason))).collect()
            } else {
                match self.provider.embed_batch(&group_texts).await {
                    Ok(vectors) if vectors.len() == group_texts.len() => {
                        vectors.into_iter().map(Ok).collect()
                    },
                    Err(e) if ProviderUnavailable::is(&e) => {
                        warn!(error = %e, "embedding provider unavailable, skipping remaining inputs");
                        let reason = e.to_string();
                        let results: Vec<anyhow::Result<Vec<f32>>> =
                            group.iter().map(|_| Err(unavailable(&reason))).collect();
                        down = Some(reason);
                        results
                    },
                    outcome => {
                        let reason = match outcome {
                            Ok(v) => format!("{} vectors for {} inputs", v.len(), group_texts.len()),
                            Err(e) => e.to_string(),
                        };
                        debug!(
                            batch = group_texts.len(),
                            error = %reason,
                            "embedding batch failed, retrying items individually"
                        );
                        let mut singles = Vec::with_capacity(group_texts.len());
                        for text in &group_texts {
                            if cancel.is_cancelled() {
                                return Err(MemoryError::Cancelled);
                            }
                            if let Some(reason) = &down {
                                singles.push(Err(unavailable(reason)));
                                continue;
                            }
                            let result = self.provider.embed(text).await;
                            if let Err(e) = &result
                                && ProviderUnavailable::is(e)
                            {
                                warn!(error = %e, "embedding provider unavailable, skipping remaining inputs");
                                down = Some(e.to_string());
                            }
                            singles.push(result);
                        }
                        singles
                    },
                }
            };

            for (hash, result) in group.iter().zip(results) {
                let slots = &miss_slots[hash].1;
                match result {
                    Ok(v) if !v.is_empty() => {
                        if self.enabled {
                            self.store
                                .put_cached_embedding(
                                    self.provider.provider_key(),
                                    self.provider.model_name(),
                                    hash,
                                    &v,
                                )
                                .await?;
                        }
                        for &slot in slots {
                            out.vectors[slot] = Some(v.clone());
                        }
                    },
                    Ok(_) => {
                        for &slot in slots {
                            out.failures.push((slot, "provider returned an empty vector".into()));
                        }
                    },
                    Err(e) => {
                        if !ProviderUnavailable::is(&e) {
                            warn!(error = %e, "embedding failed");
                        }
                        for &slot in slots {
                            out.failures.push((slot, e.to_string()));
                        }
                    },
                }
            }
        }

        out.provider_unavailable = down.is_some();
        out.failures.sort_by_key(|(i, _)| *i);
        Ok(out)
    }
}

fn unavailable(reason: &str) -> anyhow::Error {
    ProviderUnavailable(reason.to_string()).into()
}
