// Aglogen Assistant — Text embeddings

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::RagConfig;
use crate::provider::{check_api_error, http_client, post_json, RetryPolicy};

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_DIMENSIONS: usize = 1536;
const OPENAI_BATCH_SIZE: usize = 100;
const MAX_CHARS: usize = 30_000;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_name(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// Embeddings in input order.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedding provider returned no vectors"))
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

pub struct OpenAIEmbeddingProvider {
    api_key: String,
    api_base: String,
    model: String,
    dimensions: usize,
    client: Client,
    retry: RetryPolicy,
}

impl OpenAIEmbeddingProvider {
    pub fn new(api_key: impl Into<String>, api_base: Option<&str>) -> anyhow::Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            api_base: api_base
                .filter(|b| !b.is_empty())
                .unwrap_or(crate::provider::openai::OPENAI_BASE_URL)
                .to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            client: http_client()?,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>, dimensions: usize) -> Self {
        self.model = model.into();
        self.dimensions = dimensions;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_base.trim_end_matches('/'));
        let headers = [("Authorization", format!("Bearer {}", self.api_key))];

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(OPENAI_BATCH_SIZE) {
            let body = json!({"model": self.model, "input": batch});
            let text = post_json(&self.client, &url, &headers, &body, self.retry).await?;
            let vectors = parse_embeddings(&text)?;
            if vectors.len() != batch.len() {
                anyhow::bail!(
                    "Embedding API returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                );
            }
            all.extend(vectors);
        }
        Ok(all)
    }
}

/// Decode an embeddings response, restoring input order from `index`.
fn parse_embeddings(body: &str) -> anyhow::Result<Vec<Vec<f32>>> {
    let v: Value = serde_json::from_str(body)?;
    check_api_error(&v)?;

    let data = v
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("No data in embedding response"))?;

    let mut indexed: Vec<(u64, Vec<f32>)> = data
        .iter()
        .map(|item| {
            let index = item.get("index").and_then(Value::as_u64).unwrap_or(0);
            let embedding = item
                .get("embedding")
                .and_then(Value::as_array)
                .map(|values| values.iter().filter_map(Value::as_f64).map(|x| x as f32).collect())
                .unwrap_or_default();
            (index, embedding)
        })
        .collect();
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, e)| e).collect())
}

// ---------------------------------------------------------------------------
// Offline hashing provider
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words vectors: each lowercase token is hashed into a
/// signed bucket, then the vector is L2-normalised. Texts sharing vocabulary
/// land close together, which is enough for local use and tests.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimensions: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric() && c != '.' && c != '_')
            .map(|t| t.trim_matches('.'))
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let slot = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn model_name(&self) -> &str {
        "local-hash"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Preprocesses text and delegates to the configured provider.
#[derive(Clone)]
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    /// `openai` needs an API key; `hash` runs offline.
    pub fn from_config(cfg: &RagConfig) -> anyhow::Result<Self> {
        let provider: Arc<dyn EmbeddingProvider> = match cfg.embedding_provider.as_str() {
            "openai" => {
                if cfg.api_key.is_empty() {
                    anyhow::bail!("RAG embedding provider 'openai' requires an API key");
                }
                Arc::new(
                    OpenAIEmbeddingProvider::new(cfg.api_key.clone(), Some(&cfg.api_base))?
                        .with_model(cfg.embedding_model.clone(), cfg.dimensions),
                )
            }
            "hash" => Arc::new(HashEmbeddingProvider::new(cfg.dimensions)),
            other => anyhow::bail!("Unknown embedding provider: {}", other),
        };
        tracing::info!(
            provider = %cfg.embedding_provider,
            model = %provider.model_name(),
            dimensions = provider.dimensions(),
            "Embedding service ready"
        );
        Ok(Self { provider })
    }

    pub async fn embed_text(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.provider.embed_text(&preprocess(text)).await
    }

    pub async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let processed: Vec<String> = texts.iter().map(|t| preprocess(t)).collect();
        self.provider.embed_batch(&processed).await
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }
}

impl Default for EmbeddingService {
    fn default() -> Self {
        Self::new(Arc::new(HashEmbeddingProvider::default()))
    }
}

/// Collapse whitespace and cap the length.
fn preprocess(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_CHARS {
        tracing::warn!("Text truncated to {} characters for embedding", MAX_CHARS);
        collapsed.chars().take(MAX_CHARS).collect()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::cosine_similarity;

    #[test]
    fn test_preprocess() {
        assert_eq!(preprocess("  a \n\n b\tc  "), "a b c");
        let long = "x".repeat(MAX_CHARS + 10);
        assert_eq!(preprocess(&long).len(), MAX_CHARS);
    }

    #[test]
    fn test_parse_embeddings_restores_order() {
        let body = r#"{"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ]}"#;
        let vectors = parse_embeddings(body).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

        let err = parse_embeddings(r#"{"error": {"message": "quota"}}"#).unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[tokio::test]
    async fn test_hash_provider_similarity() {
        let provider = HashEmbeddingProvider::new(128);
        let texts = vec![
            "DLA simulation fractal dimension 1.8".to_string(),
            "fractal dimension of a DLA simulation".to_string(),
            "ballistic cluster porosity".to_string(),
        ];
        let v = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(v[0].len(), 128);
        assert!(cosine_similarity(&v[0], &v[1]) > cosine_similarity(&v[0], &v[2]));
        assert_eq!(provider.embed_text(&texts[0]).await.unwrap(), v[0]);
        assert!(provider.embed_text("").await.unwrap().iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_service_empty_batch() {
        let service = EmbeddingService::default();
        assert!(service.embed_batch(&[]).await.unwrap().is_empty());
        assert_eq!(service.model_name(), "local-hash");
    }
}
