//! Embedding service: lazily loaded text-embedding model, cosine ranking,
//! and the blob codec for the `embedding` column.

use std::sync::Arc;

use async_openai::{Client, config::OpenAIConfig, types::CreateEmbeddingRequestArgs};
use async_trait::async_trait;
use proto::EmbeddingError;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Default OpenAI embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
/// Output dimension of [`DEFAULT_EMBEDDING_MODEL`].
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;

/// A loaded text-embedding model.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Length of every vector this model produces.
    fn dimension(&self) -> usize;

    /// Embeds a batch; output order matches input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Builds the embedding model on first use.
#[async_trait]
pub trait EmbeddingModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError>;
}

/// Process-wide embedding service.
///
/// The model is loaded on the first call that needs it and then shared by
/// every caller. A failed load leaves the cell empty so the next call retries.
pub struct EmbeddingService {
    loader: Arc<dyn EmbeddingModelLoader>,
    model: OnceCell<Arc<dyn EmbeddingModel>>,
}

impl EmbeddingService {
    pub fn new(loader: Arc<dyn EmbeddingModelLoader>) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
        }
    }

    /// Whether the model has been loaded yet.
    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn model(&self) -> Result<&Arc<dyn EmbeddingModel>, EmbeddingError> {
        self.model
            .get_or_try_init(|| async {
                info!("Loading embedding model");
                let model = self.loader.load().await?;
                info!(dimension = model.dimension(), "Embedding model loaded");
                Ok::<_, EmbeddingError>(model)
            })
            .await
    }

    /// Embedding dimension, loading the model if needed.
    pub async fn dimension(&self) -> Result<usize, EmbeddingError> {
        Ok(self.model().await?.dimension())
    }

    /// Encodes one text. Blank text yields a zero vector without calling the model.
    pub async fn encode(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let model = self.model().await?;
        if text.trim().is_empty() {
            return Ok(vec![0.0; model.dimension()]);
        }
        let mut vectors = model.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Encode("model returned no vectors".into()))
    }

    /// Encodes a batch. Blank entries are sent as a single space.
    pub async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = self.model().await?;
        let prepared: Vec<String> = texts
            .iter()
            .map(|t| {
                if t.trim().is_empty() {
                    " ".to_string()
                } else {
                    t.clone()
                }
            })
            .collect();
        debug!(batch = prepared.len(), "Encoding embedding batch");
        let vectors = model.embed(&prepared).await?;
        if vectors.len() != prepared.len() {
            return Err(EmbeddingError::Encode(format!(
                "expected {} vectors, got {}",
                prepared.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

/// Cosine similarity clamped into `[0, 1]`.
///
/// A zero-norm or length-mismatched input yields `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0)
}

/// Top `top_k` `(index, score)` pairs by descending similarity.
///
/// Equal scores keep candidate order.
pub fn find_most_similar(query: &[f32], candidates: &[Vec<f32>], top_k: usize) -> Vec<(usize, f32)> {
    let mut scored: Vec<(usize, f32)> = candidates
        .iter()
        .enumerate()
        .map(|(idx, candidate)| (idx, cosine_similarity(query, candidate)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(top_k);
    scored
}

/// Serializes a vector as little-endian `f32` bytes.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_embedding`].
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
    if blob.len() % 4 != 0 {
        return Err(EmbeddingError::Malformed(format!(
            "length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

// ── OpenAI embeddings ─────────────────────────────────────────────────────────

/// Loader for the OpenAI embeddings endpoint.
pub struct OpenAiEmbeddingLoader {
    api_key: String,
    base_url: Option<String>,
    model: String,
    dimension: usize,
}

impl OpenAiEmbeddingLoader {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.model = model.into();
        self.dimension = dimension;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

#[async_trait]
impl EmbeddingModelLoader for OpenAiEmbeddingLoader {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, EmbeddingError> {
        if self.api_key.trim().is_empty() {
            return Err(EmbeddingError::Load("missing API key".into()));
        }
        let mut config = OpenAIConfig::new().with_api_key(self.api_key.clone());
        if let Some(base_url) = &self.base_url {
            config = config.with_api_base(base_url.clone());
        }
        Ok(Arc::new(OpenAiEmbeddingModel {
            client: Client::with_config(config),
            model: self.model.clone(),
            dimension: self.dimension,
        }))
    }
}

struct OpenAiEmbeddingModel {
    client: Client<OpenAIConfig>,
    model: String,
    dimension: usize,
}

#[async_trait]
impl EmbeddingModel for OpenAiEmbeddingModel {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(texts.to_vec())
            .build()
            .map_err(|e| EmbeddingError::Encode(e.to_string()))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| EmbeddingError::Encode(e.to_string()))?;

        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        Ok(data.into_iter().map(|e| e.embedding).collect())
    }
}
