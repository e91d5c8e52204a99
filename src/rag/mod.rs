// Aglogen Assistant — Retrieval-augmented generation
//
// Indexed documents are split into chunks, each carrying a dense embedding.
// The index answers cosine-similarity queries restricted by ownership and
// document readiness. File-backed JSON persistence is optional.

pub mod chunking;
pub mod embedding;
pub mod indexer;
pub mod search;

pub use embedding::{EmbeddingProvider, EmbeddingService, HashEmbeddingProvider, OpenAIEmbeddingProvider};
pub use indexer::Indexer;
pub use search::{RAGSearchService, SearchResult, SearchScope};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Simulation,
    Analysis,
    Study,
    ScientificDoc,
    Uploaded,
}

impl SourceType {
    pub const ALL: [SourceType; 5] = [
        SourceType::Simulation,
        SourceType::Analysis,
        SourceType::Study,
        SourceType::ScientificDoc,
        SourceType::Uploaded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Simulation => "simulation",
            SourceType::Analysis => "analysis",
            SourceType::Study => "study",
            SourceType::ScientificDoc => "scientific_doc",
            SourceType::Uploaded => "uploaded",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceType::Simulation => "Simulation",
            SourceType::Analysis => "Analysis",
            SourceType::Study => "Parametric Study",
            SourceType::ScientificDoc => "Scientific Document",
            SourceType::Uploaded => "Uploaded Document",
        }
    }

    pub fn parse(s: &str) -> Option<SourceType> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub source_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub content_hash: String,
    pub status: DocumentStatus,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub is_global: bool,
    /// Body text for documents that are not derived from a domain record.
    #[serde(default, rename = "abstract")]
    pub abstract_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
}

impl IndexedDocument {
    pub fn new(source_type: SourceType, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_type,
            source_id: None,
            title: title.into(),
            content_hash: String::new(),
            status: DocumentStatus::Pending,
            error_message: String::new(),
            metadata: Map::new(),
            owner_id: None,
            is_global: false,
            abstract_text: String::new(),
            created_at: now,
            updated_at: now,
            indexed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub chunk_index: usize,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexData {
    documents: BTreeMap<String, IndexedDocument>,
    chunks: Vec<DocumentChunk>,
}

/// Shared document/chunk index. Cloning yields another handle.
#[derive(Clone, Default)]
pub struct DocumentIndex {
    data: Arc<RwLock<IndexData>>,
    path: Option<PathBuf>,
    file: Arc<Mutex<()>>,
}

impl DocumentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file-backed index; a missing file starts empty.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let data = if path.exists() {
            let json = std::fs::read_to_string(path)?;
            serde_json::from_str(&json)?
        } else {
            IndexData::default()
        };
        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            path: Some(path.to_path_buf()),
            file: Arc::default(),
        })
    }

    /// Snapshot under the data lock, write after releasing it. The file lock
    /// is taken first so snapshots reach disk in mutation order.
    async fn persist(&self, data: RwLockWriteGuard<'_, IndexData>) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string(&*data)?;
        let _file = self.file.lock().await;
        drop(data);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Option<IndexedDocument> {
        self.data.read().await.documents.get(id).cloned()
    }

    pub async fn find_by_source(&self, source_type: SourceType, source_id: &str) -> Option<IndexedDocument> {
        self.data
            .read()
            .await
            .documents
            .values()
            .find(|d| d.source_type == source_type && d.source_id.as_deref() == Some(source_id))
            .cloned()
    }

    pub async fn upsert_document(&self, doc: IndexedDocument) -> anyhow::Result<()> {
        let mut data = self.data.write().await;
        data.documents.insert(doc.id.clone(), doc);
        self.persist(data).await
    }

    /// Apply `f` to a stored document, bumping `updated_at`.
    pub async fn update_document(
        &self,
        id: &str,
        f: impl FnOnce(&mut IndexedDocument),
    ) -> anyhow::Result<Option<IndexedDocument>> {
        let mut data = self.data.write().await;
        let updated = match data.documents.get_mut(id) {
            Some(doc) => {
                f(doc);
                doc.updated_at = Utc::now();
                Some(doc.clone())
            }
            None => None,
        };
        self.persist(data).await?;
        Ok(updated)
    }

    /// Drop every chunk of `document_id` and store `chunks` in their place.
    pub async fn replace_chunks(&self, document_id: &str, chunks: Vec<DocumentChunk>) -> anyhow::Result<()> {
        let mut data = self.data.write().await;
        data.chunks.retain(|c| c.document_id != document_id);
        data.chunks.extend(chunks);
        self.persist(data).await
    }

    pub async fn chunks_for(&self, document_id: &str) -> Vec<DocumentChunk> {
        let mut chunks: Vec<DocumentChunk> = self
            .data
            .read()
            .await
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        chunks
    }

    pub async fn documents(&self) -> Vec<IndexedDocument> {
        self.data.read().await.documents.values().cloned().collect()
    }

    /// Chunks of ready documents accepted by `filter`, most similar first,
    /// at most `limit` of them.
    pub async fn nearest(
        &self,
        embedding: &[f32],
        filter: impl Fn(&IndexedDocument) -> bool,
        limit: usize,
    ) -> Vec<(DocumentChunk, IndexedDocument, f64)> {
        let data = self.data.read().await;
        let mut scored: Vec<(&DocumentChunk, &IndexedDocument, f64)> = data
            .chunks
            .iter()
            .filter_map(|c| {
                let doc = data.documents.get(&c.document_id)?;
                (doc.status == DocumentStatus::Ready && filter(doc))
                    .then(|| (c, doc, cosine_similarity(embedding, &c.embedding)))
            })
            .collect();
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(limit)
            .map(|(c, d, s)| (c.clone(), d.clone(), s))
            .collect()
    }
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for i in 0..len {
        let x = a[i] as f64;
        let y = b[i] as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
