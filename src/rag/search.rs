// Aglogen Assistant — Semantic search over the knowledge base

use serde_json::{json, Value};

use super::{DocumentChunk, DocumentIndex, EmbeddingService, IndexedDocument, SourceType};
use crate::tool::round_to;

pub const DEFAULT_K: usize = 5;
pub const DEFAULT_MIN_SCORE: f64 = 0.5;

/// Whose documents a search may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// The user's private documents, plus global ones when `include_global`.
    Owner { user_id: i64, include_global: bool },
    /// Global documents only, no caller required.
    GlobalOnly,
}

impl SearchScope {
    fn admits(&self, doc: &IndexedDocument) -> bool {
        match *self {
            SearchScope::Owner {
                user_id,
                include_global,
            } => (doc.owner_id == Some(user_id) && !doc.is_global) || (doc.is_global && include_global),
            SearchScope::GlobalOnly => doc.is_global,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: DocumentChunk,
    pub document: IndexedDocument,
    pub score: f64,
}

impl SearchResult {
    /// Metadata merges the document's, then the chunk's on top.
    pub fn to_dict(&self) -> Value {
        let mut metadata = self.document.metadata.clone();
        metadata.extend(self.chunk.metadata.clone());
        json!({
            "chunk_id": self.chunk.id,
            "document_id": self.document.id,
            "content": self.chunk.content,
            "score": round_to(self.score, 4),
            "source_type": self.document.source_type,
            "title": self.document.title,
            "section": self.chunk.section,
            "metadata": metadata,
        })
    }
}

#[derive(Clone)]
pub struct RAGSearchService {
    index: DocumentIndex,
    embeddings: EmbeddingService,
}

impl RAGSearchService {
    pub fn new(index: DocumentIndex, embeddings: EmbeddingService) -> Self {
        Self { index, embeddings }
    }

    pub fn index(&self) -> &DocumentIndex {
        &self.index
    }

    pub fn embeddings(&self) -> &EmbeddingService {
        &self.embeddings
    }

    /// Rank-ordered chunks from ready documents within `scope`. Twice `k`
    /// candidates are scored; those under `min_score` are dropped and the
    /// rest truncated to `k`. No match is an empty list, not an error.
    pub async fn search(
        &self,
        query: &str,
        scope: SearchScope,
        k: usize,
        min_score: f64,
        source_types: Option<&[SourceType]>,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let embedding = self.embeddings.embed_text(query).await?;

        let candidates = self
            .index
            .nearest(
                &embedding,
                |doc| scope.admits(doc) && source_types.map_or(true, |types| types.contains(&doc.source_type)),
                k * 2,
            )
            .await;

        let results: Vec<SearchResult> = candidates
            .into_iter()
            .filter(|(_, _, score)| *score >= min_score)
            .take(k)
            .map(|(chunk, document, score)| SearchResult { chunk, document, score })
            .collect();

        tracing::info!(
            query = %query.chars().take(50).collect::<String>(),
            results = results.len(),
            "RAG search completed"
        );
        Ok(results)
    }

    /// Private simulation documents, optionally narrowed to one algorithm.
    pub async fn search_simulations(
        &self,
        query: &str,
        user_id: i64,
        k: usize,
        algorithm: Option<&str>,
    ) -> anyhow::Result<Vec<SearchResult>> {
        let scope = SearchScope::Owner {
            user_id,
            include_global: false,
        };
        let results = self
            .search(query, scope, k, DEFAULT_MIN_SCORE, Some(&[SourceType::Simulation]))
            .await?;

        Ok(match algorithm {
            Some(alg) => results
                .into_iter()
                .filter(|r| {
                    r.document
                        .metadata
                        .get("algorithm")
                        .and_then(Value::as_str)
                        .is_some_and(|a| a.eq_ignore_ascii_case(alg))
                })
                .collect(),
            None => results,
        })
    }

    pub async fn search_analyses(&self, query: &str, user_id: i64, k: usize) -> anyhow::Result<Vec<SearchResult>> {
        let scope = SearchScope::Owner {
            user_id,
            include_global: false,
        };
        self.search(query, scope, k, DEFAULT_MIN_SCORE, Some(&[SourceType::Analysis]))
            .await
    }

    /// Scientific literature, global documents only.
    pub async fn search_scientific(&self, query: &str, k: usize) -> anyhow::Result<Vec<SearchResult>> {
        self.search(
            query,
            SearchScope::GlobalOnly,
            k,
            DEFAULT_MIN_SCORE,
            Some(&[SourceType::ScientificDoc, SourceType::Uploaded]),
        )
        .await
    }
}

impl Default for RAGSearchService {
    fn default() -> Self {
        Self::new(DocumentIndex::new(), EmbeddingService::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::DocumentStatus;
    use serde_json::Map;

    async fn add(
        service: &RAGSearchService,
        title: &str,
        source_type: SourceType,
        owner: Option<i64>,
        global: bool,
        content: &str,
    ) -> String {
        let mut doc = IndexedDocument::new(source_type, title);
        doc.status = DocumentStatus::Ready;
        doc.owner_id = owner;
        doc.is_global = global;
        doc.metadata.insert("algorithm".into(), json!("dla"));
        doc.metadata.insert("origin".into(), json!("document"));
        let id = doc.id.clone();
        service.index().upsert_document(doc).await.unwrap();

        let embedding = service.embeddings().embed_text(content).await.unwrap();
        let mut metadata = Map::new();
        metadata.insert("origin".into(), json!("chunk"));
        let chunk = DocumentChunk {
            id: format!("{}-0", id),
            document_id: id.clone(),
            content: content.to_string(),
            chunk_index: 0,
            embedding,
            embedding_model: "local-hash".into(),
            section: "overview".into(),
            page_number: None,
            metadata,
        };
        service.index().replace_chunks(&id, vec![chunk]).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_scope_isolation() {
        let service = RAGSearchService::default();
        let text = "diffusion limited aggregation fractal dimension";
        add(&service, "mine", SourceType::Simulation, Some(1), false, text).await;
        add(&service, "theirs", SourceType::Simulation, Some(2), false, text).await;
        add(&service, "paper", SourceType::ScientificDoc, None, true, text).await;

        let own = SearchScope::Owner { user_id: 1, include_global: true };
        let titles: Vec<String> = service
            .search(text, own, 10, 0.5, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.document.title)
            .collect();
        assert_eq!(titles.len(), 2);
        assert!(titles.contains(&"mine".to_string()));
        assert!(titles.contains(&"paper".to_string()));

        let own_only = SearchScope::Owner { user_id: 1, include_global: false };
        assert_eq!(service.search(text, own_only, 10, 0.5, None).await.unwrap().len(), 1);

        let global = service.search_scientific(text, 5).await.unwrap();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].document.title, "paper");
    }

    #[tokio::test]
    async fn test_min_score_and_source_filter() {
        let service = RAGSearchService::default();
        add(&service, "sim", SourceType::Simulation, Some(1), false, "cluster cluster aggregation").await;
        add(&service, "ana", SourceType::Analysis, Some(1), false, "cluster cluster aggregation").await;

        let scope = SearchScope::Owner { user_id: 1, include_global: true };
        let hits = service
            .search("cluster cluster aggregation", scope, 5, 0.5, Some(&[SourceType::Analysis]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.title, "ana");

        let none = service.search("porosity", scope, 5, 0.99, None).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_presets_and_to_dict() {
        let service = RAGSearchService::default();
        add(&service, "sim", SourceType::Simulation, Some(1), false, "dla simulation results").await;

        let hits = service.search_simulations("dla simulation results", 1, 5, Some("DLA")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(service
            .search_simulations("dla simulation results", 1, 5, Some("cca"))
            .await
            .unwrap()
            .is_empty());
        assert!(service.search_analyses("dla simulation results", 1, 5).await.unwrap().is_empty());

        let d = hits[0].to_dict();
        assert_eq!(d["source_type"], "simulation");
        assert_eq!(d["section"], "overview");
        assert_eq!(d["metadata"]["origin"], "chunk");
        assert_eq!(d["metadata"]["algorithm"], "dla");
        let score = d["score"].as_f64().unwrap();
        assert_eq!(score, round_to(score, 4));
    }
}
