// Aglogen Assistant — Knowledge base indexing
//
// Turns completed simulations, FRAKTAL analyses and scientific documents into
// embedded chunks. A document is re-chunked only when the SHA-256 of its
// source text changes.

use chrono::Utc;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::chunking::{self, ChunkDraft};
use super::{DocumentChunk, DocumentStatus, IndexedDocument, RAGSearchService, SourceType};
use crate::queue::{Lane, TaskMessage, TaskQueue, INDEX_ANALYSIS, INDEX_DOCUMENT, INDEX_SIMULATION};
use crate::store::{fraktal_model_display, FraktalAnalysis, Simulation, Status, Store};

#[derive(Clone)]
pub struct Indexer {
    store: Store,
    search: RAGSearchService,
    queue: TaskQueue,
}

struct Source {
    source_type: SourceType,
    source_id: String,
    title: String,
    owner_id: i64,
    content: String,
    metadata: Map<String, Value>,
    drafts: Vec<ChunkDraft>,
}

impl Indexer {
    pub fn new(store: Store, search: RAGSearchService, queue: TaskQueue) -> Self {
        Self { store, search, queue }
    }

    pub async fn index_simulation(&self, simulation_id: &str) -> Value {
        let found = self
            .store
            .read(|d| {
                let sim = d.simulations.get(simulation_id)?;
                let owner = d.projects.get(&sim.project_id)?.owner_id;
                Some((sim.clone(), owner))
            })
            .await;
        let Some((sim, owner_id)) = found else {
            tracing::error!(simulation_id = %simulation_id, "Simulation not found");
            return failed("Simulation not found");
        };
        if sim.status != Status::Completed {
            return json!({"status": "skipped", "reason": "Simulation not completed"});
        }

        self.index_source(Source {
            source_type: SourceType::Simulation,
            source_id: sim.id.clone(),
            title: simulation_title(&sim),
            owner_id,
            content: simulation_content(&sim),
            metadata: simulation_metadata(&sim),
            drafts: chunking::chunk_simulation_data(&sim),
        })
        .await
    }

    pub async fn index_analysis(&self, analysis_id: &str) -> Value {
        let found = self
            .store
            .read(|d| {
                let analysis = d.fraktal_analyses.get(analysis_id)?;
                let owner = d.projects.get(&analysis.project_id)?.owner_id;
                Some((analysis.clone(), owner))
            })
            .await;
        let Some((analysis, owner_id)) = found else {
            tracing::error!(analysis_id = %analysis_id, "Analysis not found");
            return failed("Analysis not found");
        };
        if analysis.status != Status::Completed {
            return json!({"status": "skipped", "reason": "Analysis not completed"});
        }

        self.index_source(Source {
            source_type: SourceType::Analysis,
            source_id: analysis.id.clone(),
            title: format!("FRAKTAL {} analysis", analysis.model.to_uppercase()),
            owner_id,
            content: analysis_content(&analysis),
            metadata: analysis_metadata(&analysis),
            drafts: chunking::chunk_analysis_data(&analysis),
        })
        .await
    }

    async fn index_source(&self, source: Source) -> Value {
        let Source {
            source_type,
            source_id,
            title,
            owner_id,
            content,
            metadata,
            drafts,
        } = source;
        let index = self.search.index();
        let content_hash = sha256_hex(&content);

        let existing = index.find_by_source(source_type, &source_id).await;
        let unchanged = existing
            .as_ref()
            .is_some_and(|d| d.status == DocumentStatus::Ready && d.content_hash == content_hash);
        if unchanged {
            return json!({"status": "skipped", "reason": "Already indexed, no changes"});
        }

        let mut doc = existing.unwrap_or_else(|| {
            let mut doc = IndexedDocument::new(source_type, title);
            doc.source_id = Some(source_id.clone());
            doc.owner_id = Some(owner_id);
            doc
        });
        doc.content_hash = content_hash;
        doc.metadata = metadata;
        doc.status = DocumentStatus::Processing;
        doc.error_message.clear();
        doc.updated_at = Utc::now();
        let document_id = doc.id.clone();

        let outcome = async {
            index.upsert_document(doc).await?;
            index.replace_chunks(&document_id, Vec::new()).await?;
            self.store_chunks(&document_id, drafts).await
        }
        .await;

        match outcome {
            Ok(created) => {
                tracing::info!(
                    source_type = source_type.as_str(),
                    source_id = %source_id,
                    chunks = created,
                    "Indexed document"
                );
                json!({"status": "success", "document_id": document_id, "chunks_created": created})
            }
            Err(e) => {
                tracing::error!(source_id = %source_id, error = %e, "Failed to index document");
                self.mark_failed(&document_id, &e.to_string()).await;
                failed(&e.to_string())
            }
        }
    }

    /// Embed `drafts`, store them as the document's chunks and mark it ready.
    async fn store_chunks(&self, document_id: &str, drafts: Vec<ChunkDraft>) -> anyhow::Result<usize> {
        let embeddings = self.search.embeddings();
        let texts: Vec<String> = drafts.iter().map(|d| d.content.clone()).collect();
        let vectors = embeddings.embed_batch(&texts).await?;

        let chunks: Vec<DocumentChunk> = drafts
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (draft, embedding))| DocumentChunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                content: draft.content,
                chunk_index: i,
                embedding,
                embedding_model: embeddings.model_name().to_string(),
                section: draft.section,
                page_number: None,
                metadata: draft.metadata,
            })
            .collect();
        let created = chunks.len();

        let index = self.search.index();
        index.replace_chunks(document_id, chunks).await?;
        index
            .update_document(document_id, |doc| {
                doc.status = DocumentStatus::Ready;
                doc.indexed_at = Some(Utc::now());
            })
            .await?;
        Ok(created)
    }

    async fn mark_failed(&self, document_id: &str, error: &str) {
        let result = self
            .search
            .index()
            .update_document(document_id, |doc| {
                doc.status = DocumentStatus::Failed;
                doc.error_message = error.to_string();
                doc.content_hash.clear();
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(document_id = %document_id, error = %e, "Could not record indexing failure");
        }
    }

    /// Register a global literature document, pending indexing.
    pub async fn add_scientific_document(
        &self,
        title: &str,
        abstract_text: &str,
        metadata: Map<String, Value>,
    ) -> anyhow::Result<IndexedDocument> {
        let mut doc = IndexedDocument::new(SourceType::ScientificDoc, title);
        doc.is_global = true;
        doc.abstract_text = abstract_text.to_string();
        doc.metadata = metadata;
        self.search.index().upsert_document(doc.clone()).await?;
        Ok(doc)
    }

    pub async fn index_scientific_document(&self, document_id: &str) -> Value {
        let index = self.search.index();
        let Some(doc) = index.get_document(document_id).await else {
            tracing::error!(document_id = %document_id, "Document not found");
            return failed("Document not found");
        };

        let content = doc.abstract_text.clone();
        let content_hash = sha256_hex(&content);
        let prepared = index
            .update_document(document_id, |d| {
                d.status = if content.is_empty() {
                    DocumentStatus::Failed
                } else {
                    DocumentStatus::Processing
                };
                d.error_message = if content.is_empty() {
                    "No content to index".to_string()
                } else {
                    String::new()
                };
                d.content_hash = content_hash;
            })
            .await;
        if let Err(e) = prepared {
            return failed(&e.to_string());
        }
        if content.is_empty() {
            return failed("No content to index");
        }

        let outcome = async {
            index.replace_chunks(document_id, Vec::new()).await?;
            self.store_chunks(document_id, chunking::chunk_scientific_document(&content))
                .await
        }
        .await;

        match outcome {
            Ok(created) => {
                tracing::info!(document_id = %document_id, chunks = created, "Indexed scientific document");
                json!({"status": "success", "chunks_created": created})
            }
            Err(e) => {
                tracing::error!(document_id = %document_id, error = %e, "Failed to index document");
                self.mark_failed(document_id, &e.to_string()).await;
                failed(&e.to_string())
            }
        }
    }

    /// Queue indexing for every completed simulation and analysis in
    /// projects the user owns.
    pub async fn reindex_user(&self, user_id: i64) -> Value {
        let Some(user) = self.store.user(user_id).await else {
            return failed("User not found");
        };

        let (simulations, analyses) = self
            .store
            .read(|d| {
                let owned = |project_id: i64| d.projects.get(&project_id).is_some_and(|p| p.owner_id == user.id);
                let sims: Vec<String> = d
                    .simulations
                    .values()
                    .filter(|s| s.status == Status::Completed && owned(s.project_id))
                    .map(|s| s.id.clone())
                    .collect();
                let analyses: Vec<String> = d
                    .fraktal_analyses
                    .values()
                    .filter(|a| a.status == Status::Completed && owned(a.project_id))
                    .map(|a| a.id.clone())
                    .collect();
                (sims, analyses)
            })
            .await;

        let tasks = simulations
            .into_iter()
            .map(|id| (INDEX_SIMULATION, id))
            .chain(analyses.into_iter().map(|id| (INDEX_ANALYSIS, id)));
        let mut queued = 0;
        for (task, id) in tasks {
            if let Err(e) = self.queue.enqueue(task, vec![json!(id)]).await {
                tracing::warn!(task = %task, source_id = %id, error = %e, "Stopped queueing reindex tasks");
                return json!({"status": "partial", "queued": queued, "error": e.to_string()});
            }
            queued += 1;
        }
        tracing::info!(user = %user.email, queued = queued, "Queued items for reindexing");
        json!({"status": "success", "queued": queued})
    }

    /// Run an indexing task taken off the queue. Returns `None` for tasks
    /// that are not indexing tasks.
    pub async fn handle_task(&self, task: &TaskMessage) -> Option<Value> {
        let arg = task.args.first().and_then(Value::as_str).unwrap_or_default();
        let result = match task.name.as_str() {
            INDEX_SIMULATION => self.index_simulation(arg).await,
            INDEX_ANALYSIS => self.index_analysis(arg).await,
            INDEX_DOCUMENT => self.index_scientific_document(arg).await,
            _ => return None,
        };

        if result["status"] == "failed" {
            let error = result["error"].as_str().unwrap_or("Indexing failed").to_string();
            self.queue.mark_failure(&task.id, error).await;
        } else {
            self.queue.mark_success(&task.id, result.clone()).await;
        }
        Some(result)
    }

    /// Drain the indexing lane in the background. Compute tasks live on
    /// their own lane and are never taken here.
    pub fn spawn_worker(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(task) = self.queue.next_in(Lane::Indexing).await {
                self.queue.mark_started(&task.id).await;
                match self.handle_task(&task).await {
                    Some(result) => tracing::info!(
                        task = %task.name,
                        task_id = %task.id,
                        status = %result["status"],
                        "Indexing task finished"
                    ),
                    None => {
                        tracing::warn!(task = %task.name, task_id = %task.id, "Not an indexing task");
                        self.queue
                            .mark_failure(&task.id, format!("No indexing handler for '{}'", task.name))
                            .await;
                    }
                }
            }
        })
    }
}

fn failed(error: &str) -> Value {
    json!({"status": "failed", "error": error})
}

fn sha256_hex(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn simulation_title(sim: &Simulation) -> String {
    let n = sim
        .parameters
        .get("n_particles")
        .map(chunking::plain)
        .unwrap_or_else(|| "?".into());
    format!("{} simulation with {} particles", sim.algorithm.as_str().to_uppercase(), n)
}

/// Hashed text for a simulation. Any change in name, parameters or key
/// metrics changes the hash.
fn simulation_content(sim: &Simulation) -> String {
    let name = if sim.name.is_empty() { "Unnamed" } else { &sim.name };
    let params: Vec<String> = sim
        .parameters
        .iter()
        .map(|(k, v)| format!("{}={}", k, chunking::plain(v)))
        .collect();
    let mut parts = vec![
        format!("Simulation: {}", name),
        format!("Algorithm: {}", sim.algorithm.display_name()),
        format!("Parameters: {}", params.join(", ")),
    ];
    if let Some(metrics) = sim.metrics.as_ref().filter(|m| !m.is_empty()) {
        parts.push(format!(
            "Results: {}",
            key_values(metrics, &["fractal_dimension", "radius_of_gyration", "porosity", "prefactor"])
        ));
    }
    parts.join("\n\n")
}

fn simulation_metadata(sim: &Simulation) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("algorithm".into(), json!(sim.algorithm.as_str()));
    m.insert(
        "n_particles".into(),
        sim.parameters.get("n_particles").cloned().unwrap_or(Value::Null),
    );
    m.insert(
        "fractal_dimension".into(),
        sim.metric("fractal_dimension").cloned().unwrap_or(Value::Null),
    );
    m.insert("project_id".into(), json!(sim.project_id.to_string()));
    m.insert("created_at".into(), json!(sim.created_at.to_rfc3339()));
    m
}

fn analysis_content(analysis: &FraktalAnalysis) -> String {
    let name = if analysis.name.is_empty() { "Unnamed" } else { &analysis.name };
    let mut parts = vec![
        format!("FRAKTAL Analysis: {}", name),
        format!("Model: {}", fraktal_model_display(&analysis.model)),
        format!("Source: {}", analysis.source_type.display_name()),
    ];
    if let Some(results) = analysis.results.as_ref().filter(|r| !r.is_empty()) {
        parts.push(format!("Results: {}", key_values(results, &["df", "rg", "npo", "kf"])));
    }
    parts.join("\n\n")
}

fn analysis_metadata(analysis: &FraktalAnalysis) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("model".into(), json!(analysis.model));
    m.insert("source_type".into(), json!(analysis.source_type.as_str()));
    m.insert("fractal_dimension".into(), analysis.result("df"));
    m.insert("project_id".into(), json!(analysis.project_id.to_string()));
    m.insert("created_at".into(), json!(analysis.created_at.to_rfc3339()));
    m
}

fn key_values(values: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| values.get(*k).map(|v| format!("{}={}", k, chunking::fixed(v, 4))))
        .collect::<Vec<_>>()
        .join(", ")
}
