// Aglogen Assistant — Knowledge base tools

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::registration::ToolServices;
use super::{parse_args, round_to, with_state, Arguments, ErrorKind, HandlerResult, Param, ToolBuilder, ToolDefinition, ToolFailure};
use crate::rag::search::{SearchScope, DEFAULT_MIN_SCORE};
use crate::rag::{DocumentStatus, IndexedDocument, SourceType};
use crate::store::User;

const SEARCHABLE_TYPES: [SourceType; 3] = [SourceType::Simulation, SourceType::Analysis, SourceType::ScientificDoc];

pub fn tools(services: &ToolServices) -> Vec<ToolDefinition> {
    vec![
        ToolBuilder::new("search_knowledge_base")
            .description(
                "Search the knowledge base for relevant information: results from past \
                 simulations, FRAKTAL analysis results, and scientific literature about DLA, \
                 CCA and fractal analysis. The search uses semantic similarity, so natural \
                 language queries work well.",
            )
            .doc(
                "Search the RAG knowledge base.

                Args:
                    query: Natural language search query.
                    source_type: Filter by type: simulation, analysis, scientific_doc.
                    max_results: Maximum results to return (1-10).",
            )
            .category("knowledge")
            .param(Param::new("query", "str"))
            .param(Param::new("source_type", "str | None").with_default())
            .param(Param::new("max_results", "int").with_default())
            .context_param("user")
            .accepts_kwargs()
            .handler(with_state(services.clone(), search_knowledge_base)),
        ToolBuilder::new("get_simulation_insights")
            .description(
                "Get aggregated insights and statistics from past simulations. \
                 For finding specific simulations, use search_knowledge_base instead.",
            )
            .doc(
                "Get statistical insights from indexed simulations.

                Args:
                    algorithm: Filter by algorithm (dla, cca, ballistic, etc.).
                    min_particles: Minimum particle count filter.",
            )
            .category("knowledge")
            .param(Param::new("algorithm", "str | None").with_default())
            .param(Param::new("min_particles", "int | None").with_default())
            .context_param("user")
            .accepts_kwargs()
            .handler(with_state(services.clone(), get_simulation_insights)),
        ToolBuilder::new("get_analysis_insights")
            .description("Get aggregated insights from FRAKTAL analyses.")
            .doc(
                "Get statistical insights from indexed analyses.

                Args:
                    model: Filter by FRAKTAL model (granulated_2012, voxel_2018).",
            )
            .category("knowledge")
            .param(Param::new("model", "str | None").with_default())
            .context_param("user")
            .accepts_kwargs()
            .handler(with_state(services.clone(), get_analysis_insights)),
    ]
}

fn failure(error_type: ErrorKind, message: impl Into<String>) -> ToolFailure {
    ToolFailure::Execution {
        error_type,
        message: message.into(),
        details: None,
        recoverable: false,
    }
}

fn require_user(user: Option<User>, message: &str) -> Result<User, ToolFailure> {
    user.ok_or_else(|| failure(ErrorKind::Authentication, message))
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    source_type: Option<String>,
    #[serde(default = "default_max_results")]
    max_results: i64,
    user: Option<User>,
}

fn default_max_results() -> i64 {
    5
}

async fn search_knowledge_base(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: SearchArgs = parse_args(args)?;
    let user = require_user(a.user, "User context required for knowledge base search")?;
    let k = a.max_results.clamp(1, 10) as usize;

    let source_types = match a.source_type.as_deref().filter(|t| !t.is_empty()) {
        None => None,
        Some(t) => match SourceType::parse(t).filter(|st| SEARCHABLE_TYPES.contains(st)) {
            Some(st) => Some(vec![st]),
            None => {
                let valid: Vec<&str> = SEARCHABLE_TYPES.iter().map(SourceType::as_str).collect();
                return Err(failure(
                    ErrorKind::Validation,
                    format!("Invalid source_type. Must be one of: {}", valid.join(", ")),
                ));
            }
        },
    };

    let scope = SearchScope::Owner {
        user_id: user.id,
        include_global: true,
    };
    let results = s
        .search
        .search(&a.query, scope, k, DEFAULT_MIN_SCORE, source_types.as_deref())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Knowledge base search failed");
            failure(ErrorKind::Search, format!("Knowledge base search failed: {}", e))
        })?;

    if results.is_empty() {
        return Ok(json!({
            "found": false,
            "message": "No relevant results found in the knowledge base.",
            "results": [],
        })
        .into());
    }
    Ok(json!({
        "found": true,
        "count": results.len(),
        "results": results.iter().map(|r| r.to_dict()).collect::<Vec<_>>(),
    })
    .into())
}

/// Ready documents of one kind owned by the user.
async fn owned_documents(s: &ToolServices, user: &User, source_type: SourceType) -> Vec<IndexedDocument> {
    s.search
        .index()
        .documents()
        .await
        .into_iter()
        .filter(|d| d.owner_id == Some(user.id) && d.source_type == source_type && d.status == DocumentStatus::Ready)
        .collect()
}

fn meta_str<'a>(doc: &'a IndexedDocument, key: &str) -> Option<&'a str> {
    doc.metadata.get(key).and_then(Value::as_str)
}

/// Summary of metadata fractal dimensions; sample standard deviation.
fn df_statistics(docs: &[IndexedDocument]) -> Map<String, Value> {
    let values: Vec<f64> = docs
        .iter()
        .filter_map(|d| d.metadata.get("fractal_dimension").and_then(Value::as_f64))
        .collect();
    let mut stats = Map::new();
    if values.is_empty() {
        return stats;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = if values.len() > 1 {
        (values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    stats.insert(
        "fractal_dimension".into(),
        json!({
            "mean": round_to(mean, 4),
            "std": round_to(std, 4),
            "min": round_to(min, 4),
            "max": round_to(max, 4),
            "count": values.len(),
        }),
    );
    stats
}

fn distribution(docs: &[IndexedDocument], key: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for doc in docs {
        *counts
            .entry(meta_str(doc, key).unwrap_or("unknown").to_string())
            .or_insert(0) += 1;
    }
    counts
}

#[derive(Deserialize)]
struct SimulationInsightArgs {
    algorithm: Option<String>,
    min_particles: Option<i64>,
    user: Option<User>,
}

async fn get_simulation_insights(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: SimulationInsightArgs = parse_args(args)?;
    let user = require_user(a.user, "User context required")?;
    let algorithm = a.algorithm.as_deref().map(str::to_lowercase);

    let docs: Vec<IndexedDocument> = owned_documents(&s, &user, SourceType::Simulation)
        .await
        .into_iter()
        .filter(|d| algorithm.as_deref().map_or(true, |alg| meta_str(d, "algorithm") == Some(alg)))
        .filter(|d| {
            a.min_particles.map_or(true, |min| {
                d.metadata
                    .get("n_particles")
                    .and_then(Value::as_i64)
                    .is_some_and(|n| n >= min)
            })
        })
        .collect();

    let filters = json!({"algorithm": a.algorithm, "min_particles": a.min_particles});
    if docs.is_empty() {
        return Ok(json!({
            "found": false,
            "message": "No indexed simulations match the criteria.",
            "filters_applied": filters,
        })
        .into());
    }
    Ok(json!({
        "found": true,
        "total_simulations": docs.len(),
        "filters_applied": filters,
        "statistics": df_statistics(&docs),
        "algorithm_distribution": distribution(&docs, "algorithm"),
    })
    .into())
}

#[derive(Deserialize)]
struct AnalysisInsightArgs {
    model: Option<String>,
    user: Option<User>,
}

async fn get_analysis_insights(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: AnalysisInsightArgs = parse_args(args)?;
    let user = require_user(a.user, "User context required")?;
    let model = a.model.as_deref().map(str::to_lowercase);

    let docs: Vec<IndexedDocument> = owned_documents(&s, &user, SourceType::Analysis)
        .await
        .into_iter()
        .filter(|d| model.as_deref().map_or(true, |m| meta_str(d, "model") == Some(m)))
        .collect();

    let filters = json!({"model": a.model});
    if docs.is_empty() {
        return Ok(json!({
            "found": false,
            "message": "No indexed analyses match the criteria.",
            "filters_applied": filters,
        })
        .into());
    }
    Ok(json!({
        "found": true,
        "total_analyses": docs.len(),
        "filters_applied": filters,
        "statistics": df_statistics(&docs),
        "model_distribution": distribution(&docs, "model"),
    })
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::DocumentChunk;
    use crate::tool::registration::test_support::{args, fixture};

    fn doc(owner: i64, source_type: SourceType, metadata: Value) -> IndexedDocument {
        let mut doc = IndexedDocument::new(source_type, "indexed");
        doc.owner_id = Some(owner);
        doc.status = DocumentStatus::Ready;
        doc.metadata = args(metadata);
        doc
    }

    #[tokio::test]
    async fn test_search_requires_known_source_type() {
        let fx = fixture().await;
        let r = fx
            .exec(None)
            .execute(
                "search_knowledge_base",
                args(json!({"query": "dla", "source_type": "uploaded"})),
            )
            .await;
        let err = r.error().unwrap();
        assert_eq!(err.error_type, ErrorKind::Validation);
        assert_eq!(
            err.message,
            "Invalid source_type. Must be one of: simulation, analysis, scientific_doc"
        );
    }

    #[tokio::test]
    async fn test_search_empty_index() {
        let fx = fixture().await;
        let r = fx
            .exec(None)
            .execute("search_knowledge_base", args(json!({"query": "soot", "max_results": 50})))
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["found"], false);
        assert_eq!(data["results"], json!([]));
    }

    #[tokio::test]
    async fn test_search_finds_own_documents_only() {
        let fx = fixture().await;
        let query = "DLA fractal dimension with sticking probability";
        let embedding = fx.services.search.embeddings().embed_text(query).await.unwrap();
        let index = fx.services.search.index();

        for (owner, title) in [(fx.owner.id, "mine"), (fx.stranger.id, "theirs")] {
            let mut d = doc(owner, SourceType::Simulation, json!({"algorithm": "dla"}));
            d.title = title.into();
            let chunk = DocumentChunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: d.id.clone(),
                content: query.into(),
                chunk_index: 0,
                embedding: embedding.clone(),
                embedding_model: "hash".into(),
                section: "summary".into(),
                page_number: None,
                metadata: Map::new(),
            };
            index.upsert_document(d.clone()).await.unwrap();
            index.replace_chunks(&d.id, vec![chunk]).await.unwrap();
        }

        let r = fx
            .exec(None)
            .execute("search_knowledge_base", args(json!({"query": query})))
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["found"], true);
        assert_eq!(data["count"], 1);
        assert_eq!(data["results"][0]["title"], "mine");
        assert_eq!(data["results"][0]["score"], 1.0);
    }

    #[tokio::test]
    async fn test_simulation_insights() {
        let fx = fixture().await;
        let index = fx.services.search.index();
        for (alg, n, df) in [("dla", 1000, 1.7), ("dla", 5000, 1.8), ("cca", 1000, 1.9)] {
            index
                .upsert_document(doc(
                    fx.owner.id,
                    SourceType::Simulation,
                    json!({"algorithm": alg, "n_particles": n, "fractal_dimension": df}),
                ))
                .await
                .unwrap();
        }
        index
            .upsert_document(doc(fx.stranger.id, SourceType::Simulation, json!({"algorithm": "dla"})))
            .await
            .unwrap();

        let r = fx.exec(None).execute("get_simulation_insights", Arguments::new()).await;
        let data = r.data().unwrap();
        assert_eq!(data["total_simulations"], 3);
        assert_eq!(data["algorithm_distribution"], json!({"cca": 1, "dla": 2}));
        assert_eq!(data["statistics"]["fractal_dimension"]["mean"], 1.8);
        assert_eq!(data["statistics"]["fractal_dimension"]["std"], 0.1);

        let r = fx
            .exec(None)
            .execute("get_simulation_insights", args(json!({"algorithm": "DLA", "min_particles": 2000})))
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["total_simulations"], 1);
        assert_eq!(data["statistics"]["fractal_dimension"]["std"], 0.0);

        let r = fx
            .exec(None)
            .execute("get_simulation_insights", args(json!({"algorithm": "ballistic"})))
            .await;
        assert_eq!(
            r.data().unwrap()["message"],
            "No indexed simulations match the criteria."
        );
    }

    #[tokio::test]
    async fn test_analysis_insights() {
        let fx = fixture().await;
        let index = fx.services.search.index();
        index
            .upsert_document(doc(
                fx.owner.id,
                SourceType::Analysis,
                json!({"model": "voxel_2018", "fractal_dimension": 1.75}),
            ))
            .await
            .unwrap();
        let mut pending = doc(fx.owner.id, SourceType::Analysis, json!({"model": "voxel_2018"}));
        pending.status = DocumentStatus::Pending;
        index.upsert_document(pending).await.unwrap();

        let r = fx
            .exec(None)
            .execute("get_analysis_insights", args(json!({"model": "VOXEL_2018"})))
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["total_analyses"], 1);
        assert_eq!(data["model_distribution"], json!({"voxel_2018": 1}));

        let r = fx
            .exec(None)
            .execute("get_analysis_insights", args(json!({"model": "granulated_2012"})))
            .await;
        assert_eq!(r.data().unwrap()["found"], false);
    }
}
