use aglogen_assistant::queue::{Lane, TaskQueue, TaskStatus, INDEX_SIMULATION, RUN_SIMULATION};
use aglogen_assistant::rag::{DocumentIndex, DocumentStatus, EmbeddingService, Indexer, RAGSearchService, SearchScope, SourceType};
use aglogen_assistant::store::{Algorithm, Simulation, Status, Store, User};
use serde_json::{json, Map, Value};
use std::time::Duration;

fn params(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

async fn completed_simulation(store: &Store, project_id: i64) -> String {
    let mut sim = Simulation::new(
        project_id,
        Algorithm::Tunable,
        params(json!({"n_particles": 1000, "target_df": 1.8, "target_kf": 1.3})),
        11,
    );
    sim.name = "Soot cluster".into();
    sim.status = Status::Completed;
    sim.metrics = Some(params(json!({
        "n_particles": 1000,
        "fractal_dimension": 1.79,
        "prefactor": 1.31,
        "radius_of_gyration": 14.2
    })));
    sim.geometry = Some((0..32).map(|i| [i as f64, 0.0, 0.0, 1.0]).collect());
    sim.execution_time_ms = Some(850);
    let id = sim.id.clone();
    store.insert_simulation(sim).await.unwrap();
    id
}

async fn owner_store() -> (Store, i64) {
    let store = Store::new();
    store.add_user(User::new(1, "alice")).await.unwrap();
    store.add_user(User::new(2, "bob")).await.unwrap();
    let project = store.create_project(1, "Soot", "").await.unwrap();
    (store, project.id)
}

#[tokio::test]
async fn test_index_simulation_then_search_scoped_to_owner() {
    let (store, project_id) = owner_store().await;
    let sim_id = completed_simulation(&store, project_id).await;
    let search = RAGSearchService::default();
    let indexer = Indexer::new(store, search.clone(), TaskQueue::new(8));

    let result = indexer.index_simulation(&sim_id).await;
    assert_eq!(result["status"], "success", "{}", result);
    assert!(result["chunks_created"].as_u64().unwrap() >= 1);

    // Unchanged content is not indexed twice.
    let again = indexer.index_simulation(&sim_id).await;
    assert_eq!(again["status"], "skipped");

    let owner = SearchScope::Owner {
        user_id: 1,
        include_global: true,
    };
    let hits = search
        .search("tunable fractal dimension", owner, 5, -1.0, None)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].document.source_type, SourceType::Simulation);
    assert_eq!(hits[0].document.source_id.as_deref(), Some(sim_id.as_str()));

    let stranger = SearchScope::Owner {
        user_id: 2,
        include_global: true,
    };
    let hits = search
        .search("tunable fractal dimension", stranger, 5, -1.0, None)
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn test_incomplete_simulation_is_skipped() {
    let (store, project_id) = owner_store().await;
    let sim = Simulation::new(project_id, Algorithm::Dla, params(json!({"n_particles": 100})), 1);
    let sim_id = sim.id.clone();
    store.insert_simulation(sim).await.unwrap();

    let indexer = Indexer::new(store, RAGSearchService::default(), TaskQueue::new(8));
    let result = indexer.index_simulation(&sim_id).await;
    assert_eq!(result["status"], "skipped");
    assert_eq!(indexer.index_simulation("missing").await["status"], "failed");
}

#[tokio::test]
async fn test_global_documents_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.json");
    let (store, _) = owner_store().await;

    {
        let search = RAGSearchService::new(DocumentIndex::open(&path).unwrap(), EmbeddingService::default());
        let indexer = Indexer::new(store.clone(), search, TaskQueue::new(8));
        let doc = indexer
            .add_scientific_document(
                "Fractal-like aggregates",
                "Soot aggregates formed by diffusion-limited cluster aggregation show a fractal dimension near 1.8.",
                Map::new(),
            )
            .await
            .unwrap();
        let result = indexer.index_scientific_document(&doc.id).await;
        assert_eq!(result["status"], "success", "{}", result);
    }

    let reopened = DocumentIndex::open(&path).unwrap();
    let docs = reopened.documents().await;
    assert_eq!(docs.len(), 1);
    assert!(docs[0].is_global);
    assert_eq!(docs[0].status, DocumentStatus::Ready);
    assert!(!reopened.chunks_for(&docs[0].id).await.is_empty());

    let search = RAGSearchService::new(reopened, EmbeddingService::default());
    let hits = search
        .search("cluster aggregation soot", SearchScope::GlobalOnly, 3, -1.0, Some(&[SourceType::ScientificDoc]))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].document.title, "Fractal-like aggregates");
}

#[tokio::test]
async fn test_index_worker_leaves_compute_tasks_for_external_workers() {
    let (store, project_id) = owner_store().await;
    let sim_id = completed_simulation(&store, project_id).await;
    let queue = TaskQueue::new(8);
    let worker = Indexer::new(store, RAGSearchService::default(), queue.clone()).spawn_worker();

    let run_id = queue.enqueue(RUN_SIMULATION, vec![json!(sim_id)]).await.unwrap();
    let index_id = queue.enqueue(INDEX_SIMULATION, vec![json!(sim_id)]).await.unwrap();

    let mut status = queue.status(&index_id).await.status;
    for _ in 0..200 {
        if status == TaskStatus::Success {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = queue.status(&index_id).await.status;
    }
    assert_eq!(status, TaskStatus::Success);

    // The simulation task is still waiting on its own lane.
    assert_eq!(queue.status(&run_id).await.status, TaskStatus::Pending);
    let handed_off = queue.try_next_in(Lane::Compute).await.unwrap();
    assert_eq!(handed_off.id, run_id);
    assert_eq!(handed_off.name, RUN_SIMULATION);
    worker.abort();
}
