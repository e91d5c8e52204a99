// Aglogen Assistant — Tool registration

use std::sync::Arc;

use super::{analysis, knowledge, simulation, study, utility, ToolDefinition, ToolRegistry};
use crate::engine::{FractalEngine, SampledBoxCounter};
use crate::queue::TaskQueue;
use crate::rag::RAGSearchService;
use crate::store::Store;

/// Shared handles every tool handler receives.
#[derive(Clone)]
pub struct ToolServices {
    pub store: Store,
    pub queue: TaskQueue,
    pub engine: Arc<dyn FractalEngine>,
    pub search: RAGSearchService,
}

impl ToolServices {
    pub fn new(store: Store, queue: TaskQueue, search: RAGSearchService) -> Self {
        Self {
            store,
            queue,
            engine: Arc::new(SampledBoxCounter),
            search,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn FractalEngine>) -> Self {
        self.engine = engine;
        self
    }
}

/// Every tool definition, grouped by collection.
pub fn all_tools(services: &ToolServices) -> Vec<ToolDefinition> {
    let mut tools = utility::tools(services);
    tools.extend(simulation::tools(services));
    tools.extend(study::tools(services));
    tools.extend(analysis::tools(services));
    tools.extend(knowledge::tools(services));
    tools
}

/// Register all tools and return how many the registry now holds.
pub async fn register_all_tools(registry: &ToolRegistry, services: &ToolServices) -> usize {
    for tool in all_tools(services) {
        registry.register(tool).await;
    }
    let count = registry.len().await;
    tracing::info!(count, "Registered AI tools");
    count
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use serde_json::{json, Value};

    use super::*;
    use crate::store::{Algorithm, Simulation, Status, User};
    use crate::tool::{Arguments, ToolContext, ToolExecutor};

    pub(crate) fn args(value: Value) -> Arguments {
        match value {
            Value::Object(m) => m,
            _ => Arguments::new(),
        }
    }

    /// A seeded store, a registry holding every tool and two users: the
    /// project owner and a stranger with no access.
    pub(crate) struct Fixture {
        pub services: ToolServices,
        pub registry: ToolRegistry,
        pub owner: User,
        pub stranger: User,
        pub project_id: i64,
    }

    pub(crate) async fn fixture() -> Fixture {
        fixture_with_queue(TaskQueue::new(4096)).await
    }

    pub(crate) async fn fixture_with_queue(queue: TaskQueue) -> Fixture {
        let services = ToolServices::new(Store::new(), queue, RAGSearchService::default());
        let owner = User::new(1, "alice");
        let stranger = User::new(2, "mallory");
        services.store.add_user(owner.clone()).await.unwrap();
        services.store.add_user(stranger.clone()).await.unwrap();
        let project = services
            .store
            .create_project(owner.id, "Soot aggregates", "Flame soot morphology")
            .await
            .unwrap();

        let registry = ToolRegistry::new();
        register_all_tools(&registry, &services).await;

        Fixture {
            services,
            registry,
            owner,
            stranger,
            project_id: project.id,
        }
    }

    impl Fixture {
        pub fn exec(&self, project_id: Option<i64>) -> ToolExecutor {
            self.exec_as(self.owner.clone(), project_id)
        }

        pub fn exec_as(&self, user: User, project_id: Option<i64>) -> ToolExecutor {
            ToolExecutor::new(self.registry.clone(), ToolContext::new(user).with_project(project_id))
        }

        /// Insert a completed simulation with a small geometry; `rg` is derived
        /// from `df` so rows differ.
        pub async fn completed_simulation(&self, algorithm: Algorithm, parameters: Value, df: f64) -> String {
            let mut sim = Simulation::new(self.project_id, algorithm, args(parameters), 42);
            let rg = round_rg(df);
            sim.status = Status::Completed;
            sim.metrics = Some(args(json!({
                "n_particles": sim.n_particles(),
                "df": df,
                "kf": 1.3,
                "rg": rg,
                "fractal_dimension": df,
                "radius_of_gyration": rg,
            })));
            sim.geometry = Some(
                (0..64)
                    .map(|i| {
                        let t = i as f64;
                        [t * 2.0, (t * 0.7).sin() * 4.0, (t * 0.3).cos() * 4.0, 1.0]
                    })
                    .collect(),
            );
            sim.started_at = Some(Utc::now());
            sim.completed_at = Some(Utc::now());
            sim.execution_time_ms = Some(120);
            let id = sim.id.clone();
            self.services.store.insert_simulation(sim).await.unwrap();
            id
        }
    }

    fn round_rg(df: f64) -> f64 {
        crate::tool::round_to(10.0 / df, 4)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::fixture;
    use super::*;

    #[tokio::test]
    async fn test_register_all_tools() {
        let fx = fixture().await;
        let names = fx.registry.names().await;
        for name in [
            "list_algorithms",
            "run_simulation",
            "run_limiting_case",
            "create_parametric_study",
            "cancel_study",
            "run_box_counting",
            "compare_simulations",
            "search_knowledge_base",
            "get_analysis_insights",
        ] {
            assert!(names.contains(&name.to_string()), "missing {}", name);
        }
        assert_eq!(names.len(), all_tools(&fx.services).len());

        let categories = fx.registry.get_categories().await;
        assert_eq!(categories, vec!["analysis", "knowledge", "simulation", "study", "utility"]);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let fx = fixture().await;
        let before = fx.registry.len().await;
        assert_eq!(register_all_tools(&fx.registry, &fx.services).await, before);
    }
}
