// Aglogen Assistant — Simulation tools
//
// Every run creates a queued simulation record and hands it to the worker
// queue. Results arrive later; `check_task_status` and
// `get_simulation_details` report progress.

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::registration::ToolServices;
use super::{caller, parse_args, with_state, Arguments, HandlerResult, Param, ToolBuilder, ToolDefinition, ToolFailure};
use crate::queue::RUN_SIMULATION;
use crate::store::{Algorithm, Simulation, User};

const MIN_PARTICLES: i64 = 10;
const MAX_PARTICLES: i64 = 100_000;
const MAX_SEED: i64 = 2_147_483_647;

fn run_tool(name: &str, description: &str, doc: &str) -> ToolBuilder {
    ToolBuilder::new(name)
        .description(description)
        .doc(doc)
        .category("simulation")
        .requires_project(true)
        .is_async(true)
        .param(Param::new("project_id", "int | None").with_default())
        .context_param("user")
}

pub fn tools(services: &ToolServices) -> Vec<ToolDefinition> {
    vec![
        run_tool(
            "run_simulation",
            "Run a particle agglomerate simulation with the specified algorithm and parameters",
            "Run a simulation with any supported algorithm.

            Args:
                algorithm: Algorithm to use (dla, cca, ballistic, ballistic_cc, tunable, tunable_cc, limiting).
                n_particles: Number of particles to simulate (10-100000).
                name: Optional display name for the simulation.
                sticking_probability: Probability of particle sticking (0.0-1.0).
                particle_radius: Primary particle radius.
                seed: Random seed for reproducibility.",
        )
        .param(Param::new("algorithm", "str"))
        .param(Param::new("n_particles", "int"))
        .param(Param::new("name", "str | None").with_default())
        .param(Param::new("sticking_probability", "float").with_default())
        .param(Param::new("particle_radius", "float").with_default())
        .param(Param::new("seed", "int | None").with_default())
        .accepts_kwargs()
        .handler(with_state(services.clone(), run_simulation)),
        run_tool(
            "run_dla_simulation",
            "Run a Diffusion-Limited Aggregation (DLA) simulation - particles perform random walks until they stick to the growing cluster",
            "Run a DLA (Diffusion-Limited Aggregation) simulation.

            Args:
                n_particles: Number of particles to simulate (10-100000).
                name: Optional display name.
                sticking_probability: Probability of sticking on contact (0.0-1.0).
                particle_radius: Primary particle radius.
                lattice_size: Size of the simulation lattice.
                seed: Random seed for reproducibility.",
        )
        .param(Param::new("n_particles", "int"))
        .param(Param::new("name", "str | None").with_default())
        .param(Param::new("sticking_probability", "float").with_default())
        .param(Param::new("particle_radius", "float").with_default())
        .param(Param::new("lattice_size", "int").with_default())
        .param(Param::new("seed", "int | None").with_default())
        .handler(with_state(services.clone(), run_dla_simulation)),
        run_tool(
            "run_cca_simulation",
            "Run a Cluster-Cluster Aggregation (CCA) simulation - clusters diffuse and merge to form larger aggregates",
            "Run a CCA (Cluster-Cluster Aggregation) simulation.

            Args:
                n_particles: Number of particles to simulate (10-100000).
                name: Optional display name.
                sticking_probability: Probability of sticking on contact (0.0-1.0).
                particle_radius: Primary particle radius.
                box_size: Size of the simulation box.
                single_agglomerate: Whether to continue until one cluster remains.
                seed: Random seed for reproducibility.",
        )
        .param(Param::new("n_particles", "int"))
        .param(Param::new("name", "str | None").with_default())
        .param(Param::new("sticking_probability", "float").with_default())
        .param(Param::new("particle_radius", "float").with_default())
        .param(Param::new("box_size", "float").with_default())
        .param(Param::new("single_agglomerate", "bool").with_default())
        .param(Param::new("seed", "int | None").with_default())
        .handler(with_state(services.clone(), run_cca_simulation)),
        run_tool(
            "run_ballistic_simulation",
            "Run a Ballistic Particle-Cluster Aggregation simulation - particles travel in straight lines until hitting the cluster",
            "Run a Ballistic Particle-Cluster Aggregation simulation.

            Args:
                n_particles: Number of particles to simulate (10-100000).
                name: Optional display name.
                sticking_probability: Probability of sticking on contact (0.0-1.0).
                particle_radius: Primary particle radius.
                seed: Random seed for reproducibility.",
        )
        .param(Param::new("n_particles", "int"))
        .param(Param::new("name", "str | None").with_default())
        .param(Param::new("sticking_probability", "float").with_default())
        .param(Param::new("particle_radius", "float").with_default())
        .param(Param::new("seed", "int | None").with_default())
        .handler(with_state(services.clone(), run_ballistic_simulation)),
        run_tool(
            "run_ballistic_cc_simulation",
            "Run a Ballistic Cluster-Cluster Aggregation simulation - clusters travel ballistically and merge",
            "Run a Ballistic Cluster-Cluster Aggregation simulation.

            Args:
                n_particles: Number of particles to simulate (10-100000).
                name: Optional display name.
                sticking_probability: Probability of sticking on contact (0.0-1.0).
                particle_radius: Primary particle radius.
                seed: Random seed for reproducibility.",
        )
        .param(Param::new("n_particles", "int"))
        .param(Param::new("name", "str | None").with_default())
        .param(Param::new("sticking_probability", "float").with_default())
        .param(Param::new("particle_radius", "float").with_default())
        .param(Param::new("seed", "int | None").with_default())
        .handler(with_state(services.clone(), run_ballistic_cc_simulation)),
        run_tool(
            "run_tunable_simulation",
            "Run a Tunable simulation with controllable fractal dimension - specify target Df and kf values",
            "Run a Tunable simulation with controllable fractal dimension.

            Args:
                n_particles: Number of particles to simulate (10-100000).
                target_df: Target fractal dimension (typically 1.0-3.0).
                name: Optional display name.
                target_kf: Target prefactor (typically 1.0-2.0).
                particle_radius: Primary particle radius.
                seed: Random seed for reproducibility.",
        )
        .param(Param::new("n_particles", "int"))
        .param(Param::new("target_df", "float"))
        .param(Param::new("name", "str | None").with_default())
        .param(Param::new("target_kf", "float").with_default())
        .param(Param::new("particle_radius", "float").with_default())
        .param(Param::new("seed", "int | None").with_default())
        .handler(with_state(services.clone(), run_tunable_simulation)),
        run_tool(
            "run_limiting_case",
            "Generate a deterministic limiting case geometry (chain, plane, or sphere) with known fractal dimension",
            "Generate a deterministic limiting case geometry.

            Args:
                geometry_type: Type of geometry (chain, plane, sphere).
                n_particles: Target number of particles.
                name: Optional display name.
                configuration_type: Specific configuration within geometry type.
                packing: Packing type (HC=Hexagonal Compact, CS=Cubic Simple, CCC=FCC).
                layers: Number of layers (alternative to n_particles).
                particle_radius: Primary particle radius.
                sintering_coeff: Sintering coefficient (1.0=touching, <1.0=overlapping).",
        )
        .param(Param::new("geometry_type", "str"))
        .param(Param::new("n_particles", "int"))
        .param(Param::new("name", "str | None").with_default())
        .param(Param::new("configuration_type", "str | None").with_default())
        .param(Param::new("packing", "str").with_default())
        .param(Param::new("layers", "int | None").with_default())
        .param(Param::new("particle_radius", "float").with_default())
        .param(Param::new("sintering_coeff", "float").with_default())
        .handler(with_state(services.clone(), run_limiting_case)),
    ]
}

// ---------------------------------------------------------------------------
// Shared run path
// ---------------------------------------------------------------------------

fn one() -> f64 {
    1.0
}

fn check_particles(n_particles: i64) -> Result<(), ToolFailure> {
    if !(MIN_PARTICLES..=MAX_PARTICLES).contains(&n_particles) {
        return Err(ToolFailure::value(format!(
            "n_particles must be between {} and {}",
            MIN_PARTICLES, MAX_PARTICLES
        )));
    }
    Ok(())
}

fn check_sticking(p: f64) -> Result<(), ToolFailure> {
    if !(0.0..=1.0).contains(&p) {
        return Err(ToolFailure::value("sticking_probability must be between 0.0 and 1.0"));
    }
    Ok(())
}

fn require_project(project_id: Option<i64>) -> Result<i64, ToolFailure> {
    project_id.ok_or_else(|| ToolFailure::value("project_id is required"))
}

/// A zero or missing seed is replaced by a random one in `1..=2^31-1`.
fn resolve_seed(parameters: &mut Map<String, Value>) -> i64 {
    parameters
        .remove("seed")
        .and_then(|v| v.as_i64())
        .filter(|s| *s != 0)
        .unwrap_or_else(|| rand::rng().random_range(1..=MAX_SEED))
}

/// Create the simulation record and enqueue its run task.
pub(crate) async fn queue_simulation(
    s: &ToolServices,
    user: &User,
    project_id: i64,
    algorithm: &str,
    mut parameters: Map<String, Value>,
    name: Option<String>,
) -> Result<Simulation, ToolFailure> {
    s.store
        .read(|d| d.writable_project(user, project_id).map(|_| ()))
        .await?;

    let algorithm = Algorithm::parse(algorithm).ok_or_else(|| {
        ToolFailure::value(format!(
            "Invalid algorithm '{}'. Valid options: {}",
            algorithm,
            Algorithm::codes().join(", ")
        ))
    })?;

    let seed = resolve_seed(&mut parameters);
    let mut sim = Simulation::new(project_id, algorithm, parameters, seed);
    sim.name = name.unwrap_or_default();
    let id = sim.id.clone();
    s.store.insert_simulation(sim).await?;

    let task_id = match s.queue.enqueue(RUN_SIMULATION, vec![json!(id)]).await {
        Ok(task_id) => task_id,
        Err(e) => {
            s.store
                .write(|d| {
                    d.simulations.remove(&id);
                    Ok(())
                })
                .await?;
            return Err(e.into());
        }
    };
    let sim = s
        .store
        .update_simulation(&id, |sim| sim.task_id = task_id)
        .await?;

    tracing::info!(
        simulation_id = %sim.id,
        algorithm = %sim.algorithm.as_str(),
        task_id = %sim.task_id,
        "Simulation queued"
    );
    Ok(sim)
}

fn queued(sim: &Simulation, n_particles: i64, message: String) -> Value {
    json!({
        "status": "queued",
        "simulation_id": sim.id,
        "task_id": sim.task_id,
        "algorithm": sim.algorithm,
        "n_particles": n_particles,
        "message": message,
    })
}

fn with_seed(mut parameters: Map<String, Value>, seed: Option<i64>) -> Map<String, Value> {
    if let Some(seed) = seed {
        parameters.insert("seed".into(), json!(seed));
    }
    parameters
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RunArgs {
    algorithm: String,
    n_particles: i64,
    project_id: Option<i64>,
    name: Option<String>,
    #[serde(default = "one")]
    sticking_probability: f64,
    #[serde(default = "one")]
    particle_radius: f64,
    seed: Option<i64>,
    user: Option<User>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

async fn run_simulation(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: RunArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = require_project(a.project_id)?;
    check_particles(a.n_particles)?;
    check_sticking(a.sticking_probability)?;

    let mut parameters = Map::new();
    parameters.insert("n_particles".into(), json!(a.n_particles));
    parameters.insert("sticking_probability".into(), json!(a.sticking_probability));
    parameters.insert("particle_radius".into(), json!(a.particle_radius));
    parameters.extend(a.extra);
    let parameters = with_seed(parameters, a.seed);

    let sim = queue_simulation(&s, &user, project_id, &a.algorithm, parameters, a.name).await?;
    let message = format!(
        "{} simulation queued with {} particles",
        sim.algorithm.display_name(),
        a.n_particles
    );
    Ok(queued(&sim, a.n_particles, message).into())
}

#[derive(Deserialize)]
struct DlaArgs {
    n_particles: i64,
    project_id: Option<i64>,
    name: Option<String>,
    #[serde(default = "one")]
    sticking_probability: f64,
    #[serde(default = "one")]
    particle_radius: f64,
    #[serde(default = "default_lattice")]
    lattice_size: i64,
    seed: Option<i64>,
    user: Option<User>,
}

fn default_lattice() -> i64 {
    200
}

async fn run_dla_simulation(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: DlaArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = require_project(a.project_id)?;
    check_particles(a.n_particles)?;
    check_sticking(a.sticking_probability)?;

    let parameters = with_seed(
        super::obj(json!({
            "n_particles": a.n_particles,
            "sticking_probability": a.sticking_probability,
            "particle_radius": a.particle_radius,
            "lattice_size": a.lattice_size,
        })),
        a.seed,
    );
    let sim = queue_simulation(&s, &user, project_id, "dla", parameters, a.name).await?;
    let message = format!("DLA simulation queued with {} particles", a.n_particles);
    Ok(queued(&sim, a.n_particles, message).into())
}

#[derive(Deserialize)]
struct CcaArgs {
    n_particles: i64,
    project_id: Option<i64>,
    name: Option<String>,
    #[serde(default = "one")]
    sticking_probability: f64,
    #[serde(default = "one")]
    particle_radius: f64,
    #[serde(default = "default_box")]
    box_size: f64,
    #[serde(default = "default_single")]
    single_agglomerate: bool,
    seed: Option<i64>,
    user: Option<User>,
}

fn default_box() -> f64 {
    100.0
}

fn default_single() -> bool {
    true
}

async fn run_cca_simulation(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: CcaArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = require_project(a.project_id)?;
    check_particles(a.n_particles)?;
    check_sticking(a.sticking_probability)?;

    let parameters = with_seed(
        super::obj(json!({
            "n_particles": a.n_particles,
            "sticking_probability": a.sticking_probability,
            "particle_radius": a.particle_radius,
            "box_size": a.box_size,
            "single_agglomerate": a.single_agglomerate,
        })),
        a.seed,
    );
    let sim = queue_simulation(&s, &user, project_id, "cca", parameters, a.name).await?;
    let message = format!("CCA simulation queued with {} particles", a.n_particles);
    Ok(queued(&sim, a.n_particles, message).into())
}

#[derive(Deserialize)]
struct BallisticArgs {
    n_particles: i64,
    project_id: Option<i64>,
    name: Option<String>,
    #[serde(default = "one")]
    sticking_probability: f64,
    #[serde(default = "one")]
    particle_radius: f64,
    seed: Option<i64>,
    user: Option<User>,
}

async fn run_ballistic(s: ToolServices, args: Arguments, algorithm: &str, label: &str) -> HandlerResult {
    let a: BallisticArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = require_project(a.project_id)?;
    check_particles(a.n_particles)?;
    check_sticking(a.sticking_probability)?;

    let parameters = with_seed(
        super::obj(json!({
            "n_particles": a.n_particles,
            "sticking_probability": a.sticking_probability,
            "particle_radius": a.particle_radius,
        })),
        a.seed,
    );
    let sim = queue_simulation(&s, &user, project_id, algorithm, parameters, a.name).await?;
    let message = format!("{} simulation queued with {} particles", label, a.n_particles);
    Ok(queued(&sim, a.n_particles, message).into())
}

async fn run_ballistic_simulation(s: ToolServices, args: Arguments) -> HandlerResult {
    run_ballistic(s, args, "ballistic", "Ballistic").await
}

async fn run_ballistic_cc_simulation(s: ToolServices, args: Arguments) -> HandlerResult {
    run_ballistic(s, args, "ballistic_cc", "Ballistic CC").await
}

#[derive(Deserialize)]
struct TunableArgs {
    n_particles: i64,
    target_df: f64,
    project_id: Option<i64>,
    name: Option<String>,
    #[serde(default = "default_kf")]
    target_kf: f64,
    #[serde(default = "one")]
    particle_radius: f64,
    seed: Option<i64>,
    user: Option<User>,
}

fn default_kf() -> f64 {
    1.3
}

async fn run_tunable_simulation(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: TunableArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = require_project(a.project_id)?;
    check_particles(a.n_particles)?;
    if !(1.0..=3.0).contains(&a.target_df) {
        return Err(ToolFailure::value("target_df must be between 1.0 and 3.0"));
    }

    let parameters = with_seed(
        super::obj(json!({
            "n_particles": a.n_particles,
            "target_df": a.target_df,
            "target_kf": a.target_kf,
            "particle_radius": a.particle_radius,
        })),
        a.seed,
    );
    let sim = queue_simulation(&s, &user, project_id, "tunable", parameters, a.name).await?;
    let mut out = queued(
        &sim,
        a.n_particles,
        format!(
            "Tunable simulation queued with {} particles, target Df={}",
            a.n_particles, a.target_df
        ),
    );
    out["target_df"] = json!(a.target_df);
    Ok(out.into())
}

#[derive(Deserialize)]
struct LimitingArgs {
    geometry_type: String,
    n_particles: i64,
    project_id: Option<i64>,
    name: Option<String>,
    configuration_type: Option<String>,
    #[serde(default = "default_packing")]
    packing: String,
    layers: Option<i64>,
    #[serde(default = "one")]
    particle_radius: f64,
    #[serde(default = "one")]
    sintering_coeff: f64,
    user: Option<User>,
}

fn default_packing() -> String {
    "HC".into()
}

/// Theoretical fractal dimension of each limiting geometry.
fn expected_df(geometry_type: &str) -> Option<f64> {
    match geometry_type {
        "chain" => Some(1.0),
        "plane" => Some(2.0),
        "sphere" => Some(3.0),
        _ => None,
    }
}

async fn run_limiting_case(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: LimitingArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = require_project(a.project_id)?;

    let geometry = a.geometry_type.to_lowercase();
    let expected = expected_df(&geometry).ok_or_else(|| {
        ToolFailure::value(format!(
            "Invalid geometry_type '{}'. Valid options: chain, plane, sphere",
            a.geometry_type
        ))
    })?;

    let mut parameters = super::obj(json!({
        "n_particles": a.n_particles,
        "geometry_type": geometry,
        "packing": a.packing.to_uppercase(),
        "particle_radius": a.particle_radius,
        "sintering_coeff": a.sintering_coeff,
    }));
    if let Some(config) = a.configuration_type.filter(|c| !c.is_empty()) {
        parameters.insert("configuration_type".into(), json!(config));
    }
    if let Some(layers) = a.layers {
        parameters.insert("layers".into(), json!(layers));
    }

    let sim = queue_simulation(&s, &user, project_id, "limiting", parameters, a.name).await?;
    Ok(json!({
        "status": "queued",
        "simulation_id": sim.id,
        "task_id": sim.task_id,
        "algorithm": "limiting",
        "geometry_type": a.geometry_type,
        "expected_df": expected,
        "message": format!(
            "Limiting case ({}, Df={:.1}) queued with ~{} particles",
            a.geometry_type, expected, a.n_particles
        ),
    })
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskStatus;
    use crate::store::{Role, Status};
    use crate::queue::TaskQueue;
    use crate::tool::registration::test_support::{args, fixture, fixture_with_queue};
    use crate::tool::ErrorKind;

    #[tokio::test]
    async fn test_run_simulation_queues_task() {
        let fx = fixture().await;
        let result = fx
            .exec(Some(fx.project_id))
            .execute(
                "run_simulation",
                args(json!({"algorithm": "DLA", "n_particles": 500, "lattice_size": 300})),
            )
            .await;
        let data = result.data().unwrap();
        assert_eq!(data["status"], "queued");
        assert_eq!(data["algorithm"], "dla");
        assert_eq!(
            data["message"],
            "Diffusion-Limited Aggregation simulation queued with 500 particles"
        );

        let sim_id = data["simulation_id"].as_str().unwrap();
        let sim = fx.services.store.simulation(sim_id).await.unwrap();
        assert_eq!(sim.status, Status::Queued);
        assert_eq!(sim.parameters["lattice_size"], 300);
        assert_eq!(sim.parameters["sticking_probability"], 1.0);
        assert!(!sim.parameters.contains_key("user"));
        assert!(!sim.parameters.contains_key("project_id"));
        assert!((1..=MAX_SEED).contains(&sim.seed));

        let task = fx.services.queue.status(&sim.task_id).await;
        assert_eq!(task.name, RUN_SIMULATION);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.args, vec![json!(sim_id)]);
    }

    #[tokio::test]
    async fn test_explicit_seed_is_kept() {
        let fx = fixture().await;
        let result = fx
            .exec(Some(fx.project_id))
            .execute("run_cca_simulation", args(json!({"n_particles": 50, "seed": 1234})))
            .await;
        let id = result.data().unwrap()["simulation_id"].as_str().unwrap().to_string();
        let sim = fx.services.store.simulation(&id).await.unwrap();
        assert_eq!(sim.seed, 1234);
        assert!(!sim.parameters.contains_key("seed"));
        assert_eq!(sim.parameters["single_agglomerate"], true);
    }

    #[tokio::test]
    async fn test_range_checks() {
        let fx = fixture().await;
        let exec = fx.exec(Some(fx.project_id));

        let r = exec
            .execute("run_simulation", args(json!({"algorithm": "dla", "n_particles": 5})))
            .await;
        assert_eq!(r.error().unwrap().message, "n_particles must be between 10 and 100000");

        let r = exec
            .execute(
                "run_simulation",
                args(json!({"algorithm": "dla", "n_particles": 50, "sticking_probability": 1.5})),
            )
            .await;
        assert_eq!(r.error().unwrap().error_type, ErrorKind::Value);

        let r = exec
            .execute("run_simulation", args(json!({"algorithm": "vortex", "n_particles": 50})))
            .await;
        assert!(r.error().unwrap().message.starts_with("Invalid algorithm 'vortex'"));

        let r = exec
            .execute("run_tunable_simulation", args(json!({"n_particles": 50, "target_df": 3.5})))
            .await;
        assert_eq!(r.error().unwrap().message, "target_df must be between 1.0 and 3.0");
    }

    #[tokio::test]
    async fn test_requires_project_context() {
        let fx = fixture().await;
        let r = fx
            .exec(None)
            .execute("run_dla_simulation", args(json!({"n_particles": 50})))
            .await;
        assert_eq!(r.error().unwrap().error_type, ErrorKind::Context);
    }

    #[tokio::test]
    async fn test_viewer_cannot_run() {
        let fx = fixture().await;
        fx.services
            .store
            .share_project(fx.project_id, fx.stranger.id, Role::Viewer)
            .await
            .unwrap();
        let r = fx
            .exec_as(fx.stranger.clone(), Some(fx.project_id))
            .execute("run_ballistic_simulation", args(json!({"n_particles": 50})))
            .await;
        assert_eq!(r.error().unwrap().error_type, ErrorKind::Permission);
        assert!(fx.services.queue.tasks_named(RUN_SIMULATION).await.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_leaves_no_orphan_simulation() {
        let fx = fixture_with_queue(TaskQueue::new(1)).await;
        let exec = fx.exec(Some(fx.project_id));
        let first = exec.execute("run_dla_simulation", args(json!({"n_particles": 50}))).await;
        assert!(first.is_success());

        let second = exec.execute("run_dla_simulation", args(json!({"n_particles": 50}))).await;
        let err = second.error().unwrap();
        assert_eq!(err.error_type, ErrorKind::Internal);
        assert!(err.recoverable);
        assert!(err.message.starts_with("Task queue is full"));
        assert_eq!(fx.services.store.read(|d| d.simulations.len()).await, 1);
        assert_eq!(fx.services.queue.tasks_named(RUN_SIMULATION).await.len(), 1);
    }

    #[tokio::test]
    async fn test_limiting_case() {
        let fx = fixture().await;
        let r = fx
            .exec(Some(fx.project_id))
            .execute(
                "run_limiting_case",
                args(json!({"geometry_type": "Plane", "n_particles": 100, "packing": "cs", "layers": 2})),
            )
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["expected_df"], 2.0);
        assert_eq!(data["message"], "Limiting case (Plane, Df=2.0) queued with ~100 particles");
        let sim = fx
            .services
            .store
            .simulation(data["simulation_id"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(sim.parameters["geometry_type"], "plane");
        assert_eq!(sim.parameters["packing"], "CS");
        assert_eq!(sim.parameters["layers"], 2);

        let bad = fx
            .exec(Some(fx.project_id))
            .execute("run_limiting_case", args(json!({"geometry_type": "torus", "n_particles": 100})))
            .await;
        assert_eq!(bad.error().unwrap().error_type, ErrorKind::Value);
    }

    #[tokio::test]
    async fn test_async_relabel() {
        let fx = fixture().await;
        let exec = fx.exec(Some(fx.project_id));
        let r = exec
            .execute_async("run_ballistic_cc_simulation", args(json!({"n_particles": 20})))
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["status"], "completed");
        assert_eq!(data["task_id"], format!("sync-{}", exec.context().request_id));
        assert_eq!(data["result"]["algorithm"], "ballistic_cc");
    }
}
