// Aglogen Assistant — Parametric study tools

use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

use super::registration::ToolServices;
use super::{caller, parse_args, round_to, with_state, Arguments, HandlerResult, Param, ToolBuilder, ToolDefinition, ToolFailure};
use crate::queue::RUN_SIMULATION;
use crate::store::{Algorithm, ParametricStudy, Simulation, Status, StoreError, User};

const MAX_STUDY_SIMULATIONS: usize = 10_000;

pub fn tools(services: &ToolServices) -> Vec<ToolDefinition> {
    vec![
        ToolBuilder::new("create_parametric_study")
            .description("Create a parametric study that runs multiple simulations varying specified parameters")
            .doc(
                "Create and launch a parametric study.

                Args:
                    name: Display name for the study.
                    algorithm: Algorithm to use (dla, cca, ballistic, etc.).
                    base_parameters: Fixed parameters for all simulations.
                    parameter_grid: Parameters to vary {param_name: [value1, value2, ...]}.
                    description: Optional description of the study purpose.
                    seeds_per_combination: Number of random seeds per parameter combination.
                    include_box_counting: Whether to run box-counting analysis.
                    box_counting_params: Box-counting configuration.",
            )
            .category("study")
            .requires_project(true)
            .is_async(true)
            .param(Param::new("name", "str"))
            .param(Param::new("algorithm", "str"))
            .param(Param::new("base_parameters", "dict[str, Any]"))
            .param(Param::new("parameter_grid", "dict[str, list[Any]]"))
            .param(Param::new("project_id", "int | None").with_default())
            .param(Param::new("description", "str").with_default())
            .param(Param::new("seeds_per_combination", "int").with_default())
            .param(Param::new("include_box_counting", "bool").with_default())
            .param(Param::new("box_counting_params", "dict[str, Any] | None").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), create_parametric_study)),
        ToolBuilder::new("get_study_status")
            .description("Get the current status and progress of a parametric study")
            .doc(
                "Get status and progress of a parametric study.

                Args:
                    study_id: UUID of the parametric study.",
            )
            .category("study")
            .param(Param::new("study_id", "str"))
            .context_param("user")
            .handler(with_state(services.clone(), get_study_status)),
        ToolBuilder::new("get_study_results")
            .description("Get aggregated results from a completed parametric study")
            .doc(
                "Get results from a completed parametric study.

                Args:
                    study_id: UUID of the parametric study.
                    include_individual: Whether to include individual simulation results.",
            )
            .category("study")
            .param(Param::new("study_id", "str"))
            .param(Param::new("include_individual", "bool").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), get_study_results)),
        ToolBuilder::new("list_studies")
            .description("List all parametric studies in a project")
            .doc(
                "List parametric studies in a project.

                Args:
                    status_filter: Optional filter by status (queued, running, completed, failed).
                    limit: Maximum number of studies to return (default 20).",
            )
            .category("study")
            .requires_project(true)
            .param(Param::new("project_id", "int | None").with_default())
            .param(Param::new("status_filter", "str | None").with_default())
            .param(Param::new("limit", "int").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), list_studies)),
        ToolBuilder::new("cancel_study")
            .description("Cancel a running parametric study and its pending simulations")
            .doc(
                "Cancel a parametric study.

                Args:
                    study_id: UUID of the parametric study.",
            )
            .category("study")
            .param(Param::new("study_id", "str"))
            .context_param("user")
            .handler(with_state(services.clone(), cancel_study)),
    ]
}

/// Cartesian product of the grid, in key order.
fn combinations(grid: &Map<String, Value>) -> Result<Vec<Map<String, Value>>, ToolFailure> {
    let mut out = vec![Map::new()];
    for (key, values) in grid {
        let values = values
            .as_array()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ToolFailure::value(format!("parameter_grid['{}'] must be a non-empty list", key)))?;
        out = out
            .into_iter()
            .flat_map(|combo| {
                values.iter().map(move |v| {
                    let mut next = combo.clone();
                    next.insert(key.clone(), v.clone());
                    next
                })
            })
            .collect();
    }
    Ok(out)
}

fn describe_combo(combo: &Map<String, Value>) -> String {
    combo
        .iter()
        .map(|(k, v)| format!("{}={}", k, crate::rag::chunking::plain(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn varied(study: &ParametricStudy) -> Vec<&String> {
    study.parameter_grid.keys().collect()
}

#[derive(Deserialize)]
struct CreateArgs {
    name: String,
    algorithm: String,
    base_parameters: Map<String, Value>,
    parameter_grid: Map<String, Value>,
    project_id: Option<i64>,
    #[serde(default)]
    description: String,
    #[serde(default = "one_seed")]
    seeds_per_combination: u32,
    #[serde(default)]
    include_box_counting: bool,
    box_counting_params: Option<Value>,
    user: Option<User>,
}

fn one_seed() -> u32 {
    1
}

async fn create_parametric_study(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: CreateArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = a.project_id.ok_or_else(|| ToolFailure::value("project_id is required"))?;

    s.store
        .read(|d| d.writable_project(&user, project_id).map(|_| ()))
        .await?;

    let algorithm = Algorithm::parse(&a.algorithm).ok_or_else(|| {
        ToolFailure::value(format!(
            "Invalid algorithm '{}'. Valid options: {}",
            a.algorithm,
            Algorithm::codes().join(", ")
        ))
    })?;
    if a.parameter_grid.is_empty() {
        return Err(ToolFailure::value("parameter_grid must specify at least one parameter to vary"));
    }
    if a.seeds_per_combination == 0 {
        return Err(ToolFailure::value("seeds_per_combination must be at least 1"));
    }

    let combos = combinations(&a.parameter_grid)?;
    let total = combos.len() * a.seeds_per_combination as usize;
    if total > MAX_STUDY_SIMULATIONS {
        return Err(ToolFailure::value(format!(
            "Study would create {} simulations. Maximum is {}. Reduce parameter grid or seeds_per_combination.",
            total, MAX_STUDY_SIMULATIONS
        )));
    }

    let mut sims = Vec::with_capacity(total);
    {
        let mut rng = rand::rng();
        for combo in &combos {
            let mut params = a.base_parameters.clone();
            params.extend(combo.clone());
            for seed_idx in 0..a.seeds_per_combination {
                let seed = rng.random_range(1..=2_147_483_647i64);
                let mut sim = Simulation::new(project_id, algorithm, params.clone(), seed);
                sim.name = format!("{} - {} - seed {}", a.name, describe_combo(combo), seed_idx + 1);
                sims.push(sim);
            }
        }
    }

    let study = ParametricStudy {
        id: uuid::Uuid::new_v4().to_string(),
        project_id,
        name: a.name.clone(),
        description: a.description,
        base_algorithm: algorithm,
        base_parameters: a.base_parameters,
        parameter_grid: a.parameter_grid,
        seeds_per_combination: a.seeds_per_combination,
        include_box_counting: a.include_box_counting,
        box_counting_params: a.box_counting_params,
        simulation_ids: sims.iter().map(|sim| sim.id.clone()).collect(),
        status: Status::Running,
        created_at: Utc::now(),
        completed_at: None,
    };
    let study_id = study.id.clone();
    let varied_parameters: Vec<String> = study.parameter_grid.keys().cloned().collect();

    for i in 0..sims.len() {
        match s.queue.enqueue(RUN_SIMULATION, vec![json!(sims[i].id)]).await {
            Ok(task_id) => sims[i].task_id = task_id,
            Err(e) => {
                // Nothing is stored yet; take back the tasks already handed out.
                for sim in &sims[..i] {
                    s.queue.revoke(&sim.task_id).await;
                }
                return Err(e.into());
            }
        }
    }
    s.store
        .write(move |d| {
            for sim in sims {
                d.simulations.insert(sim.id.clone(), sim);
            }
            d.studies.insert(study.id.clone(), study);
            d.touch_project(project_id);
            Ok(())
        })
        .await?;

    tracing::info!(study_id = %study_id, simulations = total, "Parametric study created");
    Ok(json!({
        "status": "running",
        "study_id": study_id,
        "study_name": a.name,
        "algorithm": algorithm,
        "total_simulations": total,
        "parameter_combinations": combos.len(),
        "seeds_per_combination": a.seeds_per_combination,
        "varied_parameters": varied_parameters,
        "message": format!("Parametric study '{}' created with {} simulations", a.name, total),
    })
    .into())
}

#[derive(Deserialize)]
struct StudyArgs {
    study_id: String,
    user: Option<User>,
}

async fn get_study_status(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: StudyArgs = parse_args(args)?;
    let user = caller(a.user)?;

    let out = s
        .store
        .read(|d| -> Result<Value, StoreError> {
            let study = d.readable_study(&user, &a.study_id)?;
            let sims = d.study_simulations(study);
            let total = sims.len();
            let count = |st: Status| sims.iter().filter(|sim| sim.status == st).count();

            let mut breakdown = Map::new();
            for st in Status::ALL {
                breakdown.insert(st.as_str().to_string(), json!(count(st)));
            }
            let completed = count(Status::Completed);
            let failed = count(Status::Failed);
            let progress = if total > 0 {
                round_to((completed + failed) as f64 / total as f64 * 100.0, 1)
            } else {
                0.0
            };

            let overall = if completed + failed == total {
                if failed == 0 {
                    "completed"
                } else {
                    "completed_with_errors"
                }
            } else if count(Status::Running) > 0 || count(Status::Queued) > 0 {
                "running"
            } else {
                study.status.as_str()
            };

            Ok(json!({
                "study_id": study.id,
                "study_name": study.name,
                "status": overall,
                "progress_percent": progress,
                "total_simulations": total,
                "status_breakdown": breakdown,
                "algorithm": study.base_algorithm,
                "varied_parameters": varied(study),
                "created_at": study.created_at.to_rfc3339(),
            }))
        })
        .await?;
    Ok(out.into())
}

#[derive(Deserialize)]
struct ResultsArgs {
    study_id: String,
    #[serde(default)]
    include_individual: bool,
    user: Option<User>,
}

/// Total order over JSON scalars: numbers numerically, then strings, then
/// anything else by its text.
fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.to_string().cmp(&b.to_string()),
    }
}

fn min_max_mean(values: &[f64], places: i32) -> Value {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    json!({
        "min": round_to(min, places),
        "max": round_to(max, places),
        "mean": round_to(mean, places),
    })
}

async fn get_study_results(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: ResultsArgs = parse_args(args)?;
    let user = caller(a.user)?;

    let out = s
        .store
        .read(|d| -> Result<Value, StoreError> {
            let study = d.readable_study(&user, &a.study_id)?;
            let all = d.study_simulations(study);
            let completed: Vec<&Simulation> = all
                .iter()
                .copied()
                .filter(|sim| sim.status == Status::Completed && sim.metrics.as_ref().is_some_and(|m| !m.is_empty()))
                .collect();

            if completed.is_empty() {
                return Ok(json!({
                    "study_id": study.id,
                    "study_name": study.name,
                    "status": "no_completed_simulations",
                    "message": "No simulations have completed yet with metrics available",
                }));
            }

            let mut individual = Vec::with_capacity(completed.len());
            let mut used: Map<String, Value> = Map::new();
            for key in study.parameter_grid.keys() {
                let mut values: Vec<Value> = Vec::new();
                for sim in &completed {
                    if let Some(v) = sim.parameters.get(key) {
                        if !values.contains(v) {
                            values.push(v.clone());
                        }
                    }
                }
                values.sort_by(cmp_values);
                used.insert(key.clone(), Value::Array(values));
            }
            for sim in &completed {
                let mut entry = Map::new();
                entry.insert("simulation_id".into(), json!(sim.id));
                entry.insert("parameters".into(), Value::Object(sim.parameters.clone()));
                if let Some(metrics) = &sim.metrics {
                    entry.extend(metrics.clone());
                }
                individual.push(Value::Object(entry));
            }

            let nonzero = |key: &str| -> Vec<f64> {
                completed
                    .iter()
                    .filter_map(|sim| sim.metric_f64(key))
                    .filter(|v| *v != 0.0)
                    .collect()
            };
            let df = nonzero("fractal_dimension");
            let rg = nonzero("radius_of_gyration");

            let mut summary = json!({
                "completed_simulations": completed.len(),
                "total_simulations": all.len(),
            });
            if !df.is_empty() {
                summary["fractal_dimension"] = min_max_mean(&df, 3);
            }
            if !rg.is_empty() {
                summary["radius_of_gyration"] = min_max_mean(&rg, 3);
            }

            let mut result = json!({
                "study_id": study.id,
                "study_name": study.name,
                "algorithm": study.base_algorithm,
                "varied_parameters": varied(study),
                "parameter_values_used": used,
                "summary": summary,
            });
            if a.include_individual {
                result["individual_results"] = Value::Array(individual);
            }
            Ok(result)
        })
        .await?;
    Ok(out.into())
}

#[derive(Deserialize)]
struct ListArgs {
    project_id: Option<i64>,
    status_filter: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    user: Option<User>,
}

fn default_limit() -> i64 {
    20
}

async fn list_studies(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: ListArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = a.project_id.ok_or_else(|| ToolFailure::value("project_id is required"))?;

    let status = match a.status_filter.as_deref().filter(|f| !f.is_empty()) {
        Some(filter) => Some(Status::parse(filter).ok_or_else(|| {
            ToolFailure::value(format!(
                "Invalid status_filter '{}'. Valid options: {}",
                filter,
                Status::ALL.iter().map(Status::as_str).collect::<Vec<_>>().join(", ")
            ))
        })?),
        None => None,
    };
    let limit = a.limit.max(0) as usize;

    let out = s
        .store
        .read(|d| -> Result<Value, StoreError> {
            let project = d.readable_project(&user, project_id)?;
            let mut studies: Vec<&ParametricStudy> = d
                .studies
                .values()
                .filter(|st| st.project_id == project.id)
                .filter(|st| status.map_or(true, |wanted| st.status == wanted))
                .collect();
            studies.sort_by(|x, y| y.created_at.cmp(&x.created_at));

            let rows: Vec<Value> = studies
                .into_iter()
                .take(limit)
                .map(|study| {
                    let sims = d.study_simulations(study);
                    json!({
                        "study_id": study.id,
                        "name": study.name,
                        "algorithm": study.base_algorithm,
                        "status": study.status,
                        "total_simulations": sims.len(),
                        "completed_simulations": sims.iter().filter(|sim| sim.status == Status::Completed).count(),
                        "varied_parameters": varied(study),
                        "created_at": study.created_at.to_rfc3339(),
                    })
                })
                .collect();

            Ok(json!({
                "project_id": project.id,
                "total_count": rows.len(),
                "studies": rows,
            }))
        })
        .await?;
    Ok(out.into())
}

async fn cancel_study(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: StudyArgs = parse_args(args)?;
    let user = caller(a.user)?;

    let outcome = s
        .store
        .write(|d| -> Result<Result<Vec<String>, Status>, StoreError> {
            let study = d.study(&a.study_id)?;
            d.writable_project(&user, study.project_id)?;
            if matches!(study.status, Status::Completed | Status::Cancelled) {
                return Ok(Err(study.status));
            }

            let ids = study.simulation_ids.clone();
            let mut revoked = Vec::new();
            for id in ids {
                if let Some(sim) = d.simulations.get_mut(&id) {
                    if matches!(sim.status, Status::Queued | Status::Running) {
                        sim.status = Status::Cancelled;
                        if !sim.task_id.is_empty() {
                            revoked.push(sim.task_id.clone());
                        }
                    }
                }
            }
            if let Some(study) = d.studies.get_mut(&a.study_id) {
                study.status = Status::Cancelled;
            }
            Ok(Ok(revoked))
        })
        .await?;

    let tasks = match outcome {
        Ok(tasks) => tasks,
        Err(status) => {
            return Ok(json!({
                "study_id": a.study_id,
                "status": status,
                "message": format!("Study is already {}", status),
            })
            .into())
        }
    };

    for task_id in &tasks {
        s.queue.revoke(task_id).await;
    }
    let cancelled = tasks.len();
    tracing::info!(study_id = %a.study_id, cancelled, "Parametric study cancelled");
    Ok(json!({
        "study_id": a.study_id,
        "status": "cancelled",
        "simulations_cancelled": cancelled,
        "message": format!("Study cancelled. {} pending simulations cancelled.", cancelled),
    })
    .into())
}
