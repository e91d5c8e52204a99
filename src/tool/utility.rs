// Aglogen Assistant — Utility tools

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::registration::ToolServices;
use super::{caller, parse_args, with_state, Arguments, HandlerResult, Param, ToolBuilder, ToolDefinition};
use crate::queue::TaskStatus;
use crate::store::{Algorithm, Simulation, Status, User};

pub fn tools(services: &ToolServices) -> Vec<ToolDefinition> {
    vec![
        ToolBuilder::new("list_algorithms")
            .description("List all available simulation algorithms with their descriptions")
            .doc("List available simulation algorithms.")
            .context_param("user")
            .handler(with_state(services.clone(), list_algorithms)),
        ToolBuilder::new("get_project_info")
            .description("Get detailed information about a project including simulation and analysis counts")
            .doc(
                "Get project information.

                Args:
                    project_id: UUID of the project. If not provided, lists the caller's recent projects.",
            )
            .param(Param::new("project_id", "int | None").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), get_project_info)),
        ToolBuilder::new("check_task_status")
            .description("Check the status of an asynchronous task (e.g., a running simulation)")
            .doc(
                "Check the status of a background task.

                Args:
                    task_id: The task ID returned when the job was queued.",
            )
            .param(Param::new("task_id", "str"))
            .context_param("user")
            .handler(with_state(services.clone(), check_task_status)),
        ToolBuilder::new("list_simulations")
            .description("List simulations with optional filtering by project, algorithm, or status")
            .doc(
                "List simulations.

                Args:
                    project_id: Optional project to filter by.
                    algorithm: Optional algorithm code (dla, cca, ballistic, ...).
                    status: Optional status (queued, running, completed, failed, cancelled).
                    limit: Maximum number of results (default 20, max 100).",
            )
            .param(Param::new("project_id", "int | None").with_default())
            .param(Param::new("algorithm", "str | None").with_default())
            .param(Param::new("status", "str | None").with_default())
            .param(Param::new("limit", "int").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), list_simulations)),
        ToolBuilder::new("get_simulation_details")
            .description("Get detailed information about a specific simulation including metrics and parameters")
            .doc(
                "Get simulation details.

                Args:
                    simulation_id: UUID of the simulation.",
            )
            .param(Param::new("simulation_id", "str"))
            .context_param("user")
            .handler(with_state(services.clone(), get_simulation_details)),
    ]
}

#[derive(Deserialize)]
struct UserOnly {
    user: Option<User>,
}

async fn list_algorithms(_s: ToolServices, args: Arguments) -> HandlerResult {
    let a: UserOnly = parse_args(args)?;
    caller(a.user)?;
    let algorithms: Vec<Value> = Algorithm::ALL
        .iter()
        .map(|alg| json!({"code": alg.as_str(), "name": alg.display_name()}))
        .collect();
    Ok(json!({"count": algorithms.len(), "algorithms": algorithms}).into())
}

#[derive(Deserialize)]
struct ProjectInfoArgs {
    project_id: Option<i64>,
    user: Option<User>,
}

fn display_name(sim: &Simulation) -> String {
    if sim.name.is_empty() {
        format!("{} simulation", sim.algorithm.as_str())
    } else {
        sim.name.clone()
    }
}

async fn get_project_info(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: ProjectInfoArgs = parse_args(args)?;
    let user = caller(a.user)?;

    let out = s
        .store
        .read(|d| -> Result<Value, crate::store::StoreError> {
            let Some(project_id) = a.project_id else {
                let projects: Vec<Value> = d
                    .projects_for(&user)
                    .into_iter()
                    .take(10)
                    .map(|p| {
                        json!({
                            "id": p.id,
                            "name": p.name,
                            "description": p.description.chars().take(100).collect::<String>(),
                            "simulation_count": d.simulations_in(p.id).len(),
                            "analysis_count": d.analysis_count(p.id),
                            "updated_at": p.updated_at.to_rfc3339(),
                        })
                    })
                    .collect();
                return Ok(json!({
                    "count": projects.len(),
                    "projects": projects,
                    "message": "Use project_id parameter to get detailed information about a specific project.",
                }));
            };

            let project = d.readable_project(&user, project_id)?;
            let sims = d.simulations_in(project.id);

            let mut status_counts = Map::new();
            for status in Status::ALL {
                let count = sims.iter().filter(|sim| sim.status == status).count();
                if count > 0 {
                    status_counts.insert(status.as_str().to_string(), json!(count));
                }
            }
            let recent: Vec<Value> = sims
                .iter()
                .take(5)
                .map(|sim| {
                    json!({
                        "id": sim.id,
                        "name": display_name(sim),
                        "algorithm": sim.algorithm,
                        "status": sim.status,
                        "created_at": sim.created_at.to_rfc3339(),
                    })
                })
                .collect();

            Ok(json!({
                "id": project.id,
                "name": project.name,
                "description": project.description,
                "created_at": project.created_at.to_rfc3339(),
                "updated_at": project.updated_at.to_rfc3339(),
                "simulation_count": sims.len(),
                "analysis_count": d.analysis_count(project.id),
                "simulation_status_counts": status_counts,
                "recent_simulations": recent,
            }))
        })
        .await?;
    Ok(out.into())
}

#[derive(Deserialize)]
struct TaskArgs {
    task_id: String,
    user: Option<User>,
}

async fn check_task_status(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: TaskArgs = parse_args(args)?;
    caller(a.user)?;
    let record = s.queue.status(&a.task_id).await;

    let mut out = Map::new();
    out.insert("task_id".into(), json!(a.task_id));
    out.insert("status".into(), json!(record.status.as_str()));
    match record.status {
        TaskStatus::Success => {
            out.insert("result".into(), record.result.unwrap_or(Value::Null));
        }
        TaskStatus::Failure => {
            out.insert("error".into(), json!(record.error.unwrap_or_default()));
        }
        TaskStatus::Progress => {
            out.insert("progress".into(), record.progress.unwrap_or(Value::Null));
        }
        _ => {}
    }
    Ok(Value::Object(out).into())
}

#[derive(Deserialize)]
struct ListSimulationsArgs {
    project_id: Option<i64>,
    algorithm: Option<String>,
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    user: Option<User>,
}

fn default_limit() -> i64 {
    20
}

async fn list_simulations(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: ListSimulationsArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let limit = a.limit.clamp(1, 100) as usize;
    let algorithm = a.algorithm.as_deref().map(str::to_lowercase);
    let status = a.status.as_deref().map(str::to_lowercase);

    let simulations = s
        .store
        .read(|d| -> Result<Vec<Value>, crate::store::StoreError> {
            if let Some(pid) = a.project_id {
                d.readable_project(&user, pid)?;
            }
            let mut sims: Vec<&Simulation> = d
                .simulations
                .values()
                .filter(|sim| a.project_id.map_or(true, |pid| sim.project_id == pid))
                .filter(|sim| d.project(sim.project_id).map(|p| p.can_read(&user)).unwrap_or(false))
                .filter(|sim| algorithm.as_deref().map_or(true, |alg| sim.algorithm.as_str() == alg))
                .filter(|sim| status.as_deref().map_or(true, |st| sim.status.as_str() == st))
                .collect();
            sims.sort_by(|x, y| y.created_at.cmp(&x.created_at));

            Ok(sims
                .into_iter()
                .take(limit)
                .map(|sim| {
                    let mut row = json!({
                        "id": sim.id,
                        "name": display_name(sim),
                        "algorithm": sim.algorithm,
                        "status": sim.status,
                        "project_id": sim.project_id,
                        "created_at": sim.created_at.to_rfc3339(),
                    });
                    if sim.status == Status::Completed {
                        if let Some(metrics) = &sim.metrics {
                            let picked: Map<String, Value> = ["n_particles", "df", "kf", "rg"]
                                .iter()
                                .filter_map(|k| metrics.get(*k).map(|v| (k.to_string(), v.clone())))
                                .collect();
                            row["metrics"] = Value::Object(picked);
                        }
                    }
                    row
                })
                .collect())
        })
        .await?;

    Ok(json!({
        "count": simulations.len(),
        "simulations": simulations,
        "filters_applied": {
            "project_id": a.project_id,
            "algorithm": a.algorithm,
            "status": a.status,
            "limit": limit,
        },
    })
    .into())
}

#[derive(Deserialize)]
struct SimulationArgs {
    simulation_id: String,
    user: Option<User>,
}

async fn get_simulation_details(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: SimulationArgs = parse_args(args)?;
    let user = caller(a.user)?;

    let (sim, project_name) = s
        .store
        .read(|d| -> Result<(Simulation, String), crate::store::StoreError> {
            let sim = d.readable_simulation(&user, &a.simulation_id)?;
            let project = d.project(sim.project_id)?;
            Ok((sim.clone(), project.name.clone()))
        })
        .await?;

    let mut out = json!({
        "id": sim.id,
        "name": display_name(&sim),
        "project_id": sim.project_id,
        "project_name": project_name,
        "algorithm": sim.algorithm,
        "algorithm_name": sim.algorithm.display_name(),
        "status": sim.status,
        "status_name": sim.status.display_name(),
        "parameters": sim.parameters,
        "seed": sim.seed,
        "created_at": sim.created_at.to_rfc3339(),
    });
    if let Some(t) = sim.started_at {
        out["started_at"] = json!(t.to_rfc3339());
    }
    if let Some(t) = sim.completed_at {
        out["completed_at"] = json!(t.to_rfc3339());
    }
    if let Some(ms) = sim.execution_time_ms.filter(|ms| *ms > 0) {
        out["execution_time_ms"] = json!(ms);
    }
    if sim.status == Status::Completed {
        if let Some(metrics) = &sim.metrics {
            out["metrics"] = Value::Object(metrics.clone());
        }
    }
    if sim.status == Status::Failed && !sim.error_message.is_empty() {
        out["error_message"] = json!(sim.error_message);
    }
    if !sim.task_id.is_empty() {
        out["task_id"] = json!(sim.task_id);
    }
    Ok(out.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::registration::test_support::{args, fixture};
    use crate::tool::{ErrorKind, ToolResult};

    #[tokio::test]
    async fn test_list_algorithms() {
        let fx = fixture().await;
        let result = fx.exec(None).execute("list_algorithms", Arguments::new()).await;
        let data = result.data().unwrap();
        assert_eq!(data["count"], 7);
        assert_eq!(data["algorithms"][0]["code"], "dla");
    }

    #[tokio::test]
    async fn test_project_info_list_and_detail() {
        let fx = fixture().await;
        fx.completed_simulation(Algorithm::Dla, json!({"n_particles": 100}), 1.8).await;

        let listing = fx.exec(None).execute("get_project_info", Arguments::new()).await;
        let data = listing.data().unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["projects"][0]["simulation_count"], 1);

        let detail = fx
            .exec(Some(fx.project_id))
            .execute("get_project_info", Arguments::new())
            .await;
        let data = detail.data().unwrap();
        assert_eq!(data["simulation_status_counts"], json!({"completed": 1}));
        assert_eq!(data["recent_simulations"][0]["name"], "dla simulation");
    }

    #[tokio::test]
    async fn test_project_info_unknown_and_forbidden() {
        let fx = fixture().await;
        let result = fx
            .exec(None)
            .execute("get_project_info", args(json!({"project_id": 999})))
            .await;
        assert_eq!(result.error().unwrap().message, "Project '999' not found");
        assert_eq!(result.error().unwrap().error_type, ErrorKind::Value);

        let result = fx
            .exec_as(fx.stranger.clone(), Some(fx.project_id))
            .execute("get_project_info", Arguments::new())
            .await;
        assert_eq!(result.error().unwrap().error_type, ErrorKind::Permission);
    }

    #[tokio::test]
    async fn test_check_task_status() {
        let fx = fixture().await;
        let id = fx.services.queue.enqueue("run_simulation", vec![]).await.unwrap();
        fx.services.queue.mark_failure(&id, "boom").await;
        let result = fx
            .exec(None)
            .execute("check_task_status", args(json!({"task_id": id})))
            .await;
        let data = result.data().unwrap();
        assert_eq!(data["status"], "FAILURE");
        assert_eq!(data["error"], "boom");
    }

    #[tokio::test]
    async fn test_list_simulations_filters() {
        let fx = fixture().await;
        fx.completed_simulation(Algorithm::Dla, json!({"n_particles": 100}), 1.8).await;
        fx.completed_simulation(Algorithm::Cca, json!({"n_particles": 100}), 1.9).await;

        let result = fx
            .exec(None)
            .execute("list_simulations", args(json!({"algorithm": "CCA", "limit": 500})))
            .await;
        let data = result.data().unwrap();
        assert_eq!(data["count"], 1);
        assert_eq!(data["filters_applied"]["limit"], 100);
        assert_eq!(data["simulations"][0]["metrics"]["df"], 1.9);

        let result = fx
            .exec_as(fx.stranger.clone(), None)
            .execute("list_simulations", Arguments::new())
            .await;
        assert_eq!(result.data().unwrap()["count"], 0);
    }

    #[tokio::test]
    async fn test_simulation_details() {
        let fx = fixture().await;
        let id = fx.completed_simulation(Algorithm::Tunable, json!({"n_particles": 50}), 2.1).await;
        let result = fx
            .exec(None)
            .execute("get_simulation_details", args(json!({"simulation_id": id})))
            .await;
        let data = result.data().unwrap();
        assert_eq!(data["algorithm_name"], "Tunable Sticking Probability");
        assert_eq!(data["status_name"], "Completed");
        assert_eq!(data["metrics"]["df"], 2.1);

        let missing = fx
            .exec(None)
            .execute("get_simulation_details", args(json!({"simulation_id": "nope"})))
            .await;
        assert!(matches!(missing, ToolResult::Failure(_)));
    }
}
