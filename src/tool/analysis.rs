// Aglogen Assistant — Analysis tools
//
// Box counting runs in-process through the configured FractalEngine; FRAKTAL
// analyses are queued for the worker like simulations.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::registration::ToolServices;
use super::{caller, parse_args, round_to, with_state, Arguments, HandlerResult, Param, ToolBuilder, ToolDefinition, ToolFailure};
use crate::queue::{RUN_BOX_COUNTING, RUN_FRAKTAL_ANALYSIS, RUN_FRAKTAL_AUTO_CALIBRATE};
use crate::store::{
    FraktalAnalysis, FraktalSource, ParametricStudy, Simulation, Status, StoreError, User, FRAKTAL_MODELS,
};

const TREND_THRESHOLD: f64 = 0.05;

pub fn tools(services: &ToolServices) -> Vec<ToolDefinition> {
    vec![
        ToolBuilder::new("run_box_counting")
            .description("Run 3D box-counting fractal analysis on a completed simulation")
            .doc(
                "Run box-counting analysis on a simulation.

                Args:
                    simulation_id: UUID of the simulation to analyze.
                    points_per_sphere: Number of points to sample per sphere (default 100).
                    precision: Number of box sizes to use (default 18).",
            )
            .category("analysis")
            .is_async(true)
            .param(Param::new("simulation_id", "str"))
            .param(Param::new("points_per_sphere", "int").with_default())
            .param(Param::new("precision", "int").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), run_box_counting)),
        ToolBuilder::new("get_box_counting_results")
            .description("Get existing box-counting analysis results for a simulation")
            .doc(
                "Get existing box-counting results for a simulation.

                Args:
                    simulation_id: UUID of the simulation.",
            )
            .category("analysis")
            .param(Param::new("simulation_id", "str"))
            .context_param("user")
            .handler(with_state(services.clone(), get_box_counting_results)),
        ToolBuilder::new("run_fraktal_analysis")
            .description("Run FRAKTAL 2D fractal analysis on a simulation projection")
            .doc(
                "Run FRAKTAL analysis on a simulation projection.

                Args:
                    simulation_id: UUID of the simulation to analyze.
                    model: Analysis model - \"granulated_2012\" or \"voxel_2018\".
                    npix: Pixels per 100nm in scale bar (calibration).
                    dpo: Mean primary particle diameter in nm.
                    projection_axis: Projection axis - \"x\", \"y\", \"z\", or \"random\".
                    name: Optional name for the analysis.
                    auto_calibrate: Whether to auto-calibrate dpo.",
            )
            .category("analysis")
            .requires_project(true)
            .is_async(true)
            .param(Param::new("simulation_id", "str"))
            .param(Param::new("model", "str").with_default())
            .param(Param::new("npix", "float").with_default())
            .param(Param::new("dpo", "float").with_default())
            .param(Param::new("projection_axis", "str").with_default())
            .param(Param::new("project_id", "int | None").with_default())
            .param(Param::new("name", "str").with_default())
            .param(Param::new("auto_calibrate", "bool").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), run_fraktal_analysis)),
        ToolBuilder::new("run_fraktal_from_image")
            .description("Run FRAKTAL 2D fractal analysis on an uploaded image")
            .doc(
                "Run FRAKTAL analysis on an uploaded image.

                Args:
                    image_base64: Base64-encoded image data.
                    npix: Pixels per 100nm in scale bar (calibration).
                    dpo: Mean primary particle diameter in nm.
                    model: Analysis model - \"granulated_2012\" or \"voxel_2018\".
                    filename: Original filename for reference.
                    name: Optional name for the analysis.
                    auto_calibrate: Whether to auto-calibrate dpo.",
            )
            .category("analysis")
            .requires_project(true)
            .is_async(true)
            .param(Param::new("image_base64", "str"))
            .param(Param::new("npix", "float"))
            .param(Param::new("dpo", "float"))
            .param(Param::new("project_id", "int | None").with_default())
            .param(Param::new("model", "str").with_default())
            .param(Param::new("filename", "str").with_default())
            .param(Param::new("name", "str").with_default())
            .param(Param::new("auto_calibrate", "bool").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), run_fraktal_from_image)),
        ToolBuilder::new("get_fraktal_results")
            .description("Get FRAKTAL analysis results by analysis ID")
            .doc(
                "Get FRAKTAL analysis results.

                Args:
                    analysis_id: UUID of the FRAKTAL analysis.",
            )
            .category("analysis")
            .param(Param::new("analysis_id", "str"))
            .context_param("user")
            .handler(with_state(services.clone(), get_fraktal_results)),
        ToolBuilder::new("compare_simulations")
            .description("Compare metrics across multiple simulations")
            .doc(
                "Compare metrics across multiple simulations.

                Args:
                    simulation_ids: List of simulation UUIDs to compare (2-20 items).
                    metrics: List of metrics to compare. Defaults to [\"df\", \"rg\", \"porosity\"].",
            )
            .category("analysis")
            .param(Param::new("simulation_ids", "list[str]"))
            .param(Param::new("metrics", "list[str] | None").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), compare_simulations)),
        ToolBuilder::new("analyze_parametric_study")
            .description("Analyze all simulations in a parametric study and compute aggregated metrics")
            .doc(
                "Analyze a parametric study and aggregate results.

                Args:
                    study_id: UUID of the parametric study.
                    run_missing_analysis: Whether to run box-counting on simulations without it.",
            )
            .category("analysis")
            .is_async(true)
            .param(Param::new("study_id", "str"))
            .param(Param::new("run_missing_analysis", "bool").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), analyze_parametric_study)),
        ToolBuilder::new("list_analyses")
            .description("List fractal analyses in a project or for a simulation")
            .doc(
                "List fractal analyses.

                Args:
                    project_id: Optional project to filter by.
                    simulation_id: Optional simulation UUID to filter by.
                    analysis_type: Optional filter - \"fraktal\" or \"image\".
                    limit: Maximum number of results (default 20, max 100).",
            )
            .category("analysis")
            .param(Param::new("project_id", "int | None").with_default())
            .param(Param::new("simulation_id", "str | None").with_default())
            .param(Param::new("analysis_type", "str | None").with_default())
            .param(Param::new("limit", "int").with_default())
            .context_param("user")
            .handler(with_state(services.clone(), list_analyses)),
    ]
}

fn not_completed(sim: &Simulation, follow_up: &str) -> ToolFailure {
    ToolFailure::value(format!(
        "Simulation is not completed (status: {}). {}",
        sim.status, follow_up
    ))
}

fn check_model(model: &str) -> Result<String, ToolFailure> {
    let model = model.to_lowercase();
    if !FRAKTAL_MODELS.contains(&model.as_str()) {
        return Err(ToolFailure::value(format!(
            "Invalid model '{}'. Valid options: {}",
            model,
            FRAKTAL_MODELS.join(", ")
        )));
    }
    Ok(model)
}

/// Enqueue the analysis task and record its id on the analysis.
async fn queue_fraktal(s: &ToolServices, mut analysis: FraktalAnalysis) -> Result<FraktalAnalysis, ToolFailure> {
    let task = if analysis.auto_calibrate {
        RUN_FRAKTAL_AUTO_CALIBRATE
    } else {
        RUN_FRAKTAL_ANALYSIS
    };
    analysis.task_id = s.queue.enqueue(task, vec![json!(analysis.id)]).await?;
    if let Err(e) = s.store.insert_fraktal_analysis(analysis.clone()).await {
        s.queue.revoke(&analysis.task_id).await;
        return Err(e.into());
    }
    tracing::info!(analysis_id = %analysis.id, task = %task, "FRAKTAL analysis queued");
    Ok(analysis)
}

fn new_analysis(project_id: i64, name: String, source_type: FraktalSource, model: String, npix: f64, dpo: f64, auto_calibrate: bool) -> FraktalAnalysis {
    FraktalAnalysis {
        id: uuid::Uuid::new_v4().to_string(),
        project_id,
        simulation_id: None,
        name,
        source_type,
        model,
        npix,
        dpo,
        auto_calibrate,
        projection_params: None,
        original_image: None,
        original_filename: String::new(),
        original_content_type: String::new(),
        results: None,
        status: Status::Queued,
        task_id: String::new(),
        error_message: String::new(),
        execution_time_ms: None,
        created_at: Utc::now(),
        completed_at: None,
    }
}

// ---------------------------------------------------------------------------
// Box counting
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct BoxCountingArgs {
    simulation_id: String,
    #[serde(default = "default_points")]
    points_per_sphere: u32,
    #[serde(default = "default_precision")]
    precision: u32,
    user: Option<User>,
}

fn default_points() -> u32 {
    100
}

fn default_precision() -> u32 {
    18
}

async fn run_box_counting(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: BoxCountingArgs = parse_args(args)?;
    let user = caller(a.user)?;

    let sim = s
        .store
        .read(|d| -> Result<Simulation, StoreError> {
            let sim = d.readable_simulation(&user, &a.simulation_id)?;
            d.writable_project(&user, sim.project_id)?;
            Ok(sim.clone())
        })
        .await?;
    if sim.status != Status::Completed {
        return Err(not_completed(&sim, "Wait for completion before running analysis."));
    }
    let geometry = sim.geometry.clone().ok_or_else(|| {
        ToolFailure::value("Simulation has no geometry data. This may indicate a failed or incomplete simulation.")
    })?;

    let engine = s.engine.clone();
    let (points, precision) = (a.points_per_sphere, a.precision);
    let result = tokio::task::spawn_blocking(move || engine.box_counting(&geometry, points, precision))
        .await
        .map_err(|e| ToolFailure::Internal(e.into()))?
        .map_err(|e| ToolFailure::value(format!("Box-counting failed: {}", e)))?;

    let stored = json!({
        "dimension": result.dimension,
        "r_squared": result.r_squared,
        "std_error": result.std_error,
        "confidence_interval": result.confidence_interval,
        "log_scales": result.log_scales,
        "log_values": result.log_values,
        "execution_time_ms": result.execution_time_ms,
        "parameters": {"points_per_sphere": points, "precision": precision},
    });
    s.store
        .update_simulation(&sim.id, |sim| {
            sim.metrics
                .get_or_insert_with(Map::new)
                .insert("box_counting".into(), stored);
        })
        .await?;

    tracing::info!(simulation_id = %sim.id, engine = %s.engine.name(), dimension = result.dimension, "Box counting complete");
    Ok(json!({
        "status": "completed",
        "simulation_id": sim.id,
        "dimension": result.dimension,
        "r_squared": result.r_squared,
        "std_error": result.std_error,
        "confidence_interval_95": result.confidence_interval,
        "execution_time_ms": result.execution_time_ms,
        "message": format!(
            "Box-counting analysis complete: Df = {:.3} (R² = {:.4})",
            result.dimension, result.r_squared
        ),
    })
    .into())
}

#[derive(Deserialize)]
struct SimulationArgs {
    simulation_id: String,
    user: Option<User>,
}

async fn get_box_counting_results(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: SimulationArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let sim = s
        .store
        .read(|d| d.readable_simulation(&user, &a.simulation_id).cloned())
        .await?;

    let Some(bc) = sim.metric("box_counting") else {
        if sim.status != Status::Completed {
            return Err(not_completed(&sim, "No box-counting results available."));
        }
        return Err(ToolFailure::value(
            "No box-counting analysis found for this simulation. Use run_box_counting to analyze it first.",
        ));
    };

    let field = |k: &str| bc.get(k).cloned().unwrap_or(Value::Null);
    Ok(json!({
        "simulation_id": sim.id,
        "simulation_name": sim.name,
        "algorithm": sim.algorithm,
        "n_particles": sim.parameters.get("n_particles"),
        "dimension": field("dimension"),
        "r_squared": field("r_squared"),
        "std_error": field("std_error"),
        "confidence_interval_95": field("confidence_interval"),
        "parameters": field("parameters"),
    })
    .into())
}

// ---------------------------------------------------------------------------
// FRAKTAL
// ---------------------------------------------------------------------------

fn default_model() -> String {
    FRAKTAL_MODELS[0].to_string()
}

fn default_npix() -> f64 {
    10.0
}

fn default_dpo() -> f64 {
    40.0
}

fn default_axis() -> String {
    "z".into()
}

#[derive(Deserialize)]
struct FraktalArgs {
    simulation_id: String,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_npix")]
    npix: f64,
    #[serde(default = "default_dpo")]
    dpo: f64,
    #[serde(default = "default_axis")]
    projection_axis: String,
    project_id: Option<i64>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    auto_calibrate: bool,
    user: Option<User>,
}

/// Camera angles (azimuth, elevation) for a projection axis.
fn projection_angles(axis: &str) -> Option<(f64, f64)> {
    match axis {
        "x" => Some((90.0, 0.0)),
        "y" => Some((0.0, 0.0)),
        "z" => Some((0.0, 90.0)),
        "random" => {
            let mut rng = rand::rng();
            Some((rng.random_range(0.0..360.0), rng.random_range(-90.0..90.0)))
        }
        _ => None,
    }
}

async fn run_fraktal_analysis(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: FraktalArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = a.project_id.ok_or_else(|| ToolFailure::value("project_id is required"))?;

    let sim = s
        .store
        .read(|d| -> Result<Simulation, StoreError> {
            d.writable_project(&user, project_id)?;
            Ok(d.readable_simulation(&user, &a.simulation_id)?.clone())
        })
        .await?;
    if sim.status != Status::Completed {
        return Err(not_completed(&sim, "Wait for completion before running FRAKTAL analysis."));
    }
    if sim.geometry.is_none() {
        return Err(ToolFailure::value("Simulation has no geometry data."));
    }
    let model = check_model(&a.model)?;
    let axis = a.projection_axis.to_lowercase();
    let (azimuth, elevation) = projection_angles(&axis).ok_or_else(|| {
        ToolFailure::value(format!(
            "Invalid projection_axis '{}'. Valid options: x, y, z, random",
            a.projection_axis
        ))
    })?;

    let label = if sim.name.is_empty() {
        sim.algorithm.as_str().to_string()
    } else {
        sim.name.clone()
    };
    let name = if a.name.is_empty() {
        format!("FRAKTAL - {}", label)
    } else {
        a.name
    };
    let mut analysis = new_analysis(
        project_id,
        name,
        FraktalSource::SimulationProjection,
        model.clone(),
        a.npix,
        a.dpo,
        a.auto_calibrate,
    );
    analysis.simulation_id = Some(sim.id.clone());
    analysis.projection_params = Some(json!({
        "azimuth": azimuth,
        "elevation": elevation,
        "resolution": 512,
    }));
    let analysis = queue_fraktal(&s, analysis).await?;

    let shown = if sim.name.is_empty() { &sim.id } else { &sim.name };
    Ok(json!({
        "status": "queued",
        "analysis_id": analysis.id,
        "task_id": analysis.task_id,
        "simulation_id": sim.id,
        "model": model,
        "projection_axis": axis,
        "auto_calibrate": a.auto_calibrate,
        "message": format!("FRAKTAL analysis queued for simulation '{}'", shown),
    })
    .into())
}

#[derive(Deserialize)]
struct ImageArgs {
    image_base64: String,
    npix: f64,
    dpo: f64,
    project_id: Option<i64>,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_filename")]
    filename: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    auto_calibrate: bool,
    user: Option<User>,
}

fn default_filename() -> String {
    "uploaded_image.png".into()
}

fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or_default().to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        _ => "image/png",
    }
}

async fn run_fraktal_from_image(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: ImageArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let project_id = a.project_id.ok_or_else(|| ToolFailure::value("project_id is required"))?;
    s.store
        .read(|d| d.writable_project(&user, project_id).map(|_| ()))
        .await?;

    let image = STANDARD
        .decode(a.image_base64.trim())
        .map_err(|e| ToolFailure::value(format!("Invalid base64 image data: {}", e)))?;
    let model = check_model(&a.model)?;

    let name = if a.name.is_empty() {
        format!("FRAKTAL - {}", a.filename)
    } else {
        a.name
    };
    let mut analysis = new_analysis(
        project_id,
        name,
        FraktalSource::UploadedImage,
        model.clone(),
        a.npix,
        a.dpo,
        a.auto_calibrate,
    );
    analysis.original_content_type = content_type_for(&a.filename).to_string();
    analysis.original_filename = a.filename.clone();
    analysis.original_image = Some(image);
    let analysis = queue_fraktal(&s, analysis).await?;

    Ok(json!({
        "status": "queued",
        "analysis_id": analysis.id,
        "task_id": analysis.task_id,
        "filename": a.filename,
        "model": model,
        "auto_calibrate": a.auto_calibrate,
        "message": format!("FRAKTAL analysis queued for image '{}'", a.filename),
    })
    .into())
}

#[derive(Deserialize)]
struct AnalysisArgs {
    analysis_id: String,
    user: Option<User>,
}

async fn get_fraktal_results(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: AnalysisArgs = parse_args(args)?;
    let user = caller(a.user)?;
    let analysis = s
        .store
        .read(|d| -> Result<FraktalAnalysis, StoreError> {
            let analysis = d.fraktal_analysis(&a.analysis_id)?;
            d.readable_project(&user, analysis.project_id)?;
            Ok(analysis.clone())
        })
        .await?;

    let out = match analysis.status {
        Status::Queued => json!({
            "analysis_id": analysis.id,
            "status": "queued",
            "message": "Analysis is queued and waiting to start.",
        }),
        Status::Running => json!({
            "analysis_id": analysis.id,
            "status": "running",
            "message": "Analysis is currently running.",
        }),
        Status::Failed | Status::Cancelled => json!({
            "analysis_id": analysis.id,
            "status": analysis.status,
            "error": analysis.error_message,
        }),
        Status::Completed => {
            let mut out = json!({
                "analysis_id": analysis.id,
                "name": analysis.name,
                "status": "completed",
                "model": analysis.model,
                "source_type": analysis.source_type,
                "simulation_id": analysis.simulation_id,
                "execution_time_ms": analysis.execution_time_ms,
            });
            for key in [
                "df",
                "rg",
                "kf",
                "npo",
                "npo_visual",
                "ap",
                "volume",
                "mass",
                "surface_area",
                "npo_aligned",
                "npo_ratio",
            ] {
                out[key] = analysis.result(key);
            }
            out
        }
    };
    Ok(out.into())
}

// ---------------------------------------------------------------------------
// Comparison and study analysis
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CompareArgs {
    simulation_ids: Vec<String>,
    metrics: Option<Vec<String>>,
    user: Option<User>,
}

fn normalize_metric(metric: &str) -> String {
    match metric.to_lowercase().as_str() {
        "df" => "fractal_dimension".to_string(),
        "rg" => "radius_of_gyration".to_string(),
        "kf" => "prefactor".to_string(),
        other => other.to_string(),
    }
}

fn metric_value(sim: &Simulation, metric: &str) -> Value {
    if metric == "n_particles" {
        return sim.parameters.get("n_particles").cloned().unwrap_or(Value::Null);
    }
    if let Some(v) = sim.metric(metric) {
        return v.clone();
    }
    if metric == "fractal_dimension" {
        if let Some(d) = sim.metric("box_counting").and_then(|bc| bc.get("dimension")) {
            return d.clone();
        }
    }
    Value::Null
}

async fn compare_simulations(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: CompareArgs = parse_args(args)?;
    let user = caller(a.user)?;
    if a.simulation_ids.len() < 2 {
        return Err(ToolFailure::value("At least 2 simulations are required for comparison"));
    }
    if a.simulation_ids.len() > 20 {
        return Err(ToolFailure::value("Maximum 20 simulations can be compared at once"));
    }

    let metrics: Vec<String> = match a.metrics {
        Some(m) => m.iter().map(|m| normalize_metric(m)).collect(),
        None => vec![
            "fractal_dimension".into(),
            "radius_of_gyration".into(),
            "porosity".into(),
        ],
    };

    let sims = s
        .store
        .read(|d| -> Result<Vec<Simulation>, StoreError> {
            a.simulation_ids
                .iter()
                .map(|id| d.readable_simulation(&user, id).cloned())
                .collect()
        })
        .await?;

    let mut collected: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    let mut details = Vec::with_capacity(sims.len());
    for sim in &sims {
        let mut detail = json!({
            "simulation_id": sim.id,
            "name": sim.name,
            "algorithm": sim.algorithm,
            "status": sim.status,
        });
        for metric in &metrics {
            let value = metric_value(sim, metric);
            if let Some(x) = value.as_f64() {
                collected.entry(metric.as_str()).or_default().push(x);
            }
            detail[metric.as_str()] = value;
        }
        details.push(detail);
    }

    let mut statistics = Map::new();
    for metric in &metrics {
        let values = collected.get(metric.as_str()).cloned().unwrap_or_default();
        let entry = if values.is_empty() {
            json!({"error": format!("No data available for metric '{}'", metric)})
        } else {
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = round_to(values.iter().sum::<f64>() / values.len() as f64, 4);
            let mut entry = json!({
                "min": round_to(min, 4),
                "max": round_to(max, 4),
                "mean": mean,
                "range": round_to(max - min, 4),
                "count": values.len(),
            });
            if values.len() > 1 {
                let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;
                entry["std"] = json!(round_to(variance.sqrt(), 4));
            }
            entry
        };
        statistics.insert(metric.clone(), entry);
    }

    Ok(json!({
        "simulation_count": sims.len(),
        "metrics_compared": metrics,
        "statistics": statistics,
        "simulations": details,
    })
    .into())
}

#[derive(Deserialize)]
struct StudyAnalysisArgs {
    study_id: String,
    #[serde(default)]
    run_missing_analysis: bool,
    user: Option<User>,
}

struct SimPoint {
    df: Option<f64>,
    rg: Option<f64>,
}

fn compute_trend(rows: &[Value]) -> Value {
    let df: Vec<f64> = rows.iter().filter_map(|r| r.get("df_mean").and_then(Value::as_f64)).collect();
    if df.len() < 2 {
        return Value::Null;
    }
    let (first, last) = (df[0], df[df.len() - 1]);
    let change = last - first;
    let direction = if change.abs() < TREND_THRESHOLD {
        "stable"
    } else if change > 0.0 {
        "increasing"
    } else {
        "decreasing"
    };
    json!({
        "direction": direction,
        "change": round_to(change, 4),
        "first_value": round_to(first, 4),
        "last_value": round_to(last, 4),
    })
}

/// Group completed simulations by each varied parameter value and summarise.
fn parameter_analysis(study: &ParametricStudy, completed: &[&Simulation]) -> Map<String, Value> {
    let mut out = Map::new();
    for param in study.parameter_grid.keys() {
        let mut groups: BTreeMap<String, Vec<SimPoint>> = BTreeMap::new();
        for sim in completed {
            let Some(value) = sim.parameters.get(param).filter(|v| !v.is_null()) else {
                continue;
            };
            groups
                .entry(crate::rag::chunking::plain(value))
                .or_default()
                .push(SimPoint {
                    df: sim.fractal_dimension(),
                    rg: sim.metric_f64("radius_of_gyration"),
                });
        }

        let mut keys: Vec<String> = groups.keys().cloned().collect();
        if keys.iter().all(|k| k.parse::<f64>().is_ok()) {
            keys.sort_by(|x, y| {
                let (x, y) = (x.parse::<f64>().unwrap_or_default(), y.parse::<f64>().unwrap_or_default());
                x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let rows: Vec<Value> = keys
            .iter()
            .map(|key| {
                let points = &groups[key];
                let df: Vec<f64> = points.iter().filter_map(|p| p.df).collect();
                let rg: Vec<f64> = points.iter().filter_map(|p| p.rg).collect();
                let mut row = json!({"count": points.len(), "parameter_value": key});
                if !df.is_empty() {
                    let mean = round_to(df.iter().sum::<f64>() / df.len() as f64, 4);
                    row["df_mean"] = json!(mean);
                    if df.len() > 1 {
                        let variance = df.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / df.len() as f64;
                        row["df_std"] = json!(round_to(variance.sqrt(), 4));
                    }
                }
                if !rg.is_empty() {
                    row["rg_mean"] = json!(round_to(rg.iter().sum::<f64>() / rg.len() as f64, 4));
                }
                row
            })
            .collect();

        let trend = if rows.len() > 1 { compute_trend(&rows) } else { Value::Null };
        out.insert(param.clone(), json!({"values": rows, "trend": trend}));
    }
    out
}

async fn analyze_parametric_study(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: StudyAnalysisArgs = parse_args(args)?;
    let user = caller(a.user)?;

    let (mut result, missing) = s
        .store
        .read(|d| -> Result<(Value, Vec<String>), StoreError> {
            let study = d.readable_study(&user, &a.study_id)?;
            let all = d.study_simulations(study);
            let completed: Vec<&Simulation> = all
                .iter()
                .copied()
                .filter(|sim| sim.status == Status::Completed)
                .collect();

            if completed.is_empty() {
                return Ok((
                    json!({
                        "study_id": study.id,
                        "study_name": study.name,
                        "status": "no_completed_simulations",
                        "total_simulations": all.len(),
                        "completed_simulations": 0,
                        "message": "No simulations have completed yet.",
                    }),
                    Vec::new(),
                ));
            }

            let missing = completed
                .iter()
                .filter(|sim| sim.metric("box_counting").is_none())
                .map(|sim| sim.id.clone())
                .collect();
            Ok((
                json!({
                    "study_id": study.id,
                    "study_name": study.name,
                    "algorithm": study.base_algorithm,
                    "status": "analyzed",
                    "total_simulations": all.len(),
                    "completed_simulations": completed.len(),
                    "varied_parameters": study.parameter_grid.keys().collect::<Vec<_>>(),
                    "parameter_analysis": parameter_analysis(study, &completed),
                }),
                missing,
            ))
        })
        .await?;

    if !missing.is_empty() {
        result["missing_box_counting"] = json!(missing.len());
        if a.run_missing_analysis {
            for id in &missing {
                s.queue.enqueue(RUN_BOX_COUNTING, vec![json!(id)]).await?;
            }
            result["analysis_queued"] = json!(missing.len());
            result["message"] = json!(format!("Queued box-counting for {} simulations", missing.len()));
        } else {
            result["message"] = json!(format!(
                "{} simulations missing box-counting analysis. Set run_missing_analysis=True to run them.",
                missing.len()
            ));
        }
    }
    Ok(result.into())
}

#[derive(Deserialize)]
struct ListArgs {
    project_id: Option<i64>,
    simulation_id: Option<String>,
    analysis_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    user: Option<User>,
}

fn default_limit() -> i64 {
    20
}

async fn list_analyses(s: ToolServices, args: Arguments) -> HandlerResult {
    let a: ListArgs = parse_args(args)?;
    let user = caller(a.user)?;
    if a.project_id.is_none() && a.simulation_id.is_none() {
        return Err(ToolFailure::value("Either project_id or simulation_id is required"));
    }
    let limit = a.limit.clamp(1, 100) as usize;
    let kind = a.analysis_type.as_deref().map(str::to_lowercase);
    let want = |k: &str| kind.as_deref().map_or(true, |t| t == k);

    let rows = s
        .store
        .read(|d| -> Result<Vec<Value>, StoreError> {
            if let Some(pid) = a.project_id {
                d.readable_project(&user, pid)?;
            }
            // Image analyses are scoped by project; a simulation implies its own.
            let image_project = match (&a.project_id, &a.simulation_id) {
                (Some(pid), _) => Some(*pid),
                (None, Some(sid)) => Some(d.readable_simulation(&user, sid)?.project_id),
                (None, None) => None,
            };

            let mut rows = Vec::new();
            if want("fraktal") {
                let mut fraktal: Vec<&FraktalAnalysis> = d
                    .fraktal_analyses
                    .values()
                    .filter(|fa| a.project_id.map_or(true, |pid| fa.project_id == pid))
                    .filter(|fa| {
                        a.simulation_id
                            .as_ref()
                            .map_or(true, |sid| fa.simulation_id.as_ref() == Some(sid))
                    })
                    .filter(|fa| d.project(fa.project_id).map(|p| p.can_read(&user)).unwrap_or(false))
                    .collect();
                fraktal.sort_by(|x, y| y.created_at.cmp(&x.created_at));
                rows.extend(fraktal.into_iter().take(limit).map(|fa| {
                    json!({
                        "analysis_id": fa.id,
                        "type": "fraktal",
                        "name": fa.name,
                        "model": fa.model,
                        "source_type": fa.source_type,
                        "simulation_id": fa.simulation_id,
                        "status": fa.status,
                        "df": fa.result("df"),
                        "rg": fa.result("rg"),
                        "created_at": fa.created_at.to_rfc3339(),
                    })
                }));
            }

            if want("image") && rows.len() < limit {
                let remaining = limit - rows.len();
                let mut images: Vec<_> = d
                    .image_analyses
                    .values()
                    .filter(|ia| image_project.map_or(false, |pid| ia.project_id == pid))
                    .collect();
                images.sort_by(|x, y| y.created_at.cmp(&x.created_at));
                rows.extend(images.into_iter().take(remaining).map(|ia| {
                    let result = |k: &str| ia.results.as_ref().and_then(|r| r.get(k)).cloned().unwrap_or(Value::Null);
                    json!({
                        "analysis_id": ia.id,
                        "type": "image",
                        "method": ia.method,
                        "status": ia.status,
                        "df": result("fractal_dimension"),
                        "r_squared": result("r_squared"),
                        "created_at": ia.created_at.to_rfc3339(),
                    })
                }));
            }
            Ok(rows)
        })
        .await?;

    Ok(json!({
        "count": rows.len(),
        "project_id": a.project_id,
        "simulation_id": a.simulation_id,
        "analyses": rows,
    })
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskStatus;
    use crate::store::{Algorithm, ImageAnalysis};
    use crate::tool::registration::test_support::{args, fixture};
    use crate::tool::ErrorKind;

    #[tokio::test]
    async fn test_box_counting_stores_metrics() {
        crate::logger::init_test();
        let fx = fixture().await;
        let id = fx.completed_simulation(Algorithm::Dla, json!({"n_particles": 64}), 1.8).await;
        let exec = fx.exec(None);

        let before = exec
            .execute("get_box_counting_results", args(json!({"simulation_id": id})))
            .await;
        assert!(before.error().unwrap().message.starts_with("No box-counting analysis found"));

        let r = exec
            .execute(
                "run_box_counting",
                args(json!({"simulation_id": id, "points_per_sphere": 8, "precision": 6})),
            )
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["status"], "completed");
        let dim = data["dimension"].as_f64().unwrap();
        assert!(dim > 0.5 && dim < 3.5, "dimension {}", dim);
        assert!(data["message"].as_str().unwrap().starts_with("Box-counting analysis complete: Df = "));

        let after = exec
            .execute("get_box_counting_results", args(json!({"simulation_id": id})))
            .await;
        let data = after.data().unwrap();
        assert_eq!(data["parameters"]["precision"], 6);
        assert_eq!(data["n_particles"], 64);
    }

    #[tokio::test]
    async fn test_box_counting_needs_completed_geometry() {
        let fx = fixture().await;
        let id = fx.completed_simulation(Algorithm::Dla, json!({"n_particles": 64}), 1.8).await;
        fx.services
            .store
            .update_simulation(&id, |sim| sim.status = Status::Running)
            .await
            .unwrap();
        let r = fx
            .exec(None)
            .execute("run_box_counting", args(json!({"simulation_id": id})))
            .await;
        assert!(r.error().unwrap().message.starts_with("Simulation is not completed (status: running)"));

        fx.services
            .store
            .update_simulation(&id, |sim| {
                sim.status = Status::Completed;
                sim.geometry = None;
            })
            .await
            .unwrap();
        let r = fx
            .exec(None)
            .execute("run_box_counting", args(json!({"simulation_id": id})))
            .await;
        assert!(r.error().unwrap().message.starts_with("Simulation has no geometry data"));
    }

    #[tokio::test]
    async fn test_fraktal_analysis_queue_and_results() {
        let fx = fixture().await;
        let id = fx.completed_simulation(Algorithm::Cca, json!({"n_particles": 64}), 1.8).await;
        let exec = fx.exec(Some(fx.project_id));

        let bad = exec
            .execute("run_fraktal_analysis", args(json!({"simulation_id": id, "projection_axis": "w"})))
            .await;
        assert_eq!(bad.error().unwrap().error_type, ErrorKind::Value);

        let r = exec
            .execute(
                "run_fraktal_analysis",
                args(json!({"simulation_id": id, "model": "VOXEL_2018", "auto_calibrate": true})),
            )
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["model"], "voxel_2018");
        assert_eq!(data["projection_axis"], "z");
        let analysis_id = data["analysis_id"].as_str().unwrap().to_string();
        let task = fx.services.queue.status(data["task_id"].as_str().unwrap()).await;
        assert_eq!(task.name, RUN_FRAKTAL_AUTO_CALIBRATE);

        let analysis = fx.services.store.fraktal_analysis(&analysis_id).await.unwrap();
        assert_eq!(analysis.name, "FRAKTAL - cca");
        assert_eq!(analysis.projection_params.unwrap()["elevation"], 90.0);

        let queued = exec
            .execute("get_fraktal_results", args(json!({"analysis_id": analysis_id})))
            .await;
        assert_eq!(queued.data().unwrap()["status"], "queued");

        fx.services
            .store
            .write(|d| {
                let a = d.fraktal_analyses.get_mut(&analysis_id).unwrap();
                a.status = Status::Completed;
                a.results = Some(args(json!({"df": 1.75, "kf": 1.4})));
                Ok(())
            })
            .await
            .unwrap();
        let done = exec
            .execute("get_fraktal_results", args(json!({"analysis_id": analysis_id})))
            .await;
        let data = done.data().unwrap();
        assert_eq!(data["df"], 1.75);
        assert_eq!(data["rg"], Value::Null);
        assert_eq!(data["simulation_id"], json!(id));
    }

    #[tokio::test]
    async fn test_fraktal_from_image() {
        let fx = fixture().await;
        let exec = fx.exec(Some(fx.project_id));
        let r = exec
            .execute(
                "run_fraktal_from_image",
                args(json!({"image_base64": "iVBORw0K", "npix": 12.0, "dpo": 30.0, "filename": "tem.TIF"})),
            )
            .await;
        let data = r.data().unwrap();
        let analysis = fx
            .services
            .store
            .fraktal_analysis(data["analysis_id"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(analysis.original_content_type, "image/tiff");
        assert_eq!(analysis.name, "FRAKTAL - tem.TIF");
        assert_eq!(analysis.original_image.unwrap(), vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a]);
        assert_eq!(fx.services.queue.tasks_named(RUN_FRAKTAL_ANALYSIS).await.len(), 1);

        let bad = exec
            .execute(
                "run_fraktal_from_image",
                args(json!({"image_base64": "***", "npix": 1.0, "dpo": 1.0})),
            )
            .await;
        assert!(bad.error().unwrap().message.starts_with("Invalid base64 image data"));
    }

    #[tokio::test]
    async fn test_compare_simulations() {
        let fx = fixture().await;
        let a = fx.completed_simulation(Algorithm::Dla, json!({"n_particles": 100}), 1.8).await;
        let b = fx.completed_simulation(Algorithm::Dla, json!({"n_particles": 300}), 2.0).await;

        let r = fx
            .exec(None)
            .execute(
                "compare_simulations",
                args(json!({"simulation_ids": [a, b], "metrics": ["DF", "n_particles", "porosity"]})),
            )
            .await;
        let data = r.data().unwrap();
        assert_eq!(data["metrics_compared"], json!(["fractal_dimension", "n_particles", "porosity"]));
        let df = &data["statistics"]["fractal_dimension"];
        assert_eq!(df["mean"], 1.9);
        assert_eq!(df["range"], 0.2);
        assert_eq!(df["std"], 0.1);
        assert_eq!(data["statistics"]["n_particles"]["max"], 300.0);
        assert_eq!(
            data["statistics"]["porosity"]["error"],
            "No data available for metric 'porosity'"
        );

        let r = fx
            .exec(None)
            .execute("compare_simulations", args(json!({"simulation_ids": [a]})))
            .await;
        assert_eq!(
            r.error().unwrap().message,
            "At least 2 simulations are required for comparison"
        );
    }

    #[tokio::test]
    async fn test_analyze_parametric_study() {
        let fx = fixture().await;
        let created = fx
            .exec(Some(fx.project_id))
            .execute(
                "create_parametric_study",
                args(json!({
                    "name": "Sweep",
                    "algorithm": "dla",
                    "base_parameters": {"n_particles": 100},
                    "parameter_grid": {"sticking_probability": [1.0, 0.2]},
                })),
            )
            .await;
        let study_id = created.data().unwrap()["study_id"].as_str().unwrap().to_string();

        let none = fx
            .exec(None)
            .execute("analyze_parametric_study", args(json!({"study_id": study_id})))
            .await;
        assert_eq!(none.data().unwrap()["status"], "no_completed_simulations");

        let sims = fx
            .services
            .store
            .read(|d| d.study(&study_id).map(|st| d.study_simulations(st).into_iter().cloned().collect::<Vec<_>>()))
            .await
            .unwrap();
        for sim in &sims {
            let p = sim.parameters["sticking_probability"].as_f64().unwrap();
            let df = if p < 0.5 { 2.1 } else { 1.8 };
            fx.services
                .store
                .update_simulation(&sim.id, |s| {
                    s.status = Status::Completed;
                    s.metrics = Some(args(json!({"fractal_dimension": df, "radius_of_gyration": 5.0})));
                })
                .await
                .unwrap();
        }

        let r = fx
            .exec(None)
            .execute(
                "analyze_parametric_study",
                args(json!({"study_id": study_id, "run_missing_analysis": true})),
            )
            .await;
        let data = r.data().unwrap();
        let sp = &data["parameter_analysis"]["sticking_probability"];
        assert_eq!(sp["values"][0]["parameter_value"], "0.2");
        assert_eq!(sp["values"][0]["df_mean"], 2.1);
        assert_eq!(sp["trend"]["direction"], "decreasing");
        assert_eq!(sp["trend"]["change"], -0.3);
        assert_eq!(data["missing_box_counting"], 2);
        assert_eq!(data["analysis_queued"], 2);
        let queued = fx.services.queue.tasks_named(RUN_BOX_COUNTING).await;
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].status, TaskStatus::Pending);
    }

    #[test]
    fn test_trend_threshold() {
        let rows = vec![json!({"df_mean": 1.80}), json!({"df_mean": 1.83})];
        assert_eq!(compute_trend(&rows)["direction"], "stable");
        let rows = vec![json!({"df_mean": 1.80}), json!({"df_mean": 1.90})];
        assert_eq!(compute_trend(&rows)["direction"], "increasing");
        assert_eq!(compute_trend(&[json!({"count": 1})]), Value::Null);
    }

    #[tokio::test]
    async fn test_list_analyses() {
        let fx = fixture().await;
        let sim = fx.completed_simulation(Algorithm::Dla, json!({"n_particles": 64}), 1.8).await;
        fx.exec(Some(fx.project_id))
            .execute("run_fraktal_analysis", args(json!({"simulation_id": sim})))
            .await;
        fx.services
            .store
            .insert_image_analysis(ImageAnalysis {
                id: "img-1".into(),
                project_id: fx.project_id,
                method: "box_counting".into(),
                results: Some(args(json!({"fractal_dimension": 1.7, "r_squared": 0.99}))),
                status: Status::Completed,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let r = fx.exec(Some(fx.project_id)).execute("list_analyses", Arguments::new()).await;
        let data = r.data().unwrap();
        assert_eq!(data["count"], 2);
        assert_eq!(data["analyses"][0]["type"], "fraktal");
        assert_eq!(data["analyses"][1]["df"], 1.7);

        let r = fx
            .exec(None)
            .execute("list_analyses", args(json!({"simulation_id": sim, "analysis_type": "fraktal"})))
            .await;
        assert_eq!(r.data().unwrap()["count"], 1);

        let r = fx.exec(None).execute("list_analyses", Arguments::new()).await;
        assert_eq!(
            r.error().unwrap().message,
            "Either project_id or simulation_id is required"
        );

        let r = fx
            .exec_as(fx.stranger.clone(), Some(fx.project_id))
            .execute("list_analyses", Arguments::new())
            .await;
        assert_eq!(r.error().unwrap().error_type, ErrorKind::Permission);
    }
}
