// Aglogen Assistant — Domain store
//
// In-process replacement for the relational tables the tools read and write:
// users, projects (with sharing), simulations, parametric studies, fractal
// analyses and per-user AI provider settings. Optional file-backed JSON
// persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store data is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Dla,
    Cca,
    Ballistic,
    BallisticCc,
    Tunable,
    TunableCc,
    Limiting,
}

impl Algorithm {
    pub const ALL: [Algorithm; 7] = [
        Algorithm::Dla,
        Algorithm::Cca,
        Algorithm::Ballistic,
        Algorithm::BallisticCc,
        Algorithm::Tunable,
        Algorithm::TunableCc,
        Algorithm::Limiting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Dla => "dla",
            Algorithm::Cca => "cca",
            Algorithm::Ballistic => "ballistic",
            Algorithm::BallisticCc => "ballistic_cc",
            Algorithm::Tunable => "tunable",
            Algorithm::TunableCc => "tunable_cc",
            Algorithm::Limiting => "limiting",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Algorithm::Dla => "Diffusion-Limited Aggregation",
            Algorithm::Cca => "Cluster-Cluster Aggregation",
            Algorithm::Ballistic => "Ballistic Particle-Cluster",
            Algorithm::BallisticCc => "Ballistic Cluster-Cluster",
            Algorithm::Tunable => "Tunable Sticking Probability",
            Algorithm::TunableCc => "Tunable Cluster-Cluster",
            Algorithm::Limiting => "Limiting Case Geometry",
        }
    }

    /// Case-insensitive lookup by code.
    pub fn parse(code: &str) -> Option<Algorithm> {
        let code = code.to_lowercase();
        Self::ALL.into_iter().find(|a| a.as_str() == code)
    }

    pub fn codes() -> Vec<&'static str> {
        Self::ALL.iter().map(Algorithm::as_str).collect()
    }
}

/// Lifecycle shared by simulations, studies and analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Queued,
        Status::Running,
        Status::Completed,
        Status::Failed,
        Status::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Cancelled => "cancelled",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Status::Queued => "Queued",
            Status::Running => "Running",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
            Status::Cancelled => "Cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Status> {
        let s = s.to_lowercase();
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Editor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraktalSource {
    SimulationProjection,
    UploadedImage,
}

impl FraktalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraktalSource::SimulationProjection => "simulation_projection",
            FraktalSource::UploadedImage => "uploaded_image",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            FraktalSource::SimulationProjection => "Simulation Projection",
            FraktalSource::UploadedImage => "Uploaded Image",
        }
    }
}

/// FRAKTAL model codes accepted by the analysis tools.
pub const FRAKTAL_MODELS: [&str; 2] = ["granulated_2012", "voxel_2018"];

pub fn fraktal_model_display(model: &str) -> &str {
    match model {
        "granulated_2012" => "Granulated 2012",
        "voxel_2018" => "Voxel 2018",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default = "default_true")]
    pub ai_access: bool,
}

fn default_true() -> bool {
    true
}

impl User {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            id,
            email: format!("{}@localhost", username),
            username,
            is_superuser: false,
            ai_access: true,
        }
    }

    pub fn superuser(mut self) -> Self {
        self.is_superuser = true;
        self
    }

    /// Shape injected into tool arguments under the `user` key.
    pub fn to_context_value(&self) -> Value {
        json!({
            "id": self.id,
            "username": self.username,
            "email": self.email,
            "is_superuser": self.is_superuser,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: i64,
    #[serde(default)]
    pub collaborators: Vec<Collaborator>,
    #[serde(default)]
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn can_read(&self, user: &User) -> bool {
        user.is_superuser
            || self.is_public
            || self.owner_id == user.id
            || self.collaborators.iter().any(|c| c.user_id == user.id)
    }

    pub fn can_write(&self, user: &User) -> bool {
        user.is_superuser
            || self.owner_id == user.id
            || self
                .collaborators
                .iter()
                .any(|c| c.user_id == user.id && c.role == Role::Editor)
    }
}

/// One particle: `[x, y, z, radius]`.
pub type GeometryRow = [f64; 4];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    pub id: String,
    pub project_id: i64,
    #[serde(default)]
    pub name: String,
    pub algorithm: Algorithm,
    pub parameters: Map<String, Value>,
    pub seed: i64,
    pub status: Status,
    #[serde(default)]
    pub geometry: Option<Vec<GeometryRow>>,
    #[serde(default)]
    pub metrics: Option<Map<String, Value>>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Simulation {
    pub fn new(project_id: i64, algorithm: Algorithm, parameters: Map<String, Value>, seed: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id,
            name: String::new(),
            algorithm,
            parameters,
            seed,
            status: Status::Queued,
            geometry: None,
            metrics: None,
            execution_time_ms: None,
            error_message: String::new(),
            task_id: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn n_particles(&self) -> Option<i64> {
        self.parameters.get("n_particles").and_then(Value::as_i64)
    }

    pub fn metric(&self, key: &str) -> Option<&Value> {
        self.metrics.as_ref().and_then(|m| m.get(key))
    }

    pub fn metric_f64(&self, key: &str) -> Option<f64> {
        self.metric(key).and_then(Value::as_f64)
    }

    /// Fractal dimension from the simulation itself, falling back to a
    /// box-counting result.
    pub fn fractal_dimension(&self) -> Option<f64> {
        self.metric_f64("fractal_dimension").or_else(|| {
            self.metric("box_counting")
                .and_then(|bc| bc.get("dimension"))
                .and_then(Value::as_f64)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParametricStudy {
    pub id: String,
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_algorithm: Algorithm,
    pub base_parameters: Map<String, Value>,
    pub parameter_grid: Map<String, Value>,
    pub seeds_per_combination: u32,
    #[serde(default)]
    pub include_box_counting: bool,
    #[serde(default)]
    pub box_counting_params: Option<Value>,
    #[serde(default)]
    pub simulation_ids: Vec<String>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraktalAnalysis {
    pub id: String,
    pub project_id: i64,
    #[serde(default)]
    pub simulation_id: Option<String>,
    pub name: String,
    pub source_type: FraktalSource,
    pub model: String,
    pub npix: f64,
    pub dpo: f64,
    #[serde(default)]
    pub auto_calibrate: bool,
    #[serde(default)]
    pub projection_params: Option<Value>,
    #[serde(default, with = "base64_bytes")]
    pub original_image: Option<Vec<u8>>,
    #[serde(default)]
    pub original_filename: String,
    #[serde(default)]
    pub original_content_type: String,
    #[serde(default)]
    pub results: Option<Map<String, Value>>,
    pub status: Status,
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl FraktalAnalysis {
    pub fn result(&self, key: &str) -> Value {
        self.results
            .as_ref()
            .and_then(|r| r.get(key))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub id: String,
    pub project_id: i64,
    pub method: String,
    #[serde(default)]
    pub results: Option<Map<String, Value>>,
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AIProviderConfig {
    pub id: String,
    pub user_id: i64,
    pub provider: String,
    pub api_key_encrypted: String,
    pub model_name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AIProviderConfig {
    pub fn new(
        user_id: i64,
        provider: impl Into<String>,
        model_name: impl Into<String>,
        api_key_encrypted: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            provider: provider.into(),
            api_key_encrypted: api_key_encrypted.into(),
            model_name: model_name.into(),
            is_default: false,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub users: BTreeMap<i64, User>,
    #[serde(default)]
    pub api_tokens: BTreeMap<String, i64>,
    #[serde(default)]
    pub projects: BTreeMap<i64, Project>,
    #[serde(default)]
    pub simulations: BTreeMap<String, Simulation>,
    #[serde(default)]
    pub studies: BTreeMap<String, ParametricStudy>,
    #[serde(default)]
    pub fraktal_analyses: BTreeMap<String, FraktalAnalysis>,
    #[serde(default)]
    pub image_analyses: BTreeMap<String, ImageAnalysis>,
    #[serde(default)]
    pub provider_configs: BTreeMap<String, AIProviderConfig>,
    #[serde(default)]
    next_project_id: i64,
}

impl StoreData {
    fn clear_default_provider(&mut self, user_id: i64) {
        for config in self.provider_configs.values_mut() {
            if config.user_id == user_id {
                config.is_default = false;
            }
        }
    }

    pub fn project(&self, id: i64) -> Result<&Project, StoreError> {
        self.projects
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(format!("Project '{}' not found", id)))
    }

    pub fn simulation(&self, id: &str) -> Result<&Simulation, StoreError> {
        self.simulations
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("Simulation '{}' not found", id)))
    }

    pub fn simulation_mut(&mut self, id: &str) -> Result<&mut Simulation, StoreError> {
        self.simulations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("Simulation '{}' not found", id)))
    }

    pub fn study(&self, id: &str) -> Result<&ParametricStudy, StoreError> {
        self.studies
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("Parametric study '{}' not found", id)))
    }

    pub fn fraktal_analysis(&self, id: &str) -> Result<&FraktalAnalysis, StoreError> {
        self.fraktal_analyses
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("FRAKTAL analysis '{}' not found", id)))
    }

    /// Resolve a project the user may read.
    pub fn readable_project(&self, user: &User, id: i64) -> Result<&Project, StoreError> {
        let project = self.project(id)?;
        if !project.can_read(user) {
            return Err(StoreError::Forbidden(format!(
                "You do not have access to project '{}'",
                id
            )));
        }
        Ok(project)
    }

    /// Resolve a project the user may modify.
    pub fn writable_project(&self, user: &User, id: i64) -> Result<&Project, StoreError> {
        let project = self.readable_project(user, id)?;
        if !project.can_write(user) {
            return Err(StoreError::Forbidden(format!(
                "You do not have permission to modify project '{}'",
                id
            )));
        }
        Ok(project)
    }

    /// Look up a simulation and check read access through its project.
    pub fn readable_simulation(&self, user: &User, id: &str) -> Result<&Simulation, StoreError> {
        let sim = self.simulation(id)?;
        self.readable_project(user, sim.project_id)?;
        Ok(sim)
    }

    pub fn readable_study(&self, user: &User, id: &str) -> Result<&ParametricStudy, StoreError> {
        let study = self.study(id)?;
        self.readable_project(user, study.project_id)?;
        Ok(study)
    }

    /// Projects visible to the user, most recently updated first.
    pub fn projects_for(&self, user: &User) -> Vec<&Project> {
        let mut projects: Vec<&Project> = self
            .projects
            .values()
            .filter(|p| {
                user.is_superuser
                    || p.owner_id == user.id
                    || p.collaborators.iter().any(|c| c.user_id == user.id)
            })
            .collect();
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        projects
    }

    /// Simulations in a project, newest first.
    pub fn simulations_in(&self, project_id: i64) -> Vec<&Simulation> {
        let mut sims: Vec<&Simulation> = self
            .simulations
            .values()
            .filter(|s| s.project_id == project_id)
            .collect();
        sims.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sims
    }

    pub fn analysis_count(&self, project_id: i64) -> usize {
        self.fraktal_analyses
            .values()
            .filter(|a| a.project_id == project_id)
            .count()
            + self
                .image_analyses
                .values()
                .filter(|a| a.project_id == project_id)
                .count()
    }

    pub fn study_simulations<'a>(&'a self, study: &ParametricStudy) -> Vec<&'a Simulation> {
        study
            .simulation_ids
            .iter()
            .filter_map(|id| self.simulations.get(id))
            .collect()
    }

    pub fn touch_project(&mut self, id: i64) {
        if let Some(p) = self.projects.get_mut(&id) {
            p.updated_at = Utc::now();
        }
    }
}

/// Cloneable handle onto the shared store.
#[derive(Clone, Default)]
pub struct Store {
    data: Arc<RwLock<StoreData>>,
    path: Option<PathBuf>,
    file: Arc<Mutex<()>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a file-backed store; a missing file starts empty.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let data = if path.exists() {
            let json = std::fs::read_to_string(path)?;
            serde_json::from_str(&json)?
        } else {
            StoreData::default()
        };
        tracing::info!(path = %path.display(), "Opened store");
        Ok(Self {
            data: Arc::new(RwLock::new(data)),
            path: Some(path.to_path_buf()),
            file: Arc::default(),
        })
    }

    /// Run a read-only query.
    pub async fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> R {
        let data = self.data.read().await;
        f(&data)
    }

    /// Run a mutation and persist the result when file-backed.
    pub async fn write<R>(
        &self,
        f: impl FnOnce(&mut StoreData) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut data = self.data.write().await;
        let out = f(&mut data)?;
        self.persist(data).await?;
        Ok(out)
    }

    /// Snapshot under the data lock and write it once the lock is released.
    /// Holding the file lock across the hand-off keeps writes in order.
    async fn persist(&self, data: RwLockWriteGuard<'_, StoreData>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&*data)?;
        let _file = self.file.lock().await;
        drop(data);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    // -- users ---------------------------------------------------------------

    pub async fn add_user(&self, user: User) -> Result<(), StoreError> {
        self.write(|d| {
            d.users.insert(user.id, user);
            Ok(())
        })
        .await
    }

    /// Mint a bearer token for an existing user.
    pub async fn issue_token(&self, user_id: i64) -> Result<String, StoreError> {
        self.write(|d| {
            if !d.users.contains_key(&user_id) {
                return Err(StoreError::NotFound(format!("User '{}' not found", user_id)));
            }
            let token = uuid::Uuid::new_v4().simple().to_string();
            d.api_tokens.insert(token.clone(), user_id);
            Ok(token)
        })
        .await
    }

    pub async fn user_for_token(&self, token: &str) -> Option<User> {
        self.read(|d| {
            d.api_tokens
                .get(token)
                .and_then(|id| d.users.get(id))
                .cloned()
        })
        .await
    }

    pub async fn user(&self, id: i64) -> Option<User> {
        self.read(|d| d.users.get(&id).cloned()).await
    }

    // -- projects ------------------------------------------------------------

    pub async fn create_project(
        &self,
        owner_id: i64,
        name: &str,
        description: &str,
    ) -> Result<Project, StoreError> {
        self.write(|d| {
            d.next_project_id += 1;
            let now = Utc::now();
            let project = Project {
                id: d.next_project_id,
                name: name.to_string(),
                description: description.to_string(),
                owner_id,
                collaborators: Vec::new(),
                is_public: false,
                created_at: now,
                updated_at: now,
            };
            d.projects.insert(project.id, project.clone());
            Ok(project)
        })
        .await
    }

    pub async fn share_project(&self, project_id: i64, user_id: i64, role: Role) -> Result<(), StoreError> {
        self.write(|d| {
            let project = d
                .projects
                .get_mut(&project_id)
                .ok_or_else(|| StoreError::NotFound(format!("Project '{}' not found", project_id)))?;
            project.collaborators.retain(|c| c.user_id != user_id);
            project.collaborators.push(Collaborator { user_id, role });
            Ok(())
        })
        .await
    }

    // -- simulations and analyses --------------------------------------------

    pub async fn insert_simulation(&self, sim: Simulation) -> Result<(), StoreError> {
        self.write(|d| {
            d.touch_project(sim.project_id);
            d.simulations.insert(sim.id.clone(), sim);
            Ok(())
        })
        .await
    }

    pub async fn simulation(&self, id: &str) -> Result<Simulation, StoreError> {
        self.read(|d| d.simulation(id).cloned()).await
    }

    pub async fn update_simulation(
        &self,
        id: &str,
        f: impl FnOnce(&mut Simulation),
    ) -> Result<Simulation, StoreError> {
        self.write(|d| {
            let sim = d.simulation_mut(id)?;
            f(sim);
            Ok(sim.clone())
        })
        .await
    }

    pub async fn insert_study(&self, study: ParametricStudy) -> Result<(), StoreError> {
        self.write(|d| {
            d.studies.insert(study.id.clone(), study);
            Ok(())
        })
        .await
    }

    pub async fn insert_fraktal_analysis(&self, analysis: FraktalAnalysis) -> Result<(), StoreError> {
        self.write(|d| {
            d.fraktal_analyses.insert(analysis.id.clone(), analysis);
            Ok(())
        })
        .await
    }

    pub async fn insert_image_analysis(&self, analysis: ImageAnalysis) -> Result<(), StoreError> {
        self.write(|d| {
            d.image_analyses.insert(analysis.id.clone(), analysis);
            Ok(())
        })
        .await
    }

    pub async fn fraktal_analysis(&self, id: &str) -> Result<FraktalAnalysis, StoreError> {
        self.read(|d| d.fraktal_analysis(id).cloned()).await
    }

    // -- provider configs ----------------------------------------------------

    /// Add a provider config. A user has at most one config per provider; a
    /// new default clears the flag on the user's other configs.
    pub async fn add_provider_config(&self, config: AIProviderConfig) -> Result<(), StoreError> {
        self.write(|d| {
            let duplicate = d
                .provider_configs
                .values()
                .any(|c| c.user_id == config.user_id && c.provider == config.provider);
            if duplicate {
                return Err(StoreError::Invalid(format!(
                    "A '{}' configuration already exists for this user",
                    config.provider
                )));
            }
            if config.is_default {
                d.clear_default_provider(config.user_id);
            }
            d.provider_configs.insert(config.id.clone(), config);
            Ok(())
        })
        .await
    }

    /// Every config a user owns, in selection order.
    pub async fn provider_configs_for(&self, user_id: i64) -> Vec<AIProviderConfig> {
        self.read(|d| {
            let mut configs: Vec<AIProviderConfig> = d
                .provider_configs
                .values()
                .filter(|c| c.user_id == user_id)
                .cloned()
                .collect();
            sort_provider_configs(&mut configs);
            configs
        })
        .await
    }

    /// A config owned by `user_id`. Other users' configs read as missing.
    pub async fn provider_config(&self, user_id: i64, id: &str) -> Option<AIProviderConfig> {
        self.read(|d| d.provider_configs.get(id).filter(|c| c.user_id == user_id).cloned())
            .await
    }

    /// Apply `f` to one of the user's configs, keeping a single default.
    pub async fn update_provider_config(
        &self,
        user_id: i64,
        id: &str,
        f: impl FnOnce(&mut AIProviderConfig),
    ) -> Result<AIProviderConfig, StoreError> {
        self.write(|d| {
            let mut config = d
                .provider_configs
                .get(id)
                .filter(|c| c.user_id == user_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("Provider configuration '{}' not found", id)))?;
            f(&mut config);
            config.updated_at = Utc::now();
            if config.is_default {
                d.clear_default_provider(user_id);
            }
            d.provider_configs.insert(config.id.clone(), config.clone());
            Ok(config)
        })
        .await
    }

    pub async fn set_default_provider(&self, user_id: i64, id: &str) -> Result<AIProviderConfig, StoreError> {
        self.update_provider_config(user_id, id, |c| c.is_default = true).await
    }

    pub async fn delete_provider_config(&self, user_id: i64, id: &str) -> Result<(), StoreError> {
        self.write(|d| {
            let owned = d.provider_configs.get(id).is_some_and(|c| c.user_id == user_id);
            if !owned {
                return Err(StoreError::NotFound(format!("Provider configuration '{}' not found", id)));
            }
            d.provider_configs.remove(id);
            Ok(())
        })
        .await
    }

    /// Active configs for a user: default first, then newest.
    pub async fn active_provider_configs(&self, user_id: i64) -> Vec<AIProviderConfig> {
        self.read(|d| {
            let mut configs: Vec<AIProviderConfig> = d
                .provider_configs
                .values()
                .filter(|c| c.user_id == user_id && c.is_active)
                .cloned()
                .collect();
            sort_provider_configs(&mut configs);
            configs
        })
        .await
    }
}

/// Default first, then newest.
fn sort_provider_configs(configs: &mut [AIProviderConfig]) {
    configs.sort_by(|a, b| {
        b.is_default
            .cmp(&a.is_default)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn seeded() -> (Store, User, User, Project) {
        let store = Store::new();
        let alice = User::new(1, "alice");
        let bob = User::new(2, "bob");
        store.add_user(alice.clone()).await.unwrap();
        store.add_user(bob.clone()).await.unwrap();
        let project = store.create_project(alice.id, "Soot", "").await.unwrap();
        (store, alice, bob, project)
    }

    #[test]
    fn test_algorithm_codes() {
        assert_eq!(Algorithm::parse("BALLISTIC_CC"), Some(Algorithm::BallisticCc));
        assert_eq!(Algorithm::parse("nope"), None);
        assert_eq!(serde_json::to_value(Algorithm::TunableCc).unwrap(), "tunable_cc");
        assert_eq!(Algorithm::codes().len(), 7);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(Status::parse("Completed"), Some(Status::Completed));
        assert!(Status::Cancelled.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[tokio::test]
    async fn test_project_access_rules() {
        let (store, alice, bob, project) = seeded().await;
        store
            .read(|d| {
                assert!(d.readable_project(&alice, project.id).is_ok());
                assert!(matches!(
                    d.readable_project(&bob, project.id),
                    Err(StoreError::Forbidden(_))
                ));
                assert!(matches!(d.project(999), Err(StoreError::NotFound(_))));
            })
            .await;

        store.share_project(project.id, bob.id, Role::Viewer).await.unwrap();
        store
            .read(|d| {
                assert!(d.readable_project(&bob, project.id).is_ok());
                assert!(matches!(
                    d.writable_project(&bob, project.id),
                    Err(StoreError::Forbidden(_))
                ));
            })
            .await;

        store.share_project(project.id, bob.id, Role::Editor).await.unwrap();
        store
            .read(|d| assert!(d.writable_project(&bob, project.id).is_ok()))
            .await;

        let root = User::new(9, "root").superuser();
        store
            .read(|d| assert!(d.writable_project(&root, project.id).is_ok()))
            .await;
    }

    #[tokio::test]
    async fn test_tokens() {
        let (store, alice, _, _) = seeded().await;
        let token = store.issue_token(alice.id).await.unwrap();
        assert_eq!(store.user_for_token(&token).await.unwrap().username, "alice");
        assert!(store.user_for_token("bogus").await.is_none());
        assert!(store.issue_token(404).await.is_err());
    }

    #[tokio::test]
    async fn test_fractal_dimension_fallback() {
        let mut sim = Simulation::new(1, Algorithm::Dla, Map::new(), 42);
        assert_eq!(sim.fractal_dimension(), None);
        sim.metrics = Some(
            json!({"box_counting": {"dimension": 1.8}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(sim.fractal_dimension(), Some(1.8));
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = Store::open(&path).unwrap();
        store.add_user(User::new(1, "alice")).await.unwrap();
        let project = store.create_project(1, "P", "desc").await.unwrap();
        let mut analysis = FraktalAnalysis {
            id: "a1".into(),
            project_id: project.id,
            simulation_id: None,
            name: "img".into(),
            source_type: FraktalSource::UploadedImage,
            model: "granulated_2012".into(),
            npix: 10.0,
            dpo: 40.0,
            auto_calibrate: false,
            projection_params: None,
            original_image: None,
            original_filename: "x.png".into(),
            original_content_type: "image/png".into(),
            results: None,
            status: Status::Queued,
            task_id: String::new(),
            error_message: String::new(),
            execution_time_ms: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        analysis.original_image = Some(vec![0x89, 0x50, 0x4e, 0x47]);
        store.insert_fraktal_analysis(analysis).await.unwrap();

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.user(1).await.unwrap().username, "alice");
        let a = reopened.fraktal_analysis("a1").await.unwrap();
        assert_eq!(a.original_image.as_deref(), Some(&[0x89, 0x50, 0x4e, 0x47][..]));
        let next = reopened.create_project(1, "Q", "").await.unwrap();
        assert_eq!(next.id, project.id + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_all_reach_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Store::open(&path).unwrap();

        let mut writers = tokio::task::JoinSet::new();
        for id in 1..=16 {
            let store = store.clone();
            writers.spawn(async move { store.add_user(User::new(id, format!("user{}", id))).await });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap().unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        assert_eq!(reopened.read(|d| d.users.len()).await, 16);
    }

    #[tokio::test]
    async fn test_provider_config_ordering() {
        let store = Store::new();
        let now = Utc::now();
        let mk = |id: &str, default: bool, offset: i64| AIProviderConfig {
            id: id.into(),
            user_id: 1,
            provider: id.into(),
            api_key_encrypted: String::new(),
            model_name: String::new(),
            is_default: default,
            is_active: true,
            created_at: now + chrono::Duration::seconds(offset),
            updated_at: now,
        };
        store.add_provider_config(mk("old-default", true, 0)).await.unwrap();
        store.add_provider_config(mk("newer", false, 10)).await.unwrap();
        store.add_provider_config(mk("new-default", true, 5)).await.unwrap();

        let configs = store.active_provider_configs(1).await;
        let ids: Vec<&str> = configs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["new-default", "newer", "old-default"]);
    }

    #[tokio::test]
    async fn test_provider_config_management() {
        let store = Store::new();
        let openai = AIProviderConfig::new(1, "openai", "gpt-4o", "enc-1");
        let mut anthropic = AIProviderConfig::new(1, "anthropic", "claude-x", "enc-2");
        anthropic.is_default = true;
        store.add_provider_config(openai.clone()).await.unwrap();
        store.add_provider_config(anthropic.clone()).await.unwrap();

        let dup = store
            .add_provider_config(AIProviderConfig::new(1, "openai", "gpt-4o-mini", "enc-3"))
            .await;
        assert!(matches!(dup, Err(StoreError::Invalid(_))));
        // Another user may configure the same provider.
        store
            .add_provider_config(AIProviderConfig::new(2, "openai", "gpt-4o", "enc-4"))
            .await
            .unwrap();

        let switched = store.set_default_provider(1, &openai.id).await.unwrap();
        assert!(switched.is_default);
        let configs = store.provider_configs_for(1).await;
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].id, openai.id);
        assert!(!configs[1].is_default);

        let updated = store
            .update_provider_config(1, &anthropic.id, |c| c.is_active = false)
            .await
            .unwrap();
        assert!(!updated.is_active);
        assert_eq!(store.active_provider_configs(1).await.len(), 1);

        assert!(store.provider_config(2, &openai.id).await.is_none());
        assert!(matches!(
            store.delete_provider_config(2, &openai.id).await,
            Err(StoreError::NotFound(_))
        ));
        store.delete_provider_config(1, &openai.id).await.unwrap();
        assert_eq!(store.provider_configs_for(1).await.len(), 1);
    }
}
