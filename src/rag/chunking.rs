// Aglogen Assistant — Document chunking

use serde_json::{json, Map, Value};

use crate::store::{fraktal_model_display, FraktalAnalysis, Simulation};

/// A chunk before it is embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub content: String,
    pub section: String,
    pub metadata: Map<String, Value>,
}

impl ChunkDraft {
    fn new(content: String, section: &str, chunk_type: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("chunk_type".into(), json!(chunk_type));
        Self {
            content,
            section: section.to_string(),
            metadata,
        }
    }
}

pub const SCIENTIFIC_CHUNK_SIZE: usize = 2000;
pub const SCIENTIFIC_CHUNK_OVERLAP: usize = 200;
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// An overview chunk, plus a results chunk when metrics exist.
pub fn chunk_simulation_data(simulation: &Simulation) -> Vec<ChunkDraft> {
    let mut chunks = vec![ChunkDraft::new(simulation_overview(simulation), "overview", "overview")];
    if let Some(metrics) = simulation.metrics.as_ref().filter(|m| !m.is_empty()) {
        chunks.push(ChunkDraft::new(simulation_results(metrics), "results", "results"));
    }
    chunks
}

pub fn chunk_analysis_data(analysis: &FraktalAnalysis) -> Vec<ChunkDraft> {
    let mut chunks = vec![ChunkDraft::new(analysis_overview(analysis), "overview", "overview")];
    if let Some(results) = analysis.results.as_ref().filter(|r| !r.is_empty()) {
        chunks.push(ChunkDraft::new(analysis_results(results), "results", "results"));
    }
    chunks
}

pub fn chunk_scientific_document(content: &str) -> Vec<ChunkDraft> {
    TextSplitter::new(SCIENTIFIC_CHUNK_SIZE, SCIENTIFIC_CHUNK_OVERLAP)
        .split_text(content)
        .into_iter()
        .map(|text| ChunkDraft::new(text, "", "scientific"))
        .collect()
}

fn simulation_overview(sim: &Simulation) -> String {
    let mut parts = vec![
        "Simulation Overview:".to_string(),
        format!(
            "Algorithm: {} ({})",
            sim.algorithm.as_str().to_uppercase(),
            sim.algorithm.display_name()
        ),
        format!(
            "Particles: {}",
            sim.parameters.get("n_particles").map(plain).unwrap_or_else(|| "N/A".into())
        ),
        format!("Seed: {}", sim.seed),
        String::new(),
        "Parameters:".to_string(),
    ];
    for (key, value) in &sim.parameters {
        parts.push(format!("  - {}: {}", parameter_label(key), plain(value)));
    }
    parts.join("\n")
}

fn parameter_label(key: &str) -> String {
    match key {
        "n_particles" => "Number of particles".into(),
        "sticking_probability" => "Sticking probability".into(),
        "particle_radius" => "Particle radius".into(),
        "max_attempts" => "Maximum walk attempts".into(),
        "grid_size" => "Grid size".into(),
        "fractal_dimension" => "Target fractal dimension".into(),
        "prefactor" => "Target prefactor".into(),
        "n_primary" => "Primary particles per cluster".into(),
        "sigma" => "Size distribution sigma".into(),
        "sintering_coefficient" => "Sintering coefficient".into(),
        other => title_case(other),
    }
}

fn simulation_results(metrics: &Map<String, Value>) -> String {
    const LABELS: [(&str, &str); 6] = [
        ("fractal_dimension", "Fractal Dimension (Df)"),
        ("fractal_dimension_std", "  Standard Deviation"),
        ("prefactor", "Prefactor (kf)"),
        ("radius_of_gyration", "Radius of Gyration (Rg)"),
        ("porosity", "Porosity"),
        ("overlap_volume", "Overlap Volume"),
    ];

    let mut parts = vec!["Simulation Results:".to_string()];
    for (key, label) in LABELS {
        if let Some(value) = metrics.get(key) {
            parts.push(format!("  - {}: {}", label, fixed(value, 4)));
        }
    }

    if let Some(Value::Object(coord)) = metrics.get("coordination") {
        let mean = coord.get("mean").cloned().unwrap_or_else(|| json!("N/A"));
        if mean.is_f64() {
            let std = coord.get("std").cloned().unwrap_or_else(|| json!("N/A"));
            parts.push(format!(
                "  - Coordination Number: {} (std: {})",
                fixed(&mean, 2),
                fixed(&std, 2)
            ));
        } else {
            parts.push(format!("  - Coordination Number: {}", plain(&mean)));
        }
    }
    parts.join("\n")
}

fn analysis_overview(analysis: &FraktalAnalysis) -> String {
    [
        "FRAKTAL Analysis Overview:".to_string(),
        format!(
            "Model: {} ({})",
            analysis.model.to_uppercase(),
            fraktal_model_display(&analysis.model)
        ),
        format!("Source: {}", analysis.source_type.display_name()),
        String::new(),
        "Analysis Parameters:".to_string(),
        format!("  - Image resolution (npix): {}", analysis.npix),
        format!("  - Primary particle diameter (dpo): {}", analysis.dpo),
        format!("  - Auto-calibrated: {}", if analysis.auto_calibrate { "True" } else { "False" }),
    ]
    .join("\n")
}

fn analysis_results(results: &Map<String, Value>) -> String {
    const LABELS: [(&str, &str, usize); 10] = [
        ("df", "Fractal Dimension (Df)", 4),
        ("rg", "Radius of Gyration (Rg)", 4),
        ("ap", "Primary Particle Area (Ap)", 4),
        ("npo", "Number of Primary Particles (Npo)", 1),
        ("kf", "Prefactor (kf)", 4),
        ("zf", "Zf coefficient", 4),
        ("jf", "Jf coefficient", 4),
        ("volume", "Volume", 4),
        ("mass", "Mass", 4),
        ("surface_area", "Surface Area", 4),
    ];

    let mut parts = vec!["FRAKTAL Analysis Results:".to_string()];
    for (key, label, places) in LABELS {
        if let Some(value) = results.get(key) {
            parts.push(format!("  - {}: {}", label, fixed(value, places)));
        }
    }
    parts.join("\n")
}

/// Floats at fixed precision; anything else as plain text.
pub(crate) fn fixed(value: &Value, places: usize) -> String {
    match value {
        Value::Number(n) if n.is_f64() => format!("{:.*}", places, n.as_f64().unwrap_or_default()),
        other => plain(other),
    }
}

/// Human text for a JSON scalar: strings unquoted, booleans capitalised.
pub(crate) fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "True".into(),
        Value::Bool(false) => "False".into(),
        Value::Null => "None".into(),
        other => other.to_string(),
    }
}

fn title_case(key: &str) -> String {
    key.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Recursive character splitter
// ---------------------------------------------------------------------------

/// Splits on the coarsest separator that occurs, recursing into pieces that
/// are still too long, then greedily merges pieces back up to `chunk_size`
/// characters with `overlap` characters carried between neighbours.
pub struct TextSplitter {
    chunk_size: usize,
    overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap: overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (idx, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || text.contains(**s))
            .map(|(i, s)| (i, *s))
            .unwrap_or((separators.len(), ""));
        let remaining = separators.get(idx + 1..).unwrap_or(&[]);

        let pieces: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut out = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for piece in pieces {
            if char_len(&piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                out.extend(self.merge(&pending, separator));
                pending.clear();
            }
            if remaining.is_empty() {
                out.push(piece);
            } else {
                out.extend(self.split_with(&piece, remaining));
            }
        }
        if !pending.is_empty() {
            out.extend(self.merge(&pending, separator));
        }
        out
    }

    fn merge(&self, pieces: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut docs = Vec::new();
        let mut current: std::collections::VecDeque<&str> = std::collections::VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            let joiner = if current.is_empty() { 0 } else { sep_len };
            if total + len + joiner > self.chunk_size && !current.is_empty() {
                push_joined(&mut docs, &current, separator);
                while total > self.overlap
                    || (total > 0 && total + len + if current.is_empty() { 0 } else { sep_len } > self.chunk_size)
                {
                    let Some(front) = current.pop_front() else { break };
                    total -= char_len(front) + if current.is_empty() { 0 } else { sep_len };
                }
            }
            total += len + if current.is_empty() { 0 } else { sep_len };
            current.push_back(piece);
        }
        push_joined(&mut docs, &current, separator);
        docs
    }
}

fn push_joined(docs: &mut Vec<String>, parts: &std::collections::VecDeque<&str>, separator: &str) {
    let joined = parts.iter().copied().collect::<Vec<&str>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        docs.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Algorithm, FraktalSource, Status};

    fn sim() -> Simulation {
        let params = json!({"n_particles": 500, "sticking_probability": 0.5, "box_size": 10});
        let mut sim = Simulation::new(1, Algorithm::Dla, params.as_object().cloned().unwrap(), 42);
        sim.metrics = Some(
            json!({
                "fractal_dimension": 1.7812345,
                "radius_of_gyration": 12.5,
                "porosity": 1,
                "coordination": {"mean": 2.0, "std": 0.5}
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        sim
    }

    #[test]
    fn test_simulation_chunks() {
        let chunks = chunk_simulation_data(&sim());
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].section, "overview");
        assert_eq!(chunks[0].metadata["chunk_type"], "overview");
        let overview = &chunks[0].content;
        assert!(overview.starts_with("Simulation Overview:\nAlgorithm: DLA (Diffusion-Limited Aggregation)"));
        assert!(overview.contains("Particles: 500"));
        assert!(overview.contains("  - Sticking probability: 0.5"));
        assert!(overview.contains("  - Box Size: 10"));

        let results = &chunks[1].content;
        assert!(results.contains("  - Fractal Dimension (Df): 1.7812"));
        assert!(results.contains("  - Radius of Gyration (Rg): 12.5000"));
        assert!(results.contains("  - Porosity: 1\n"));
        assert!(results.contains("  - Coordination Number: 2.00 (std: 0.50)"));
    }

    #[test]
    fn test_simulation_without_metrics_has_only_overview() {
        let mut s = sim();
        s.metrics = None;
        assert_eq!(chunk_simulation_data(&s).len(), 1);
    }

    #[test]
    fn test_analysis_chunks() {
        let analysis = FraktalAnalysis {
            id: "a".into(),
            project_id: 1,
            simulation_id: None,
            name: "img".into(),
            source_type: FraktalSource::UploadedImage,
            model: "granulated_2012".into(),
            npix: 512.0,
            dpo: 30.0,
            auto_calibrate: false,
            projection_params: None,
            original_image: None,
            original_filename: String::new(),
            original_content_type: String::new(),
            results: json!({"df": 1.8, "npo": 120.25}).as_object().cloned(),
            status: Status::Completed,
            task_id: String::new(),
            error_message: String::new(),
            execution_time_ms: None,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        let chunks = chunk_analysis_data(&analysis);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("Model: GRANULATED_2012 (Granulated 2012)"));
        assert!(chunks[0].content.contains("Source: Uploaded Image"));
        assert!(chunks[1].content.contains("Number of Primary Particles (Npo): 120.2"));
        assert!(chunks[1].content.contains("Fractal Dimension (Df): 1.8000"));
    }

    #[test]
    fn test_splitter_respects_size_and_overlap() {
        let paragraph = "word ".repeat(300);
        let text = format!("{}\n\n{}\n\n{}", paragraph, paragraph, paragraph);
        let chunks = TextSplitter::new(500, 50).split_text(&text);
        assert!(chunks.len() > 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 500));
        assert!(chunks.iter().all(|c| !c.starts_with(' ')));
    }

    #[test]
    fn test_splitter_keeps_short_text_whole() {
        let chunks = chunk_scientific_document("Short abstract.\n\nSecond paragraph.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata["chunk_type"], "scientific");
        assert!(chunk_scientific_document("   ").is_empty());
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("box_size"), "Box Size");
        assert_eq!(parameter_label("n_primary"), "Primary particles per cluster");
    }
}
