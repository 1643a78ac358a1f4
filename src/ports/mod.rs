// Port traits: the seams between the service and its storage, generator and renderers.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::graph::{validate_identifier, GraphArtifact};
use crate::domain::view::GraphView;
use crate::error::{HaystackError, Result};
use crate::infrastructure::concurrency::CancellationToken;

pub mod cytoscape_exporter;
pub mod dot_exporter;

/// Read access to persisted graphs.
pub trait GraphRepository: Send + Sync {
    /// Identifiers of every complete artifact, sorted.
    fn list(&self) -> Result<Vec<String>>;
    fn contains(&self, id: &str) -> bool;
    fn load(&self, id: &str) -> Result<GraphArtifact>;

    /// Change marker of the stored artifact, if the backend can tell.
    fn stamp(&self, _id: &str) -> Option<ArtifactStamp> {
        None
    }
}

/// Latest modification time and total size of an artifact's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactStamp {
    pub modified: SystemTime,
    pub bytes: u64,
}

/// Produces new artifacts from programs.
pub trait GraphGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest, cancel: &CancellationToken)
        -> Result<GraphArtifact>;
}

/// Renders a view into one output format.
pub trait ViewExporter {
    fn render(&self, view: &GraphView) -> Result<String>;

    fn export(&self, view: &GraphView, path: &Path) -> Result<()> {
        let content = self.render(view)?;
        std::fs::write(path, content).map_err(|e| HaystackError::io(path, e))
    }
}

/// Input of one call-graph generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Folder or jar holding the program to analyze.
    pub input: PathBuf,
    /// Identifier of the artifact to produce.
    pub output: String,
    #[serde(default)]
    pub main_class: Option<String>,
    #[serde(default)]
    pub edge_filter: Vec<String>,
    #[serde(default)]
    pub jar_filter: Vec<String>,
    /// Regenerate even if the artifact already exists.
    #[serde(default)]
    pub force: bool,
}

impl GenerationRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            main_class: None,
            edge_filter: Vec::new(),
            jar_filter: Vec::new(),
            force: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.output).map_err(HaystackError::InvalidRequest)?;
        if self.input.as_os_str().is_empty() {
            return Err(HaystackError::InvalidRequest(
                "generation input path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Parameters recorded in the artifact's `meta.json`.
    pub fn attrs(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert(
            "input".to_string(),
            Value::String(self.input.to_string_lossy().into_owned()),
        );
        attrs.insert(
            "main_class".to_string(),
            self.main_class.clone().map_or(Value::Null, Value::String),
        );
        attrs.insert("edge_filter".to_string(), string_list(&self.edge_filter));
        attrs.insert("jar_filter".to_string(), string_list(&self.jar_filter));
        attrs
    }
}

fn string_list(words: &[String]) -> Value {
    Value::Array(words.iter().cloned().map(Value::String).collect())
}

/// Output formats a view can be rendered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderFormat {
    #[default]
    Json,
    Cytoscape,
    Dot,
}

impl RenderFormat {
    pub fn parse(s: &str) -> Option<RenderFormat> {
        match s.trim().to_lowercase().as_str() {
            "json" => Some(RenderFormat::Json),
            "cytoscape" | "cyto" => Some(RenderFormat::Cytoscape),
            "dot" | "graphviz" => Some(RenderFormat::Dot),
            _ => None,
        }
    }

    pub fn exporter(&self) -> Box<dyn ViewExporter> {
        match self {
            RenderFormat::Json => Box::new(JsonExporter),
            RenderFormat::Cytoscape => Box::new(cytoscape_exporter::CytoscapeExporter),
            RenderFormat::Dot => Box::new(dot_exporter::DotExporter),
        }
    }
}

/// The view as pretty-printed JSON.
pub struct JsonExporter;

impl ViewExporter for JsonExporter {
    fn render(&self, view: &GraphView) -> Result<String> {
        Ok(serde_json::to_string_pretty(view)?)
    }
}
