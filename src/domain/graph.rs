// Graph artifact structures for Haystack.
// A persisted graph of code hierarchy elements and the dependencies between them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::domain::hierarchy::HierarchyLevel;

/// Highest `meta.json` version this build understands.
pub const SCHEMA_VERSION: u32 = 1;

pub const META_FILE: &str = "meta.json";
pub const MAPPING_FILE: &str = "mapping.json";
pub const EDGES_FILE: &str = "edges.json";

/// Files that together make up one artifact directory.
pub const ARTIFACT_FILES: [&str; 3] = [EDGES_FILE, MAPPING_FILE, META_FILE];

/// How the edges of a graph were inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// caller -> callee, extracted from a program
    #[serde(rename = "callgraph")]
    Call,
    /// elements modified together in the same commit or pull request
    #[serde(rename = "git_changes")]
    CoChange,
}

impl RelationKind {
    pub fn name(&self) -> &'static str {
        match self {
            RelationKind::Call => "callgraph",
            RelationKind::CoChange => "git_changes",
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn default_version() -> u32 {
    1
}

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphMeta {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    #[serde(rename = "hierch")]
    pub hierarchy: HierarchyLevel,
    /// Parameters used when the graph was produced.
    #[serde(default)]
    pub attrs: Map<String, Value>,
    /// Hash of `attrs`, used to tell regenerated graphs apart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Number>,
}

impl GraphMeta {
    /// Metadata for a freshly generated method-level call graph.
    pub fn for_callgraph(attrs: Map<String, Value>) -> Self {
        let hash = attrs_hash(&attrs);
        Self {
            version: SCHEMA_VERSION,
            kind: RelationKind::Call,
            hierarchy: HierarchyLevel::Method,
            attrs,
            hash: Some(Number::from(hash)),
        }
    }
}

/// Stable 64-bit FNV-1a hash of the attrs' JSON text.
pub fn attrs_hash(attrs: &Map<String, Value>) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let text = Value::Object(attrs.clone()).to_string();
    text.bytes().fold(OFFSET, |h, b| (h ^ b as u64).wrapping_mul(PRIME))
}

/// Properties of a node as stored in `mapping.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Anything else the producer recorded; passed through to renderers.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub props: NodeProps,
}

/// One record of `edges.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeRecord {
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EdgeRecord {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            weight: None,
            confidence: None,
            extra: Map::new(),
        }
    }

    /// Build an edge from one JSON record. Association-rule output names the
    /// endpoints `antecedents`/`consequents`; both spellings are accepted.
    pub fn from_record(mut record: Map<String, Value>) -> Result<Self, String> {
        let source = take_endpoint(&mut record, "source", "antecedents")?;
        let target = take_endpoint(&mut record, "target", "consequents")?;
        let weight = take_number(&mut record, "weight")?;
        let confidence = take_number(&mut record, "confidence")?;
        Ok(Self {
            source,
            target,
            weight,
            confidence,
            extra: record,
        })
    }

    /// `weight`, else `confidence`, else 1.
    pub fn effective_weight(&self) -> f64 {
        self.weight.or(self.confidence).unwrap_or(1.0)
    }
}

fn take_endpoint(record: &mut Map<String, Value>, key: &str, alias: &str) -> Result<String, String> {
    let value = record
        .remove(key)
        .or_else(|| record.remove(alias))
        .ok_or_else(|| format!("missing '{}' (or '{}')", key, alias))?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(format!("'{}' must be a string, got {}", key, other)),
    }
}

fn take_number(record: &mut Map<String, Value>, key: &str) -> Result<Option<f64>, String> {
    match record.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(format!("'{}' must be a number, got {}", key, other)),
    }
}

/// Check that `id` can name an artifact: a single, visible path component.
pub fn validate_identifier(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("graph identifier must not be empty".to_string());
    }
    if id.starts_with('.') {
        return Err(format!("graph identifier '{}' must not start with '.'", id));
    }
    if id.contains(['/', '\\']) || id.contains('\0') {
        return Err(format!("graph identifier '{}' must not contain path separators", id));
    }
    Ok(())
}

/// A named, persisted graph.
#[derive(Debug, Clone)]
pub struct GraphArtifact {
    pub id: String,
    pub meta: GraphMeta,
    nodes: Vec<GraphNode>,
    node_index: HashMap<String, usize>,
    edges: Vec<EdgeRecord>,
}

impl GraphArtifact {
    /// Assemble an artifact and check the cross-file invariants.
    /// Returns the reason for rejection on failure.
    pub fn new(
        id: impl Into<String>,
        meta: GraphMeta,
        nodes: Vec<GraphNode>,
        edges: Vec<EdgeRecord>,
    ) -> Result<Self, String> {
        if meta.version > SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema version {} (newest supported is {})",
                meta.version, SCHEMA_VERSION
            ));
        }

        let mut node_index = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            if node.id.is_empty() {
                return Err(format!("node #{} has an empty identifier", idx));
            }
            if node_index.insert(node.id.clone(), idx).is_some() {
                return Err(format!("duplicate node identifier '{}'", node.id));
            }
        }

        for (idx, edge) in edges.iter().enumerate() {
            for endpoint in [&edge.source, &edge.target] {
                if !node_index.contains_key(endpoint) {
                    return Err(format!(
                        "edge #{} ({} -> {}) references unknown node '{}'",
                        idx, edge.source, edge.target, endpoint
                    ));
                }
            }
            let weight = edge.effective_weight();
            if !weight.is_finite() || weight < 0.0 {
                return Err(format!("edge #{} has an invalid weight {}", idx, weight));
            }
        }

        Ok(Self {
            id: id.into(),
            meta,
            nodes,
            node_index,
            edges,
        })
    }

    pub fn kind(&self) -> RelationKind {
        self.meta.kind
    }

    pub fn hierarchy(&self) -> HierarchyLevel {
        self.meta.hierarchy
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[EdgeRecord] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.node_index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn node_position(&self, id: &str) -> Option<usize> {
        self.node_index.get(id).copied()
    }

    pub fn summary(&self) -> GraphSummary {
        GraphSummary {
            id: self.id.clone(),
            kind: self.meta.kind,
            hierarchy: self.meta.hierarchy,
            vertices: self.nodes.len(),
            edges: self.edges.len(),
            attrs: self.meta.attrs.clone(),
            hash: self.meta.hash.clone(),
            viewable: self.meta.hierarchy.included(),
        }
    }
}

/// What the service shows about an artifact before it is rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    pub hierarchy: HierarchyLevel,
    pub vertices: usize,
    pub edges: usize,
    pub attrs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<Number>,
    pub viewable: Vec<HierarchyLevel>,
}
