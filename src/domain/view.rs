/// View Selection Domain Module
///
/// Picks which part of an [`AnalyzedGraph`] is shown: the whole graph, a
/// community-balanced sample, or the neighbourhood of one node.

use std::collections::HashSet;

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::domain::analysis::{AnalysisParams, AnalyzedGraph};
use crate::domain::graph::{NodeProps, RelationKind};
use crate::domain::hierarchy::HierarchyLevel;
use crate::error::{HaystackError, Result};

/// Top-ranked members listed per community summary.
const COMMUNITY_HIGHLIGHTS: usize = 5;

/// Which edges of a node count as its neighbourhood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborDirection {
    /// callers / predecessors
    In,
    /// callees / successors
    Out,
    #[default]
    All,
}

impl NeighborDirection {
    pub fn parse(s: &str) -> Option<NeighborDirection> {
        match s.trim().to_lowercase().as_str() {
            "in" | "incoming" => Some(NeighborDirection::In),
            "out" | "outgoing" => Some(NeighborDirection::Out),
            "all" | "both" => Some(NeighborDirection::All),
            _ => None,
        }
    }

    fn directions(&self) -> &'static [Direction] {
        match self {
            NeighborDirection::In => &[Direction::Incoming],
            NeighborDirection::Out => &[Direction::Outgoing],
            NeighborDirection::All => &[Direction::Incoming, Direction::Outgoing],
        }
    }

    fn node_class(&self) -> &'static str {
        match self {
            NeighborDirection::In => "followerNode",
            NeighborDirection::Out => "followingNode",
            NeighborDirection::All => "selneighbor",
        }
    }

    fn edge_class(&self) -> &'static str {
        match self {
            NeighborDirection::In => "followerEdge",
            NeighborDirection::Out => "followingEdge",
            NeighborDirection::All => "selneighedge",
        }
    }
}

fn default_include_edges() -> bool {
    true
}

/// What to show of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewOptions {
    #[serde(flatten)]
    pub analysis: AnalysisParams,
    /// Community-balanced sample size; `None` shows everything.
    #[serde(default)]
    pub max_nodes: Option<usize>,
    #[serde(default = "default_include_edges")]
    pub include_edges: bool,
    /// Node name to centre the view on.
    #[serde(default)]
    pub focus: Option<String>,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            analysis: AnalysisParams::default(),
            max_nodes: None,
            include_edges: true,
            focus: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewNode {
    pub name: String,
    #[serde(flatten)]
    pub props: NodeProps,
    pub pr: f64,
    pub size: f64,
    pub community: usize,
    pub color: &'static str,
    pub members: usize,
    /// Style classes for the front-end, e.g. `genesis` for the focused node.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewEdge {
    pub source: String,
    pub target: String,
    pub weight: f64,
    pub kind: RelationKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommunitySummary {
    pub id: usize,
    pub color: &'static str,
    pub size: usize,
    /// Highest ranked member names.
    pub top: Vec<String>,
}

/// The renderable selection of an analyzed graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    pub hierarchy: HierarchyLevel,
    pub total_nodes: usize,
    pub total_edges: usize,
    pub max_edge_weight: f64,
    pub max_pagerank: f64,
    pub nodes: Vec<ViewNode>,
    pub edges: Vec<ViewEdge>,
    pub communities: Vec<CommunitySummary>,
}

/// Select the part of `graph` described by `options`.
pub fn select_view(graph: &AnalyzedGraph, options: &ViewOptions) -> Result<GraphView> {
    let mut selection = Selection::default();

    if let Some(name) = &options.focus {
        let focus = find_node(graph, name)?;
        selection.add_node(focus, "genesis");
        let direction = NeighborDirection::All;
        for edge in graph.incident_edges(focus, direction.directions()) {
            let (s, t, _) = graph.edge(edge);
            let other = if s == focus { t } else { s };
            selection.add_node(other, direction.node_class());
            selection.add_edge(edge, direction.edge_class());
        }
    }

    match options.max_nodes {
        Some(n) => {
            for idx in sample_nodes(graph, n, &selection.seen_nodes) {
                selection.add_node(idx, "");
            }
        }
        None if options.focus.is_none() => {
            for idx in graph.node_indices() {
                selection.add_node(idx, "");
            }
        }
        None => {}
    }

    if options.include_edges {
        let seen = selection.seen_nodes.clone();
        for edge in graph.edges_within(|idx| seen.contains(&idx)) {
            selection.add_edge(edge, "");
        }
    }

    Ok(selection.into_view(graph))
}

/// The node named `name`, its neighbours in `direction` and the edges between them.
pub fn neighborhood(
    graph: &AnalyzedGraph,
    name: &str,
    direction: NeighborDirection,
) -> Result<GraphView> {
    let center = find_node(graph, name)?;
    let mut selection = Selection::default();
    selection.add_node(center, "genesis");
    for edge in graph.incident_edges(center, direction.directions()) {
        let (s, t, _) = graph.edge(edge);
        let other = if s == center { t } else { s };
        selection.add_node(other, direction.node_class());
        selection.add_edge(edge, direction.edge_class());
    }
    Ok(selection.into_view(graph))
}

/// Pick up to `n` nodes not in `exclude`, spread over communities.
///
/// `n` is split evenly over the communities that still have candidates, the
/// remainder going to the first one. Each community contributes its highest
/// ranked candidates. A community smaller than its share does not hand the
/// unused quota to others.
pub fn sample_nodes(
    graph: &AnalyzedGraph,
    n: usize,
    exclude: &HashSet<NodeIndex>,
) -> Vec<NodeIndex> {
    let candidates: Vec<Vec<NodeIndex>> = graph
        .communities()
        .iter()
        .map(|members| {
            members
                .iter()
                .copied()
                .filter(|idx| !exclude.contains(idx))
                .collect::<Vec<_>>()
        })
        .filter(|members| !members.is_empty())
        .collect();
    if candidates.is_empty() || n == 0 {
        return Vec::new();
    }

    let per_community = n / candidates.len();
    let remainder = n % candidates.len();
    let mut picked = Vec::with_capacity(n.min(graph.node_count()));
    for (i, members) in candidates.iter().enumerate() {
        let quota = if i == 0 { per_community + remainder } else { per_community };
        picked.extend(members.iter().take(quota).copied());
    }
    picked
}

fn find_node(graph: &AnalyzedGraph, name: &str) -> Result<NodeIndex> {
    graph.find(name).ok_or_else(|| HaystackError::NodeNotFound {
        graph: graph.id.clone(),
        node: name.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Selection accumulator
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Selection {
    nodes: Vec<(NodeIndex, Vec<&'static str>)>,
    seen_nodes: HashSet<NodeIndex>,
    edges: Vec<(EdgeIndex, Vec<&'static str>)>,
    seen_edges: HashSet<EdgeIndex>,
}

impl Selection {
    /// Adds a node once; later calls only add classes.
    fn add_node(&mut self, idx: NodeIndex, class: &'static str) {
        if self.seen_nodes.insert(idx) {
            self.nodes.push((idx, Vec::new()));
        }
        if class.is_empty() {
            return;
        }
        if let Some((_, classes)) = self.nodes.iter_mut().find(|(i, _)| *i == idx) {
            if !classes.contains(&class) {
                classes.push(class);
            }
        }
    }

    fn add_edge(&mut self, idx: EdgeIndex, class: &'static str) {
        if self.seen_edges.insert(idx) {
            self.edges.push((idx, Vec::new()));
        }
        if class.is_empty() {
            return;
        }
        if let Some((_, classes)) = self.edges.iter_mut().find(|(i, _)| *i == idx) {
            if !classes.contains(&class) {
                classes.push(class);
            }
        }
    }

    fn into_view(self, graph: &AnalyzedGraph) -> GraphView {
        let nodes = self
            .nodes
            .into_iter()
            .map(|(idx, classes)| {
                let node = graph.node(idx);
                ViewNode {
                    name: node.name.clone(),
                    props: node.props.clone(),
                    pr: node.pr,
                    size: node.size,
                    community: node.community,
                    color: node.color,
                    members: node.members,
                    classes,
                }
            })
            .collect();

        let edges = self
            .edges
            .into_iter()
            .map(|(idx, classes)| {
                let (s, t, weight) = graph.edge(idx);
                ViewEdge {
                    source: graph.node(s).name.clone(),
                    target: graph.node(t).name.clone(),
                    weight,
                    kind: graph.kind,
                    classes,
                }
            })
            .collect();

        let communities = graph
            .communities()
            .iter()
            .enumerate()
            .map(|(id, members)| CommunitySummary {
                id,
                color: members
                    .first()
                    .map(|&idx| graph.node(idx).color)
                    .unwrap_or(""),
                size: members.len(),
                top: members
                    .iter()
                    .take(COMMUNITY_HIGHLIGHTS)
                    .map(|&idx| graph.node(idx).name.clone())
                    .collect(),
            })
            .collect();

        GraphView {
            id: graph.id.clone(),
            kind: graph.kind,
            hierarchy: graph.hierarchy,
            total_nodes: graph.node_count(),
            total_edges: graph.edge_count(),
            max_edge_weight: graph.max_edge_weight(),
            max_pagerank: graph.max_pagerank(),
            nodes,
            edges,
            communities,
        }
    }
}
