//! Graph Analysis
//!
//! Turns a stored [`GraphArtifact`] into an [`AnalyzedGraph`] ready for rendering:
//! - contraction to a coarser code hierarchy (methods -> classes -> packages)
//! - removal of self loops and parallel edges
//! - weighted PageRank for node importance
//! - modularity-based community detection for colouring

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::graph::{GraphArtifact, NodeProps, RelationKind, MAPPING_FILE};
use crate::domain::hierarchy::HierarchyLevel;
use crate::error::{HaystackError, Result};

const PAGERANK_MAX_ITERATIONS: usize = 100;
const PAGERANK_TOLERANCE: f64 = 1e-10;

const MIN_NODE_SIZE: f64 = 16.0;
const NODE_SIZE_RANGE: f64 = 30.0;

/// Kelly's colours of maximum contrast. The later ones are harder to tell apart
/// for people with defective colour vision.
pub const GRAPH_COLORS: [&str; 20] = [
    "#FFB300", "#803E75", "#FF6800", "#A6BDD7", "#C10020", "#CEA262", "#817066",
    "#007D34", "#F6768E", "#00538A", "#FF7A5C", "#53377A", "#FF8E00", "#B32851",
    "#F4C800", "#7F180D", "#93AA00", "#593315", "#F13A13", "#232C16",
];

/// Parameters that change the outcome of [`analyze`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    /// Level to view the graph at; `None` keeps the artifact's own level.
    pub hierarchy: Option<HierarchyLevel>,
    pub damping: f64,
    /// Higher values yield more, smaller communities.
    pub resolution: f64,
    pub community_iterations: usize,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            hierarchy: None,
            damping: 0.85,
            resolution: 1.0,
            community_iterations: 50,
        }
    }
}

impl AnalysisParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.damping) {
            return Err(HaystackError::InvalidRequest(format!(
                "damping factor must be within [0, 1], got {}",
                self.damping
            )));
        }
        if !self.resolution.is_finite() || self.resolution < 0.0 {
            return Err(HaystackError::InvalidRequest(format!(
                "resolution must be a non-negative number, got {}",
                self.resolution
            )));
        }
        Ok(())
    }

    /// Hashable identity of these parameters, used to memoize analyses.
    pub fn cache_key(&self) -> AnalysisKey {
        AnalysisKey {
            hierarchy: self.hierarchy,
            damping_bits: self.damping.to_bits(),
            resolution_bits: self.resolution.to_bits(),
            community_iterations: self.community_iterations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalysisKey {
    hierarchy: Option<HierarchyLevel>,
    damping_bits: u64,
    resolution_bits: u64,
    community_iterations: usize,
}

/// A node after contraction and analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedNode {
    /// Display name; unique within the analyzed graph.
    pub name: String,
    pub props: NodeProps,
    /// PageRank, all nodes sum to 1.
    pub pr: f64,
    pub size: f64,
    pub community: usize,
    pub color: &'static str,
    /// Number of artifact nodes merged into this one.
    pub members: usize,
}

/// An artifact prepared for display.
#[derive(Debug, Clone)]
pub struct AnalyzedGraph {
    pub id: String,
    pub kind: RelationKind,
    pub hierarchy: HierarchyLevel,
    graph: DiGraph<AnalyzedNode, f64>,
    by_name: HashMap<String, NodeIndex>,
    /// Member nodes of each community, by descending PageRank.
    communities: Vec<Vec<NodeIndex>>,
}

impl AnalyzedGraph {
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node(&self, idx: NodeIndex) -> &AnalyzedNode {
        &self.graph[idx]
    }

    pub fn find(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn edge_indices(&self) -> impl Iterator<Item = EdgeIndex> + '_ {
        self.graph.edge_indices()
    }

    /// `(source, target, weight)` of an edge.
    pub fn edge(&self, idx: EdgeIndex) -> (NodeIndex, NodeIndex, f64) {
        let (source, target) = self
            .graph
            .edge_endpoints(idx)
            .unwrap_or((NodeIndex::end(), NodeIndex::end()));
        (source, target, self.graph[idx])
    }

    /// Edges touching `node` in the given direction(s).
    pub fn incident_edges(&self, node: NodeIndex, directions: &[Direction]) -> Vec<EdgeIndex> {
        let mut edges: Vec<EdgeIndex> = directions
            .iter()
            .flat_map(|&dir| self.graph.edges_directed(node, dir).map(|e| e.id()))
            .collect();
        edges.sort();
        edges.dedup();
        edges
    }

    /// Edges whose both endpoints satisfy `keep`.
    pub fn edges_within(&self, keep: impl Fn(NodeIndex) -> bool) -> Vec<EdgeIndex> {
        self.graph
            .edge_references()
            .filter(|e| keep(e.source()) && keep(e.target()))
            .map(|e| e.id())
            .collect()
    }

    pub fn communities(&self) -> &[Vec<NodeIndex>] {
        &self.communities
    }

    pub fn max_edge_weight(&self) -> f64 {
        self.graph.raw_edges().iter().map(|e| e.weight).fold(0.0, f64::max)
    }

    pub fn max_pagerank(&self) -> f64 {
        self.graph.raw_nodes().iter().map(|n| n.weight.pr).fold(0.0, f64::max)
    }
}

/// Contract, simplify and score an artifact.
pub fn analyze(artifact: &GraphArtifact, params: &AnalysisParams) -> Result<AnalyzedGraph> {
    params.validate()?;
    let own_level = artifact.hierarchy();
    let level = params.hierarchy.unwrap_or(own_level);
    if !own_level.can_view_as(level) {
        return Err(HaystackError::InvalidRequest(format!(
            "graph '{}' is recorded at {} level and cannot be viewed at the finer {} level",
            artifact.id, own_level, level
        )));
    }

    let (nodes, edges) = contract(artifact, level)?;
    let mut graph: DiGraph<AnalyzedNode, f64> =
        DiGraph::with_capacity(nodes.len(), edges.len());
    for node in nodes {
        graph.add_node(node);
    }
    for (source, target, weight) in edges {
        graph.add_edge(NodeIndex::new(source), NodeIndex::new(target), weight);
    }

    let ranks = pagerank(&graph, params.damping);
    let (min_pr, max_pr) = ranks
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| (lo.min(r), hi.max(r)));
    let membership = detect_communities(&graph, params.resolution, params.community_iterations);

    for idx in graph.node_indices() {
        let pr = ranks[idx.index()];
        let community = membership[idx.index()];
        let node = &mut graph[idx];
        node.pr = pr;
        node.size = if max_pr > min_pr {
            MIN_NODE_SIZE + NODE_SIZE_RANGE * (pr - min_pr) / (max_pr - min_pr)
        } else {
            MIN_NODE_SIZE
        };
        node.community = community;
        node.color = GRAPH_COLORS[community % GRAPH_COLORS.len()];
    }

    let community_count = membership.iter().copied().max().map_or(0, |m| m + 1);
    let mut communities: Vec<Vec<NodeIndex>> = vec![Vec::new(); community_count];
    for idx in graph.node_indices() {
        communities[membership[idx.index()]].push(idx);
    }
    for members in &mut communities {
        members.sort_by(|a, b| {
            graph[*b]
                .pr
                .total_cmp(&graph[*a].pr)
                .then_with(|| a.cmp(b))
        });
    }

    let by_name = graph
        .node_indices()
        .map(|idx| (graph[idx].name.clone(), idx))
        .collect();

    debug!(
        graph = %artifact.id,
        %level,
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        communities = communities.len(),
        "analyzed graph"
    );

    Ok(AnalyzedGraph {
        id: artifact.id.clone(),
        kind: artifact.kind(),
        hierarchy: level,
        graph,
        by_name,
        communities,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Contraction
// ═══════════════════════════════════════════════════════════════════════════

type ContractedEdges = Vec<(usize, usize, f64)>;

fn contract(
    artifact: &GraphArtifact,
    level: HierarchyLevel,
) -> Result<(Vec<AnalyzedNode>, ContractedEdges)> {
    // Drop loops; the first of parallel edges wins.
    let mut simple: Vec<(usize, usize, f64)> = Vec::with_capacity(artifact.edges().len());
    let mut seen: HashSet<(usize, usize)> = HashSet::new();
    for edge in artifact.edges() {
        let (Some(s), Some(t)) = (
            artifact.node_position(&edge.source),
            artifact.node_position(&edge.target),
        ) else {
            continue;
        };
        if s == t {
            continue;
        }
        if seen.insert((s, t)) {
            simple.push((s, t, edge.effective_weight()));
        }
    }

    if level == HierarchyLevel::Method {
        let nodes = artifact
            .nodes()
            .iter()
            .map(|n| new_node(n.id.clone(), n.props.clone(), 1))
            .collect();
        return Ok((nodes, simple));
    }

    let mapping_path = PathBuf::from(&artifact.id).join(MAPPING_FILE);
    let mut group_of: Vec<usize> = Vec::with_capacity(artifact.nodes().len());
    let mut groups: Vec<AnalyzedNode> = Vec::new();
    // Keyed by (package, class) so that dotted names cannot collide.
    let mut group_index: HashMap<(String, Option<String>), usize> = HashMap::new();
    let mut group_names: HashSet<String> = HashSet::new();

    for node in artifact.nodes() {
        let package = node.props.package.clone().ok_or_else(|| {
            HaystackError::format(
                &mapping_path,
                format!("node '{}' has no 'package', required for the {} view", node.id, level),
            )
        })?;
        let (name, props) = match level {
            HierarchyLevel::TypeDef => {
                let class = node.props.class.clone().ok_or_else(|| {
                    HaystackError::format(
                        &mapping_path,
                        format!("node '{}' has no 'class', required for the {} view", node.id, level),
                    )
                })?;
                (
                    format!("{}.{}", package, class),
                    NodeProps {
                        package: Some(package),
                        class: Some(class),
                        ..NodeProps::default()
                    },
                )
            }
            _ => (
                package.clone(),
                NodeProps {
                    package: Some(package),
                    ..NodeProps::default()
                },
            ),
        };

        let key = (
            props.package.clone().unwrap_or_default(),
            props.class.clone(),
        );
        let group = match group_index.get(&key) {
            Some(&g) => {
                groups[g].members += 1;
                g
            }
            None => {
                let name = if group_names.contains(&name) {
                    match (&props.package, &props.class) {
                        (Some(package), Some(class)) => format!("{}:{}", package, class),
                        _ => name,
                    }
                } else {
                    name
                };
                group_names.insert(name.clone());
                group_index.insert(key, groups.len());
                groups.push(new_node(name, props, 1));
                groups.len() - 1
            }
        };
        group_of.push(group);
    }

    // Parallel edges between groups add up.
    let mut contracted: Vec<(usize, usize, f64)> = Vec::new();
    let mut position: HashMap<(usize, usize), usize> = HashMap::new();
    for (s, t, w) in simple {
        let (gs, gt) = (group_of[s], group_of[t]);
        if gs == gt {
            continue;
        }
        match position.get(&(gs, gt)) {
            Some(&p) => contracted[p].2 += w,
            None => {
                position.insert((gs, gt), contracted.len());
                contracted.push((gs, gt, w));
            }
        }
    }

    Ok((groups, contracted))
}

fn new_node(name: String, props: NodeProps, members: usize) -> AnalyzedNode {
    AnalyzedNode {
        name,
        props,
        pr: 0.0,
        size: MIN_NODE_SIZE,
        community: 0,
        color: GRAPH_COLORS[0],
        members,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PageRank
// ═══════════════════════════════════════════════════════════════════════════

/// Weighted PageRank by power iteration. Rank held by nodes without outgoing
/// weight is spread uniformly.
pub fn pagerank<N>(graph: &DiGraph<N, f64>, damping: f64) -> Vec<f64> {
    let n = graph.node_count();
    if n == 0 {
        return Vec::new();
    }
    let uniform = 1.0 / n as f64;

    let out_weight: Vec<f64> = graph
        .node_indices()
        .map(|idx| {
            graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| *e.weight())
                .sum()
        })
        .collect();

    let mut rank = vec![uniform; n];
    for _ in 0..PAGERANK_MAX_ITERATIONS {
        let dangling: f64 = rank
            .iter()
            .zip(&out_weight)
            .filter(|(_, w)| **w <= 0.0)
            .map(|(r, _)| r)
            .sum();
        let base = (1.0 - damping) * uniform + damping * dangling * uniform;

        let mut next = vec![base; n];
        for edge in graph.edge_references() {
            let s = edge.source().index();
            if out_weight[s] > 0.0 {
                next[edge.target().index()] += damping * rank[s] * edge.weight() / out_weight[s];
            }
        }

        let delta: f64 = next.iter().zip(&rank).map(|(a, b)| (a - b).abs()).sum();
        rank = next;
        if delta < PAGERANK_TOLERANCE {
            break;
        }
    }
    rank
}

// ═══════════════════════════════════════════════════════════════════════════
// Community detection
// ═══════════════════════════════════════════════════════════════════════════

/// Modularity local moving on the undirected view of the graph (both edge
/// directions collapsed, weights summed). Returns a community number per node,
/// numbered by first appearance.
pub fn detect_communities<N>(
    graph: &DiGraph<N, f64>,
    resolution: f64,
    max_sweeps: usize,
) -> Vec<usize> {
    let n = graph.node_count();
    let mut adjacency: Vec<HashMap<usize, f64>> = vec![HashMap::new(); n];
    for edge in graph.edge_references() {
        let (s, t) = (edge.source().index(), edge.target().index());
        if s == t {
            continue;
        }
        *adjacency[s].entry(t).or_insert(0.0) += edge.weight();
        *adjacency[t].entry(s).or_insert(0.0) += edge.weight();
    }
    let degree: Vec<f64> = adjacency.iter().map(|a| a.values().sum()).collect();
    let two_m: f64 = degree.iter().sum();

    let mut membership: Vec<usize> = (0..n).collect();
    if two_m <= 0.0 {
        return membership;
    }
    let mut total: Vec<f64> = degree.clone();

    for _ in 0..max_sweeps {
        let mut moved = false;
        for node in 0..n {
            let current = membership[node];
            let k = degree[node];
            total[current] -= k;

            let mut links: HashMap<usize, f64> = HashMap::new();
            for (&neighbor, &w) in &adjacency[node] {
                *links.entry(membership[neighbor]).or_insert(0.0) += w;
            }
            let gain = |community: usize, w: f64| w - resolution * k * total[community] / two_m;

            let mut best = current;
            let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
            let mut candidates: Vec<(usize, f64)> = links.into_iter().collect();
            candidates.sort_by_key(|(c, _)| *c);
            for (community, w) in candidates {
                let g = gain(community, w);
                if g > best_gain + 1e-12 {
                    best = community;
                    best_gain = g;
                }
            }

            total[best] += k;
            if best != current {
                membership[node] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }

    let mut renumber: HashMap<usize, usize> = HashMap::new();
    membership
        .iter()
        .map(|c| {
            let next = renumber.len();
            *renumber.entry(*c).or_insert(next)
        })
        .collect()
}
