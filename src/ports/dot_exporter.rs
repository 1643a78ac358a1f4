//! Graphviz DOT Exporter
//!
//! Renders a GraphView as DOT: node colour from the community, node width from
//! PageRank size, edge pen width from weight.

use crate::domain::view::GraphView;
use crate::error::Result;
use crate::ports::ViewExporter;

/// Node sizes are in pixels; DOT widths are in inches.
const PIXELS_PER_INCH: f64 = 72.0;
const MAX_PEN_WIDTH: f64 = 5.0;

pub struct DotExporter;

impl DotExporter {
    /// Convert a GraphView to a DOT string.
    pub fn to_dot(view: &GraphView) -> String {
        let mut lines = Vec::new();

        lines.push(format!("digraph \"{}\" {{", Self::escape_label(&view.id)));
        lines.push("    rankdir=LR;".to_string());
        lines.push("    overlap=false;".to_string());
        lines.push(
            "    node [shape=ellipse, style=filled, fontname=\"Helvetica\", fontsize=10];"
                .to_string(),
        );
        lines.push("    edge [fontname=\"Helvetica\", fontsize=8];".to_string());
        lines.push("".to_string());

        for node in &view.nodes {
            let name = Self::escape_label(&node.name);
            lines.push(format!(
                "    \"{}\" [label=\"{}\", fillcolor=\"{}\", width={:.2}, tooltip=\"pr={:.6}\"];",
                name,
                name,
                node.color,
                node.size / PIXELS_PER_INCH,
                node.pr
            ));
        }

        lines.push("".to_string());

        let max_weight = view.max_edge_weight;
        for edge in &view.edges {
            let pen = if max_weight > 0.0 {
                1.0 + (MAX_PEN_WIDTH - 1.0) * edge.weight / max_weight
            } else {
                1.0
            };
            lines.push(format!(
                "    \"{}\" -> \"{}\" [label=\"{}\", penwidth={:.2}];",
                Self::escape_label(&edge.source),
                Self::escape_label(&edge.target),
                Self::format_weight(edge.weight),
                pen
            ));
        }

        lines.push("}".to_string());

        lines.join("\n")
    }

    fn format_weight(weight: f64) -> String {
        if weight.fract() == 0.0 {
            format!("{}", weight as i64)
        } else {
            format!("{:.3}", weight)
        }
    }

    fn escape_label(label: &str) -> String {
        label
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
    }
}

impl ViewExporter for DotExporter {
    fn render(&self, view: &GraphView) -> Result<String> {
        Ok(Self::to_dot(view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{NodeProps, RelationKind};
    use crate::domain::hierarchy::HierarchyLevel;
    use crate::domain::view::{ViewEdge, ViewNode};

    fn node(name: &str) -> ViewNode {
        ViewNode {
            name: name.to_string(),
            props: NodeProps::default(),
            pr: 0.5,
            size: 36.0,
            community: 0,
            color: "#FFB300",
            members: 1,
            classes: vec![],
        }
    }

    fn view() -> GraphView {
        GraphView {
            id: "demo".to_string(),
            kind: RelationKind::Call,
            hierarchy: HierarchyLevel::Method,
            total_nodes: 2,
            total_edges: 1,
            max_edge_weight: 2.0,
            max_pagerank: 0.5,
            nodes: vec![node("Main.main"), node("say \"hi\"")],
            edges: vec![ViewEdge {
                source: "Main.main".to_string(),
                target: "say \"hi\"".to_string(),
                weight: 2.0,
                kind: RelationKind::Call,
                classes: vec![],
            }],
            communities: vec![],
        }
    }

    #[test]
    fn test_to_dot() {
        let dot = DotExporter::to_dot(&view());
        assert!(dot.starts_with("digraph \"demo\""));
        assert!(dot.contains("\"Main.main\" [label=\"Main.main\", fillcolor=\"#FFB300\", width=0.50"));
        assert!(dot.contains("\"Main.main\" -> \"say \\\"hi\\\"\" [label=\"2\", penwidth=5.00]"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_escape_label() {
        assert_eq!(DotExporter::escape_label("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }

    #[test]
    fn test_fractional_weight_label() {
        assert_eq!(DotExporter::format_weight(0.25), "0.250");
        assert_eq!(DotExporter::format_weight(3.0), "3");
    }
}
