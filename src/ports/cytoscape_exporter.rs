//! Cytoscape element exporter.
//!
//! Produces the `[{"data": {...}, "classes": "..."}]` element list consumed by
//! Cytoscape-based front-ends.

use serde_json::{json, Map, Value};

use crate::domain::view::{GraphView, ViewEdge, ViewNode};
use crate::error::Result;
use crate::ports::ViewExporter;

pub struct CytoscapeExporter;

impl CytoscapeExporter {
    /// Nodes first, then edges.
    pub fn to_elements(view: &GraphView) -> Vec<Value> {
        let mut elements = Vec::with_capacity(view.nodes.len() + view.edges.len());
        elements.extend(view.nodes.iter().map(Self::node_element));
        elements.extend(view.edges.iter().map(Self::edge_element));
        elements
    }

    fn node_element(node: &ViewNode) -> Value {
        let mut data = Map::new();
        data.insert("id".to_string(), Value::String(node.name.clone()));
        data.insert("label".to_string(), Value::String(node.name.clone()));
        if let Some(package) = &node.props.package {
            data.insert("package".to_string(), Value::String(package.clone()));
        }
        if let Some(class) = &node.props.class {
            data.insert("class".to_string(), Value::String(class.clone()));
        }
        if let Some(method) = &node.props.method {
            data.insert("method".to_string(), Value::String(method.clone()));
        }
        for (key, value) in &node.props.extra {
            data.entry(key.clone()).or_insert_with(|| value.clone());
        }
        data.insert("pr".to_string(), json!(node.pr));
        data.insert("size".to_string(), json!(node.size));
        data.insert("community".to_string(), json!(node.community));
        data.insert("color".to_string(), json!(node.color));
        data.insert("members".to_string(), json!(node.members));

        json!({ "data": data, "classes": node.classes.join(" ") })
    }

    fn edge_element(edge: &ViewEdge) -> Value {
        json!({
            "data": {
                "id": format!("{}->{}", edge.source, edge.target),
                "source": edge.source,
                "target": edge.target,
                "weight": edge.weight,
                "type": edge.kind.name(),
            },
            "classes": edge.classes.join(" "),
        })
    }
}

impl ViewExporter for CytoscapeExporter {
    fn render(&self, view: &GraphView) -> Result<String> {
        Ok(serde_json::to_string(&Self::to_elements(view))?)
    }
}
