use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::application::UserMessage;
use crate::domain::view::{GraphView, NeighborDirection, ViewOptions};
use crate::error::{HaystackError, Result};
use crate::ports::cytoscape_exporter::CytoscapeExporter;
use crate::ports::dot_exporter::DotExporter;
use crate::ports::RenderFormat;

/// One request line: `{"command": "VIEW", "params": {...}}`.
#[derive(Debug, Deserialize)]
pub struct CommandReq {
    pub command: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl CommandReq {
    /// Decode `params` into the command's parameter type. Absent params
    /// decode like an empty object.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .params
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        serde_json::from_value(value).map_err(|e| {
            HaystackError::InvalidRequest(format!("invalid params for {}: {}", self.command, e))
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResponseDto {
    Success { data: Value },
    Error { kind: String, message: String },
}

impl ResponseDto {
    pub fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(data) => ResponseDto::Success { data },
            Err(e) => UserMessage::from(&e).into(),
        }
    }
}

impl From<UserMessage> for ResponseDto {
    fn from(msg: UserMessage) -> Self {
        ResponseDto::Error {
            kind: msg.kind.to_string(),
            message: msg.message,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DescribeParams {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ViewParams {
    pub id: String,
    #[serde(default)]
    pub format: RenderFormat,
    #[serde(flatten)]
    pub options: ViewOptions,
}

#[derive(Debug, Deserialize)]
pub struct NeighborsParams {
    pub id: String,
    pub node: String,
    #[serde(default)]
    pub direction: NeighborDirection,
    #[serde(flatten)]
    pub options: ViewOptions,
}

/// A view in the requested wire format: the view object, a Cytoscape
/// element array, or DOT text.
pub fn render_view(view: &GraphView, format: RenderFormat) -> Result<Value> {
    Ok(match format {
        RenderFormat::Json => serde_json::to_value(view)?,
        RenderFormat::Cytoscape => Value::Array(CytoscapeExporter::to_elements(view)),
        RenderFormat::Dot => Value::String(DotExporter::to_dot(view)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::hierarchy::HierarchyLevel;

    #[test]
    fn test_view_params_flatten() {
        let req: CommandReq = serde_json::from_str(
            r#"{"command": "VIEW", "params": {"id": "g", "format": "dot",
                "hierarchy": "type_def", "max_nodes": 10, "include_edges": false}}"#,
        )
        .unwrap();
        let params: ViewParams = req.params().unwrap();
        assert_eq!(params.id, "g");
        assert_eq!(params.format, RenderFormat::Dot);
        assert_eq!(params.options.analysis.hierarchy, Some(HierarchyLevel::TypeDef));
        assert_eq!(params.options.max_nodes, Some(10));
        assert!(!params.options.include_edges);
    }

    #[test]
    fn test_missing_params_is_invalid_request() {
        let req: CommandReq = serde_json::from_str(r#"{"command": "DESCRIBE"}"#).unwrap();
        let err = req.params::<DescribeParams>().unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert!(err.to_string().contains("DESCRIBE"));
    }

    #[test]
    fn test_response_shapes() {
        let ok = serde_json::to_value(ResponseDto::from_result(Ok(Value::from("PONG")))).unwrap();
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["data"], "PONG");

        let err = serde_json::to_value(ResponseDto::from_result(Err(HaystackError::not_found("g"))))
            .unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["kind"], "not_found");
        assert_eq!(err["message"], "graph 'g' not found");
    }

    #[test]
    fn test_neighbors_default_direction() {
        let req: CommandReq =
            serde_json::from_str(r#"{"command": "NEIGHBORS", "params": {"id": "g", "node": "n"}}"#)
                .unwrap();
        let params: NeighborsParams = req.params().unwrap();
        assert_eq!(params.direction, NeighborDirection::All);
        assert!(params.options.include_edges);
    }
}
