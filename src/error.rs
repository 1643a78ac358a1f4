//! Error kinds shared by the store, the generator bridge and the service.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = HaystackError> = std::result::Result<T, E>;

/// Every failure the service may surface to a user.
#[derive(Debug, Error)]
pub enum HaystackError {
    /// The requested graph has no backing data.
    #[error("graph '{id}' not found")]
    NotFound { id: String },

    #[error("node '{node}' not found in graph '{graph}'")]
    NodeNotFound { graph: String, node: String },

    /// A backing file exists but does not match the graph schema.
    #[error("invalid graph data in {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// The caller asked for something that can never succeed as phrased.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A bug surfaced while serving a request, e.g. a caught panic.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HaystackError {
    pub fn format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HaystackError::Format {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HaystackError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        HaystackError::NotFound { id: id.into() }
    }

    /// Short machine-readable kind used by the wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            HaystackError::NotFound { .. } | HaystackError::NodeNotFound { .. } => "not_found",
            HaystackError::Format { .. } => "format",
            HaystackError::Generation(_) => "generation",
            HaystackError::InvalidRequest(_) => "invalid_request",
            HaystackError::Internal(_)
            | HaystackError::Serialization(_)
            | HaystackError::Io { .. } => "internal",
        }
    }
}

/// Failures of the external call-graph generator.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to launch generator '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("generator exited with {}{}", describe_code(.code), render_diagnostics(.diagnostics))]
    Failed {
        code: Option<i32>,
        diagnostics: Diagnostics,
    },

    #[error("generator timed out after {}s{}", .after.as_secs_f64(), render_diagnostics(.diagnostics))]
    TimedOut {
        after: Duration,
        diagnostics: Diagnostics,
    },

    #[error("generation was cancelled")]
    Cancelled,

    #[error("generator exited successfully but produced no graph in {}", path.display())]
    MissingOutput { path: PathBuf },

    #[error("generator produced an unreadable graph: {0}")]
    InvalidOutput(Box<HaystackError>),
}

impl GenerationError {
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            GenerationError::Failed { diagnostics, .. }
            | GenerationError::TimedOut { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Captured generator output, bounded in size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub text: String,
    /// Bytes dropped from the front of the output to respect the bound.
    pub truncated_bytes: usize,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "no exit code (killed by signal)".to_string(),
    }
}

fn render_diagnostics(diag: &Diagnostics) -> String {
    if diag.is_empty() {
        return String::new();
    }
    let mut out = String::from(":\n");
    if diag.truncated_bytes > 0 {
        out.push_str(&format!("[... {} earlier bytes omitted ...]\n", diag.truncated_bytes));
    }
    out.push_str(diag.text.trim_end());
    out
}
