//! Configuration for Haystack.
//!
//! Layering, lowest to highest precedence: built-in defaults, a TOML file
//! (`--config`, or `haystack.toml` in the working directory), environment
//! variables, command-line flags. The last layer is applied by the binary.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::infrastructure::concurrency::default_workers;

pub const DEFAULT_CONFIG_FILE: &str = "haystack.toml";

pub const ENV_GRAPH_DIR: &str = "HAYSTACK_GRAPH_DIR";
pub const ENV_GENERATOR: &str = "HAYSTACK_GENERATOR";
pub const ENV_GENERATOR_TIMEOUT: &str = "HAYSTACK_GENERATOR_TIMEOUT";
pub const ENV_BIND: &str = "HAYSTACK_BIND";
pub const ENV_LOG: &str = "RUST_LOG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HaystackConfig {
    pub store: StoreConfig,
    pub generator: GeneratorConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding one sub-directory per graph.
    pub graph_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            graph_dir: PathBuf::from("GRAPHS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    pub program: String,
    /// Placed before the per-request arguments.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Bound on captured generator output.
    pub max_diagnostic_bytes: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: "java".to_string(),
            args: vec!["-jar".to_string(), "genCallgraph.jar".to_string()],
            timeout_secs: 600,
            max_diagnostic_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
    /// Request workers; `None` means half the cores, at least 2.
    pub workers: Option<usize>,
    /// Open connections served at once; further ones are turned away.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8050".to_string(),
            workers: None,
            max_connections: 64,
        }
    }
}

impl ServerConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.filter(|&w| w > 0).unwrap_or_else(default_workers)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive, e.g. `info` or `haystack=debug`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl HaystackConfig {
    /// Defaults, then the config file, then the process environment.
    ///
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override settings from environment-style variables.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(ENV_GRAPH_DIR) {
            self.store.graph_dir = PathBuf::from(dir);
        }
        if let Some(program) = lookup(ENV_GENERATOR) {
            self.generator.program = program;
        }
        if let Some(timeout) = lookup(ENV_GENERATOR_TIMEOUT) {
            self.generator.timeout_secs = timeout
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", ENV_GENERATOR_TIMEOUT, timeout))?;
        }
        if let Some(bind) = lookup(ENV_BIND) {
            self.server.bind = bind;
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.graph_dir.as_os_str().is_empty() {
            bail!("store.graph_dir cannot be empty");
        }
        if self.generator.program.trim().is_empty() {
            bail!("generator.program cannot be empty");
        }
        if self.generator.timeout_secs == 0 {
            bail!("generator.timeout_secs must be positive");
        }
        if self.server.bind.trim().is_empty() {
            bail!("server.bind cannot be empty");
        }
        if self.server.max_connections == 0 {
            bail!("server.max_connections must be positive");
        }
        Ok(())
    }
}
