/// Graph Store
///
/// Directory-backed storage of graph artifacts. Each artifact is a
/// sub-directory named after its identifier:
/// - `meta.json` - relation kind, hierarchy level, generation attrs
/// - `mapping.json` - node identifier -> node properties
/// - `edges.json` - edge records
///
/// Writers stage into a hidden sibling directory and publish with a rename,
/// so readers never observe a half-written artifact.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::domain::graph::{
    validate_identifier, EdgeRecord, GraphArtifact, GraphMeta, GraphNode, NodeProps, ARTIFACT_FILES,
    EDGES_FILE, MAPPING_FILE, META_FILE,
};
use crate::error::{HaystackError, Result};
use crate::ports::{ArtifactStamp, GraphRepository};

const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// Graph Store rooted at one directory.
#[derive(Debug, Clone)]
pub struct FsGraphStore {
    root: PathBuf,
}

impl FsGraphStore {
    /// Open the store, creating its directory if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| HaystackError::io(&root, e))?;
        debug!(root = %root.display(), "opened graph store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Parse an artifact from an arbitrary directory with full validation.
    pub fn load_from(dir: &Path, id: &str) -> Result<GraphArtifact> {
        for file in ARTIFACT_FILES {
            if !dir.join(file).is_file() {
                return Err(HaystackError::format(
                    dir.join(file),
                    "missing artifact file",
                ));
            }
        }

        let meta_path = dir.join(META_FILE);
        let meta: GraphMeta = read_json(&meta_path)?;

        let mapping_path = dir.join(MAPPING_FILE);
        let mapping: Map<String, Value> = read_json(&mapping_path)?;
        let mut nodes = Vec::with_capacity(mapping.len());
        for (node_id, value) in mapping {
            let props: NodeProps = serde_json::from_value(value).map_err(|e| {
                HaystackError::format(&mapping_path, format!("node '{}': {}", node_id, e))
            })?;
            nodes.push(GraphNode { id: node_id, props });
        }

        let edges_path = dir.join(EDGES_FILE);
        let records: Vec<Value> = read_json(&edges_path)?;
        let mut edges = Vec::with_capacity(records.len());
        for (idx, record) in records.into_iter().enumerate() {
            let Value::Object(record) = record else {
                return Err(HaystackError::format(
                    &edges_path,
                    format!("edge #{} is not an object", idx),
                ));
            };
            let edge = EdgeRecord::from_record(record)
                .map_err(|reason| HaystackError::format(&edges_path, format!("edge #{}: {}", idx, reason)))?;
            edges.push(edge);
        }

        GraphArtifact::new(id, meta, nodes, edges).map_err(|reason| HaystackError::format(dir, reason))
    }

    /// A fresh hidden directory inside the store for staging `id`.
    /// Removed when dropped unless published first.
    pub(crate) fn staging_dir(&self, id: &str) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(&format!("{}{}-", STAGING_PREFIX, id))
            .tempdir_in(&self.root)
            .map_err(|e| HaystackError::io(&self.root, e))
    }

    /// Move a fully written staging directory into place as `id`.
    ///
    /// An existing artifact is first moved into a hidden trash directory and
    /// restored if the final rename fails.
    pub(crate) fn publish(&self, staging: &Path, id: &str) -> Result<()> {
        validate_identifier(id).map_err(HaystackError::InvalidRequest)?;
        let target = self.artifact_dir(id);

        if !target.exists() {
            fs::rename(staging, &target).map_err(|e| HaystackError::io(&target, e))?;
            debug!(graph = id, "published artifact");
            return Ok(());
        }

        let trash = tempfile::Builder::new()
            .prefix(TRASH_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| HaystackError::io(&self.root, e))?;
        let old = trash.path().join(id);
        fs::rename(&target, &old).map_err(|e| HaystackError::io(&target, e))?;
        if let Err(e) = fs::rename(staging, &target) {
            if let Err(restore) = fs::rename(&old, &target) {
                warn!(graph = id, error = %restore, "failed to restore previous artifact");
            }
            return Err(HaystackError::io(&target, e));
        }
        if let Err(e) = trash.close() {
            warn!(graph = id, error = %e, "failed to remove replaced artifact");
        }
        debug!(graph = id, "replaced artifact");
        Ok(())
    }
}

impl GraphRepository for FsGraphStore {
    fn list(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| HaystackError::io(&self.root, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| HaystackError::io(&self.root, e))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if is_complete(&path) {
                ids.push(name);
            } else {
                debug!(entry = %name, "skipping incomplete artifact directory");
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn contains(&self, id: &str) -> bool {
        validate_identifier(id).is_ok() && is_complete(&self.artifact_dir(id))
    }

    fn load(&self, id: &str) -> Result<GraphArtifact> {
        validate_identifier(id).map_err(HaystackError::InvalidRequest)?;
        let dir = self.artifact_dir(id);
        if !dir.is_dir() {
            return Err(HaystackError::not_found(id));
        }
        Self::load_from(&dir, id)
    }

    fn stamp(&self, id: &str) -> Option<ArtifactStamp> {
        validate_identifier(id).ok()?;
        let dir = self.artifact_dir(id);
        let mut stamp: Option<ArtifactStamp> = None;
        for file in ARTIFACT_FILES {
            let metadata = fs::metadata(dir.join(file)).ok()?;
            let modified = metadata.modified().ok()?;
            stamp = Some(match stamp {
                Some(s) => ArtifactStamp {
                    modified: s.modified.max(modified),
                    bytes: s.bytes + metadata.len(),
                },
                None => ArtifactStamp {
                    modified,
                    bytes: metadata.len(),
                },
            });
        }
        stamp
    }
}

fn is_complete(dir: &Path) -> bool {
    ARTIFACT_FILES.iter().all(|file| dir.join(file).is_file())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| HaystackError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| HaystackError::format(path, e.to_string()))
}
