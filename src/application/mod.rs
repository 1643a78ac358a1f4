//! Visualization Service
//!
//! The use-case layer shared by the CLI and the network endpoint: keeps the
//! selectable set of graphs, memoizes analyses and delegates generation.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::analysis::{analyze, AnalysisParams, AnalyzedGraph};
use crate::domain::graph::GraphSummary;
use crate::domain::view::{neighborhood, select_view, GraphView, NeighborDirection, ViewOptions};
use crate::error::{HaystackError, Result};
use crate::infrastructure::concurrency::CancellationToken;
use crate::ports::{GenerationRequest, GraphGenerator, GraphRepository};

pub mod cache;

use cache::AnalysisCache;

pub struct VisualizationService {
    store: Arc<dyn GraphRepository>,
    generator: Arc<dyn GraphGenerator>,
    selectable: RwLock<BTreeSet<String>>,
    analyses: AnalysisCache,
    shutdown: CancellationToken,
}

impl VisualizationService {
    /// Enumerate the store into the selectable set.
    pub fn start(store: Arc<dyn GraphRepository>, generator: Arc<dyn GraphGenerator>) -> Result<Self> {
        let ids = store.list()?;
        info!(graphs = ids.len(), "visualization service started");
        Ok(Self {
            store,
            generator,
            selectable: RwLock::new(ids.into_iter().collect()),
            analyses: AnalysisCache::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Keep at most `capacity` analyses in memory.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.analyses = AnalysisCache::new(capacity);
        self
    }

    pub fn cached_analyses(&self) -> usize {
        self.analyses.len()
    }

    pub fn available(&self) -> Vec<String> {
        self.read_selectable().iter().cloned().collect()
    }

    /// Re-enumerate the store, picking up graphs written by other processes.
    pub fn refresh(&self) -> Result<Vec<String>> {
        let ids: BTreeSet<String> = self.store.list()?.into_iter().collect();
        self.analyses.retain_graphs(&ids);
        let listed = ids.iter().cloned().collect();
        *self
            .selectable
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = ids;
        Ok(listed)
    }

    pub fn describe(&self, id: &str) -> Result<GraphSummary> {
        Ok(self.store.load(id)?.summary())
    }

    /// Analyze a graph, reusing a previous result for the same parameters
    /// while the stored artifact is unchanged.
    pub fn analysis(&self, id: &str, params: &AnalysisParams) -> Result<Arc<AnalyzedGraph>> {
        params.validate()?;
        let key = params.cache_key();
        let stamp = self.store.stamp(id);
        if let Some(cached) = self.analyses.get(id, &key, stamp) {
            return Ok(cached);
        }

        let epoch = self.analyses.epoch(id);
        let artifact = self.store.load(id)?;
        let analyzed = Arc::new(analyze(&artifact, params)?);
        self.analyses.insert(id, &key, Arc::clone(&analyzed), epoch, stamp);
        Ok(analyzed)
    }

    pub fn view(&self, id: &str, options: &ViewOptions) -> Result<GraphView> {
        let graph = self.analysis(id, &options.analysis)?;
        select_view(&graph, options)
    }

    pub fn neighbors(
        &self,
        id: &str,
        options: &ViewOptions,
        node: &str,
        direction: NeighborDirection,
    ) -> Result<GraphView> {
        let graph = self.analysis(id, &options.analysis)?;
        neighborhood(&graph, node, direction)
    }

    /// Run the generator and make the result selectable.
    ///
    /// The generation stops when either `cancel` or the service shutdown fires.
    pub fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GraphSummary> {
        if self.shutdown.is_cancelled() {
            return Err(HaystackError::InvalidRequest(
                "service is shutting down".to_string(),
            ));
        }
        let token = self.shutdown.linked_with(cancel);
        let artifact = self.generator.generate(request, &token)?;

        let id = artifact.id.clone();
        self.analyses.invalidate(&id);
        self.selectable
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id);
        Ok(artifact.summary())
    }

    /// Cancel in-flight generations; later generations are refused.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("visualization service shutting down");
        }
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn read_selectable(&self) -> std::sync::RwLockReadGuard<'_, BTreeSet<String>> {
        self.selectable
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An error as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMessage {
    pub kind: &'static str,
    pub message: String,
}

impl From<&HaystackError> for UserMessage {
    fn from(err: &HaystackError) -> Self {
        if err.kind() == "internal" {
            warn!(error = %err, "internal error surfaced to user");
        }
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for UserMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{EdgeRecord, GraphArtifact, GraphMeta, GraphNode, NodeProps};
    use crate::error::GenerationError;
    use serde_json::Map;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory repository counting loads.
    #[derive(Default)]
    struct MemoryStore {
        graphs: Mutex<HashMap<String, GraphArtifact>>,
        loads: AtomicUsize,
    }

    impl MemoryStore {
        fn put(&self, artifact: GraphArtifact) {
            self.graphs.lock().unwrap().insert(artifact.id.clone(), artifact);
        }
    }

    impl GraphRepository for MemoryStore {
        fn list(&self) -> Result<Vec<String>> {
            let mut ids: Vec<String> = self.graphs.lock().unwrap().keys().cloned().collect();
            ids.sort();
            Ok(ids)
        }

        fn contains(&self, id: &str) -> bool {
            self.graphs.lock().unwrap().contains_key(id)
        }

        fn load(&self, id: &str) -> Result<GraphArtifact> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.graphs
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| HaystackError::not_found(id))
        }
    }

    /// Generator writing a two-node graph into the shared store.
    struct FakeGenerator {
        store: Arc<MemoryStore>,
    }

    impl GraphGenerator for FakeGenerator {
        fn generate(
            &self,
            request: &GenerationRequest,
            cancel: &CancellationToken,
        ) -> Result<GraphArtifact> {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled.into());
            }
            if request.input.to_string_lossy() == "broken.jar" {
                return Err(GenerationError::Failed {
                    code: Some(1),
                    diagnostics: Default::default(),
                }
                .into());
            }
            let artifact = artifact(&request.output, &["main", "helper"]);
            self.store.put(artifact.clone());
            Ok(artifact)
        }
    }

    fn artifact(id: &str, names: &[&str]) -> GraphArtifact {
        let nodes = names
            .iter()
            .map(|n| GraphNode {
                id: n.to_string(),
                props: NodeProps::default(),
            })
            .collect();
        let edges = names
            .windows(2)
            .map(|w| EdgeRecord::new(w[0], w[1]))
            .collect();
        GraphArtifact::new(id, GraphMeta::for_callgraph(Map::new()), nodes, edges).unwrap()
    }

    fn service() -> (VisualizationService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        store.put(artifact("alpha", &["a", "b", "c"]));
        let generator = Arc::new(FakeGenerator {
            store: Arc::clone(&store),
        });
        let service = VisualizationService::start(store.clone(), generator).unwrap();
        (service, store)
    }

    #[test]
    fn test_start_lists_store() {
        let (service, _) = service();
        assert_eq!(service.available(), vec!["alpha"]);
    }

    #[test]
    fn test_analysis_is_memoized() {
        let (service, store) = service();
        let options = ViewOptions::default();
        service.view("alpha", &options).unwrap();
        service.view("alpha", &options).unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        let other = ViewOptions {
            analysis: AnalysisParams {
                damping: 0.5,
                ..AnalysisParams::default()
            },
            ..ViewOptions::default()
        };
        service.view("alpha", &other).unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_stays_within_capacity() {
        let (service, store) = service();
        let service = service.with_cache_capacity(3);
        let view_with = |damping: f64| ViewOptions {
            analysis: AnalysisParams {
                damping,
                ..AnalysisParams::default()
            },
            ..ViewOptions::default()
        };
        for i in 1..=10 {
            service.view("alpha", &view_with(i as f64 / 20.0)).unwrap();
        }
        assert_eq!(service.cached_analyses(), 3);
        assert_eq!(store.loads.load(Ordering::SeqCst), 10);

        service.view("alpha", &view_with(0.5)).unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 10);
        service.view("alpha", &view_with(0.05)).unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_generate_adds_and_invalidates() {
        let (service, store) = service();
        let token = CancellationToken::new();
        service.view("alpha", &ViewOptions::default()).unwrap();

        let summary = service
            .generate(&GenerationRequest::new("app.jar", "alpha"), &token)
            .unwrap();
        assert_eq!(summary.vertices, 2);
        let view = service.view("alpha", &ViewOptions::default()).unwrap();
        assert_eq!(view.nodes.len(), 2);
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);

        service
            .generate(&GenerationRequest::new("app.jar", "beta"), &token)
            .unwrap();
        assert_eq!(service.available(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_failed_generation_is_a_message() {
        let (service, _) = service();
        let err = service
            .generate(
                &GenerationRequest::new("broken.jar", "gamma"),
                &CancellationToken::new(),
            )
            .unwrap_err();
        let msg = UserMessage::from(&err);
        assert_eq!(msg.kind, "generation");
        assert!(msg.message.contains("exit code 1"));
        assert_eq!(service.available(), vec!["alpha"]);
    }

    #[test]
    fn test_shutdown_cancels_generation() {
        let (service, _) = service();
        service.shutdown();
        assert!(service.is_shut_down());
        let err = service
            .generate(
                &GenerationRequest::new("app.jar", "late"),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn test_refresh_picks_up_external_graphs() {
        let (service, store) = service();
        store.put(artifact("mined", &["x", "y"]));
        assert_eq!(service.available(), vec!["alpha"]);
        assert_eq!(service.refresh().unwrap(), vec!["alpha", "mined"]);
        assert_eq!(service.available(), vec!["alpha", "mined"]);
    }

    #[test]
    fn test_errors_become_messages() {
        let (service, _) = service();
        let err = service.view("nope", &ViewOptions::default()).unwrap_err();
        let msg = UserMessage::from(&err);
        assert_eq!(msg.kind, "not_found");
        assert_eq!(msg.to_string(), "[not_found] graph 'nope' not found");

        let err = service
            .neighbors("alpha", &ViewOptions::default(), "zzz", NeighborDirection::All)
            .unwrap_err();
        assert_eq!(UserMessage::from(&err).kind, "not_found");
    }

    #[test]
    fn test_describe() {
        let (service, _) = service();
        let summary = service.describe("alpha").unwrap();
        assert_eq!(summary.vertices, 3);
        assert_eq!(summary.edges, 2);
    }
}
