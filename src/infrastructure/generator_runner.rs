/// Call-Graph Generator Runner.
///
/// Drives the external generator (by default `java -jar genCallgraph.jar`)
/// as a subprocess and publishes its output into the Graph Store:
/// - output is staged in a hidden directory and renamed into place on success
/// - one generation at a time per output identifier
/// - bounded by a timeout and a cancellation token
/// - stdout/stderr kept as a bounded tail for error reports

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::concurrency::{lock_unpoisoned, CancellationToken, PathLocks};
use super::graph_store::FsGraphStore;
use crate::config::GeneratorConfig;
use crate::domain::graph::{GraphArtifact, GraphMeta, EDGES_FILE, MAPPING_FILE, META_FILE};
use crate::error::{Diagnostics, GenerationError, HaystackError, Result};
use crate::ports::{GenerationRequest, GraphGenerator, GraphRepository};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// Longest wait for output readers once the generator itself has exited.
const READER_GRACE: Duration = Duration::from_secs(2);
const MIN_READER_WAIT: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 8192;

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

/// How to launch the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorOptions {
    pub program: String,
    /// Arguments placed before the per-request ones.
    pub args: Vec<String>,
    pub timeout: Duration,
    pub max_diagnostic_bytes: usize,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self::from(&GeneratorConfig::default())
    }
}

impl From<&GeneratorConfig> for GeneratorOptions {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_diagnostic_bytes: config.max_diagnostic_bytes,
        }
    }
}

/// Generator Bridge backed by a subprocess.
pub struct GeneratorRunner {
    store: FsGraphStore,
    options: GeneratorOptions,
    locks: PathLocks,
}

impl GeneratorRunner {
    pub fn new(store: FsGraphStore, options: GeneratorOptions) -> Self {
        Self {
            store,
            options,
            locks: PathLocks::new(),
        }
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    fn generate_locked(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GraphArtifact> {
        let id = request.output.as_str();
        if !request.force && self.store.contains(id) {
            info!(graph = id, "graph already exists, reusing it");
            return self.store.load(id);
        }
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled.into());
        }

        let staging = self.store.staging_dir(id)?;
        let spec = build_command_spec(&self.options, request, staging.path());
        info!(graph = id, program = %spec.program, "running call-graph generator");
        debug!(args = ?spec.args, "generator command line");

        let diagnostics = run_generator(&spec, &self.options, cancel)?;
        if !diagnostics.is_empty() {
            debug!(graph = id, output = %diagnostics.text, "generator output");
        }

        for file in [EDGES_FILE, MAPPING_FILE] {
            if !staging.path().join(file).is_file() {
                return Err(GenerationError::MissingOutput {
                    path: PathBuf::from(id).join(file),
                }
                .into());
            }
        }

        let meta = GraphMeta::for_callgraph(request.attrs());
        let meta_path = staging.path().join(META_FILE);
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
            .map_err(|e| HaystackError::io(&meta_path, e))?;

        let artifact = FsGraphStore::load_from(staging.path(), id)
            .map_err(|e| GenerationError::InvalidOutput(Box::new(e)))?;
        self.store.publish(staging.path(), id)?;

        info!(
            graph = id,
            vertices = artifact.nodes().len(),
            edges = artifact.edges().len(),
            "generated call graph"
        );
        Ok(artifact)
    }
}

impl GraphGenerator for GeneratorRunner {
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GraphArtifact> {
        request.validate()?;
        let lock = self.locks.lock_for(&request.output);
        let _guard = lock_unpoisoned(&lock);
        self.generate_locked(request, cancel)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Internal Implementation
// ═══════════════════════════════════════════════════════════════════════════

/// Run the generator to completion. Returns its output on exit code 0.
fn run_generator(
    spec: &CommandSpec,
    options: &GeneratorOptions,
    cancel: &CancellationToken,
) -> Result<Diagnostics> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| GenerationError::Launch {
            program: spec.program.clone(),
            source,
        })?;

    let tail = Arc::new(Mutex::new(OutputTail::new(options.max_diagnostic_bytes)));
    let (done_tx, done_rx) = mpsc::channel();
    let mut readers = 0;
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, Arc::clone(&tail), done_tx.clone());
        readers += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, Arc::clone(&tail), done_tx.clone());
        readers += 1;
    }
    drop(done_tx);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                kill_and_reap(&mut child);
                return Err(HaystackError::io(&spec.program, e));
            }
        }
        if cancel.is_cancelled() {
            warn!(program = %spec.program, "generation cancelled, killing generator");
            kill_and_reap(&mut child);
            return Err(GenerationError::Cancelled.into());
        }
        if started.elapsed() >= options.timeout {
            warn!(program = %spec.program, timeout = ?options.timeout, "generator timed out, killing it");
            kill_and_reap(&mut child);
            // Readers are left detached: a grandchild may still hold the pipes.
            return Err(GenerationError::TimedOut {
                after: options.timeout,
                diagnostics: lock_unpoisoned(&tail).snapshot(),
            }
            .into());
        }
        thread::sleep(POLL_INTERVAL);
    };

    // Descendants may have inherited the pipes and outlive the generator.
    let wait = READER_GRACE
        .min(options.timeout.saturating_sub(started.elapsed()))
        .max(MIN_READER_WAIT);
    let deadline = Instant::now() + wait;
    while readers > 0 {
        match done_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(()) => readers -= 1,
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    program = %spec.program,
                    "generator exited but its output is still held open, detaching readers"
                );
                break;
            }
        }
    }
    let diagnostics = lock_unpoisoned(&tail).snapshot();

    if !status.success() {
        return Err(GenerationError::Failed {
            code: status.code(),
            diagnostics,
        }
        .into());
    }
    Ok(diagnostics)
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(error = %e, "failed to kill generator (already exited?)");
    }
    if let Err(e) = child.wait() {
        warn!(error = %e, "failed to reap generator");
    }
}

/// Drain `source` into `tail`, then report on `done`.
fn spawn_reader<R: Read + Send + 'static>(
    mut source: R,
    tail: Arc<Mutex<OutputTail>>,
    done: Sender<()>,
) {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => lock_unpoisoned(&tail).push(&buf[..n]),
            }
        }
        let _ = done.send(());
    });
}

/// The most recent bytes of a stream, up to a limit.
#[derive(Debug)]
struct OutputTail {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl OutputTail {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.dropped += excess;
        }
    }

    fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            text: String::from_utf8_lossy(&self.buf).into_owned(),
            truncated_bytes: self.dropped,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Testable Command Builder
// ═══════════════════════════════════════════════════════════════════════════

/// The command line the runner would execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

/// Build the generator command line for a request writing into `output_dir`.
pub fn build_command_spec(
    options: &GeneratorOptions,
    request: &GenerationRequest,
    output_dir: &Path,
) -> CommandSpec {
    let mut args = options.args.clone();
    args.push("-i".to_string());
    args.push(request.input.to_string_lossy().into_owned());
    if let Some(main_class) = &request.main_class {
        args.push("-m".to_string());
        args.push(main_class.clone());
    }
    args.push("-o".to_string());
    args.push(output_dir.to_string_lossy().into_owned());
    if !request.edge_filter.is_empty() {
        args.push("--edge-filter".to_string());
        args.extend(request.edge_filter.iter().cloned());
    }
    if !request.jar_filter.is_empty() {
        args.push("--jar-filter".to_string());
        args.extend(request.jar_filter.iter().cloned());
    }
    CommandSpec {
        program: options.program.clone(),
        args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::new("apps/demo.jar", "demo")
    }

    #[test]
    fn test_build_command_spec_default() {
        let spec = build_command_spec(&GeneratorOptions::default(), &request(), Path::new("/g/.s"));
        assert_eq!(spec.program, "java");
        assert_eq!(
            spec.args,
            vec!["-jar", "genCallgraph.jar", "-i", "apps/demo.jar", "-o", "/g/.s"]
        );
    }

    #[test]
    fn test_build_command_spec_with_filters() {
        let mut req = request();
        req.main_class = Some("org.demo.Main".to_string());
        req.edge_filter = vec!["jadx".to_string(), "java.".to_string()];
        req.jar_filter = vec!["lib".to_string()];
        let spec = build_command_spec(&GeneratorOptions::default(), &req, Path::new("out"));

        let m = spec.args.iter().position(|a| a == "-m").unwrap();
        assert_eq!(spec.args[m + 1], "org.demo.Main");
        let e = spec.args.iter().position(|a| a == "--edge-filter").unwrap();
        assert_eq!(&spec.args[e + 1..e + 3], &["jadx", "java."]);
        let j = spec.args.iter().position(|a| a == "--jar-filter").unwrap();
        assert_eq!(spec.args[j + 1], "lib");
        assert_eq!(spec.args.len(), j + 2);
    }

    #[test]
    fn test_output_tail_keeps_most_recent_bytes() {
        let mut tail = OutputTail::new(8);
        tail.push(b"hello ");
        tail.push(b"world!");
        let diag = tail.snapshot();
        assert_eq!(diag.text, "o world!");
        assert_eq!(diag.truncated_bytes, 4);
    }

    #[test]
    fn test_output_tail_under_limit() {
        let mut tail = OutputTail::new(64);
        tail.push(b"fine");
        let diag = tail.snapshot();
        assert_eq!(diag.text, "fine");
        assert_eq!(diag.truncated_bytes, 0);
    }

    #[test]
    fn test_launch_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsGraphStore::open(tmp.path()).unwrap();
        let runner = GeneratorRunner::new(
            store.clone(),
            GeneratorOptions {
                program: "haystack-no-such-generator".to_string(),
                args: vec![],
                ..GeneratorOptions::default()
            },
        );
        let err = runner
            .generate(&request(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            HaystackError::Generation(GenerationError::Launch { .. })
        ));
        assert!(store.list().unwrap().is_empty());
    }
}
