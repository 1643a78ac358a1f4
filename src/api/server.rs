use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::api::dto::{render_view, CommandReq, DescribeParams, NeighborsParams, ResponseDto, ViewParams};
use crate::application::VisualizationService;
use crate::error::HaystackError;
use crate::infrastructure::concurrency::{build_worker_pool, panic_message, CancellationToken};
use crate::ports::GenerationRequest;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
/// How often an idle connection re-checks for shutdown.
const READ_POLL: Duration = Duration::from_millis(250);
/// Longest accepted request line, newline excluded.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Line-delimited JSON endpoint in front of a [`VisualizationService`].
///
/// Every connection gets its own thread; requests on it are computed on a
/// shared rayon pool, GENERATE on a thread of its own.
pub struct Server {
    listener: TcpListener,
    service: Arc<VisualizationService>,
    pool: Arc<rayon::ThreadPool>,
    max_connections: usize,
}

impl Server {
    pub fn bind(address: &str, workers: Option<usize>, service: Arc<VisualizationService>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .with_context(|| format!("Failed to bind to {}", address))?;
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;
        let pool = build_worker_pool(workers)?;
        Ok(Self {
            listener,
            service,
            pool: Arc::new(pool),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        })
    }

    /// Cap on connections served at once. Zero is treated as one.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the service shuts down (SHUTDOWN command or
    /// [`VisualizationService::shutdown`]).
    pub fn run(self) -> Result<()> {
        let shutdown = self.service.shutdown_token();
        let active = Arc::new(AtomicUsize::new(0));
        info!(
            address = %self.local_addr()?,
            max_connections = self.max_connections,
            "API server listening"
        );

        while !shutdown.is_cancelled() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let Some(slot) = ConnectionSlot::acquire(&active, self.max_connections) else {
                        warn!(%peer, "connection limit reached, turning client away");
                        turn_away(stream);
                        continue;
                    };
                    debug!(%peer, "accepted connection");
                    let service = Arc::clone(&self.service);
                    let pool = Arc::clone(&self.pool);
                    let shutdown = shutdown.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("haystack-conn-{}", peer))
                        .spawn(move || {
                            let _slot = slot;
                            if let Err(e) = handle_connection(stream, &service, &pool, &shutdown) {
                                warn!(%peer, error = %e, "connection error");
                            }
                        });
                    if let Err(e) = spawned {
                        error!(%peer, error = %e, "failed to spawn connection thread");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    warn!(error = %e, "accept error");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }

        info!("API server stopped");
        Ok(())
    }

    /// Run on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let address = self.local_addr()?;
        let shutdown = self.service.shutdown_token();
        let thread = thread::Builder::new()
            .name("haystack-accept".to_string())
            .spawn(move || self.run())
            .context("Failed to spawn server thread")?;
        Ok(ServerHandle {
            address,
            shutdown,
            thread,
        })
    }
}

/// A server running on its own thread.
pub struct ServerHandle {
    address: SocketAddr,
    shutdown: CancellationToken,
    thread: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Ask the server to stop without waiting.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the accept loop to exit.
    pub fn join(self) -> Result<()> {
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => anyhow::bail!("server thread panicked"),
        }
    }
}

/// One counted open connection; released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self(Arc::clone(active)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn turn_away(mut stream: TcpStream) {
    let response = ResponseDto::from_result(Err(HaystackError::InvalidRequest(
        "server is at its connection limit, try again later".to_string(),
    )));
    let sent = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_write_timeout(Some(READ_POLL)))
        .map_err(anyhow::Error::from)
        .and_then(|_| write_response(&mut stream, &response));
    if let Err(e) = sent {
        debug!(error = %e, "could not notify rejected client");
    }
}

fn handle_connection(
    mut stream: TcpStream,
    service: &VisualizationService,
    pool: &rayon::ThreadPool,
    shutdown: &CancellationToken,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_POLL))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line: Vec<u8> = Vec::new();
    // Set after an oversized line was rejected, until its newline shows up.
    let mut discarding = false;

    loop {
        let budget = (MAX_REQUEST_BYTES + 1).saturating_sub(line.len()) as u64;
        match (&mut reader).take(budget).read_until(b'\n', &mut line) {
            Ok(0) => break, // Connection closed
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                // Partial input stays in `line`.
                if shutdown.is_cancelled() {
                    break;
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        let complete = line.last() == Some(&b'\n');
        if discarding {
            if complete {
                discarding = false;
            }
            line.clear();
            continue;
        }
        if !complete {
            if line.len() > MAX_REQUEST_BYTES {
                warn!(limit = MAX_REQUEST_BYTES, "rejecting oversized request");
                let response = ResponseDto::from_result(Err(HaystackError::InvalidRequest(format!(
                    "request exceeds {} bytes",
                    MAX_REQUEST_BYTES
                ))));
                write_response(&mut stream, &response)?;
                discarding = true;
                line.clear();
            }
            continue;
        }

        let request = match std::str::from_utf8(&line) {
            Ok(text) if text.trim().is_empty() => {
                line.clear();
                continue;
            }
            Ok(text) => serde_json::from_str::<CommandReq>(text.trim())
                .map_err(|e| HaystackError::InvalidRequest(format!("invalid JSON request: {}", e))),
            Err(_) => Err(HaystackError::InvalidRequest("request is not valid UTF-8".to_string())),
        };
        line.clear();

        let is_shutdown = matches!(&request, Ok(req) if req.command == "SHUTDOWN");
        let result = request.and_then(|req| match req.command.as_str() {
            "GENERATE" => generate_while_connected(&stream, service, &req),
            _ => guarded(|| pool.install(|| process_command(service, &req, &CancellationToken::new()))),
        });
        write_response(&mut stream, &ResponseDto::from_result(result))?;

        if is_shutdown {
            info!("shutdown requested");
            service.shutdown();
            break;
        }
    }
    Ok(())
}

fn write_response(stream: &mut TcpStream, response: &ResponseDto) -> Result<()> {
    let response_str = serde_json::to_string(response)?;
    stream.write_all(response_str.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Runs `f`, turning a panic into an internal error reply.
fn guarded<F>(f: F) -> crate::error::Result<Value>
where
    F: FnOnce() -> crate::error::Result<Value>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!(panic = %message, "request handler panicked");
        Err(HaystackError::Internal(message))
    })
}

/// Runs GENERATE on its own thread and cancels it if the client hangs up.
fn generate_while_connected(
    stream: &TcpStream,
    service: &VisualizationService,
    req: &CommandReq,
) -> crate::error::Result<Value> {
    let cancel = CancellationToken::new();
    thread::scope(|scope| {
        let worker = scope.spawn(|| process_command(service, req, &cancel));
        let mut byte = [0u8; 1];
        while !worker.is_finished() {
            // Blocks for at most READ_POLL.
            match stream.peek(&mut byte) {
                Ok(0) => {
                    info!("client disconnected, cancelling generation");
                    cancel.cancel();
                    break;
                }
                // Pipelined input waits for the reply.
                Ok(_) => thread::sleep(READ_POLL),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => {
                    info!(error = %e, "connection failed, cancelling generation");
                    cancel.cancel();
                    break;
                }
            }
        }
        worker.join().unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "generation panicked");
            Err(HaystackError::Internal(message))
        })
    })
}

fn process_command(
    service: &VisualizationService,
    req: &CommandReq,
    cancel: &CancellationToken,
) -> crate::error::Result<Value> {
    debug!(command = %req.command, "processing command");
    match req.command.as_str() {
        "PING" => Ok(json!("PONG")),
        "LIST" => Ok(json!(service.available())),
        "REFRESH" => Ok(json!(service.refresh()?)),
        "DESCRIBE" => {
            let params: DescribeParams = req.params()?;
            Ok(serde_json::to_value(service.describe(&params.id)?)?)
        }
        "VIEW" => {
            let params: ViewParams = req.params()?;
            let view = service.view(&params.id, &params.options)?;
            render_view(&view, params.format)
        }
        "NEIGHBORS" => {
            let params: NeighborsParams = req.params()?;
            let view = service.neighbors(&params.id, &params.options, &params.node, params.direction)?;
            Ok(serde_json::to_value(view)?)
        }
        "GENERATE" => {
            let request: GenerationRequest = req.params()?;
            let summary = service.generate(&request, cancel)?;
            Ok(serde_json::to_value(summary)?)
        }
        "SHUTDOWN" => Ok(json!("Shutting down...")),
        _ => Err(HaystackError::InvalidRequest(format!("Unknown command: {}", req.command))),
    }
}
