use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use haystack::api::server::{Server, MAX_REQUEST_BYTES};
use haystack::application::VisualizationService;
use haystack::infrastructure::{FsGraphStore, GeneratorOptions, GeneratorRunner};
use serde_json::Value;
use tempfile::tempdir;

fn write_graph(root: &Path) {
    let dir = root.join("tiny");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("meta.json"), r#"{"type": "callgraph", "hierch": "method"}"#).unwrap();
    fs::write(
        dir.join("mapping.json"),
        r#"{"a.A.x": {"package": "a", "class": "A", "method": "x"},
            "a.B.y": {"package": "a", "class": "B", "method": "y"},
            "b.C.z": {"package": "b", "class": "C", "method": "z"}}"#,
    )
    .unwrap();
    fs::write(
        dir.join("edges.json"),
        r#"[{"source": "a.A.x", "target": "a.B.y"}, {"source": "a.B.y", "target": "b.C.z"}]"#,
    )
    .unwrap();
}

struct Client {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Client {
    fn connect(address: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(address).expect("Failed to connect to server");
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    fn send_raw(&mut self, line: &str) -> Value {
        self.stream.write_all(line.as_bytes()).unwrap();
        self.stream.write_all(b"\n").unwrap();
        let mut response = String::new();
        self.reader.read_line(&mut response).unwrap();
        println!("Response: {}", response.trim_end());
        serde_json::from_str(&response).unwrap()
    }

    fn send(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string())
    }

    fn read_response(&mut self) -> Value {
        let mut response = String::new();
        self.reader.read_line(&mut response).unwrap();
        serde_json::from_str(&response).unwrap()
    }
}

fn start_service(root: &Path, options: GeneratorOptions) -> Arc<VisualizationService> {
    let store = FsGraphStore::open(root).unwrap();
    let generator = GeneratorRunner::new(store.clone(), options);
    Arc::new(VisualizationService::start(Arc::new(store), Arc::new(generator)).unwrap())
}

/// PING on a fresh connection; `None` if it was refused or dropped.
fn try_ping(address: std::net::SocketAddr) -> Option<Value> {
    let mut stream = TcpStream::connect(address).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    stream.write_all(b"{\"command\": \"PING\"}\n").ok()?;
    let mut response = String::new();
    BufReader::new(stream).read_line(&mut response).ok()?;
    serde_json::from_str(&response).ok()
}

#[test]
fn test_server_lifecycle() {
    let tmp = tempdir().unwrap();
    write_graph(tmp.path());
    let store = FsGraphStore::open(tmp.path()).unwrap();
    let generator = GeneratorRunner::new(store.clone(), GeneratorOptions::default());
    let service = Arc::new(VisualizationService::start(Arc::new(store), Arc::new(generator)).unwrap());

    let server = Server::bind("127.0.0.1:0", Some(2), Arc::clone(&service)).unwrap();
    let handle = server.spawn().unwrap();
    let mut client = Client::connect(handle.address());

    let pong = client.send(serde_json::json!({"command": "PING"}));
    assert_eq!(pong["status"], "success");
    assert_eq!(pong["data"], "PONG");

    let list = client.send(serde_json::json!({"command": "LIST"}));
    assert_eq!(list["data"], serde_json::json!(["tiny"]));

    let described = client.send(serde_json::json!({"command": "DESCRIBE", "params": {"id": "tiny"}}));
    assert_eq!(described["data"]["vertices"], 3);
    assert_eq!(described["data"]["type"], "callgraph");

    let view = client.send(serde_json::json!({
        "command": "VIEW",
        "params": {"id": "tiny", "hierarchy": "package"}
    }));
    assert_eq!(view["status"], "success");
    assert_eq!(view["data"]["total_nodes"], 2);
    assert_eq!(view["data"]["edges"][0]["source"], "a");

    let dot = client.send(serde_json::json!({
        "command": "VIEW",
        "params": {"id": "tiny", "format": "dot"}
    }));
    assert!(dot["data"].as_str().unwrap().starts_with("digraph"));

    let cyto = client.send(serde_json::json!({
        "command": "VIEW",
        "params": {"id": "tiny", "format": "cytoscape", "focus": "a.B.y"}
    }));
    assert_eq!(cyto["data"].as_array().unwrap().len(), 5);
    assert_eq!(cyto["data"][0]["classes"], "genesis");

    let callees = client.send(serde_json::json!({
        "command": "NEIGHBORS",
        "params": {"id": "tiny", "node": "a.A.x", "direction": "out"}
    }));
    assert_eq!(callees["data"]["nodes"].as_array().unwrap().len(), 2);

    // errors keep the connection usable
    let missing = client.send(serde_json::json!({"command": "DESCRIBE", "params": {"id": "nope"}}));
    assert_eq!(missing["status"], "error");
    assert_eq!(missing["kind"], "not_found");

    let garbage = client.send_raw("{this is not json");
    assert_eq!(garbage["kind"], "invalid_request");

    let unknown = client.send(serde_json::json!({"command": "ANALYZE"}));
    assert_eq!(unknown["kind"], "invalid_request");
    assert!(unknown["message"].as_str().unwrap().contains("Unknown command"));

    let escape = client.send(serde_json::json!({
        "command": "GENERATE",
        "params": {"input": "x.jar", "output": "../escape"}
    }));
    assert_eq!(escape["kind"], "invalid_request");

    let bye = client.send(serde_json::json!({"command": "SHUTDOWN"}));
    assert_eq!(bye["status"], "success");

    handle.join().unwrap();
    assert!(service.is_shut_down());
}

#[test]
fn test_stop_handle_ends_accept_loop() {
    let tmp = tempdir().unwrap();
    let store = FsGraphStore::open(tmp.path()).unwrap();
    let generator = GeneratorRunner::new(store.clone(), GeneratorOptions::default());
    let service = Arc::new(VisualizationService::start(Arc::new(store), Arc::new(generator)).unwrap());

    let handle = Server::bind("127.0.0.1:0", None, service).unwrap().spawn().unwrap();
    let mut client = Client::connect(handle.address());
    let list = client.send(serde_json::json!({"command": "REFRESH"}));
    assert_eq!(list["data"], serde_json::json!([]));

    handle.stop();
    handle.join().unwrap();
}

#[test]
fn test_unbounded_sample_size_is_served() {
    let tmp = tempdir().unwrap();
    write_graph(tmp.path());
    let service = start_service(tmp.path(), GeneratorOptions::default());
    let handle = Server::bind("127.0.0.1:0", Some(2), service).unwrap().spawn().unwrap();
    let mut client = Client::connect(handle.address());

    let view = client.send(serde_json::json!({
        "command": "VIEW",
        "params": {"id": "tiny", "max_nodes": u64::MAX}
    }));
    assert_eq!(view["status"], "success");
    assert_eq!(view["data"]["nodes"].as_array().unwrap().len(), 3);

    let pong = client.send(serde_json::json!({"command": "PING"}));
    assert_eq!(pong["data"], "PONG");

    handle.stop();
    handle.join().unwrap();
}

#[test]
fn test_idle_connections_do_not_block_new_clients() {
    let tmp = tempdir().unwrap();
    let service = start_service(tmp.path(), GeneratorOptions::default());
    let handle = Server::bind("127.0.0.1:0", Some(2), Arc::clone(&service))
        .unwrap()
        .spawn()
        .unwrap();

    // More open connections than workers, all idle.
    let mut idle: Vec<Client> = (0..3).map(|_| Client::connect(handle.address())).collect();
    for client in &mut idle {
        assert_eq!(client.send(serde_json::json!({"command": "PING"}))["data"], "PONG");
    }

    let mut late = Client::connect(handle.address());
    assert_eq!(late.send(serde_json::json!({"command": "PING"}))["data"], "PONG");
    let bye = late.send(serde_json::json!({"command": "SHUTDOWN"}));
    assert_eq!(bye["status"], "success");

    handle.join().unwrap();
    assert!(service.is_shut_down());
}

#[test]
fn test_connection_limit_turns_clients_away() {
    let tmp = tempdir().unwrap();
    let service = start_service(tmp.path(), GeneratorOptions::default());
    let handle = Server::bind("127.0.0.1:0", Some(2), service)
        .unwrap()
        .with_max_connections(1)
        .spawn()
        .unwrap();

    let mut first = Client::connect(handle.address());
    assert_eq!(first.send(serde_json::json!({"command": "PING"}))["data"], "PONG");

    let mut second = Client::connect(handle.address());
    let refused = second.read_response();
    assert_eq!(refused["status"], "error");
    assert!(refused["message"].as_str().unwrap().contains("connection limit"));

    drop(first);
    let deadline = Instant::now() + Duration::from_secs(5);
    let pong = loop {
        match try_ping(handle.address()) {
            Some(reply) if reply["status"] == "success" => break reply,
            _ if Instant::now() > deadline => panic!("slot was never released"),
            _ => std::thread::sleep(Duration::from_millis(50)),
        }
    };
    assert_eq!(pong["data"], "PONG");

    handle.stop();
    handle.join().unwrap();
}

#[test]
fn test_oversized_request_is_rejected() {
    let tmp = tempdir().unwrap();
    let service = start_service(tmp.path(), GeneratorOptions::default());
    let handle = Server::bind("127.0.0.1:0", Some(2), service).unwrap().spawn().unwrap();
    let mut client = Client::connect(handle.address());

    let huge = "x".repeat(MAX_REQUEST_BYTES + 10);
    let rejected = client.send_raw(&huge);
    assert_eq!(rejected["status"], "error");
    assert_eq!(rejected["kind"], "invalid_request");
    assert!(rejected["message"].as_str().unwrap().contains("exceeds"));

    // The rest of the long line is skipped, the connection stays usable.
    let pong = client.send(serde_json::json!({"command": "PING"}));
    assert_eq!(pong["data"], "PONG");

    handle.stop();
    handle.join().unwrap();
}

#[cfg(unix)]
#[test]
fn test_generate_is_cancelled_when_client_leaves() {
    let scratch = tempdir().unwrap();
    let pid_file = scratch.path().join("generator.pid");
    let script = scratch.path().join("slow-generator.sh");
    fs::write(
        &script,
        format!("echo $$ > '{}'\nexec sleep 30\n", pid_file.display()),
    )
    .unwrap();
    let service = start_service(
        &scratch.path().join("GRAPHS"),
        GeneratorOptions {
            program: "/bin/sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
            timeout: Duration::from_secs(60),
            max_diagnostic_bytes: 1024,
        },
    );
    let handle = Server::bind("127.0.0.1:0", Some(2), Arc::clone(&service))
        .unwrap()
        .spawn()
        .unwrap();

    let mut client = Client::connect(handle.address());
    client
        .stream
        .write_all(b"{\"command\": \"GENERATE\", \"params\": {\"input\": \"app.jar\", \"output\": \"slow\"}}\n")
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let pid = loop {
        let written = fs::read_to_string(&pid_file).unwrap_or_default();
        if let Ok(pid) = written.trim().parse::<u32>() {
            break pid.to_string();
        }
        assert!(Instant::now() < deadline, "generator never started");
        std::thread::sleep(Duration::from_millis(20));
    };
    drop(client);

    let alive = |pid: &str| {
        std::process::Command::new("kill")
            .args(["-0", pid])
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    };
    let deadline = Instant::now() + Duration::from_secs(10);
    while alive(&pid) {
        assert!(Instant::now() < deadline, "generator outlived its client");
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!service.available().contains(&"slow".to_string()));

    handle.stop();
    handle.join().unwrap();
}
