//! End-to-end tests: a server on ephemeral ports hosting an in-process
//! module, exercised over real sockets.

use geod_host::{
    AuxResource, EventContext, EventHook, EventKind, EventReply, HostConfig, HostInterface,
    Module, ModuleContext, ModuleError, ModuleState, Protocol, Request, StaticLoader, SymbolTable,
};
use geod_server::{run_cycle, GeodServer, ServerConfig, ServerHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

struct Tiles;

impl Module for Tiles {
    fn register(&self, module: &ModuleContext, host: &HostInterface) -> Result<(), ModuleError> {
        host.register_routes(module, Protocol::Http, &["/a", "/quiet"]);
        host.register_routes(module, Protocol::Ws, &["/live"]);
        host.register_routes(module, Protocol::Control, &["tiles"]);
        Ok(())
    }

    fn init(&self, module: &ModuleContext, host: &HostInterface) -> Result<(), ModuleError> {
        use std::io::{Read, Write};

        let greeting = host.config_string("tiles", "greeting", "hello");
        host.set_handler(module, Protocol::Http, move |_: &ModuleContext, req: &mut Request<'_>| {
            if req.path() == "/a" {
                let body = format!("{} from {}", greeting, req.path());
                let _ = req.send_response(200, "text/plain", body.as_bytes());
            }
        });
        host.set_handler(module, Protocol::Ws, |_: &ModuleContext, req: &mut Request<'_>| {
            let mut frame = [0u8; 4];
            if req.stream().read_exact(&mut frame).is_ok() {
                let _ = req.stream().write_all(&frame);
            }
        });
        host.set_handler(module, Protocol::Control, |_: &ModuleContext, req: &mut Request<'_>| {
            let line = format!("tiles args: {}", req.args().join(" "));
            let _ = req.write_line(&line);
        });
        Ok(())
    }

    fn finish(&self, _module: &ModuleContext) {}
}

impl EventHook for Tiles {
    fn on_event(&self, _module: &ModuleContext, _kind: EventKind, _ctx: &EventContext) -> EventReply {
        EventReply::Ready
    }
}

fn loader() -> Arc<StaticLoader> {
    Arc::new(StaticLoader::new().with_module("tiles", || {
        let module = Arc::new(Tiles);
        SymbolTable::from_module(module.clone()).with_event_hook(module)
    }))
}

fn config(cache: &std::path::Path) -> ServerConfig {
    let mut host = HostConfig {
        cache_dir: cache.to_path_buf(),
        ..HostConfig::default()
    };
    host.module_config.insert(
        "tiles".to_string(),
        [("greeting".to_string(), "hi".to_string())].into_iter().collect(),
    );
    ServerConfig {
        http_bind: "127.0.0.1:0".parse().unwrap(),
        ws_bind: Some("127.0.0.1:0".parse().unwrap()),
        control_bind: Some("127.0.0.1:0".parse().unwrap()),
        bind_retries: 0,
        connection_timeout: 2,
        host,
        ..ServerConfig::default()
    }
}

async fn start(cache: &std::path::Path) -> ServerHandle {
    GeodServer::with_loader(config(cache), loader(), AuxResource::disabled())
        .start()
        .await
        .expect("server should start")
}

async fn exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("server should close the connection")
        .unwrap();
    String::from_utf8(response).unwrap()
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    exchange(addr, &format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path)).await
}

#[tokio::test(flavor = "multi_thread")]
async fn http_request_is_served_by_module_and_released() {
    let cache = tempfile::tempdir().unwrap();
    let server = start(cache.path()).await;
    let addr = server.local_addr(Protocol::Http).unwrap();
    let registry = server.shared().registry.clone();
    let id = registry.find("tiles").unwrap();

    let response = http_get(addr, "/a").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("hi from /a"));

    assert_eq!(registry.state(id).unwrap(), ModuleState::Initialized);
    let info = registry.module_snapshot().unwrap();
    assert_eq!(info[0].refcount, 0);

    let later = Instant::now() + Duration::from_secs(61);
    let report = run_cycle(&registry, &server.shared().listeners, &server.shared().config.housekeeper, later);
    assert_eq!(report.modules_evicted, 1);
    assert_eq!(registry.state(id).unwrap(), ModuleState::Unloaded);

    let response = http_get(addr, "/a").await;
    assert!(response.ends_with("hi from /a"), "module reloads on demand");

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn http_builtins_and_errors() {
    let cache = tempfile::tempdir().unwrap();
    let server = start(cache.path()).await;
    let addr = server.local_addr(Protocol::Http).unwrap();

    let status = http_get(addr, "/status.json").await;
    assert!(status.starts_with("HTTP/1.1 200 OK\r\n"));
    let body = status.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["status"], "running");
    assert_eq!(json["modules"][0]["name"], "tiles");

    let page = http_get(addr, "/status").await;
    assert!(page.contains("<h1>geod status</h1>"));

    assert!(http_get(addr, "/missing").await.starts_with("HTTP/1.1 404 "));
    assert!(http_get(addr, "/quiet").await.starts_with("HTTP/1.1 500 "));
    assert!(exchange(addr, "NONSENSE\r\n\r\n").await.starts_with("HTTP/1.1 400 "));

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_session_outlives_connection_timeout() {
    let cache = tempfile::tempdir().unwrap();
    let server = start(cache.path()).await;
    let addr = server.local_addr(Protocol::Ws).unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /live HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    stream.write_all(b"ping").await.unwrap();

    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("module should close the session")
        .unwrap();
    assert_eq!(response, b"ping");

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn control_session_runs_builtins_and_module_commands() {
    let cache = tempfile::tempdir().unwrap();
    let server = start(cache.path()).await;
    let addr = server.local_addr(Protocol::Control).unwrap();

    let transcript = exchange(addr, "stat\r\nfrobnicate\r\ntiles render 3 4\r\nquit\r\n").await;
    assert!(transcript.starts_with("geod control ready"));
    assert!(transcript.contains("uptime: "));
    assert!(transcript.contains("unknown command 'frobnicate', type 'help'"));
    assert!(transcript.contains("tiles args: render 3 4"));
    assert!(transcript.trim_end().ends_with("bye"));

    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn control_stop_requests_shutdown() {
    let cache = tempfile::tempdir().unwrap();
    let server = start(cache.path()).await;
    let addr = server.local_addr(Protocol::Control).unwrap();

    let transcript = exchange(addr, "stop\r\n").await;
    assert!(transcript.contains("stopping"));
    timeout(Duration::from_secs(1), server.wait_for_stop())
        .await
        .expect("stop should raise the shutdown signal");

    let registry = server.shared().registry.clone();
    server.shutdown().await.unwrap();
    let id = registry.find("tiles").unwrap();
    assert!(!registry.state(id).unwrap().is_resident());
}
