//! Sample geod module.
//!
//! Serves `/hello` and `/hello/time`, answers the `hello` control command,
//! runs a ticker thread while loaded and refuses to stand by while a request
//! is being served.

use geod_host::{
    EventContext, EventHook, EventKind, EventReply, HostInterface, LogLevel, Module,
    ModuleContext, ModuleError, Protocol, Request, ThreadHooks,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    served: AtomicU64,
    ticks: AtomicU64,
}

#[derive(Serialize)]
struct TimeReply {
    unix_secs: u64,
    ticks: u64,
}

#[derive(Default)]
pub struct HelloModule {
    counters: Arc<Counters>,
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn serve_http(counters: &Counters, greeting: &str, req: &mut Request<'_>) {
    counters.served.fetch_add(1, Ordering::Relaxed);
    // Write errors mean the client went away.
    let _ = match req.path() {
        "/hello" => {
            let name = req.query("name").unwrap_or("world").to_string();
            let body = format!("{}, {}!\n", greeting, name);
            req.send_response(200, "text/plain; charset=utf-8", body.as_bytes())
        }
        "/hello/time" => {
            let reply = TimeReply {
                unix_secs: unix_secs(),
                ticks: counters.ticks.load(Ordering::Relaxed),
            };
            match serde_json::to_vec(&reply) {
                Ok(body) => req.send_response(200, "application/json", &body),
                Err(_) => req.send_response(500, "text/plain", b"encoding failed\n"),
            }
        }
        _ => req.send_response(404, "text/plain", b"Not Found\n"),
    };
}

fn serve_control(counters: &Counters, req: &mut Request<'_>) {
    let line = match req.args().first().map(String::as_str) {
        Some("stat") => format!(
            "hello: served {} request(s), {} tick(s), {} active",
            counters.served.load(Ordering::Relaxed),
            counters.ticks.load(Ordering::Relaxed),
            counters.active.load(Ordering::Relaxed)
        ),
        Some(other) => format!("hello: unknown argument '{}', try 'hello stat'", other),
        None => "hello from the control port".to_string(),
    };
    let _ = req.write_line(&line);
}

impl Module for HelloModule {
    fn register(&self, module: &ModuleContext, host: &HostInterface) -> Result<(), ModuleError> {
        host.register_routes(module, Protocol::Http, &["/hello", "/hello/time"]);
        host.register_routes(module, Protocol::Control, &["hello"]);
        Ok(())
    }

    fn init(&self, module: &ModuleContext, host: &HostInterface) -> Result<(), ModuleError> {
        let greeting = host.config_string("hello", "greeting", "Hello");
        let tick_ms = host.config_int("hello", "tick_ms", 1000).clamp(10, 60_000) as u64;

        let counters = self.counters.clone();
        host.set_handler(module, Protocol::Http, move |_: &ModuleContext, req: &mut Request<'_>| {
            serve_http(&counters, &greeting, req)
        });
        let counters = self.counters.clone();
        host.set_handler(module, Protocol::Control, move |_: &ModuleContext, req: &mut Request<'_>| {
            serve_control(&counters, req)
        });

        let counters = self.counters.clone();
        host.spawn_own_thread(module, "ticker", move |control| {
            while control.wait_timeout(Duration::from_millis(tick_ms)) {
                counters.ticks.fetch_add(1, Ordering::Relaxed);
            }
        })?;

        host.log(module, LogLevel::Info, "hello module initialized");
        Ok(())
    }

    fn finish(&self, _module: &ModuleContext) {
        self.counters.active.store(0, Ordering::Relaxed);
    }
}

impl ThreadHooks for HelloModule {
    fn thread_init(&self, _module: &ModuleContext) -> Result<(), ModuleError> {
        self.counters.active.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn thread_finish(&self, _module: &ModuleContext) {
        let _ = self
            .counters
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl EventHook for HelloModule {
    fn on_event(&self, _module: &ModuleContext, kind: EventKind, _ctx: &EventContext) -> EventReply {
        match kind {
            EventKind::Terminate => EventReply::Ready,
            _ if self.counters.active.load(Ordering::Acquire) > 0 => EventReply::Busy,
            _ => EventReply::Ready,
        }
    }
}

geod_host::export_module!(HelloModule, thread_hooks, event);
