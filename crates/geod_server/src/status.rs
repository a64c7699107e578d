//! Server status report shared by the built-in HTTP pages and the control
//! `stat` / `debug` commands.

use crate::listener::ListenerSocket;
use crate::server::ServerShared;
use crate::stats::{TickSample, Totals, WindowSummary};
use geod_host::{DiagnosticsSnapshot, ModuleInfo};
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, Serialize)]
pub struct ListenerReport {
    pub protocol: String,
    pub address: String,
    pub tracked: usize,
    pub alive: usize,
    pub last: Option<TickSample>,
    pub window: WindowSummary,
    pub totals: Totals,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// `running`, or `stopping` once shutdown was requested.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// False when the module table was busy; `modules` is empty then.
    pub modules_available: bool,
    pub modules: Vec<ModuleInfo>,
    pub listeners: Vec<ListenerReport>,
    pub diagnostics: DiagnosticsSnapshot,
    pub aux_loaded: bool,
}

fn listener_report(listener: &ListenerSocket) -> ListenerReport {
    let stats = listener.stats();
    ListenerReport {
        protocol: listener.protocol().label().to_string(),
        address: listener.local_addr().to_string(),
        tracked: listener.connections().len(),
        alive: listener.connections().alive(),
        last: stats.last(),
        window: stats.summary(),
        totals: stats.totals(),
    }
}

pub fn collect(shared: &ServerShared) -> StatusReport {
    let modules = shared.registry.module_snapshot();
    StatusReport {
        status: if shared.shutdown.is_requested() { "stopping" } else { "running" },
        uptime_secs: shared.started_at.elapsed().as_secs(),
        modules_available: modules.is_ok(),
        modules: modules.unwrap_or_default(),
        listeners: shared.listeners.iter().map(|l| listener_report(l)).collect(),
        diagnostics: shared.registry.diagnostics().snapshot(),
        aux_loaded: shared.registry.host().aux().is_loaded(),
    }
}

/// Plain text lines for the control session.
pub fn render_text(report: &StatusReport) -> Vec<String> {
    let mut lines = vec![format!("uptime: {}s ({})", report.uptime_secs, report.status)];
    for l in &report.listeners {
        lines.push(format!(
            "{:<8} {:<22} alive {:>4}  accepted {:>6}  rejected {:>4}  finished {:>6}  failed {:>4}",
            l.protocol,
            l.address,
            l.alive,
            l.totals.accepted,
            l.totals.rejected,
            l.totals.finished,
            l.totals.failed
        ));
        if l.window.samples > 0 {
            lines.push(format!(
                "         window {} ticks: alive min/avg/max {}/{}/{}  exec avg {:.2}ms",
                l.window.samples,
                l.window.min.alive,
                l.window.avg.alive,
                l.window.max.alive,
                l.window.avg.exec_avg_ms
            ));
        }
    }
    if !report.modules_available {
        lines.push("modules: table busy, try again".to_string());
    }
    for m in &report.modules {
        lines.push(format!(
            "module {:>2} {:<20} {:<13} refs {:>3}  idle {:>5}s  threads {}",
            m.id, m.name, m.state.label(), m.refcount, m.idle_secs, m.own_threads
        ));
    }
    lines
}

pub fn render_diagnostics(report: &StatusReport) -> Vec<String> {
    let d = &report.diagnostics;
    vec![
        format!("lock timeouts:     {}", d.lock_timeouts),
        format!("load failures:     {}", d.load_failures),
        format!("deferred unloads:  {}", d.deferred_unloads),
        format!("abandoned threads: {}", d.abandoned_threads),
        format!("evictions:         {}", d.evictions),
        format!("aux library:       {}", if report.aux_loaded { "loaded" } else { "idle" }),
    ]
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn render_html(report: &StatusReport) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><title>geod status</title></head><body>\n<h1>geod status</h1>\n",
    );
    let _ = writeln!(html, "<p>uptime {}s</p>", report.uptime_secs);

    html.push_str("<h2>Listeners</h2>\n<table>\n<tr><th>protocol</th><th>address</th><th>alive</th><th>accepted</th><th>rejected</th><th>finished</th><th>failed</th><th>exec avg ms</th></tr>\n");
    for l in &report.listeners {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.2}</td></tr>",
            l.protocol,
            escape(&l.address),
            l.alive,
            l.totals.accepted,
            l.totals.rejected,
            l.totals.finished,
            l.totals.failed,
            l.window.avg.exec_avg_ms
        );
    }
    html.push_str("</table>\n<h2>Modules</h2>\n");

    if !report.modules_available {
        html.push_str("<p>module table busy</p>\n");
    }
    html.push_str("<table>\n<tr><th>id</th><th>name</th><th>state</th><th>refs</th><th>idle s</th><th>routes</th></tr>\n");
    for m in &report.modules {
        let mut routes: Vec<String> = m.routes.values().flatten().map(|r| escape(r)).collect();
        routes.sort();
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            m.id,
            escape(&m.name),
            m.state.label(),
            m.refcount,
            m.idle_secs,
            routes.join(" ")
        );
    }
    html.push_str("</table>\n</body></html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use geod_host::ModuleState;
    use std::collections::HashMap;

    fn report() -> StatusReport {
        StatusReport {
            status: "running",
            uptime_secs: 42,
            modules_available: true,
            modules: vec![ModuleInfo {
                id: 0,
                name: "tiles<x>".into(),
                state: ModuleState::Initialized,
                refcount: 0,
                idle_secs: 3,
                library_loaded: true,
                shutdown_attempts: 0,
                own_threads: 1,
                routes: HashMap::from([(geod_host::Protocol::Http, vec!["/tiles".to_string()])]),
            }],
            listeners: Vec::new(),
            diagnostics: DiagnosticsSnapshot::default(),
            aux_loaded: false,
        }
    }

    #[test]
    fn html_escapes_module_names() {
        let html = render_html(&report());
        assert!(html.contains("tiles&lt;x&gt;"));
        assert!(html.contains("/tiles"));
        assert!(html.contains("INITIALIZED"));
    }

    #[test]
    fn text_lists_modules() {
        let lines = render_text(&report());
        assert_eq!(lines[0], "uptime: 42s (running)");
        assert!(lines.iter().any(|l| l.contains("tiles<x>") && l.contains("INITIALIZED")));
    }

    #[test]
    fn json_is_serializable() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["modules"][0]["state"], "INITIALIZED");
        assert_eq!(json["modules"][0]["routes"]["http"][0], "/tiles");
    }
}
