//! Capability routing: which module serves which path or command.
//!
//! HTTP paths go into a concurrent hash index where the first module to
//! claim a path keeps it. WebSocket and control routes are few per module
//! and are resolved by scanning modules in id order.

use crate::context::{ModuleContext, ModuleId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Protocol class of a listener and of a route namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Ws,
    Control,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Http, Protocol::Ws, Protocol::Control];

    pub fn label(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Ws => "ws",
            Protocol::Control => "control",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Routes claimed by one module, one write-once array per protocol.
#[derive(Debug, Default)]
pub struct ModuleRoutes {
    http: OnceLock<Vec<String>>,
    ws: OnceLock<Vec<String>>,
    control: OnceLock<Vec<String>>,
}

impl ModuleRoutes {
    fn slot(&self, protocol: Protocol) -> &OnceLock<Vec<String>> {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Ws => &self.ws,
            Protocol::Control => &self.control,
        }
    }

    pub fn paths(&self, protocol: Protocol) -> &[String] {
        self.slot(protocol).get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_registered(&self, protocol: Protocol) -> bool {
        self.slot(protocol).get().is_some()
    }

    /// Publishes the array. Fails if this protocol was already registered.
    pub(crate) fn publish(&self, protocol: Protocol, paths: Vec<String>) -> bool {
        self.slot(protocol).set(paths).is_ok()
    }

    pub fn matches(&self, protocol: Protocol, path: &str) -> bool {
        self.paths(protocol).iter().any(|p| p == path)
    }

    /// Longest control route whose words equal the leading `words`.
    /// Returns how many words the route consumed.
    pub fn match_command(&self, words: &[&str]) -> Option<usize> {
        self.paths(Protocol::Control)
            .iter()
            .filter_map(|route| {
                let route_words: Vec<&str> = route.split_whitespace().collect();
                let n = route_words.len();
                (n > 0 && n <= words.len() && route_words[..] == words[..n]).then_some(n)
            })
            .max()
    }
}

/// Shared HTTP path index.
#[derive(Debug, Default)]
pub struct RouteIndex {
    http: DashMap<String, ModuleId>,
}

impl RouteIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `path` for `module` unless another module claimed it first.
    pub fn insert(&self, path: &str, module: ModuleId) -> bool {
        match self.http.entry(path.to_string()) {
            Entry::Occupied(existing) => {
                if *existing.get() != module {
                    debug!(
                        "HTTP route {} already served by module {}; module {} shadowed",
                        path,
                        existing.get(),
                        module
                    );
                }
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(module);
                true
            }
        }
    }

    pub fn lookup(&self, path: &str) -> Option<ModuleId> {
        self.http.get(path).map(|id| *id)
    }

    pub fn len(&self) -> usize {
        self.http.len()
    }

    pub fn is_empty(&self) -> bool {
        self.http.is_empty()
    }

    /// Finds the module serving `path` for `protocol`.
    pub fn resolve(
        &self,
        protocol: Protocol,
        path: &str,
        modules: &[Arc<ModuleContext>],
    ) -> Option<ModuleId> {
        match protocol {
            Protocol::Http => self.lookup(path),
            Protocol::Ws | Protocol::Control => modules
                .iter()
                .find(|m| m.routes().matches(protocol, path))
                .map(|m| m.id()),
        }
    }

    /// Finds the module owning a control command line. Returns the module and
    /// the number of words naming the command; the rest are arguments.
    pub fn resolve_command(
        &self,
        words: &[&str],
        modules: &[Arc<ModuleContext>],
    ) -> Option<(ModuleId, usize)> {
        modules
            .iter()
            .find_map(|m| m.routes().match_command(words).map(|n| (m.id(), n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(id: ModuleId, protocol: Protocol, paths: &[&str]) -> Arc<ModuleContext> {
        let ctx = ModuleContext::new(id, format!("m{}", id), 1);
        assert!(ctx
            .routes()
            .publish(protocol, paths.iter().map(|p| p.to_string()).collect()));
        Arc::new(ctx)
    }

    #[test]
    fn first_registered_http_route_wins() {
        let index = RouteIndex::new();
        assert!(index.insert("/a", 0));
        assert!(index.insert("/b", 0));
        assert!(!index.insert("/b", 1));
        assert!(index.insert("/c", 1));

        assert_eq!(index.resolve(Protocol::Http, "/b", &[]), Some(0));
        assert_eq!(index.resolve(Protocol::Http, "/c", &[]), Some(1));
        assert_eq!(index.resolve(Protocol::Http, "/d", &[]), None);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn routes_publish_once() {
        let ctx = ModuleContext::new(0, "m", 1);
        assert!(ctx.routes().publish(Protocol::Ws, vec!["/live".into()]));
        assert!(!ctx.routes().publish(Protocol::Ws, vec!["/other".into()]));
        assert_eq!(ctx.routes().paths(Protocol::Ws), ["/live".to_string()]);
        assert!(ctx.routes().paths(Protocol::Http).is_empty());
    }

    #[test]
    fn ws_routes_scan_in_module_order() {
        let modules = vec![
            module(0, Protocol::Ws, &["/feed"]),
            module(1, Protocol::Ws, &["/feed", "/chat"]),
        ];
        let index = RouteIndex::new();
        assert_eq!(index.resolve(Protocol::Ws, "/feed", &modules), Some(0));
        assert_eq!(index.resolve(Protocol::Ws, "/chat", &modules), Some(1));
        assert_eq!(index.resolve(Protocol::Ws, "/nope", &modules), None);
        // namespaces are disjoint per protocol
        assert_eq!(index.resolve(Protocol::Control, "/feed", &modules), None);
    }

    #[test]
    fn control_commands_match_whole_leading_words() {
        let modules = vec![
            module(0, Protocol::Control, &["map", "map stat"]),
            module(1, Protocol::Control, &["tiles purge"]),
        ];
        let index = RouteIndex::new();

        assert_eq!(index.resolve_command(&["map", "stat", "now"], &modules), Some((0, 2)));
        assert_eq!(index.resolve_command(&["map", "x"], &modules), Some((0, 1)));
        assert_eq!(index.resolve_command(&["tiles", "purge"], &modules), Some((1, 2)));
        assert_eq!(index.resolve_command(&["tiles"], &modules), None);
        assert_eq!(index.resolve_command(&["mapx"], &modules), None);
    }
}
