//! Protocol descriptors and the shared module dispatch step.

pub mod control;
pub mod http;
pub mod ws;

use crate::connection::ConnectionContext;
use crate::error::ServerError;
use crate::listener::ListenerSocket;
use crate::server::ServerShared;
use geod_host::{HostError, ModuleId, Protocol, Registry, Request};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use tracing::debug;

pub type AcceptHook = fn(&ListenerSocket, SocketAddr) -> Option<Arc<ConnectionContext>>;
pub type ProcessHook = fn(&ServerShared, &ConnectionContext, TcpStream) -> Result<(), ServerError>;

/// How a listener admits and serves connections.
pub struct ProtocolDescriptor {
    pub protocol: Protocol,
    pub label: &'static str,
    pub accept: AcceptHook,
    pub process: ProcessHook,
}

fn admit(listener: &ListenerSocket, peer: SocketAddr) -> Option<Arc<ConnectionContext>> {
    listener.admit(peer)
}

static HTTP: ProtocolDescriptor = ProtocolDescriptor {
    protocol: Protocol::Http,
    label: "http",
    accept: admit,
    process: http::process,
};

static WS: ProtocolDescriptor = ProtocolDescriptor {
    protocol: Protocol::Ws,
    label: "ws",
    accept: admit,
    process: ws::process,
};

static CONTROL: ProtocolDescriptor = ProtocolDescriptor {
    protocol: Protocol::Control,
    label: "control",
    accept: admit,
    process: control::process,
};

pub fn descriptor(protocol: Protocol) -> &'static ProtocolDescriptor {
    match protocol {
        Protocol::Http => &HTTP,
        Protocol::Ws => &WS,
        Protocol::Control => &CONTROL,
    }
}

/// Result of handing a request to a module.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Handled,
    /// Transient failure; the client should retry.
    Unavailable,
    NoHandler,
    Failed(HostError),
}

/// Starts the module, runs its handler for `request` and releases it.
pub(crate) fn dispatch_to_module(registry: &Registry, id: ModuleId, request: &mut Request<'_>) -> Dispatch {
    let lease = match registry.start(id) {
        Ok(lease) => lease,
        Err(e) if e.is_transient() => {
            debug!("Module {} unavailable: {}", id, e);
            return Dispatch::Unavailable;
        }
        Err(e) => return Dispatch::Failed(e),
    };
    let Some(handler) = lease.handler(request.protocol()) else {
        return Dispatch::NoHandler;
    };
    handler(lease.context(), request);
    Dispatch::Handled
}
