//! Listening sockets: binding with retry, and per-listener admission and
//! statistics.

use crate::connection::{ConnectionContext, ConnectionList};
use crate::error::ServerError;
use crate::stats::RollingStats;
use geod_host::Protocol;
use parking_lot::{Mutex, MutexGuard};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_BIND_BACKOFF_MS: u64 = 5_000;

pub struct ListenerSocket {
    protocol: Protocol,
    local_addr: SocketAddr,
    max_connections: usize,
    connections: ConnectionList,
    stats: Mutex<RollingStats>,
}

impl ListenerSocket {
    pub fn new(protocol: Protocol, local_addr: SocketAddr, max_connections: usize, stats_window: usize) -> Self {
        Self {
            protocol,
            local_addr,
            max_connections,
            connections: ConnectionList::new(),
            stats: Mutex::new(RollingStats::new(stats_window)),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connections(&self) -> &ConnectionList {
        &self.connections
    }

    pub fn stats(&self) -> MutexGuard<'_, RollingStats> {
        self.stats.lock()
    }

    /// Registers a new connection unless the listener is at capacity.
    pub fn admit(&self, peer: SocketAddr) -> Option<Arc<ConnectionContext>> {
        if self.connections.alive() >= self.max_connections {
            self.stats.lock().record_reject();
            warn!(
                "{} listener full ({} connections); rejecting {}",
                self.protocol, self.max_connections, peer
            );
            return None;
        }
        self.stats.lock().record_accept();
        Some(self.connections.register(self.protocol, peer))
    }
}

fn bind_once(addr: SocketAddr, backlog: u32) -> io::Result<StdTcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    let listener: StdTcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Binds `addr`, retrying with a doubling backoff while the address is busy.
///
/// # Arguments
///
/// * `retries` - Additional attempts after the first one
/// * `backoff_ms` - Delay before the first retry; doubled after each failure
///   and capped at five seconds
pub async fn bind_with_retry(
    addr: SocketAddr,
    backlog: u32,
    retries: u32,
    backoff_ms: u64,
) -> Result<StdTcpListener, ServerError> {
    let mut delay = backoff_ms.max(1);
    let mut attempt = 1;
    loop {
        match bind_once(addr, backlog) {
            Ok(listener) => {
                debug!("Bound {} on attempt {}", addr, attempt);
                return Ok(listener);
            }
            Err(e) if attempt <= retries => {
                warn!(
                    "Bind {} failed (attempt {}/{}): {}; retrying in {}ms",
                    addr,
                    attempt,
                    retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = (delay * 2).min(MAX_BIND_BACKOFF_MS);
                attempt += 1;
            }
            Err(source) => {
                return Err(ServerError::Bind {
                    addr,
                    attempts: attempt,
                    source,
                })
            }
        }
    }
}
