//! Accept loop and per-connection workers.
//!
//! Accepting is async; serving is not. Every admitted connection gets its
//! own detached OS thread running the listener's process hook on a blocking
//! socket. Workers are never joined: the housekeeper reaps their contexts
//! once they report a final status.

use crate::connection::{ConnectionContext, ConnectionStatus};
use crate::listener::ListenerSocket;
use crate::protocol::{descriptor, ProtocolDescriptor};
use crate::server::ServerShared;
use futures::future::select_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Marks the connection failed if the worker unwinds before reporting.
struct FinishGuard<'a>(&'a ConnectionContext);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if self.0.finish(ConnectionStatus::Error) {
            warn!("Connection {} worker ended without a status", self.0.id());
        }
    }
}

fn serve(
    shared: Arc<ServerShared>,
    descriptor: &'static ProtocolDescriptor,
    conn: Arc<ConnectionContext>,
    stream: std::net::TcpStream,
) {
    let _guard = FinishGuard(&conn);
    // The stream is consumed, so the socket is closed before the status is set.
    let status = match (descriptor.process)(&shared, &conn, stream) {
        Ok(()) => ConnectionStatus::FinishedOk,
        Err(e) => {
            debug!(
                "{} connection {} from {} failed: {}",
                descriptor.label,
                conn.id(),
                conn.peer(),
                e
            );
            ConnectionStatus::Error
        }
    };
    conn.finish(status);
}

fn hand_off(shared: &Arc<ServerShared>, listener: &ListenerSocket, stream: TcpStream, peer: SocketAddr) {
    let descriptor = descriptor(listener.protocol());
    let Some(conn) = (descriptor.accept)(listener, peer) else {
        return;
    };

    let stream = match stream.into_std().and_then(|s| {
        s.set_nonblocking(false)?;
        s.set_read_timeout(Some(shared.config.connection_timeout()))?;
        Ok(s)
    }) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to prepare connection from {}: {}", peer, e);
            conn.finish(ConnectionStatus::Error);
            return;
        }
    };

    let worker_shared = shared.clone();
    let worker_conn = conn.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("conn-{}-{}", descriptor.label, conn.id()))
        .spawn(move || serve(worker_shared, descriptor, worker_conn, stream));
    if let Err(e) = spawned {
        error!("Failed to spawn worker for {}: {}", peer, e);
        conn.finish(ConnectionStatus::Error);
    }
}

/// Accepts on every listener until shutdown is requested.
pub(crate) async fn accept_loop(shared: Arc<ServerShared>, listeners: Vec<(Arc<ListenerSocket>, TcpListener)>) {
    if listeners.is_empty() {
        shared.shutdown.wait().await;
        return;
    }
    info!("📡 Accepting connections on {} listener(s)", listeners.len());

    loop {
        let accepts = listeners
            .iter()
            .enumerate()
            .map(|(index, (_, listener))| Box::pin(async move { (index, listener.accept().await) }));

        let (index, accepted) = tokio::select! {
            _ = shared.shutdown.wait() => break,
            ((index, accepted), _, _) = select_all(accepts) => (index, accepted),
        };

        let listener = &listeners[index].0;
        match accepted {
            Ok((stream, peer)) => hand_off(&shared, listener, stream, peer),
            Err(e) => {
                warn!("{} accept failed: {}", listener.protocol(), e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    info!("Accept loop stopped");
}
