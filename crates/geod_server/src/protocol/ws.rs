//! WebSocket upgrade routing.
//!
//! The host only validates the upgrade request and picks the module; the
//! handshake and framing belong to the module handler, which takes over the
//! raw stream. Once a route is found the connection read timeout is cleared;
//! a handler that wants idle detection sets its own.

use super::http::{is_timeout, parse_head, read_head};
use super::{dispatch_to_module, Dispatch};
use crate::connection::ConnectionContext;
use crate::error::ServerError;
use crate::server::ServerShared;
use geod_host::{Protocol, Request};
use std::net::TcpStream;
use tracing::debug;

fn is_upgrade(upgrade: Option<&str>) -> bool {
    upgrade.is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

pub fn process(shared: &ServerShared, conn: &ConnectionContext, mut stream: TcpStream) -> Result<(), ServerError> {
    let head = match read_head(&mut stream).and_then(|raw| parse_head(&raw)) {
        Ok(head) => head,
        Err(ServerError::Io(e)) if is_timeout(&e) => return Ok(()),
        Err(e) => {
            let mut request = Request::new(Protocol::Ws, "", &mut stream);
            let _ = request.send_response(400, "text/plain", b"Bad Request\n");
            return Err(e);
        }
    };

    let upgrade = is_upgrade(head.header("Upgrade"));
    let route = if upgrade {
        shared.registry.resolve(Protocol::Ws, &head.path)
    } else {
        None
    };
    if route.is_some() {
        stream.set_read_timeout(None)?;
    }

    let mut request = Request::new(Protocol::Ws, head.path, &mut stream)
        .with_method(head.method)
        .with_query(head.query)
        .with_headers(head.headers)
        .with_peer(conn.peer());

    if !upgrade {
        request.send_response(400, "text/plain", b"Expected a WebSocket upgrade\n")?;
        return Ok(());
    }

    let Some(id) = route else {
        debug!("No WebSocket route for {}", request.path());
        request.send_response(404, "text/plain", b"Not Found\n")?;
        return Ok(());
    };

    match dispatch_to_module(&shared.registry, id, &mut request) {
        Dispatch::Handled => Ok(()),
        Dispatch::Unavailable => {
            request.send_response(503, "text/plain", b"Service Unavailable, retry later\n")?;
            Ok(())
        }
        Dispatch::NoHandler => {
            request.send_response(404, "text/plain", b"Not Found\n")?;
            Ok(())
        }
        Dispatch::Failed(e) => {
            if !request.response_started() {
                let _ = request.send_response(500, "text/plain", b"Internal Server Error\n");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_header_is_case_insensitive() {
        assert!(is_upgrade(Some("websocket")));
        assert!(is_upgrade(Some("WebSocket")));
        assert!(!is_upgrade(Some("h2c")));
        assert!(!is_upgrade(None));
    }
}
