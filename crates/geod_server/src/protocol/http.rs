//! HTTP/1.x request handling: one request per connection.

use super::{dispatch_to_module, Dispatch};
use crate::connection::ConnectionContext;
use crate::error::ServerError;
use crate::server::ServerShared;
use crate::status;
use geod_host::{Protocol, Request};
use std::io::{self, Read};
use std::net::TcpStream;
use tracing::debug;

const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reads until the blank line that ends the request head.
pub fn read_head<R: Read>(reader: &mut R) -> Result<Vec<u8>, ServerError> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Err(ServerError::BadRequest(
                "connection closed before end of request head".to_string(),
            ));
        }
        head.extend_from_slice(&buf[..n]);
        if let Some(end) = find_head_end(&head) {
            head.truncate(end);
            return Ok(head);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(ServerError::BadRequest("request head too large".to_string()));
        }
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

pub fn parse_head(raw: &[u8]) -> Result<RequestHead, ServerError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| ServerError::BadRequest("request head is not UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ServerError::BadRequest(format!(
            "malformed request line: {:?}",
            request_line
        )));
    };
    if !version.starts_with("HTTP/") {
        return Err(ServerError::BadRequest(format!("unsupported version {}", version)));
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (target, Vec::new()),
    };

    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ServerError::BadRequest(format!("malformed header: {:?}", line)));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(RequestHead {
        method: method.to_string(),
        path: path.to_string(),
        query,
        version: version.to_string(),
        headers,
    })
}

pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

type Builtin = fn(&ServerShared, &mut Request<'_>) -> io::Result<()>;

fn status_page(shared: &ServerShared, request: &mut Request<'_>) -> io::Result<()> {
    let html = status::render_html(&status::collect(shared));
    request.send_response(200, "text/html; charset=utf-8", html.as_bytes())
}

fn status_json(shared: &ServerShared, request: &mut Request<'_>) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(&status::collect(shared))
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    request.send_response(200, "application/json", &body)
}

const BUILTINS: &[(&str, Builtin)] = &[("/status", status_page), ("/status.json", status_json)];

fn builtin(path: &str) -> Option<Builtin> {
    BUILTINS.iter().find(|(p, _)| *p == path).map(|(_, f)| *f)
}

pub fn process(shared: &ServerShared, conn: &ConnectionContext, mut stream: TcpStream) -> Result<(), ServerError> {
    let head = match read_head(&mut stream).and_then(|raw| parse_head(&raw)) {
        Ok(head) => head,
        Err(ServerError::Io(e)) if is_timeout(&e) => {
            debug!("HTTP connection {} timed out before sending a request", conn.id());
            return Ok(());
        }
        Err(e) => {
            let mut request = Request::new(Protocol::Http, "", &mut stream);
            let _ = request.send_response(400, "text/plain", b"Bad Request\n");
            return Err(e);
        }
    };
    debug!("{} {} from {}", head.method, head.path, conn.peer());

    let mut request = Request::new(Protocol::Http, head.path, &mut stream)
        .with_method(head.method)
        .with_query(head.query)
        .with_headers(head.headers)
        .with_peer(conn.peer());

    if let Some(page) = builtin(request.path()) {
        page(shared, &mut request)?;
        return Ok(());
    }

    let Some(id) = shared.registry.resolve(Protocol::Http, request.path()) else {
        request.send_response(404, "text/plain", b"Not Found\n")?;
        return Ok(());
    };

    match dispatch_to_module(&shared.registry, id, &mut request) {
        Dispatch::Handled => {
            if !request.response_started() {
                request.send_response(500, "text/plain", b"Module sent no response\n")?;
            }
            Ok(())
        }
        Dispatch::Unavailable => {
            request.send_response(503, "text/plain", b"Service Unavailable, retry later\n")?;
            Ok(())
        }
        Dispatch::NoHandler => {
            request.send_response(404, "text/plain", b"Not Found\n")?;
            Ok(())
        }
        Dispatch::Failed(e) => {
            let _ = request.send_response(500, "text/plain", b"Internal Server Error\n");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_request_line_query_and_headers() {
        let raw = b"GET /tiles/3?x=4&y=5&flag HTTP/1.1\r\nHost: example\r\nUpgrade: websocket\r\n";
        let head = parse_head(raw).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/tiles/3");
        assert_eq!(
            head.query,
            vec![
                ("x".to_string(), "4".to_string()),
                ("y".to_string(), "5".to_string()),
                ("flag".to_string(), String::new())
            ]
        );
        assert_eq!(head.header("host"), Some("example"));
        assert_eq!(head.header("UPGRADE"), Some("websocket"));
    }

    #[test]
    fn rejects_malformed_heads() {
        assert!(parse_head(b"GET\r\n").is_err());
        assert!(parse_head(b"GET / SPDY/3\r\n").is_err());
        assert!(parse_head(b"GET / HTTP/1.1\r\nno-colon-here\r\n").is_err());
    }

    #[test]
    fn head_reader_stops_at_blank_line() {
        let mut input = Cursor::new(b"GET / HTTP/1.0\r\nA: b\r\n\r\nbody".to_vec());
        let head = read_head(&mut input).unwrap();
        assert_eq!(head, b"GET / HTTP/1.0\r\nA: b");
    }

    #[test]
    fn head_reader_rejects_truncated_input() {
        let mut input = Cursor::new(b"GET / HTTP/1.0\r\n".to_vec());
        assert!(matches!(read_head(&mut input), Err(ServerError::BadRequest(_))));
    }

    #[test]
    fn builtins_are_exact_paths() {
        assert!(builtin("/status").is_some());
        assert!(builtin("/status.json").is_some());
        assert!(builtin("/status/").is_none());
    }
}
