//! A request routed to a module handler, plus the response helpers modules
//! use to answer it.

use crate::routes::Protocol;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::Path;

/// Byte stream of a connection.
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send> Transport for T {}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

pub struct Request<'a> {
    protocol: Protocol,
    path: String,
    method: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    args: Vec<String>,
    peer: Option<SocketAddr>,
    stream: &'a mut dyn Transport,
    response_started: bool,
    bytes_sent: u64,
}

impl<'a> Request<'a> {
    pub fn new(protocol: Protocol, path: impl Into<String>, stream: &'a mut dyn Transport) -> Self {
        Self {
            protocol,
            path: path.into(),
            method: String::new(),
            query: Vec::new(),
            headers: Vec::new(),
            args: Vec::new(),
            peer: None,
            stream,
            response_started: false,
            bytes_sent: 0,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// HTTP/WS path, or the command name for control requests.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Words following a control command.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Raw connection access, e.g. for a WebSocket handshake.
    pub fn stream(&mut self) -> &mut dyn Transport {
        self.response_started = true;
        &mut *self.stream
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.response_started = true;
        self.stream.write_all(data)?;
        self.bytes_sent += data.len() as u64;
        Ok(())
    }

    /// Writes one line to a control session.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.write(line.as_bytes())?;
        self.write(b"\r\n")
    }

    pub fn send_response(&mut self, status: u16, content_type: &str, body: &[u8]) -> io::Result<()> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            reason_phrase(status),
            content_type,
            body.len()
        );
        self.write(head.as_bytes())?;
        self.write(body)?;
        self.stream.flush()
    }

    /// Streams a file as the response body, or answers 404 if it cannot be opened.
    pub fn send_file(&mut self, path: &Path, content_type: &str) -> io::Result<()> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return self.send_response(404, "text/plain", b"Not Found\n"),
        };
        let len = file.metadata()?.len();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            content_type, len
        );
        self.write(head.as_bytes())?;

        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n])?;
        }
        self.stream.flush()
    }

    pub fn start_chunked(&mut self, status: u16, content_type: &str) -> io::Result<()> {
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            status,
            reason_phrase(status),
            content_type
        );
        self.write(head.as_bytes())
    }

    pub fn send_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.write(format!("{:x}\r\n", data.len()).as_bytes())?;
        self.write(data)?;
        self.write(b"\r\n")
    }

    pub fn end_chunked(&mut self) -> io::Result<()> {
        self.write(b"0\r\n\r\n")?;
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn output(cursor: Cursor<Vec<u8>>) -> String {
        String::from_utf8(cursor.into_inner()).unwrap()
    }

    #[test]
    fn plain_response_has_length_and_reason() {
        let mut out = Cursor::new(Vec::new());
        let mut req = Request::new(Protocol::Http, "/a", &mut out);
        req.send_response(503, "text/plain", b"busy").unwrap();
        assert!(req.response_started());
        drop(req);

        let text = output(out);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nbusy"));
    }

    #[test]
    fn chunked_response_framing() {
        let mut out = Cursor::new(Vec::new());
        let mut req = Request::new(Protocol::Http, "/a", &mut out);
        req.start_chunked(200, "text/plain").unwrap();
        req.send_chunk(b"hello world, twenty").unwrap();
        req.send_chunk(b"").unwrap();
        req.end_chunked().unwrap();
        drop(req);

        let text = output(out);
        assert!(text.contains("Transfer-Encoding: chunked"));
        assert!(text.ends_with("\r\n\r\n13\r\nhello world, twenty\r\n0\r\n\r\n"));
    }

    #[test]
    fn missing_file_answers_not_found() {
        let mut out = Cursor::new(Vec::new());
        let mut req = Request::new(Protocol::Http, "/f", &mut out);
        req.send_file(Path::new("/nonexistent/geod.png"), "image/png")
            .unwrap();
        drop(req);
        assert!(output(out).starts_with("HTTP/1.1 404 Not Found"));
    }

    #[test]
    fn file_is_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.json");
        std::fs::write(&path, b"{\"z\":3}").unwrap();

        let mut out = Cursor::new(Vec::new());
        let mut req = Request::new(Protocol::Http, "/f", &mut out);
        req.send_file(&path, "application/json").unwrap();
        assert!(req.bytes_sent() > 7);
        drop(req);

        let text = output(out);
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("{\"z\":3}"));
    }

    #[test]
    fn lookups_are_case_insensitive_for_headers() {
        let mut out = Cursor::new(Vec::new());
        let req = Request::new(Protocol::Ws, "/live", &mut out)
            .with_headers(vec![("Upgrade".into(), "websocket".into())])
            .with_query(vec![("z".into(), "4".into())])
            .with_args(vec!["now".into()]);
        assert_eq!(req.header("upgrade"), Some("websocket"));
        assert_eq!(req.query("z"), Some("4"));
        assert_eq!(req.query("x"), None);
        assert_eq!(req.args(), ["now".to_string()]);
    }
}
