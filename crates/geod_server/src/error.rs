use geod_host::HostError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr} after {attempts} attempt(s): {source}")]
    Bind {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Malformed request: {0}")]
    BadRequest(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("Internal error: {0}")]
    Internal(String),
}
