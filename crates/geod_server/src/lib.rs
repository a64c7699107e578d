//! # geod server
//!
//! Connection dispatcher of the geod daemon. Listeners accept HTTP,
//! WebSocket and control connections; each connection is served on its own
//! worker thread, either by a built-in handler or by the module that
//! registered the requested route. A housekeeper thread evicts idle modules,
//! reaps finished connections and keeps rolling per-listener statistics.

pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod housekeeper;
pub mod listener;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod status;

pub use config::{HousekeeperConfig, ServerConfig};
pub use connection::{ConnectionContext, ConnectionList, ConnectionStatus, ReapSummary};
pub use error::ServerError;
pub use housekeeper::{run_cycle, CycleReport, Housekeeper};
pub use listener::{bind_with_retry, ListenerSocket};
pub use server::{GeodServer, ServerHandle, ServerShared};
pub use shutdown::ShutdownSignal;
pub use stats::{RollingStats, TickSample, Totals, WindowSummary};
pub use status::StatusReport;
