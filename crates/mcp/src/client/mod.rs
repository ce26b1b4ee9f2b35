//! Plugin client subsystem.
//!
//! Transports carry MCP traffic to local child processes and remote HTTP
//! endpoints; rmcp runs the protocol on top. [`ManagedClient`] wraps one
//! live connection and the [`ClientManager`] supervises every configured
//! plugin.

mod health;
mod http;
mod managed;
mod manager;
mod process;
mod session;
mod stdio;
mod transport;

pub use health::{HealthMonitor, ProbeReport, ProbeSink, ProbeSource};
pub use http::RemoteTransport;
pub use managed::ManagedClient;
pub use manager::{ClientManager, ManagerDeps, SlotSnapshot};
pub use rmcp::model::{JsonObject, ServerInfo};
pub use stdio::LocalTransport;
pub use transport::{
    CallError, Connection, DefaultTransportFactory, EventStream, ProbeOutcome, Transport, TransportEvent, TransportFactory,
};
