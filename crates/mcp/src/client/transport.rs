//! Transport seams between the managed client and a plugin process or endpoint.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::Stream;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use rmcp::model::{JsonObject, ServerInfo};

use super::http::RemoteTransport;
use super::stdio::LocalTransport;
use crate::config::{PluginConfig, TransportConfig};
use crate::logging::LogManager;
use crate::types::{ToolDescriptor, ToolOutput, TransportError, TransportKind};

/// Capacity of the per-connection event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Something a connection pushes without being asked.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// `notifications/tools/list_changed`.
    ToolsChanged,
    /// The peer went away. Emitted at most once per connection.
    Closed { reason: String },
}

pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Result of a single `ping` round trip.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub latency: Duration,
    pub ok: bool,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn success(latency: Duration) -> Self {
        Self {
            latency,
            ok: true,
            error: None,
        }
    }

    pub fn failure(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            latency,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Why a `tools/call` did not produce a result.
#[derive(Debug, Clone)]
pub enum CallError {
    /// The plugin answered with a JSON-RPC error.
    Rpc { code: i64, message: String },
    Transport(TransportError),
}

impl From<TransportError> for CallError {
    fn from(error: TransportError) -> Self {
        Self::Transport(error)
    }
}

/// Factory for connections to one plugin.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection. Never retries.
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError>;

    fn kind(&self) -> TransportKind;
}

/// A live MCP session with a plugin.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Result of the `initialize` handshake. Runs it on first use; later
    /// calls return the same outcome.
    async fn initialize(&self) -> Result<ServerInfo, TransportError>;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError>;

    async fn call_tool(&self, tool: &str, arguments: JsonObject) -> Result<ToolOutput, CallError>;

    async fn ping(&self) -> Result<(), TransportError>;

    async fn health_check(&self) -> ProbeOutcome {
        let started = Instant::now();
        match self.ping().await {
            Ok(()) => ProbeOutcome::success(started.elapsed()),
            Err(error) => ProbeOutcome::failure(started.elapsed(), error.to_string()),
        }
    }

    /// Pushed events. Connections without push semantics yield nothing.
    fn subscribe_events(&self) -> EventStream;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Adapt a broadcast receiver into an [`EventStream`].
///
/// `closed` is emitted first when the connection ended before the caller
/// subscribed.
pub(crate) fn broadcast_events(receiver: broadcast::Receiver<TransportEvent>, closed: Option<String>) -> EventStream {
    let head = stream::iter(closed.map(|reason| TransportEvent::Closed { reason }));
    let tail = stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((event, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "transport event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    head.chain(tail).boxed()
}

pub(crate) fn no_events() -> EventStream {
    stream::empty().boxed()
}

/// Builds transports from resolved plugin configuration.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: Arc<PluginConfig>, logs: Arc<LogManager>) -> Result<Box<dyn Transport>, TransportError>;
}

/// Local configs get a child process, remote configs an HTTP client.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: Arc<PluginConfig>, logs: Arc<LogManager>) -> Result<Box<dyn Transport>, TransportError> {
        match &config.transport {
            TransportConfig::Local { .. } => Ok(Box::new(LocalTransport::new(config, logs))),
            TransportConfig::Remote { .. } => Ok(Box::new(RemoteTransport::new(config)?)),
        }
    }
}
