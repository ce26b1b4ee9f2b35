//! rmcp client session shared by the local and remote transports.
//!
//! A transport never speaks MCP itself. It moves raw JSON-RPC messages
//! between the plugin and a [`Wire`], and rmcp drives the protocol on the
//! other end of the channel pair through a [`ChannelTransport`].

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::stream::{self, BoxStream, StreamExt};
use rmcp::model::{
    CallToolRequestParams, CallToolResult, ClientInfo, ClientJsonRpcMessage, ClientRequest, Implementation, JsonObject,
    PingRequest, ServerInfo, ServerJsonRpcMessage, Tool,
};
use rmcp::service::{NotificationContext, Peer, RoleClient, RunningService, ServiceError};
use rmcp::{ClientHandler, ServiceExt};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio_util::sync::PollSender;
use tracing::debug;

use super::transport::{CallError, TransportEvent};
use crate::types::{ToolDescriptor, ToolOutput, TransportError};

const CLIENT_NAME: &str = "tendril";
const OUTGOING_CAPACITY: usize = 32;

/// Host-side handler: answers plugin requests with rmcp's defaults and turns
/// `notifications/tools/list_changed` into a [`TransportEvent`].
#[derive(Clone)]
pub(crate) struct PluginHandler {
    plugin_name: String,
    events: broadcast::Sender<TransportEvent>,
}

impl ClientHandler for PluginHandler {
    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            client_info: Implementation {
                name: CLIENT_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        debug!(plugin = %self.plugin_name, "plugin announced a new tool list");
        let _ = self.events.send(TransportEvent::ToolsChanged);
    }
}

/// The pump's end of a session: messages rmcp wants delivered, and a sender
/// for whatever the plugin answers or pushes.
pub(crate) struct Wire {
    pub(crate) outgoing: mpsc::Receiver<ClientJsonRpcMessage>,
    pub(crate) incoming: mpsc::UnboundedSender<ServerJsonRpcMessage>,
}

/// rmcp's end of a session. The session ends when every incoming sender is
/// gone.
pub(crate) struct ChannelTransport {
    sink: PollSender<ClientJsonRpcMessage>,
    stream: BoxStream<'static, ServerJsonRpcMessage>,
}

pub(crate) fn channel_transport() -> (ChannelTransport, Wire) {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let stream = stream::unfold(incoming_rx, |mut receiver| async move {
        receiver.recv().await.map(|message| (message, receiver))
    })
    .boxed();

    (
        ChannelTransport {
            sink: PollSender::new(outgoing_tx),
            stream,
        },
        Wire {
            outgoing: outgoing_rx,
            incoming: incoming_tx,
        },
    )
}

/// The first fatal error a pump ran into. Later errors are dropped.
#[derive(Clone, Default)]
pub(crate) struct Fault(Arc<Mutex<Option<TransportError>>>);

impl Fault {
    /// Returns true when this call recorded the fault.
    pub(crate) fn set(&self, error: TransportError) -> bool {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(error);
        true
    }

    pub(crate) fn get(&self) -> Option<TransportError> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// An initialized rmcp session with one plugin.
pub(crate) struct McpSession {
    plugin_name: String,
    peer: Peer<RoleClient>,
    server: ServerInfo,
    running: AsyncMutex<Option<RunningService<RoleClient, PluginHandler>>>,
    fault: Fault,
}

impl McpSession {
    /// Run the `initialize` exchange over `transport`.
    pub(crate) async fn establish(
        plugin_name: &str,
        transport: ChannelTransport,
        events: broadcast::Sender<TransportEvent>,
        fault: Fault,
    ) -> Result<Self, TransportError> {
        let handler = PluginHandler {
            plugin_name: plugin_name.to_string(),
            events,
        };
        let running = handler
            .serve((transport.sink, transport.stream))
            .await
            .map_err(|error| fault.get().unwrap_or_else(|| TransportError::connect(format!("initialize failed: {error}"))))?;

        let server = running
            .peer_info()
            .cloned()
            .ok_or_else(|| TransportError::protocol("plugin sent no initialize result"))?;
        debug!(
            plugin = %plugin_name,
            server = %server.server_info.name,
            version = %server.server_info.version,
            "plugin initialized"
        );

        Ok(Self {
            plugin_name: plugin_name.to_string(),
            peer: running.peer().clone(),
            server,
            running: AsyncMutex::new(Some(running)),
            fault,
        })
    }

    pub(crate) fn server_info(&self) -> ServerInfo {
        self.server.clone()
    }

    /// Every tool, following `nextCursor` until the plugin stops paging.
    pub(crate) async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let tools = self
            .peer
            .list_all_tools()
            .await
            .map_err(|error| self.transport_error(error, "tools/list"))?;
        tools.iter().map(descriptor).collect()
    }

    pub(crate) async fn call_tool(&self, tool: &str, arguments: JsonObject) -> Result<ToolOutput, CallError> {
        let request = CallToolRequestParams {
            name: tool.to_string().into(),
            arguments: Some(arguments),
            task: None,
            meta: None,
        };
        match self.peer.call_tool(request).await {
            Ok(result) => tool_output(&result)
                .map_err(|error| CallError::Transport(TransportError::protocol(format!("invalid tools/call result: {error}")))),
            Err(ServiceError::McpError(error)) => Err(CallError::Rpc {
                code: i64::from(error.code.0),
                message: error.message.to_string(),
            }),
            Err(error) => Err(CallError::Transport(self.transport_error(error, "tools/call"))),
        }
    }

    pub(crate) async fn ping(&self) -> Result<(), TransportError> {
        let request = ClientRequest::PingRequest(PingRequest {
            method: Default::default(),
            extensions: Default::default(),
        });
        self.peer
            .send_request(request)
            .await
            .map(|_| ())
            .map_err(|error| self.transport_error(error, "ping"))
    }

    /// Stop the rmcp service task. Idempotent.
    pub(crate) async fn shutdown(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running
            && let Err(error) = running.cancel().await
        {
            debug!(plugin = %self.plugin_name, error = %error, "rmcp service did not stop cleanly");
        }
    }

    fn transport_error(&self, error: ServiceError, operation: &str) -> TransportError {
        match error {
            ServiceError::McpError(error) => {
                TransportError::protocol(format!("{operation} failed ({}): {}", error.code.0, error.message))
            }
            ServiceError::Timeout { timeout } => TransportError::timeout(operation, timeout),
            ServiceError::UnexpectedResponse => TransportError::protocol(format!("unexpected response to {operation}")),
            other => self
                .fault
                .get()
                .unwrap_or_else(|| TransportError::closed(format!("{operation}: {other}"))),
        }
    }
}

fn descriptor(tool: &Tool) -> Result<ToolDescriptor, TransportError> {
    serde_json::to_value(tool)
        .and_then(serde_json::from_value)
        .map_err(|error| TransportError::protocol(format!("invalid tool '{}': {error}", tool.name)))
}

/// Null fields are dropped first, so absent and `null` read the same.
fn tool_output(result: &CallToolResult) -> Result<ToolOutput, serde_json::Error> {
    let mut value = serde_json::to_value(result)?;
    if let Value::Object(fields) = &mut value {
        fields.retain(|_, field| !field.is_null());
    }
    serde_json::from_value(value)
}

/// Parse one raw JSON-RPC message from a plugin. `None` for anything rmcp
/// would not accept.
pub(crate) fn parse_server_message(value: Value) -> Option<ServerJsonRpcMessage> {
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}
