//! Remote transport: JSON-RPC over HTTP POST, with optional SSE push.
//!
//! - `RemoteTransport` owns the configured HTTP client and runs the rmcp
//!   handshake on `connect`.
//! - A pump task POSTs every message rmcp emits. Replies come back either as
//!   a JSON body or as a `text/event-stream` body and are handed back to the
//!   session. Credential rejections and lost endpoints are fatal: they are
//!   recorded, the session ends, and every pending call reports that error.
//! - When the handshake result advertises an `eventStream` path, a background
//!   listener (`sse::spawn_sse_listener`) forwards pushed messages until the
//!   connection is dropped or closed.

mod sse;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rmcp::model::{JsonObject, ServerInfo, ServerJsonRpcMessage};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};
use url::Url;

use super::session::{Fault, McpSession, Wire, channel_transport, parse_server_message};
use super::transport::{
    CallError, Connection, EVENT_CHANNEL_CAPACITY, EventStream, Transport, TransportEvent, broadcast_events,
};
use crate::config::{PluginConfig, ResolvedAuth, TransportConfig};
use crate::types::{AuthError, ToolDescriptor, ToolOutput, TransportError, TransportKind};

pub(crate) const SESSION_HEADER: &str = "Mcp-Session-Id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 512;
const INTERNAL_ERROR: i64 = -32603;

/// Apply the resolved credentials to one request.
pub(crate) fn apply_auth(builder: RequestBuilder, auth: Option<&ResolvedAuth>) -> RequestBuilder {
    match auth {
        Some(ResolvedAuth::Bearer { token }) => builder.bearer_auth(token),
        Some(ResolvedAuth::Basic { username, password }) => builder.basic_auth(username, password.as_deref()),
        Some(ResolvedAuth::Header { name, value }) => builder.header(name.as_str(), value.as_str()),
        None => builder,
    }
}

/// Talks to a plugin behind an HTTP endpoint.
pub struct RemoteTransport {
    plugin_name: String,
    client: Client,
    base_url: Url,
    auth: Option<ResolvedAuth>,
}

impl RemoteTransport {
    pub fn new(config: Arc<PluginConfig>) -> Result<Self, TransportError> {
        let TransportConfig::Remote { base_url, headers, auth } = &config.transport else {
            return Err(TransportError::connect("plugin is not configured for a remote transport"));
        };

        let mut default_headers = HeaderMap::new();
        for header in headers {
            let name = HeaderName::from_bytes(header.key.as_bytes())
                .map_err(|error| TransportError::connect(format!("invalid header name '{}': {error}", header.key)))?;
            let value = HeaderValue::from_str(header.effective_value())
                .map_err(|_| TransportError::connect(format!("invalid value for header '{}'", header.key)))?;
            default_headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(default_headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| TransportError::connect(error.to_string()))?;

        Ok(Self {
            plugin_name: config.name.clone(),
            client,
            base_url: base_url.clone(),
            auth: auth.clone(),
        })
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let (transport, wire) = channel_transport();
        let link = Arc::new(RemoteLink {
            plugin_name: self.plugin_name.clone(),
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            auth: self.auth.clone(),
            session_id: RwLock::new(None),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            fault: Fault::default(),
            cancel: CancellationToken::new(),
            listening: AtomicBool::new(false),
        });
        // Dropping the connect future stops the pump and any listener.
        let guard = link.cancel.clone().drop_guard();
        spawn_post_pump(Arc::clone(&link), wire);

        let session = McpSession::establish(&self.plugin_name, transport, link.events.clone(), link.fault.clone()).await?;
        Ok(Arc::new(RemoteConnection {
            link,
            session,
            closed: AtomicBool::new(false),
            _guard: guard,
        }))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Remote
    }
}

/// HTTP plumbing shared by the pump, its request tasks and the connection.
struct RemoteLink {
    plugin_name: String,
    client: Client,
    base_url: Url,
    auth: Option<ResolvedAuth>,
    session_id: RwLock<Option<String>>,
    events: broadcast::Sender<TransportEvent>,
    fault: Fault,
    cancel: CancellationToken,
    listening: AtomicBool,
}

impl RemoteLink {
    fn session_id(&self) -> Option<String> {
        self.session_id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn remember_session(&self, response: &Response) {
        if let Some(session) = response.headers().get(SESSION_HEADER).and_then(|value| value.to_str().ok()) {
            *self.session_id.write().unwrap_or_else(PoisonError::into_inner) = Some(session.to_string());
        }
    }

    /// POST one message and return the JSON-RPC messages of the reply body.
    async fn post(&self, message: &Value) -> Result<Vec<Value>, TransportError> {
        let mut request = self
            .client
            .post(self.base_url.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        request = apply_auth(request, self.auth.as_ref());
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        self.remember_session(&response);

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::Rejected { status: status.as_u16() }.into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        let body = response.text().await.map_err(map_reqwest_error)?;
        if status == StatusCode::ACCEPTED || body.trim().is_empty() {
            return Ok(Vec::new());
        }

        if is_event_stream {
            return Ok(sse::parse_event_stream_body(&body)
                .into_iter()
                .filter_map(|frame| frame.data)
                .filter_map(|data| serde_json::from_str(&data).ok())
                .collect());
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Array(batch)) => Ok(batch),
            Ok(value) => Ok(vec![value]),
            Err(error) => Err(TransportError::protocol(format!("reply is not JSON: {error}"))),
        }
    }

    /// POST `message` and hand the replies to the session. `request_id` is
    /// set for requests, which get an error response when the POST fails
    /// without ending the session.
    async fn deliver(
        &self,
        message: &Value,
        request_id: Option<Value>,
        incoming: &mpsc::UnboundedSender<ServerJsonRpcMessage>,
    ) {
        match self.post(message).await {
            Ok(replies) => {
                for reply in replies {
                    self.watch_event_stream(&reply, incoming);
                    match parse_server_message(reply) {
                        Some(reply) => {
                            let _ = incoming.send(reply);
                        }
                        None => debug!(plugin = %self.plugin_name, "ignoring unreadable reply message"),
                    }
                }
            }
            Err(error) if is_fatal(&error) => self.fail(error),
            Err(error) => {
                warn!(plugin = %self.plugin_name, error = %error, "plugin request failed");
                let reply = request_id.and_then(|id| {
                    parse_server_message(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": INTERNAL_ERROR, "message": error.to_string()}
                    }))
                });
                if let Some(reply) = reply {
                    let _ = incoming.send(reply);
                }
            }
        }
    }

    /// Start the SSE listener the first time a result carries `eventStream`.
    fn watch_event_stream(&self, reply: &Value, incoming: &mpsc::UnboundedSender<ServerJsonRpcMessage>) {
        let Some(path) = reply.pointer("/result/eventStream").and_then(Value::as_str) else {
            return;
        };
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let url = match self.base_url.join(path) {
            Ok(url) => url,
            Err(error) => {
                warn!(plugin = %self.plugin_name, path, error = %error, "ignoring invalid eventStream path");
                return;
            }
        };
        sse::spawn_sse_listener(sse::SseListener {
            plugin_name: self.plugin_name.clone(),
            client: self.client.clone(),
            url,
            auth: self.auth.clone(),
            session_id: self.session_id(),
            incoming: incoming.clone(),
            cancel: self.cancel.child_token(),
        });
        debug!(plugin = %self.plugin_name, path, "listening for pushed events");
    }

    /// Record a fatal error and end the session.
    fn fail(&self, error: TransportError) {
        if self.fault.set(error.clone()) {
            warn!(plugin = %self.plugin_name, error = %error, "remote session lost");
            let _ = self.events.send(TransportEvent::Closed {
                reason: error.to_string(),
            });
        }
        self.cancel.cancel();
    }
}

fn is_fatal(error: &TransportError) -> bool {
    error.is_disconnect() || matches!(error, TransportError::Auth(_) | TransportError::Timeout { .. })
}

/// Forward rmcp's messages until the session ends. Messages go out in
/// order until the first request has been answered; after that requests
/// run concurrently so a slow tool call does not hold up probes.
fn spawn_post_pump(link: Arc<RemoteLink>, wire: Wire) {
    tokio::spawn(async move {
        let Wire { mut outgoing, incoming } = wire;
        let mut handshaken = false;
        loop {
            let message = tokio::select! {
                _ = link.cancel.cancelled() => break,
                message = outgoing.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let message = match serde_json::to_value(&message) {
                Ok(message) => message,
                Err(error) => {
                    warn!(plugin = %link.plugin_name, error = %error, "could not encode message for plugin");
                    continue;
                }
            };
            let request_id = message.get("method").and(message.get("id")).cloned();

            match request_id {
                Some(id) if handshaken => {
                    let link = Arc::clone(&link);
                    let incoming = incoming.clone();
                    tokio::spawn(async move { link.deliver(&message, Some(id), &incoming).await });
                }
                Some(id) => {
                    link.deliver(&message, Some(id), &incoming).await;
                    handshaken = true;
                }
                None => link.deliver(&message, None, &incoming).await,
            }
        }
        debug!(plugin = %link.plugin_name, "remote message pump stopped");
    });
}

/// A session with a remote plugin.
pub struct RemoteConnection {
    link: Arc<RemoteLink>,
    session: McpSession,
    closed: AtomicBool,
    /// Stops the pump and SSE listener when the connection goes away.
    _guard: DropGuard,
}

impl RemoteConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::closed("connection closed by host"));
        }
        match self.link.fault.get() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Connection for RemoteConnection {
    async fn initialize(&self) -> Result<ServerInfo, TransportError> {
        Ok(self.session.server_info())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        self.ensure_open()?;
        self.session.list_tools().await
    }

    async fn call_tool(&self, tool: &str, arguments: JsonObject) -> Result<ToolOutput, CallError> {
        self.ensure_open()?;
        self.session.call_tool(tool, arguments).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.session.ping().await
    }

    fn subscribe_events(&self) -> EventStream {
        let closed = self.link.fault.get().map(|fault| fault.to_string());
        broadcast_events(self.link.events.subscribe(), closed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.session.shutdown().await;
        self.link.cancel.cancel();
        debug!(plugin = %self.link.plugin_name, "remote connection closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.link.fault.get().is_some()
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::timeout("HTTP request", CONNECT_TIMEOUT)
    } else {
        TransportError::connect(error.to_string())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexSet;
    use tendril_types::{EnvSource, EnvVar};

    fn remote_config(headers: IndexSet<EnvVar>) -> Arc<PluginConfig> {
        Arc::new(PluginConfig {
            name: "remote".into(),
            transport: TransportConfig::Remote {
                base_url: Url::parse("http://127.0.0.1:9/rpc").unwrap(),
                headers,
                auth: None,
            },
            disabled: false,
            tags: vec![],
        })
    }

    #[test]
    fn rejects_invalid_header_values() {
        let mut headers = IndexSet::new();
        headers.insert(EnvVar::new("X-Trace", "line\nbreak", EnvSource::Raw));
        assert!(matches!(RemoteTransport::new(remote_config(headers)), Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_connect_error() {
        let transport = RemoteTransport::new(remote_config(IndexSet::new())).unwrap();
        assert!(matches!(transport.connect().await, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn lost_endpoints_and_rejected_credentials_end_the_session() {
        assert!(is_fatal(&TransportError::connect("refused")));
        assert!(is_fatal(&AuthError::Rejected { status: 401 }.into()));
        assert!(is_fatal(&TransportError::timeout("HTTP request", CONNECT_TIMEOUT)));
        assert!(!is_fatal(&TransportError::Http {
            status: 500,
            body: "oops".into()
        }));
        assert!(!is_fatal(&TransportError::protocol("reply is not JSON")));
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo", 2), "h…");
    }
}
