//! ManagedClient: one connection to a plugin plus its tool cache and counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use rmcp::model::{JsonObject, ServerInfo};
use serde_json::Value;
use tendril_util::redact_sensitive;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::debug;

use super::health::HealthMonitor;
use super::transport::{CallError, Connection, EventStream, ProbeOutcome};
use crate::types::{ClientMetrics, HealthRecord, InvokeError, ToolDescriptor, ToolError, ToolOutput, TransportError};

const NO_LATENCY: u64 = u64::MAX;

/// Wraps one live [`Connection`].
pub struct ManagedClient {
    name: String,
    connection: Arc<dyn Connection>,
    initialized: OnceCell<ServerInfo>,
    tools: RwLock<Option<Arc<Vec<ToolDescriptor>>>>,
    invocations: AtomicU64,
    errors: AtomicU64,
    last_latency_ms: AtomicU64,
    healthy: AtomicBool,
    health: HealthMonitor,
    invoke_timeout: Duration,
}

impl ManagedClient {
    pub fn new(
        name: impl Into<String>,
        connection: Arc<dyn Connection>,
        health: HealthMonitor,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            initialized: OnceCell::new(),
            tools: RwLock::new(None),
            invocations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(NO_LATENCY),
            healthy: AtomicBool::new(true),
            health,
            invoke_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the `initialize` handshake and keep its result.
    pub async fn initialize(&self) -> Result<&ServerInfo, TransportError> {
        self.initialized
            .get_or_try_init(|| async {
                let result = self.checked(self.connection.initialize().await).await?;
                debug!(plugin = %self.name, server = %result.server_info.name, "plugin session ready");
                Ok(result)
            })
            .await
    }

    /// Tools advertised by the plugin, listed once and cached.
    pub async fn list_capabilities(&self) -> Result<Arc<Vec<ToolDescriptor>>, InvokeError> {
        if let Some(tools) = self.cached_tools() {
            return Ok(tools);
        }
        self.refresh_tools().await
    }

    /// List every tool again and replace the cache.
    pub async fn refresh_tools(&self) -> Result<Arc<Vec<ToolDescriptor>>, InvokeError> {
        self.initialize().await?;
        let tools = Arc::new(self.checked(self.connection.list_tools().await).await?);
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&tools));
        debug!(plugin = %self.name, count = tools.len(), "tool list refreshed");
        Ok(tools)
    }

    pub fn cached_tools(&self) -> Option<Arc<Vec<ToolDescriptor>>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Drop the cached tool list, e.g. after `notifications/tools/list_changed`.
    pub fn invalidate_tools(&self) {
        self.tools.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Call `tool` with `arguments` under the invoke timeout.
    pub async fn invoke(&self, tool: &str, arguments: Value) -> Result<ToolOutput, InvokeError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let result = match timeout(self.invoke_timeout, self.call_tool(tool, arguments)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timeout(format!("tools/call {tool}"), self.invoke_timeout).into()),
        };

        self.last_latency_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput, InvokeError> {
        let arguments = match arguments {
            Value::Null => JsonObject::new(),
            Value::Object(arguments) => arguments,
            _ => return Err(ToolError::InvalidArguments { tool: tool.to_string() }.into()),
        };
        self.initialize().await?;

        match self.connection.call_tool(tool, arguments).await {
            Ok(output) if output.is_error => {
                let text = output.text();
                let message = if text.is_empty() { "tool reported an error".to_string() } else { text };
                Err(ToolError::Failed {
                    tool: tool.to_string(),
                    message,
                }
                .into())
            }
            Ok(output) => Ok(output),
            Err(CallError::Rpc { code, message }) => {
                if self.lacks_tool(tool).await {
                    Err(ToolError::NotFound { tool: tool.to_string() }.into())
                } else {
                    Err(ToolError::Rpc {
                        tool: tool.to_string(),
                        code,
                        message,
                    }
                    .into())
                }
            }
            Err(CallError::Transport(TransportError::Protocol { reason })) => Err(ToolError::InvalidResponse {
                tool: tool.to_string(),
                reason,
            }
            .into()),
            Err(CallError::Transport(error)) => self.checked(Err(error)).await.map_err(InvokeError::from),
        }
    }

    /// True only when a successful listing does not contain `tool`.
    async fn lacks_tool(&self, tool: &str) -> bool {
        match self.list_capabilities().await {
            Ok(tools) => !tools.iter().any(|descriptor| descriptor.name == tool),
            Err(_) => false,
        }
    }

    /// A lost peer marks the client unhealthy and is recorded at once.
    async fn checked<T>(&self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(error) = &result
            && error.is_disconnect()
        {
            self.healthy.store(false, Ordering::SeqCst);
            self.health
                .record(HealthRecord::unreachable(&self.name, redact_sensitive(&error.to_string())))
                .await;
        }
        result
    }

    /// One ping round trip, after the handshake when it is still running.
    pub async fn health_check(&self) -> ProbeOutcome {
        let started = Instant::now();
        if let Err(error) = self.initialize().await {
            self.healthy.store(false, Ordering::SeqCst);
            return ProbeOutcome::failure(started.elapsed(), error.to_string());
        }
        let outcome = self.connection.health_check().await;
        self.healthy.store(outcome.ok, Ordering::SeqCst);
        outcome
    }

    pub async fn disconnect(&self) {
        self.connection.close().await;
        self.healthy.store(false, Ordering::SeqCst);
    }

    pub fn subscribe_events(&self) -> EventStream {
        self.connection.subscribe_events()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.connection.is_closed()
    }

    pub fn handshake(&self) -> Option<&ServerInfo> {
        self.initialized.get()
    }

    pub fn metrics(&self) -> ClientMetrics {
        let latency = self.last_latency_ms.load(Ordering::Relaxed);
        ClientMetrics {
            invocations: self.invocations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_latency_ms: (latency != NO_LATENCY).then_some(latency),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::transport::no_events;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted in-memory connection.
    #[derive(Default)]
    pub(crate) struct ScriptedConnection {
        pub(crate) tools: Vec<&'static str>,
        pub(crate) disconnected: AtomicBool,
        pub(crate) calls: Mutex<Vec<&'static str>>,
        /// `close` never returns.
        pub(crate) stuck_on_close: bool,
    }

    impl ScriptedConnection {
        fn enter(&self, operation: &'static str) -> Result<(), TransportError> {
            self.calls.lock().unwrap().push(operation);
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(TransportError::closed("peer gone"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn initialize(&self) -> Result<ServerInfo, TransportError> {
            self.enter("initialize")?;
            Ok(serde_json::from_value(json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "serverInfo": {"name": "scripted", "version": "1.0.0"}
            }))
            .unwrap())
        }

        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
            self.enter("tools/list")?;
            Ok(self.tools.iter().map(|name| ToolDescriptor::named(*name)).collect())
        }

        async fn call_tool(&self, tool: &str, arguments: JsonObject) -> Result<ToolOutput, CallError> {
            self.enter("tools/call")?;
            match tool {
                "echo" => Ok(ToolOutput {
                    content: vec![json!({"type": "text", "text": arguments.get("message").and_then(Value::as_str).unwrap_or("")})],
                    structured_content: None,
                    is_error: false,
                }),
                "fails" => Ok(ToolOutput {
                    content: vec![json!({"type": "text", "text": "quota exceeded"})],
                    structured_content: None,
                    is_error: true,
                }),
                _ => Err(CallError::Rpc {
                    code: -32602,
                    message: "unknown tool".into(),
                }),
            }
        }

        async fn ping(&self) -> Result<(), TransportError> {
            self.enter("ping")
        }

        fn subscribe_events(&self) -> EventStream {
            no_events()
        }

        async fn close(&self) {
            if self.stuck_on_close {
                std::future::pending::<()>().await;
            }
            self.disconnected.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.disconnected.load(Ordering::SeqCst)
        }
    }

    fn client(connection: Arc<ScriptedConnection>) -> ManagedClient {
        ManagedClient::new("p", connection, HealthMonitor::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn lists_tools_once_and_caches() {
        let connection = Arc::new(ScriptedConnection {
            tools: vec!["echo", "fails"],
            ..Default::default()
        });
        let client = client(Arc::clone(&connection));

        let tools = client.list_capabilities().await.unwrap();
        let names: Vec<_> = tools.iter().map(|tool| tool.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "fails"]);

        let _ = client.list_capabilities().await.unwrap();
        assert_eq!(*connection.calls.lock().unwrap(), vec!["initialize", "tools/list"]);
        assert_eq!(client.handshake().unwrap().server_info.name, "scripted");
    }

    #[tokio::test]
    async fn invoke_classifies_outcomes() {
        let connection = Arc::new(ScriptedConnection {
            tools: vec!["echo", "fails"],
            ..Default::default()
        });
        let client = client(connection);

        let output = client.invoke("echo", json!({"message": "hi"})).await.unwrap();
        assert_eq!(output.text(), "hi");

        let failed = client.invoke("fails", Value::Null).await.unwrap_err();
        assert!(matches!(failed, InvokeError::Tool(ToolError::Failed { ref message, .. }) if message == "quota exceeded"));

        let missing = client.invoke("missing-tool", json!({})).await.unwrap_err();
        assert!(matches!(missing, InvokeError::Tool(ToolError::NotFound { .. })));

        let scalar = client.invoke("echo", json!("hi")).await.unwrap_err();
        assert!(matches!(scalar, InvokeError::Tool(ToolError::InvalidArguments { .. })));

        let metrics = client.metrics();
        assert_eq!(metrics.invocations, 4);
        assert_eq!(metrics.errors, 3);
        assert!(metrics.last_latency_ms.is_some());
        assert!(client.is_healthy());
    }

    #[tokio::test]
    async fn rpc_error_for_listed_tool_is_not_not_found() {
        let connection = Arc::new(ScriptedConnection {
            tools: vec!["picky"],
            ..Default::default()
        });
        let client = client(connection);
        let error = client.invoke("picky", json!({})).await.unwrap_err();
        assert!(matches!(error, InvokeError::Tool(ToolError::Rpc { code: -32602, .. })));
    }

    #[tokio::test]
    async fn disconnect_during_invoke_marks_unhealthy_and_records() {
        let connection = Arc::new(ScriptedConnection::default());
        let monitor = HealthMonitor::new();
        let client = ManagedClient::new("p", connection.clone(), monitor.clone(), Duration::from_secs(5));
        client.initialize().await.unwrap();

        connection.disconnected.store(true, Ordering::SeqCst);
        let error = client.invoke("echo", json!({})).await.unwrap_err();
        assert!(matches!(error, InvokeError::Transport(TransportError::Closed { .. })));
        assert!(!client.is_healthy());

        let record = monitor.latest("p").await.unwrap();
        assert!(!record.reachable);
    }

    #[tokio::test]
    async fn health_check_and_invalidate() {
        let connection = Arc::new(ScriptedConnection {
            tools: vec!["echo"],
            ..Default::default()
        });
        let client = client(connection);
        assert!(client.health_check().await.ok);

        client.list_capabilities().await.unwrap();
        assert!(client.cached_tools().is_some());
        client.invalidate_tools();
        assert!(client.cached_tools().is_none());

        client.disconnect().await;
        assert!(!client.is_healthy());
        assert!(!client.health_check().await.ok);
    }
}
