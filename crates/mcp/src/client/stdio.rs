//! Local transport: a child process speaking newline-delimited JSON-RPC.
//!
//! The child's stdout is split: JSON-RPC lines feed the rmcp session, other
//! lines land in the plugin's log next to its stderr.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use indexmap::IndexSet;
use rmcp::model::{ClientJsonRpcMessage, JsonObject, ServerInfo, ServerJsonRpcMessage};
use serde_json::Value;
use tendril_types::EnvVar;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tracing::{debug, warn};

use super::process::ProcessGuard;
use super::session::{Fault, McpSession, channel_transport, parse_server_message};
use super::transport::{
    CallError, Connection, EVENT_CHANNEL_CAPACITY, EventStream, Transport, TransportEvent, broadcast_events,
};
use crate::config::{PluginConfig, TransportConfig};
use crate::logging::LogManager;
use crate::types::{LogEntry, LogLevel, LogSource, ToolDescriptor, ToolOutput, TransportError, TransportKind};

type SharedStdin = Arc<AsyncMutex<Option<ChildStdin>>>;
type Handshake = Result<Arc<McpSession>, TransportError>;

/// Build a configured `tokio::process::Command` for a local plugin.
pub(crate) fn build_stdio_command(command: &str, args: &[String], env: &IndexSet<EnvVar>, cwd: Option<&Path>) -> Command {
    let mut cmd = Command::new(command);
    cmd.args(args);
    for var in env {
        cmd.env(&var.key, var.effective_value());
    }
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawn a background task that forwards stderr lines to the log manager.
pub(crate) fn spawn_stderr_logger(plugin_name: String, log_manager: Arc<LogManager>, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let entry = LogEntry::new(LogLevel::Info, line, LogSource::Stderr, plugin_name.clone());
            log_manager.add_log(entry).await;
        }
    });
}

/// Spawns the plugin's command on every `connect`.
pub struct LocalTransport {
    config: Arc<PluginConfig>,
    logs: Arc<LogManager>,
}

impl LocalTransport {
    pub fn new(config: Arc<PluginConfig>, logs: Arc<LogManager>) -> Self {
        Self { config, logs }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    /// Spawns the child and starts the handshake without waiting for it. A
    /// plugin that never answers `initialize` still connects; its first
    /// operation or probe fails instead.
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let TransportConfig::Local { command, args, env, cwd } = &self.config.transport else {
            return Err(TransportError::connect("plugin is not configured for a local transport"));
        };
        let name = self.config.name.clone();

        let mut child = build_stdio_command(command, args, env, cwd.as_deref())
            .spawn()
            .map_err(|error| TransportError::Spawn {
                command: command.clone(),
                reason: error.to_string(),
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(TransportError::connect("child process pipes were not attached"));
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let stdin: SharedStdin = Arc::new(AsyncMutex::new(Some(stdin)));
        let (transport, wire) = channel_transport();

        spawn_stderr_logger(name.clone(), Arc::clone(&self.logs), stderr);
        spawn_stdout_reader(StdoutReader {
            plugin_name: name.clone(),
            stdout,
            incoming: wire.incoming,
            closed: Arc::clone(&closed),
            logs: Arc::clone(&self.logs),
        });
        spawn_stdin_writer(name.clone(), Arc::clone(&stdin), wire.outgoing);
        let process = ProcessGuard::spawn(name.clone(), child, events.clone(), Arc::clone(&closed));

        let (ready, handshake) = watch::channel(None);
        let plugin = name.clone();
        let session_events = events.clone();
        tokio::spawn(async move {
            let outcome = McpSession::establish(&plugin, transport, session_events, Fault::default())
                .await
                .map(Arc::new);
            if let Err(error) = &outcome {
                debug!(plugin = %plugin, error = %error, "local handshake failed");
            }
            let _ = ready.send(Some(outcome));
        });

        debug!(plugin = %name, pid = ?process.pid(), "spawned local plugin");
        self.logs
            .add_log(LogEntry::system(format!("spawned '{}'", self.config.target()), name.clone()))
            .await;

        Ok(Arc::new(LocalConnection {
            plugin_name: name,
            stdin,
            events,
            closed,
            handshake,
            process,
        }))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Local
    }
}

/// Connection to a running child process.
pub struct LocalConnection {
    plugin_name: String,
    stdin: SharedStdin,
    events: broadcast::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    handshake: watch::Receiver<Option<Handshake>>,
    process: ProcessGuard,
}

impl LocalConnection {
    fn closed_error(&self) -> TransportError {
        TransportError::closed(self.process.exit_reason().unwrap_or_else(|| "stdout closed".to_string()))
    }

    /// A lost session is reported with the process exit reason, once known.
    fn explain(&self, error: TransportError) -> TransportError {
        match (&error, self.process.exit_reason()) {
            (TransportError::Closed { .. }, Some(reason)) => TransportError::closed(reason),
            _ => error,
        }
    }

    async fn session(&self) -> Result<Arc<McpSession>, TransportError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut handshake = self.handshake.clone();
        let outcome = match handshake.wait_for(Option::is_some).await {
            Ok(ready) => Option::clone(&ready),
            Err(_) => None,
        };
        match outcome {
            Some(outcome) => outcome.map_err(|error| self.explain(error)),
            None => Err(self.closed_error()),
        }
    }

    fn ready_session(&self) -> Option<Arc<McpSession>> {
        match &*self.handshake.borrow() {
            Some(Ok(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn initialize(&self) -> Result<ServerInfo, TransportError> {
        Ok(self.session().await?.server_info())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let session = self.session().await?;
        session.list_tools().await.map_err(|error| self.explain(error))
    }

    async fn call_tool(&self, tool: &str, arguments: JsonObject) -> Result<ToolOutput, CallError> {
        let session = self.session().await?;
        session.call_tool(tool, arguments).await.map_err(|error| match error {
            CallError::Transport(error) => CallError::Transport(self.explain(error)),
            rpc => rpc,
        })
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let session = self.session().await?;
        session.ping().await.map_err(|error| self.explain(error))
    }

    fn subscribe_events(&self) -> EventStream {
        let receiver = self.events.subscribe();
        let closed = self.is_closed().then(|| self.process.exit_reason().unwrap_or_else(|| "stdout closed".into()));
        broadcast_events(receiver, closed)
    }

    async fn close(&self) {
        if let Some(session) = self.ready_session() {
            session.shutdown().await;
        }
        // Dropping stdin gives well-behaved plugins an EOF before the kill.
        self.stdin.lock().await.take();
        self.process.shutdown().await;
        self.closed.store(true, Ordering::SeqCst);
        debug!(plugin = %self.plugin_name, "local connection closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn write_line(stdin: &SharedStdin, line: &str) -> Result<(), TransportError> {
    let mut guard = stdin.lock().await;
    let writer = guard.as_mut().ok_or_else(|| TransportError::closed("stdin closed"))?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|error| TransportError::closed(format!("write to plugin failed: {error}")))?;
    writer
        .flush()
        .await
        .map_err(|error| TransportError::closed(format!("flush to plugin failed: {error}")))
}

/// One JSON-RPC message per line, until rmcp or the pipe gives up.
fn spawn_stdin_writer(plugin_name: String, stdin: SharedStdin, mut outgoing: mpsc::Receiver<ClientJsonRpcMessage>) {
    tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(error) => {
                    warn!(plugin = %plugin_name, error = %error, "could not encode message for plugin");
                    continue;
                }
            };
            line.push('\n');
            if let Err(error) = write_line(&stdin, &line).await {
                debug!(plugin = %plugin_name, error = %error, "plugin stdin closed");
                break;
            }
        }
    });
}

struct StdoutReader {
    plugin_name: String,
    stdout: ChildStdout,
    incoming: mpsc::UnboundedSender<ServerJsonRpcMessage>,
    closed: Arc<AtomicBool>,
    logs: Arc<LogManager>,
}

/// JSON-RPC lines go to rmcp; anything else is plugin output and is logged.
fn spawn_stdout_reader(reader: StdoutReader) {
    tokio::spawn(async move {
        let StdoutReader {
            plugin_name,
            stdout,
            incoming,
            closed,
            logs,
        } = reader;

        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(error) => {
                    warn!(plugin = %plugin_name, error = %error, "failed to read plugin stdout");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let message = serde_json::from_str::<Value>(line.trim())
                .ok()
                .and_then(parse_server_message);
            match message {
                Some(message) => {
                    if incoming.send(message).is_err() {
                        debug!(plugin = %plugin_name, "session gone; dropping plugin message");
                    }
                }
                None => {
                    logs.add_log(LogEntry::new(LogLevel::Info, line, LogSource::Stdout, plugin_name.clone()))
                        .await;
                }
            }
        }

        closed.store(true, Ordering::SeqCst);
        debug!(plugin = %plugin_name, "plugin stdout reader finished");
    });
}
