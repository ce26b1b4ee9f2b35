//! ClientManager: per-plugin slots, admission, supervision and retries.
//!
//! Each configured plugin owns a [`PluginSlot`]. All lifecycle mutation of a
//! plugin happens under the slot's async mutex. Operations are admitted
//! before they wait for the lock: admission bumps a sequence number and
//! cancels the token of the previous operation, so a `stop` aborts an
//! in-flight `start` and an operation that was overtaken while waiting
//! returns the current status without acting. A `start` that arrives while
//! another start or restart is in flight joins it instead and reports its
//! outcome.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use indexmap::IndexMap;
use serde_json::Value;
use tendril_util::RedactionRules;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::health::{HealthMonitor, ProbeReport, ProbeSink, ProbeSource, ProbeTask, spawn_probe_task};
use super::managed::ManagedClient;
use super::transport::{Connection, TransportEvent, TransportFactory};
use crate::config::{EngineSettings, PluginConfig};
use crate::logging::{AuditAction, AuditEvent, AuditOutcome, LogManager};
use crate::plugin::{Backoff, EngineError, LifecycleCoordinator, PluginRuntimeState, Transition};
use crate::provider::ProviderBridge;
use crate::types::{HealthRecord, PluginStatus, ToolOutput};

/// Shared collaborators of the manager.
pub struct ManagerDeps {
    pub factory: Arc<dyn TransportFactory>,
    pub logs: Arc<LogManager>,
    pub health: HealthMonitor,
    pub lifecycle: Arc<LifecycleCoordinator>,
    pub providers: Arc<ProviderBridge>,
    pub rules: Arc<RedactionRules>,
}

/// Point-in-time view of one slot.
#[derive(Clone)]
pub struct SlotSnapshot {
    pub config: Arc<PluginConfig>,
    pub runtime: PluginRuntimeState,
    pub client: Option<Arc<ManagedClient>>,
}

/// Supervises every configured plugin.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    self_ref: Weak<ManagerInner>,
    settings: RwLock<Arc<EngineSettings>>,
    slots: RwLock<IndexMap<String, Arc<PluginSlot>>>,
    next_epoch: AtomicU64,
    factory: Arc<dyn TransportFactory>,
    logs: Arc<LogManager>,
    health: HealthMonitor,
    lifecycle: Arc<LifecycleCoordinator>,
    providers: Arc<ProviderBridge>,
    rules: Arc<RedactionRules>,
}

struct PluginSlot {
    config: Arc<PluginConfig>,
    state: tokio::sync::Mutex<SlotState>,
    admission: Mutex<Admission>,
    /// Set once a reload has replaced this slot. A retired slot never connects.
    retired: AtomicBool,
}

struct SlotState {
    runtime: PluginRuntimeState,
    client: Option<Arc<ManagedClient>>,
    /// Cancels the probe and event tasks of the current connection.
    tasks: CancellationToken,
    backoff: Backoff,
    probe_failures: u32,
}

struct Admission {
    seq: u64,
    token: CancellationToken,
    /// A start or restart holds the current admission.
    starting: bool,
}

#[derive(Clone)]
struct Ticket {
    seq: u64,
    token: CancellationToken,
    /// Shares an in-flight start instead of owning the admission.
    joined: bool,
}

/// Clears the `starting` mark of its admission, also when the start is
/// dropped half way.
struct StartingMark<'a> {
    slot: &'a PluginSlot,
    seq: u64,
}

impl StartingMark<'_> {
    fn clear(self) {}
}

impl Drop for StartingMark<'_> {
    fn drop(&mut self) {
        let mut admission = self.slot.admission.lock().unwrap_or_else(PoisonError::into_inner);
        if admission.seq == self.seq {
            admission.starting = false;
        }
    }
}

enum ConnectOutcome {
    Connected(Arc<dyn Connection>),
    Failed(EngineError),
    Cancelled,
}

impl PluginSlot {
    fn new(config: Arc<PluginConfig>, settings: &EngineSettings) -> Self {
        Self {
            config,
            state: tokio::sync::Mutex::new(SlotState {
                runtime: PluginRuntimeState::default(),
                client: None,
                tasks: CancellationToken::new(),
                backoff: Backoff::new(settings.backoff),
                probe_failures: 0,
            }),
            admission: Mutex::new(Admission {
                seq: 0,
                token: CancellationToken::new(),
                starting: false,
            }),
            retired: AtomicBool::new(false),
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    /// Admit a new operation, superseding whatever was admitted before.
    fn admit(&self) -> Ticket {
        let mut admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        Self::supersede(&mut admission, false)
    }

    /// Admit a start or restart the caller will run itself.
    fn admit_starting(&self) -> (Ticket, StartingMark<'_>) {
        let mut admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = Self::supersede(&mut admission, true);
        let mark = StartingMark {
            slot: self,
            seq: ticket.seq,
        };
        (ticket, mark)
    }

    /// Admit a start, joining the start or restart in flight if there is one.
    fn admit_start(&self) -> (Ticket, Option<StartingMark<'_>>) {
        {
            let admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
            if admission.starting {
                let ticket = Ticket {
                    seq: admission.seq,
                    token: admission.token.clone(),
                    joined: true,
                };
                return (ticket, None);
            }
        }
        let (ticket, mark) = self.admit_starting();
        (ticket, Some(mark))
    }

    fn supersede(admission: &mut Admission, starting: bool) -> Ticket {
        admission.token.cancel();
        admission.seq += 1;
        admission.token = CancellationToken::new();
        admission.starting = starting;
        Ticket {
            seq: admission.seq,
            token: admission.token.clone(),
            joined: false,
        }
    }

    /// The most recent admission, without superseding it.
    fn current(&self) -> Ticket {
        let admission = self.admission.lock().unwrap_or_else(PoisonError::into_inner);
        Ticket {
            seq: admission.seq,
            token: admission.token.clone(),
            joined: false,
        }
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn is_current(&self, ticket: &Ticket) -> bool {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner).seq == ticket.seq
    }
}

impl ClientManager {
    pub fn new(plugins: impl IntoIterator<Item = Arc<PluginConfig>>, settings: EngineSettings, deps: ManagerDeps) -> Self {
        let slots = plugins
            .into_iter()
            .map(|config| (config.name.clone(), Arc::new(PluginSlot::new(config, &settings))))
            .collect();
        let inner = Arc::new_cyclic(|self_ref| ManagerInner {
            self_ref: self_ref.clone(),
            settings: RwLock::new(Arc::new(settings)),
            slots: RwLock::new(slots),
            next_epoch: AtomicU64::new(0),
            factory: deps.factory,
            logs: deps.logs,
            health: deps.health,
            lifecycle: deps.lifecycle,
            providers: deps.providers,
            rules: deps.rules,
        });
        Self { inner }
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.inner.settings()
    }

    /// Configured plugin names, in configuration order.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn config(&self, name: &str) -> Option<Arc<PluginConfig>> {
        self.inner.slot(name).ok().map(|slot| Arc::clone(&slot.config))
    }

    /// Connect `name`. A connected plugin is left alone, and a start that
    /// finds another one in flight waits for it and reports its outcome.
    pub async fn start(&self, name: &str) -> Result<PluginStatus, EngineError> {
        let slot = self.inner.slot(name)?;
        if slot.config.disabled {
            return Err(EngineError::Disabled { name: name.to_string() });
        }
        let (ticket, mark) = slot.admit_start();
        let deadline = Instant::now() + self.inner.settings().operation_timeout;

        let mut state = slot.state.lock().await;
        if !slot.is_current(&ticket) {
            debug!(plugin = %name, "start superseded by a later operation");
            return Ok(state.runtime.status);
        }
        if ticket.joined {
            // The joined start ran to completion before the lock came free.
            let status = state.runtime.status;
            debug!(plugin = %name, %status, "start joined an in-flight start");
            return if status.is_connected() {
                Ok(status)
            } else {
                Err(EngineError::NotRunning {
                    name: name.to_string(),
                    status,
                })
            };
        }
        let result = self
            .inner
            .start_locked(&slot, &mut state, &ticket, deadline, true, AuditAction::Start)
            .await;
        if let Some(mark) = mark {
            mark.clear();
        }
        result
    }

    /// Disconnect `name`. A stopped plugin is left alone.
    pub async fn stop(&self, name: &str) -> Result<PluginStatus, EngineError> {
        let slot = self.inner.slot(name)?;
        Ok(self.inner.stop_slot(&slot, AuditAction::Stop).await)
    }

    /// Stop (when connected) and start again under one deadline.
    pub async fn restart(&self, name: &str) -> Result<PluginStatus, EngineError> {
        let slot = self.inner.slot(name)?;
        if slot.config.disabled {
            return Err(EngineError::Disabled { name: name.to_string() });
        }
        let (ticket, mark) = slot.admit_starting();
        let deadline = Instant::now() + self.inner.settings().operation_timeout;

        let mut state = slot.state.lock().await;
        if !slot.is_current(&ticket) {
            debug!(plugin = %name, "restart superseded by a later operation");
            return Ok(state.runtime.status);
        }
        if state.runtime.status.is_connected() {
            self.inner
                .stop_locked(&slot, &mut state, Uuid::new_v4(), AuditAction::Restart, deadline)
                .await;
        }
        let result = if Instant::now() >= deadline {
            Err(EngineError::Timeout {
                name: name.to_string(),
                operation: "restart".to_string(),
                timeout_ms: self.inner.settings().operation_timeout.as_millis() as u64,
            })
        } else {
            self.inner
                .start_locked(&slot, &mut state, &ticket, deadline, true, AuditAction::Restart)
                .await
        };
        mark.clear();
        result
    }

    /// Start every plugin that is not disabled in configuration. Failures
    /// are logged and returned.
    pub async fn start_all(&self) -> Vec<(String, EngineError)> {
        let mut failures = Vec::new();
        for name in self.names() {
            let disabled = self.config(&name).is_some_and(|config| config.disabled);
            if disabled {
                continue;
            }
            if let Err(error) = self.start(&name).await {
                warn!(plugin = %name, error = %error.user_message(), "autostart failed");
                failures.push((name, error));
            }
        }
        failures
    }

    /// Stop every plugin.
    pub async fn shutdown(&self) {
        for name in self.names() {
            if let Err(error) = self.stop(&name).await {
                warn!(plugin = %name, error = %error.user_message(), "stop during shutdown failed");
            }
        }
    }

    /// Swap in a new plugin generation, then stop every slot of the old one.
    ///
    /// Old slots are retired before they are stopped, so an operation that
    /// looked one up before the swap cannot bring it back.
    pub async fn replace_plugins(&self, plugins: impl IntoIterator<Item = Arc<PluginConfig>>, settings: EngineSettings) {
        let slots: IndexMap<String, Arc<PluginSlot>> = plugins
            .into_iter()
            .map(|config| (config.name.clone(), Arc::new(PluginSlot::new(config, &settings))))
            .collect();
        info!(count = slots.len(), "plugin configuration replaced");
        let retired = std::mem::replace(&mut *self.inner.slots.write().unwrap_or_else(PoisonError::into_inner), slots);
        *self.inner.settings.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(settings);

        for slot in retired.values() {
            slot.retire();
            self.inner.stop_slot(slot, AuditAction::Stop).await;
        }
    }

    pub async fn snapshot(&self, name: &str) -> Result<SlotSnapshot, EngineError> {
        let slot = self.inner.slot(name)?;
        let state = slot.state.lock().await;
        Ok(SlotSnapshot {
            config: Arc::clone(&slot.config),
            runtime: state.runtime.clone(),
            client: state.client.clone(),
        })
    }

    pub async fn status(&self, name: &str) -> Result<PluginStatus, EngineError> {
        let slot = self.inner.slot(name)?;
        let status = slot.state.lock().await.runtime.status;
        Ok(status)
    }

    /// The live client of a connected plugin.
    pub async fn client(&self, name: &str) -> Result<Arc<ManagedClient>, EngineError> {
        let slot = self.inner.slot(name)?;
        let state = slot.state.lock().await;
        match &state.client {
            Some(client) if state.runtime.status.is_connected() => Ok(Arc::clone(client)),
            _ => Err(EngineError::NotRunning {
                name: name.to_string(),
                status: state.runtime.status,
            }),
        }
    }

    /// Invoke a tool without holding the slot while the plugin works.
    pub async fn invoke(&self, name: &str, tool: &str, arguments: Value) -> Result<ToolOutput, EngineError> {
        let client = self.client(name).await?;
        let result = client.invoke(tool, arguments).await;

        let outcome = if result.is_ok() {
            AuditOutcome::Success
        } else {
            AuditOutcome::Failure
        };
        self.inner
            .lifecycle
            .record(AuditEvent::tool_invoke(name, tool, outcome));
        if let Err(error) = &result {
            debug!(plugin = %name, tool, error = %self.inner.rules.redact(&error.to_string()), "tool invocation failed");
        }
        result.map_err(EngineError::from)
    }
}

impl ManagerInner {
    fn settings(&self) -> Arc<EngineSettings> {
        Arc::clone(&self.settings.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn slot(&self, name: &str) -> Result<Arc<PluginSlot>, EngineError> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound { name: name.to_string() })
    }

    /// Admit a stop of `slot` and run it.
    async fn stop_slot(&self, slot: &Arc<PluginSlot>, action: AuditAction) -> PluginStatus {
        let ticket = slot.admit();
        let deadline = Instant::now() + self.settings().stop_timeout;

        let mut state = slot.state.lock().await;
        if !slot.is_current(&ticket) {
            debug!(plugin = %slot.name(), "stop superseded by a later operation");
            return state.runtime.status;
        }
        self.stop_locked(slot, &mut state, Uuid::new_v4(), action, deadline)
            .await
    }

    async fn start_locked(
        &self,
        slot: &Arc<PluginSlot>,
        state: &mut SlotState,
        ticket: &Ticket,
        deadline: Instant,
        manual: bool,
        action: AuditAction,
    ) -> Result<PluginStatus, EngineError> {
        let name = slot.name();
        let correlation = Uuid::new_v4();

        if slot.is_retired() {
            debug!(plugin = %name, "slot was replaced by a reload; not connecting");
            return Err(EngineError::Cancelled { name: name.to_string() });
        }

        if state.runtime.status.is_connected() {
            self.lifecycle
                .record(AuditEvent::new(name, action, AuditOutcome::Skipped, correlation));
            return Ok(state.runtime.status);
        }
        if manual {
            state.runtime.consecutive_failures = 0;
            state.backoff.reset();
        }

        let step = Transition::new(action, AuditOutcome::InProgress, correlation);
        if !self
            .lifecycle
            .transition(name, &mut state.runtime, PluginStatus::Starting, step)
            .await
        {
            return Ok(state.runtime.status);
        }

        let settings = self.settings();
        let outcome = match self.factory.create(Arc::clone(&slot.config), Arc::clone(&self.logs)) {
            Err(error) => ConnectOutcome::Failed(error.into()),
            Ok(transport) => {
                tokio::select! {
                    biased;
                    _ = ticket.token.cancelled() => ConnectOutcome::Cancelled,
                    result = tokio::time::timeout_at(deadline, transport.connect()) => match result {
                        Ok(Ok(connection)) => ConnectOutcome::Connected(connection),
                        Ok(Err(error)) => ConnectOutcome::Failed(error.into()),
                        Err(_) => ConnectOutcome::Failed(EngineError::Timeout {
                            name: name.to_string(),
                            operation: "start".to_string(),
                            timeout_ms: settings.operation_timeout.as_millis() as u64,
                        }),
                    },
                }
            }
        };

        match outcome {
            ConnectOutcome::Cancelled => {
                let step = Transition::new(action, AuditOutcome::Cancelled, correlation).because("cancelled");
                self.lifecycle
                    .transition(name, &mut state.runtime, PluginStatus::Stopped, step)
                    .await;
                Err(EngineError::Cancelled { name: name.to_string() })
            }
            ConnectOutcome::Failed(error) => {
                self.fail_locked(slot, state, correlation, action, &error.to_string())
                    .await;
                Err(error)
            }
            ConnectOutcome::Connected(connection) => {
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
                let client = Arc::new(ManagedClient::new(
                    name,
                    connection,
                    self.health.clone(),
                    settings.invoke_timeout,
                ));

                state.runtime.epoch = epoch;
                state.runtime.last_error = None;
                state.probe_failures = 0;
                state.tasks = CancellationToken::new();
                state.client = Some(Arc::clone(&client));
                self.spawn_connection_tasks(name, epoch, &client, &settings, state.tasks.clone());

                let step = Transition::new(action, AuditOutcome::Success, correlation);
                self.lifecycle
                    .transition(name, &mut state.runtime, PluginStatus::Running, step)
                    .await;
                Ok(state.runtime.status)
            }
        }
    }

    async fn stop_locked(
        &self,
        slot: &Arc<PluginSlot>,
        state: &mut SlotState,
        correlation: Uuid,
        action: AuditAction,
        deadline: Instant,
    ) -> PluginStatus {
        let name = slot.name();
        state.probe_failures = 0;

        match state.runtime.status {
            PluginStatus::Failed | PluginStatus::DisabledByFailure => {
                let step = Transition::new(action, AuditOutcome::Success, correlation);
                self.lifecycle
                    .transition(name, &mut state.runtime, PluginStatus::Stopped, step)
                    .await;
            }
            PluginStatus::Running | PluginStatus::Degraded => {
                let step = Transition::new(action, AuditOutcome::InProgress, correlation);
                self.lifecycle
                    .transition(name, &mut state.runtime, PluginStatus::Stopping, step)
                    .await;
                self.close_client(name, state, deadline).await;
                let step = Transition::new(action, AuditOutcome::Success, correlation);
                self.lifecycle
                    .transition(name, &mut state.runtime, PluginStatus::Stopped, step)
                    .await;
            }
            PluginStatus::Stopped | PluginStatus::Starting | PluginStatus::Stopping => {
                self.lifecycle
                    .record(AuditEvent::new(name, action, AuditOutcome::Skipped, correlation));
            }
        }
        state.runtime.status
    }

    /// Cancel the connection's tasks and close its client, giving up at
    /// `deadline` or after the stop timeout, whichever comes first.
    async fn close_client(&self, name: &str, state: &mut SlotState, deadline: Instant) {
        state.tasks.cancel();
        if let Some(client) = state.client.take() {
            let started = Instant::now();
            let limit = deadline.min(started + self.settings().stop_timeout);
            if tokio::time::timeout_at(limit, client.disconnect()).await.is_err() {
                let waited_ms = limit.saturating_duration_since(started).as_millis() as u64;
                warn!(plugin = %name, waited_ms, "disconnect timed out");
            }
        }
        self.providers.forget(name);
    }

    /// Close the connection, count the failure, then retry or disable.
    async fn fail_locked(
        &self,
        slot: &Arc<PluginSlot>,
        state: &mut SlotState,
        correlation: Uuid,
        action: AuditAction,
        reason: &str,
    ) -> PluginStatus {
        let name = slot.name();
        let settings = self.settings();
        self.close_client(name, state, Instant::now() + settings.stop_timeout)
            .await;

        let reason = self.rules.redact(reason);
        state.probe_failures = 0;
        state.runtime.consecutive_failures = state.runtime.consecutive_failures.saturating_add(1);
        state.runtime.last_error = Some(reason.clone());

        let step = Transition::new(action, AuditOutcome::Failure, correlation).because(&reason);
        self.lifecycle
            .transition(name, &mut state.runtime, PluginStatus::Failed, step)
            .await;
        warn!(
            plugin = %name,
            failures = state.runtime.consecutive_failures,
            reason = %reason,
            "plugin failed"
        );

        if state.runtime.consecutive_failures >= settings.max_consecutive_failures {
            let why = format!("{} consecutive failures", state.runtime.consecutive_failures);
            let step = Transition::new(action, AuditOutcome::Failure, correlation).because(&why);
            self.lifecycle
                .transition(name, &mut state.runtime, PluginStatus::DisabledByFailure, step)
                .await;
        } else {
            let delay = state.backoff.next_delay();
            state.runtime.last_backoff = Some(delay);
            self.schedule_retry(slot, delay);
        }
        state.runtime.status
    }

    /// Sleep, then start again unless another operation intervened.
    fn schedule_retry(&self, slot: &Arc<PluginSlot>, delay: Duration) {
        let ticket = slot.current();
        let slot = Arc::clone(slot);
        let manager = self.self_ref.clone();
        debug!(plugin = %slot.name(), delay_ms = delay.as_millis() as u64, "retry scheduled");

        tokio::spawn(async move {
            tokio::select! {
                _ = ticket.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(manager) = manager.upgrade() else { return };

            let mut state = slot.state.lock().await;
            if !slot.is_current(&ticket) || state.runtime.status != PluginStatus::Failed {
                debug!(plugin = %slot.name(), "retry abandoned");
                return;
            }
            let deadline = Instant::now() + manager.settings().operation_timeout;
            if let Err(error) = manager
                .start_locked(&slot, &mut state, &ticket, deadline, false, AuditAction::Restart)
                .await
            {
                debug!(plugin = %slot.name(), error = %manager.rules.redact(&error.to_string()), "retry failed");
            }
        });
    }

    fn spawn_connection_tasks(
        &self,
        name: &str,
        epoch: u64,
        client: &Arc<ManagedClient>,
        settings: &EngineSettings,
        cancel: CancellationToken,
    ) {
        let sink: Weak<dyn ProbeSink> = self.self_ref.clone();
        spawn_probe_task(ProbeTask {
            plugin: name.to_string(),
            epoch,
            client: Arc::clone(client),
            monitor: self.health.clone(),
            sink: sink.clone(),
            interval: settings.health_interval,
            probe_timeout: settings.probe_timeout,
            cancel: cancel.clone(),
        });

        let plugin = name.to_string();
        let client = Arc::clone(client);
        let manager = self.self_ref.clone();
        let mut events = client.subscribe_events();
        tokio::spawn(async move {
            refresh_providers(&manager, &plugin, &client, &cancel).await;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    None => break,
                    Some(TransportEvent::Closed { reason }) => {
                        let Some(inner) = manager.upgrade() else { break };
                        let record = HealthRecord::unreachable(&plugin, inner.rules.redact(&reason));
                        inner.health.record(record.clone()).await;
                        drop(inner);
                        if let Some(sink) = sink.upgrade() {
                            sink.apply_probe(ProbeReport {
                                plugin: plugin.clone(),
                                epoch,
                                record,
                                source: ProbeSource::Disconnect,
                            })
                            .await;
                        }
                        break;
                    }
                    Some(TransportEvent::ToolsChanged) => {
                        client.invalidate_tools();
                        refresh_providers(&manager, &plugin, &client, &cancel).await;
                    }
                }
            }
            debug!(plugin = %plugin, epoch, "event task stopped");
        });
    }
}

async fn refresh_providers(
    manager: &Weak<ManagerInner>,
    plugin: &str,
    client: &ManagedClient,
    cancel: &CancellationToken,
) {
    let Some(inner) = manager.upgrade() else { return };
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = inner.providers.refresh(plugin, client) => result,
    };
    if let Err(error) = result {
        debug!(plugin = %plugin, error = %inner.rules.redact(&error.to_string()), "provider refresh failed");
    } else if cancel.is_cancelled() {
        inner.providers.forget(plugin);
    }
}

#[async_trait]
impl ProbeSink for ManagerInner {
    async fn apply_probe(&self, report: ProbeReport) -> bool {
        let Ok(slot) = self.slot(&report.plugin) else { return false };
        let mut state = slot.state.lock().await;
        if state.runtime.epoch != report.epoch || !state.runtime.status.is_connected() {
            debug!(plugin = %report.plugin, epoch = report.epoch, "ignoring stale health report");
            return false;
        }

        let name = slot.name();
        let correlation = Uuid::new_v4();
        let settings = self.settings();

        if report.record.reachable {
            let recovering = state.probe_failures > 0 || state.runtime.status == PluginStatus::Degraded;
            state.probe_failures = 0;
            state.runtime.consecutive_failures = 0;
            state.backoff.reset();
            if recovering {
                self.lifecycle
                    .record(AuditEvent::health_check(name, true, report.record.latency_ms));
            }
            if state.runtime.status == PluginStatus::Degraded {
                let step = Transition::new(AuditAction::HealthCheck, AuditOutcome::Success, correlation);
                self.lifecycle
                    .transition(name, &mut state.runtime, PluginStatus::Running, step)
                    .await;
            }
            return true;
        }

        state.probe_failures += 1;
        let reason = report
            .record
            .error
            .clone()
            .unwrap_or_else(|| "health probe failed".to_string());
        let source = match report.source {
            ProbeSource::Probe => "probe",
            ProbeSource::Disconnect => "disconnect",
        };
        self.lifecycle.record(
            AuditEvent::health_check(name, false, None)
                .with_metadata("source", source)
                .with_metadata("error", reason.as_str()),
        );

        if state.probe_failures >= settings.failure_threshold {
            self.fail_locked(&slot, &mut state, correlation, AuditAction::HealthCheck, &reason)
                .await;
            return false;
        }
        if state.runtime.status == PluginStatus::Running {
            let step = Transition::new(AuditAction::HealthCheck, AuditOutcome::Failure, correlation).because(&reason);
            self.lifecycle
                .transition(name, &mut state.runtime, PluginStatus::Degraded, step)
                .await;
        }
        true
    }
}
