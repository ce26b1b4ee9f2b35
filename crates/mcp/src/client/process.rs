//! Ownership of a plugin child process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::debug;

use super::transport::TransportEvent;

/// Supervises one child process.
///
/// A background task waits on the child. When the child exits, or when the
/// guard is closed or dropped, the task kills and reaps it, records the exit
/// reason and emits [`TransportEvent::Closed`].
#[derive(Debug)]
pub(crate) struct ProcessGuard {
    pid: Option<u32>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<String>>,
}

impl ProcessGuard {
    pub(crate) fn spawn(
        plugin_name: String,
        mut child: Child,
        events: broadcast::Sender<TransportEvent>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };

            let reason = match waited {
                Some(Ok(status)) => format!("process exited ({status})"),
                Some(Err(error)) => format!("failed to wait for process: {error}"),
                None => {
                    if let Err(error) = child.kill().await {
                        debug!(plugin = %plugin_name, error = %error, "kill failed; process already gone");
                    }
                    "process stopped by host".to_string()
                }
            };

            closed.store(true, Ordering::SeqCst);
            debug!(plugin = %plugin_name, reason = %reason, "plugin process ended");
            let _ = exit_tx.send(Some(reason.clone()));
            let _ = events.send(TransportEvent::Closed { reason });
        });

        Self {
            pid,
            kill: Mutex::new(Some(kill_tx)),
            exit: exit_rx,
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Why the process ended, once it has.
    pub(crate) fn exit_reason(&self) -> Option<String> {
        self.exit.borrow().clone()
    }

    /// Kill the child and wait until it has been reaped.
    pub(crate) async fn shutdown(&self) {
        let kill = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        let mut exit = self.exit.clone();
        let _ = exit.wait_for(Option::is_some).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    fn spawn(script: &str) -> (ProcessGuard, broadcast::Receiver<TransportEvent>, Arc<AtomicBool>) {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let (events, receiver) = broadcast::channel(8);
        let closed = Arc::new(AtomicBool::new(false));
        (ProcessGuard::spawn("p".into(), child, events, closed.clone()), receiver, closed)
    }

    #[tokio::test]
    async fn natural_exit_emits_closed() {
        let (guard, mut events, closed) = spawn("exit 3");
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, TransportEvent::Closed { ref reason } if reason.contains("exited")));
        assert!(closed.load(Ordering::SeqCst));
        assert!(guard.exit_reason().is_some());
    }

    #[tokio::test]
    async fn shutdown_kills_a_running_child() {
        let (guard, mut events, _) = spawn("sleep 30");
        assert!(guard.pid().is_some());
        tokio::time::timeout(Duration::from_secs(5), guard.shutdown()).await.unwrap();
        assert_eq!(guard.exit_reason().as_deref(), Some("process stopped by host"));
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Closed { .. }));
    }

    #[tokio::test]
    async fn dropping_the_guard_kills_the_child() {
        let (guard, mut events, _) = spawn("sleep 30");
        drop(guard);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, TransportEvent::Closed { reason: "process stopped by host".into() });
    }
}
