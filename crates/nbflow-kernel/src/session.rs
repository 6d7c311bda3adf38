use crate::protocol::{KernelMessage, KernelRequest};
use crate::{KernelError, KernelLauncher};
use nbflow_core::settings::KernelSettings;
use nbflow_core::{shutdown_requested, ExecutionResult, ExecutionStatus, OutputRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One live kernel backend. Executions are serialized: a second `execute`
/// waits until the first one's pump has finished.
pub struct KernelSession {
    requests: mpsc::Sender<KernelRequest>,
    replies: Mutex<mpsc::Receiver<KernelMessage>>,
    process: Mutex<Option<Child>>,
    settings: KernelSettings,
    alive: AtomicBool,
    cancel: watch::Receiver<bool>,
}

enum Pump {
    Finished,
    Deadline,
    Cancelled,
    Closed,
}

impl KernelSession {
    /// Launches a backend and waits for it to answer the readiness handshake.
    /// The backend is torn down if the handshake fails.
    pub async fn start(
        launcher: &dyn KernelLauncher,
        settings: KernelSettings,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self, KernelError> {
        let channels = launcher.launch()?;
        let session = Self {
            requests: channels.requests,
            replies: Mutex::new(channels.replies),
            process: Mutex::new(channels.process),
            settings,
            alive: AtomicBool::new(true),
            cancel,
        };

        let request = KernelRequest::kernel_info();
        let msg_id = request.msg_id.clone();
        if session.requests.send(request).await.is_err() {
            session.terminate().await;
            return Err(KernelError::Unavailable);
        }

        let ready_timeout = session.settings.ready_timeout();
        let outcome = {
            let mut replies = session.replies.lock().await;
            session
                .await_idle(&mut replies, &msg_id, Instant::now() + ready_timeout)
                .await
        };
        match outcome {
            Pump::Finished => {
                info!(event = "kernel_ready");
                Ok(session)
            }
            Pump::Deadline => {
                warn!(event = "kernel_not_ready", timeout_secs = ready_timeout.as_secs());
                session.terminate().await;
                Err(KernelError::NotReady(ready_timeout))
            }
            Pump::Cancelled => {
                session.terminate().await;
                Err(KernelError::Cancelled)
            }
            Pump::Closed => {
                warn!(event = "kernel_exited_during_start");
                session.terminate().await;
                Err(KernelError::Unavailable)
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.requests.is_closed()
    }

    /// Runs `code` and collects its output. Never fails: a silent backend
    /// yields `TimedOut` with whatever arrived, a dead one `KernelUnavailable`.
    pub async fn execute(&self, code: &str) -> ExecutionResult {
        if !self.is_alive() {
            return ExecutionResult::kernel_unavailable();
        }
        let mut replies = self.replies.lock().await;

        let request = KernelRequest::execute(code);
        let msg_id = request.msg_id.clone();
        debug!(event = "kernel_execute", msg_id = %msg_id, bytes = code.len());
        if self.requests.send(request).await.is_err() {
            self.alive.store(false, Ordering::SeqCst);
            return ExecutionResult::kernel_unavailable();
        }

        let idle_timeout = self.settings.idle_timeout();
        let mut outputs = Vec::new();
        let outcome = self
            .pump_resetting(&mut replies, &msg_id, idle_timeout, &mut outputs)
            .await;

        let status = match outcome {
            Pump::Finished => ExecutionStatus::Completed,
            Pump::Deadline => {
                warn!(event = "kernel_execute_timeout", msg_id = %msg_id, outputs = outputs.len());
                ExecutionStatus::TimedOut
            }
            Pump::Cancelled => {
                info!(event = "kernel_execute_cancelled", msg_id = %msg_id);
                ExecutionStatus::Cancelled
            }
            Pump::Closed => {
                warn!(event = "kernel_died", msg_id = %msg_id);
                self.alive.store(false, Ordering::SeqCst);
                let mut result = ExecutionResult::kernel_unavailable();
                outputs.append(&mut result.outputs);
                result.outputs = outputs;
                return result;
            }
        };
        ExecutionResult { status, outputs }
    }

    pub async fn shutdown(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            self.terminate().await;
            return;
        }
        let _ = self.requests.try_send(KernelRequest::shutdown());
        let mut process = self.process.lock().await;
        let Some(mut child) = process.take() else {
            info!(event = "kernel_shutdown");
            return;
        };
        match tokio::time::timeout(self.settings.shutdown_timeout(), child.wait()).await {
            Ok(Ok(status)) => info!(event = "kernel_shutdown", status = %status),
            Ok(Err(err)) => warn!(event = "kernel_wait_error", error = %err),
            Err(_) => {
                warn!(event = "kernel_kill", reason = "shutdown_timeout");
                if let Err(err) = child.kill().await {
                    warn!(event = "kernel_kill_error", error = %err);
                }
            }
        }
    }

    async fn terminate(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.process.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(event = "kernel_kill_error", error = %err);
            }
        }
    }

    async fn pump_resetting(
        &self,
        replies: &mut mpsc::Receiver<KernelMessage>,
        msg_id: &str,
        window: std::time::Duration,
        outputs: &mut Vec<OutputRecord>,
    ) -> Pump {
        let mut deadline = Instant::now() + window;
        let mut cancel = self.cancel.clone();
        loop {
            let received = tokio::select! {
                _ = shutdown_requested(&mut cancel) => return Pump::Cancelled,
                received = tokio::time::timeout_at(deadline, replies.recv()) => received,
            };
            let message = match received {
                Err(_) => return Pump::Deadline,
                Ok(None) => return Pump::Closed,
                Ok(Some(message)) => message,
            };
            if message.correlation_id != msg_id {
                debug!(event = "kernel_stale_message", correlation_id = %message.correlation_id, kind = message.event.kind());
                continue;
            }
            deadline = Instant::now() + window;
            if message.event.is_idle() {
                return Pump::Finished;
            }
            if let Some(record) = message.event.into_output() {
                outputs.push(record);
            }
        }
    }

    async fn await_idle(
        &self,
        replies: &mut mpsc::Receiver<KernelMessage>,
        msg_id: &str,
        deadline: Instant,
    ) -> Pump {
        let mut cancel = self.cancel.clone();
        loop {
            let received = tokio::select! {
                _ = shutdown_requested(&mut cancel) => return Pump::Cancelled,
                received = tokio::time::timeout_at(deadline, replies.recv()) => received,
            };
            match received {
                Err(_) => return Pump::Deadline,
                Ok(None) => return Pump::Closed,
                Ok(Some(message)) if message.correlation_id == msg_id && message.event.is_idle() => {
                    return Pump::Finished
                }
                Ok(Some(_)) => continue,
            }
        }
    }
}
