use crate::protocol::{KernelEvent, KernelMessage, KernelRequest, RequestBody};
use crate::{KernelChannels, KernelError, KernelLauncher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Emit these events, then report idle.
    Events(Vec<KernelEvent>),
    /// Emit these events and never report idle.
    Hang(Vec<KernelEvent>),
}

type Responder = dyn Fn(&str) -> ScriptedReply + Send + Sync;

/// In-process kernel backend driven by a closure. Records every executed
/// code string in order.
#[derive(Clone)]
pub struct ScriptedLauncher {
    responder: Arc<Responder>,
    ready: bool,
    launches: Arc<AtomicUsize>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLauncher {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            ready: true,
            launches: Arc::new(AtomicUsize::new(0)),
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn quiet() -> Self {
        Self::new(|_| ScriptedReply::Events(Vec::new()))
    }

    /// Backend that never answers the readiness handshake.
    pub fn unresponsive(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }
}

impl KernelLauncher for ScriptedLauncher {
    fn launch(&self) -> Result<KernelChannels, KernelError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (request_tx, mut request_rx) = mpsc::channel::<KernelRequest>(64);
        let (reply_tx, reply_rx) = mpsc::channel(64);
        let responder = Arc::clone(&self.responder);
        let executed = Arc::clone(&self.executed);
        let ready = self.ready;

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let correlation_id = request.msg_id;
                let (events, finish) = match request.body {
                    RequestBody::KernelInfoRequest => (Vec::new(), ready),
                    RequestBody::ShutdownRequest => break,
                    RequestBody::ExecuteRequest { code } => {
                        if let Ok(mut log) = executed.lock() {
                            log.push(code.clone());
                        }
                        match responder(&code) {
                            ScriptedReply::Events(events) => (events, true),
                            ScriptedReply::Hang(events) => (events, false),
                        }
                    }
                };
                let mut events = events;
                if finish {
                    events.push(KernelEvent::idle());
                }
                for event in events {
                    let message = KernelMessage {
                        correlation_id: correlation_id.clone(),
                        event,
                    };
                    if reply_tx.send(message).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(KernelChannels {
            requests: request_tx,
            replies: reply_rx,
            process: None,
        })
    }
}
