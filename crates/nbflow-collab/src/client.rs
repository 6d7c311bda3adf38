use crate::{classify_inbound, CollabError, ConnectionStatus, Inbound, PresenceUpdate};
use futures_util::{SinkExt, StreamExt};
use nbflow_core::collab_wire::{CollabEnvelope, CollabMsg};
use nbflow_core::settings::CollabSettings;
use nbflow_core::{shutdown_requested, CellId};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const EDIT_CHANNEL_CAPACITY: usize = 1_024;

pub struct CollabHandle {
    client_id: String,
    notebook_id: String,
    outbound: mpsc::Sender<String>,
    max_message_bytes: usize,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

pub struct CollabEvents {
    pub edits: mpsc::Receiver<CollabMsg>,
    pub presence: mpsc::Receiver<PresenceUpdate>,
    pub status: watch::Receiver<ConnectionStatus>,
}

struct LoopConfig {
    url: Url,
    client_id: String,
    notebook_id: String,
    reconnect_delay: Duration,
    max_message_bytes: usize,
}

/// Starts the connection loop for `room_url`. Returns immediately; the
/// first connection attempt happens in the background.
pub fn connect(
    room_url: &str,
    notebook_id: &str,
    settings: &CollabSettings,
) -> Result<(CollabHandle, CollabEvents), CollabError> {
    let url = Url::parse(room_url)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(CollabError::UnsupportedScheme(url.scheme().to_string()));
    }
    let client_id = Uuid::new_v4().to_string();

    let (outbound_tx, outbound_rx) = mpsc::channel(settings.send_queue_capacity.max(1));
    let (edit_tx, edit_rx) = mpsc::channel(EDIT_CHANNEL_CAPACITY);
    let (presence_tx, presence_rx) = mpsc::channel(settings.presence_capacity.max(1));
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
    let (stop_tx, stop_rx) = watch::channel(false);

    let config = LoopConfig {
        url,
        client_id: client_id.clone(),
        notebook_id: notebook_id.to_string(),
        reconnect_delay: settings.reconnect_delay(),
        max_message_bytes: settings.max_message_bytes,
    };
    let sinks = InboundSinks {
        edits: edit_tx,
        presence: presence_tx,
    };
    let task = tokio::spawn(connection_loop(config, outbound_rx, sinks, status_tx, stop_rx));

    let handle = CollabHandle {
        client_id,
        notebook_id: notebook_id.to_string(),
        outbound: outbound_tx,
        max_message_bytes: settings.max_message_bytes,
        stop: stop_tx,
        task: Some(task),
    };
    let events = CollabEvents {
        edits: edit_rx,
        presence: presence_rx,
        status: status_rx,
    };
    Ok((handle, events))
}

impl CollabHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    /// Stamps `msg` with this client's id and queues it. Never waits on the
    /// network.
    pub fn send(&self, msg: CollabMsg) -> Result<(), CollabError> {
        let kind = msg.kind();
        let raw = CollabEnvelope::new(self.client_id.clone(), msg).encode(self.max_message_bytes)?;
        match self.outbound.try_send(raw) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(event = "collab_queue_full", notebook_id = %self.notebook_id, kind);
                Err(CollabError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(CollabError::Stopped),
        }
    }

    pub fn send_cursor(
        &self,
        cell_id: CellId,
        cursor_pos: usize,
        selection_end: usize,
    ) -> Result<(), CollabError> {
        self.send(CollabMsg::CursorUpdate {
            cell_id,
            cursor_pos,
            selection_end,
        })
    }

    /// Cancels the reconnect loop, closes the socket and waits for the
    /// background task to finish.
    pub async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(event = "collab_task_join_error", error = %err);
            }
        }
    }
}

impl Drop for CollabHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

struct InboundSinks {
    edits: mpsc::Sender<CollabMsg>,
    presence: mpsc::Sender<PresenceUpdate>,
}

impl InboundSinks {
    async fn route(&self, config: &LoopConfig, raw: &str) {
        match classify_inbound(&config.client_id, raw, config.max_message_bytes) {
            Inbound::Echo => debug!(event = "collab_echo_dropped", notebook_id = %config.notebook_id),
            Inbound::Malformed(err) => {
                warn!(event = "collab_malformed_message", notebook_id = %config.notebook_id, error = %err)
            }
            Inbound::Edit(msg) => {
                debug!(event = "collab_remote_edit", kind = msg.kind(), cell_id = %msg.cell_id());
                if self.edits.send(msg).await.is_err() {
                    debug!(event = "collab_edit_receiver_closed");
                }
            }
            Inbound::Presence(update) => {
                if let Err(TrySendError::Full(update)) = self.presence.try_send(update) {
                    debug!(event = "collab_presence_dropped", client_id = %update.client_id);
                }
            }
        }
    }
}

enum SessionEnd {
    Disconnected,
    Stop,
}

async fn connection_loop(
    config: LoopConfig,
    mut outbound: mpsc::Receiver<String>,
    sinks: InboundSinks,
    status: watch::Sender<ConnectionStatus>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        status.send_replace(ConnectionStatus::Connecting);
        let connect = tokio::select! {
            _ = shutdown_requested(&mut stop) => break,
            result = connect_async_with_config(
                config.url.as_str(),
                Some(websocket_config(config.max_message_bytes)),
                false,
            ) => result,
        };
        match connect {
            Ok((ws, _)) => {
                info!(event = "collab_connected", notebook_id = %config.notebook_id, client_id = %config.client_id);
                status.send_replace(ConnectionStatus::Connected);
                let ended = run_session(ws, &config, &mut outbound, &sinks, &mut stop).await;
                if matches!(ended, SessionEnd::Stop) {
                    break;
                }
                warn!(event = "collab_connection_lost", notebook_id = %config.notebook_id);
            }
            Err(err) => {
                warn!(event = "collab_connect_error", url = %config.url, error = %err);
            }
        }
        status.send_replace(ConnectionStatus::Disconnected);
        tokio::select! {
            _ = shutdown_requested(&mut stop) => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }
    status.send_replace(ConnectionStatus::Stopped);
    info!(event = "collab_stopped", notebook_id = %config.notebook_id);
}

fn websocket_config(max_message_bytes: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_bytes);
    config.max_frame_size = Some(max_message_bytes);
    config
}

async fn run_session<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    config: &LoopConfig,
    outbound: &mut mpsc::Receiver<String>,
    sinks: &InboundSinks,
    stop: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    let receive = async {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => sinks.route(config, &text).await,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => sinks.route(config, &text).await,
                    Err(_) => warn!(event = "collab_malformed_message", reason = "binary_not_utf8"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(event = "collab_read_error", error = %err);
                    break;
                }
            }
        }
    };

    let send = async {
        while let Some(raw) = outbound.recv().await {
            if let Err(err) = sink.send(Message::Text(raw)).await {
                warn!(event = "collab_write_error", error = %err);
                return SessionEnd::Disconnected;
            }
        }
        SessionEnd::Stop
    };

    let ended = tokio::select! {
        _ = receive => SessionEnd::Disconnected,
        ended = send => ended,
        _ = shutdown_requested(stop) => SessionEnd::Stop,
    };
    let _ = sink.close().await;
    ended
}
