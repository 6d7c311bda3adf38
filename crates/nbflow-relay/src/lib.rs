use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Path, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use nbflow_core::frame::{validate_json_object, DEFAULT_MAX_FRAME_BYTES};
use nbflow_core::shutdown_requested;
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8765";

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub max_message_bytes: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_FRAME_BYTES,
            write_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

type Room = HashMap<String, mpsc::Sender<Message>>;

/// Room membership. Rooms exist only while they have members.
pub struct RelayState {
    config: RelayConfig,
    conn_counter: AtomicU64,
    rooms: RwLock<HashMap<String, Room>>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn member_count(&self, notebook_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(notebook_id)
            .map(HashMap::len)
            .unwrap_or_default()
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    async fn join(&self, notebook_id: &str, conn_id: &str, sender: mpsc::Sender<Message>) -> usize {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(notebook_id.to_string()).or_default();
        room.insert(conn_id.to_string(), sender);
        room.len()
    }

    async fn leave(&self, notebook_id: &str, conn_id: &str) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(notebook_id) else {
            return 0;
        };
        room.remove(conn_id);
        let remaining = room.len();
        if remaining == 0 {
            rooms.remove(notebook_id);
            info!(event = "room_closed", notebook_id = %notebook_id);
        }
        remaining
    }

    /// Sends `msg` to every member of the room except `from`. Slow members
    /// whose queue is full miss the message.
    async fn broadcast(&self, notebook_id: &str, from: &str, msg: Message) -> usize {
        let targets = {
            let rooms = self.rooms.read().await;
            let Some(room) = rooms.get(notebook_id) else {
                return 0;
            };
            room.iter()
                .filter(|(conn_id, _)| conn_id.as_str() != from)
                .map(|(conn_id, sender)| (conn_id.clone(), sender.clone()))
                .collect::<Vec<_>>()
        };
        let mut delivered = 0;
        for (conn_id, sender) in targets {
            match sender.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(event = "member_queue_full", notebook_id = %notebook_id, conn_id = %conn_id)
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(event = "member_gone", notebook_id = %notebook_id, conn_id = %conn_id)
                }
            }
        }
        delivered
    }

    fn start_ping(&self, conn_id: &str, sender: mpsc::Sender<Message>) -> Option<JoinHandle<()>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let interval = self.config.ping_interval;
        let conn_id = conn_id.to_string();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(event = "ping_stopped", conn_id = %conn_id);
                    return;
                }
            }
        }))
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, notebook_id: String) {
        let conn_id = self.next_conn_id();
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity.max(1));
        let write_timeout = self.config.write_timeout;
        let writer_conn = conn_id.clone();
        let mut write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(event = "write_error", conn_id = %writer_conn, error = %err);
                        return;
                    }
                    Err(_) => {
                        warn!(event = "write_timeout", conn_id = %writer_conn);
                        return;
                    }
                }
            }
        });

        let members = self.join(&notebook_id, &conn_id, tx.clone()).await;
        info!(event = "room_joined", notebook_id = %notebook_id, conn_id = %conn_id, members);
        let ping_task = self.start_ping(&conn_id, tx.clone());

        let max = self.config.max_message_bytes;
        let mut writer_done = false;
        loop {
            let result = tokio::select! {
                next = ws_receiver.next() => match next {
                    Some(result) => result,
                    None => break,
                },
                _ = &mut write_task => {
                    writer_done = true;
                    warn!(event = "member_dropped", notebook_id = %notebook_id, conn_id = %conn_id);
                    break;
                }
            };
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %conn_id, error = %err);
                    break;
                }
            };
            let checked = match &msg {
                Message::Text(text) => validate_json_object(text.as_bytes(), max),
                Message::Binary(bytes) => validate_json_object(bytes, max),
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if let Err(err) = checked {
                warn!(event = "message_dropped", notebook_id = %notebook_id, conn_id = %conn_id, error = %err);
                continue;
            }
            let delivered = self.broadcast(&notebook_id, &conn_id, msg).await;
            debug!(event = "message_relayed", notebook_id = %notebook_id, conn_id = %conn_id, delivered);
        }

        if let Some(task) = ping_task {
            task.abort();
        }
        let remaining = self.leave(&notebook_id, &conn_id).await;
        info!(event = "room_left", notebook_id = %notebook_id, conn_id = %conn_id, remaining);
        drop(tx);
        if !writer_done {
            let _ = write_task.await;
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(notebook_id): Path<String>,
    State(relay): State<Arc<RelayState>>,
) -> impl IntoResponse {
    // Frames up to twice the limit are read and dropped one by one; larger
    // ones end the connection.
    let ceiling = relay.config.max_message_bytes.saturating_mul(2);
    ws.max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_upgrade(move |socket| async move {
            relay.handle_socket(socket, notebook_id).await;
        })
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/rooms/:notebook_id", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: Arc<RelayState>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    info!(event = "relay_start", addr = ?listener.local_addr().ok());
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await?;
    info!(event = "relay_stop");
    Ok(())
}
