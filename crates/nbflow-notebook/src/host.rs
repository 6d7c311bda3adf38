use crate::notebook::{CloseHandle, EditOrigin, Notebook, Reaction};
use crate::scheduler::{RunKind, RunReport};
use crate::NotebookError;
use nbflow_collab::{CollabEvents, ConnectionStatus, PresenceUpdate};
use nbflow_core::collab_wire::CollabMsg;
use nbflow_core::{CellId, CellKind, ExecutionStatus, OutputRecord};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, NotebookError>>;

enum HostCommand {
    AddCell {
        kind: CellKind,
        content: String,
        index: Option<usize>,
        reply: Reply<CellId>,
    },
    EditCell {
        cell_id: CellId,
        content: String,
        reply: Reply<Option<RunReport>>,
    },
    DeleteCell {
        cell_id: CellId,
        reply: Reply<()>,
    },
    SetTestFlag {
        cell_id: CellId,
        is_test: bool,
        reply: Reply<Option<RunReport>>,
    },
    Run {
        kind: RunKind,
        reply: Reply<RunReport>,
    },
    Cursor {
        cell_id: CellId,
        cursor_pos: usize,
        selection_end: usize,
        reply: Reply<()>,
    },
    Save {
        path: Option<PathBuf>,
        reply: Reply<()>,
    },
    Snapshot {
        reply: oneshot::Sender<NotebookSnapshot>,
    },
    Presence {
        reply: oneshot::Sender<Vec<PresenceUpdate>>,
    },
    Close {
        reply: oneshot::Sender<Notebook>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CellSnapshot {
    pub cell_id: CellId,
    pub kind: CellKind,
    pub content: String,
    pub is_test: bool,
    pub outputs: Vec<OutputRecord>,
    pub status: Option<ExecutionStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotebookSnapshot {
    pub notebook_id: String,
    pub dirty: bool,
    pub kernel_ready: bool,
    pub cells: Vec<CellSnapshot>,
}

impl NotebookSnapshot {
    fn capture(notebook: &Notebook) -> Self {
        Self {
            notebook_id: notebook.notebook_id().to_string(),
            dirty: notebook.is_dirty(),
            kernel_ready: notebook.kernel_ready(),
            cells: notebook
                .cells()
                .map(|cell| CellSnapshot {
                    cell_id: cell.id(),
                    kind: cell.kind(),
                    content: cell.content().to_string(),
                    is_test: cell.is_test(),
                    outputs: cell.outputs().to_vec(),
                    status: cell.last_status(),
                })
                .collect(),
        }
    }

    pub fn cell(&self, cell_id: CellId) -> Option<&CellSnapshot> {
        self.cells.iter().find(|cell| cell.cell_id == cell_id)
    }
}

/// Owns one notebook on its own task. Commands are handled one at a time,
/// so a run request that arrives mid-run waits its turn, and remote edits
/// that arrive mid-run are applied once the run has drained.
pub struct NotebookHost {
    notebook: Notebook,
    presence: HashMap<String, PresenceUpdate>,
}

#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::Sender<HostCommand>,
    close: CloseHandle,
    status: Option<watch::Receiver<ConnectionStatus>>,
}

impl NotebookHost {
    pub fn start(mut notebook: Notebook, collaborate: bool) -> Result<HostHandle, NotebookError> {
        let events = if collaborate {
            Some(notebook.connect_collab()?)
        } else {
            None
        };
        Ok(Self::spawn(notebook, events))
    }

    pub fn spawn(notebook: Notebook, events: Option<CollabEvents>) -> HostHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let close = notebook.close_handle();
        let status = events.as_ref().map(|events| events.status.clone());
        let host = Self {
            notebook,
            presence: HashMap::new(),
        };
        tokio::spawn(host.run_loop(command_rx, events));
        HostHandle {
            commands: command_tx,
            close,
            status,
        }
    }

    async fn run_loop(mut self, mut commands: mpsc::Receiver<HostCommand>, events: Option<CollabEvents>) {
        let (mut edits, mut presence) = match events {
            Some(events) => (Some(events.edits), Some(events.presence)),
            None => (None, None),
        };
        info!(event = "host_started", notebook_id = %self.notebook.notebook_id());

        let close_reply = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(HostCommand::Close { reply }) => break Some(reply),
                    Some(command) => self.handle(command).await,
                    None => break None,
                },
                edit = recv_from(&mut edits) => match edit {
                    Some(msg) => self.apply_remote(msg),
                    None => edits = None,
                },
                update = recv_from(&mut presence) => match update {
                    Some(update) => self.record_presence(update),
                    None => presence = None,
                },
            }
        };

        self.notebook.close().await;
        info!(event = "host_stopped", notebook_id = %self.notebook.notebook_id());
        if let Some(reply) = close_reply {
            let _ = reply.send(self.notebook);
        }
    }

    async fn handle(&mut self, command: HostCommand) {
        match command {
            HostCommand::AddCell {
                kind,
                content,
                index,
                reply,
            } => {
                let _ = reply.send(self.notebook.add_cell(kind, content, index));
            }
            HostCommand::EditCell {
                cell_id,
                content,
                reply,
            } => {
                let _ = reply.send(self.notebook.edit_cell(cell_id, content).await);
            }
            HostCommand::DeleteCell { cell_id, reply } => {
                let result = self.notebook.delete_cell(cell_id, EditOrigin::Local);
                if result.is_ok() {
                    self.forget_cell(cell_id);
                }
                let _ = reply.send(result);
            }
            HostCommand::SetTestFlag {
                cell_id,
                is_test,
                reply,
            } => {
                let result = match self.notebook.set_test_flag(cell_id, is_test) {
                    Ok(Reaction::RunDependents(root)) => self.notebook.run_cell(root).await.map(Some),
                    Ok(Reaction::None) => Ok(None),
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            HostCommand::Run { kind, reply } => {
                let _ = reply.send(self.notebook.run(kind).await);
            }
            HostCommand::Cursor {
                cell_id,
                cursor_pos,
                selection_end,
                reply,
            } => {
                let _ = reply.send(self.notebook.send_cursor(cell_id, cursor_pos, selection_end));
            }
            HostCommand::Save { path, reply } => {
                let result = match path {
                    Some(path) => self.notebook.save_as(path),
                    None => self.notebook.save(),
                };
                let _ = reply.send(result);
            }
            HostCommand::Snapshot { reply } => {
                let _ = reply.send(NotebookSnapshot::capture(&self.notebook));
            }
            HostCommand::Presence { reply } => {
                let mut cursors = self.presence.values().cloned().collect::<Vec<_>>();
                cursors.sort_by(|left, right| left.client_id.cmp(&right.client_id));
                let _ = reply.send(cursors);
            }
            HostCommand::Close { .. } => {}
        }
    }

    fn apply_remote(&mut self, msg: CollabMsg) {
        let kind = msg.kind();
        let cell_id = msg.cell_id();
        let deleted = matches!(msg, CollabMsg::DeleteCell { .. });
        match self.notebook.apply_remote(msg) {
            Ok(()) => {
                debug!(event = "remote_edit_applied", kind, cell_id = %cell_id);
                if deleted {
                    self.forget_cell(cell_id);
                }
            }
            Err(err) => warn!(event = "remote_edit_rejected", kind, cell_id = %cell_id, error = %err),
        }
    }

    fn record_presence(&mut self, update: PresenceUpdate) {
        if self.notebook.cell(update.cell_id).is_none() {
            debug!(event = "presence_unknown_cell", client_id = %update.client_id, cell_id = %update.cell_id);
            return;
        }
        self.presence.insert(update.client_id.clone(), update);
    }

    fn forget_cell(&mut self, cell_id: CellId) {
        self.presence.retain(|_, cursor| cursor.cell_id != cell_id);
    }
}

async fn recv_from<T>(receiver: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl HostHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HostCommand) -> Result<T, NotebookError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| NotebookError::HostStopped)?;
        reply_rx.await.map_err(|_| NotebookError::HostStopped)
    }

    pub async fn add_cell(
        &self,
        kind: CellKind,
        content: impl Into<String>,
        index: Option<usize>,
    ) -> Result<CellId, NotebookError> {
        let content = content.into();
        self.request(|reply| HostCommand::AddCell {
            kind,
            content,
            index,
            reply,
        })
        .await?
    }

    pub async fn edit_cell(
        &self,
        cell_id: CellId,
        content: impl Into<String>,
    ) -> Result<Option<RunReport>, NotebookError> {
        let content = content.into();
        self.request(|reply| HostCommand::EditCell {
            cell_id,
            content,
            reply,
        })
        .await?
    }

    pub async fn delete_cell(&self, cell_id: CellId) -> Result<(), NotebookError> {
        self.request(|reply| HostCommand::DeleteCell { cell_id, reply })
            .await?
    }

    pub async fn set_test_flag(&self, cell_id: CellId, is_test: bool) -> Result<Option<RunReport>, NotebookError> {
        self.request(|reply| HostCommand::SetTestFlag {
            cell_id,
            is_test,
            reply,
        })
        .await?
    }

    pub async fn run(&self, kind: RunKind) -> Result<RunReport, NotebookError> {
        self.request(|reply| HostCommand::Run { kind, reply }).await?
    }

    pub async fn send_cursor(
        &self,
        cell_id: CellId,
        cursor_pos: usize,
        selection_end: usize,
    ) -> Result<(), NotebookError> {
        self.request(|reply| HostCommand::Cursor {
            cell_id,
            cursor_pos,
            selection_end,
            reply,
        })
        .await?
    }

    pub async fn save(&self, path: Option<PathBuf>) -> Result<(), NotebookError> {
        self.request(|reply| HostCommand::Save { path, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<NotebookSnapshot, NotebookError> {
        self.request(|reply| HostCommand::Snapshot { reply }).await
    }

    pub async fn presence(&self) -> Result<Vec<PresenceUpdate>, NotebookError> {
        self.request(|reply| HostCommand::Presence { reply }).await
    }

    /// `None` when the notebook is not collaborating.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.status.as_ref().map(|status| *status.borrow())
    }

    /// Aborts any in-flight kernel wait, then tears the notebook down once
    /// the host reaches this request and hands it back.
    pub async fn close(self) -> Result<Notebook, NotebookError> {
        self.close.close();
        self.request(|reply| HostCommand::Close { reply }).await
    }
}
