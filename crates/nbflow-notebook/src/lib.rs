use nbflow_collab::CollabError;
use nbflow_core::document::DocumentError;
use nbflow_core::CellId;
use nbflow_deps::GraphError;
use nbflow_kernel::KernelError;
use thiserror::Error;

pub mod assist;
pub mod host;
pub mod notebook;
pub mod scheduler;

pub use assist::{AssistError, ChatMessage, ChatModel, ChatRole};
pub use host::{HostHandle, NotebookHost, NotebookSnapshot};
pub use notebook::{Cell, CloseHandle, EditOrigin, Notebook, Reaction};
pub use scheduler::{plan, CellRun, RunKind, RunReport};

#[derive(Debug, Error)]
pub enum NotebookError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Collab(#[from] CollabError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("unknown cell {0}")]
    UnknownCell(CellId),
    #[error("cell {0} already exists")]
    DuplicateCell(CellId),
    #[error("cell {0} is not a code cell")]
    NotCode(CellId),
    #[error("notebook has no document path")]
    NoPath,
    #[error("notebook is closed")]
    Closed,
    #[error("notebook host stopped")]
    HostStopped,
}
