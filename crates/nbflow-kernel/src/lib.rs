use std::io;
use std::time::Duration;
use thiserror::Error;

pub mod process;
pub mod protocol;
pub mod scripted;
pub mod session;

pub use process::ProcessLauncher;
pub use protocol::{ExecutionState, KernelEvent, KernelMessage, KernelRequest, RequestBody};
pub use scripted::{ScriptedLauncher, ScriptedReply};
pub use session::KernelSession;

use tokio::process::Child;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("failed to spawn kernel: {0}")]
    Spawn(#[from] io::Error),
    #[error("kernel command is empty")]
    EmptyCommand,
    #[error("kernel did not become ready within {0:?}")]
    NotReady(Duration),
    #[error("kernel is not running")]
    Unavailable,
    #[error("kernel start cancelled")]
    Cancelled,
}

/// Transport to one running kernel backend.
pub struct KernelChannels {
    pub requests: mpsc::Sender<KernelRequest>,
    pub replies: mpsc::Receiver<KernelMessage>,
    /// Present when the backend is a child process owned by the session.
    pub process: Option<Child>,
}

/// Starts a kernel backend. Called from within a tokio runtime.
pub trait KernelLauncher: Send + Sync {
    fn launch(&self) -> Result<KernelChannels, KernelError>;
}
