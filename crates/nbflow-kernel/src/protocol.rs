use nbflow_core::{OutputKind, OutputRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelRequest {
    pub msg_id: String,
    #[serde(flatten)]
    pub body: RequestBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum RequestBody {
    ExecuteRequest { code: String },
    KernelInfoRequest,
    ShutdownRequest,
}

impl KernelRequest {
    pub fn execute(code: impl Into<String>) -> Self {
        Self::with_body(RequestBody::ExecuteRequest { code: code.into() })
    }

    pub fn kernel_info() -> Self {
        Self::with_body(RequestBody::KernelInfoRequest)
    }

    pub fn shutdown() -> Self {
        Self::with_body(RequestBody::ShutdownRequest)
    }

    fn with_body(body: RequestBody) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            body,
        }
    }
}

/// One reply from the backend, tagged with the `msg_id` of the request it answers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelMessage {
    pub correlation_id: String,
    #[serde(flatten)]
    pub event: KernelEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum KernelEvent {
    Status {
        execution_state: ExecutionState,
    },
    Stream {
        text: String,
    },
    DisplayData {
        text: String,
    },
    ExecuteResult {
        text: String,
    },
    Error {
        #[serde(default)]
        ename: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
    #[serde(other)]
    Unknown,
}

impl KernelEvent {
    pub fn idle() -> Self {
        KernelEvent::Status {
            execution_state: ExecutionState::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            KernelEvent::Status {
                execution_state: ExecutionState::Idle
            }
        )
    }

    /// Maps output-bearing events to a record; status events carry none.
    pub fn into_output(self) -> Option<OutputRecord> {
        match self {
            KernelEvent::Status { .. } => None,
            KernelEvent::Stream { text } => Some(OutputRecord::new(OutputKind::Stdout, text)),
            KernelEvent::DisplayData { text } => Some(OutputRecord::new(OutputKind::Display, text)),
            KernelEvent::ExecuteResult { text } => Some(OutputRecord::new(OutputKind::Result, text)),
            KernelEvent::Error { ename, traceback } => {
                let text = if traceback.is_empty() {
                    ename
                } else {
                    traceback.join("\n")
                };
                Some(OutputRecord::new(OutputKind::Error, text))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KernelEvent::Status { .. } => "status",
            KernelEvent::Stream { .. } => "stream",
            KernelEvent::DisplayData { .. } => "display_data",
            KernelEvent::ExecuteResult { .. } => "execute_result",
            KernelEvent::Error { .. } => "error",
        }
    }
}
