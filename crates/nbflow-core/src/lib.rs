use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use uuid::Uuid;

pub mod collab_wire;
pub mod document;
pub mod frame;
pub mod logging;
pub mod settings;

/// Leading marker that flags a code cell as a test cell.
pub const TEST_MARKER: &str = "#| test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(Uuid);

impl CellId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CellId {
    type Err = uuid::Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(input.trim()).map(CellId)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    #[serde(alias = "prose")]
    Markdown,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self, CellKind::Code)
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "code" => Ok(CellKind::Code),
            "markdown" | "prose" | "md" => Ok(CellKind::Markdown),
            other => Err(format!("Unknown cell kind: {other}")),
        }
    }
}

pub fn is_test_content(content: &str) -> bool {
    content.trim_start().starts_with(TEST_MARKER)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Display,
    Result,
    Error,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Stdout => "stdout",
            OutputKind::Display => "display",
            OutputKind::Result => "result",
            OutputKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputRecord {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub text: String,
}

impl OutputRecord {
    pub fn new(kind: OutputKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == OutputKind::Error
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Cancelled,
    KernelUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub outputs: Vec<OutputRecord>,
}

impl ExecutionResult {
    pub fn completed(outputs: Vec<OutputRecord>) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            outputs,
        }
    }

    pub fn kernel_unavailable() -> Self {
        Self {
            status: ExecutionStatus::KernelUnavailable,
            outputs: vec![OutputRecord::new(
                OutputKind::Error,
                "Kernel is not running.",
            )],
        }
    }

    pub fn has_error(&self) -> bool {
        self.outputs.iter().any(OutputRecord::is_error)
    }

    /// A test cell passes when it ran to completion without an error record.
    pub fn is_pass(&self) -> bool {
        self.status == ExecutionStatus::Completed && !self.has_error()
    }
}

/// Resolves once the watched flag flips to `true`. A dropped sender never resolves.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_marker_ignores_leading_whitespace() {
        assert!(is_test_content("#| test\nassert 1 == 1"));
        assert!(is_test_content("\n   #| test\nassert True"));
        assert!(!is_test_content("x = 1\n#| test"));
        assert!(!is_test_content(""));
    }

    #[test]
    fn cell_kind_accepts_prose_alias() {
        let kind: CellKind = serde_json::from_str("\"prose\"").expect("parse prose");
        assert_eq!(kind, CellKind::Markdown);
        assert_eq!(serde_json::to_string(&kind).expect("encode"), "\"markdown\"");
        assert_eq!("Code".parse::<CellKind>(), Ok(CellKind::Code));
        assert!("sql".parse::<CellKind>().is_err());
    }

    #[test]
    fn pass_requires_completion_and_no_error_record() {
        let clean = ExecutionResult::completed(vec![OutputRecord::new(OutputKind::Stdout, "ok\n")]);
        assert!(clean.is_pass());

        let failed = ExecutionResult::completed(vec![OutputRecord::new(
            OutputKind::Error,
            "AssertionError",
        )]);
        assert!(!failed.is_pass());

        let partial = ExecutionResult {
            status: ExecutionStatus::TimedOut,
            outputs: Vec::new(),
        };
        assert!(!partial.is_pass());

        let dead = ExecutionResult::kernel_unavailable();
        assert!(dead.has_error());
        assert_eq!(dead.outputs[0].text, "Kernel is not running.");
    }

    #[test]
    fn output_record_uses_type_tag() {
        let record = OutputRecord::new(OutputKind::Display, "<Figure>");
        let encoded = serde_json::to_value(&record).expect("encode");
        assert_eq!(encoded, serde_json::json!({"type": "display", "text": "<Figure>"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_requested_wakes_on_flip() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move {
            shutdown_requested(&mut rx).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timeout")
            .expect("join waiter");
    }
}
