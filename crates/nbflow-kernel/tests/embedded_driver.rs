use nbflow_core::settings::KernelSettings;
use nbflow_core::{ExecutionResult, ExecutionStatus, OutputKind};
use nbflow_kernel::{KernelSession, ProcessLauncher};
use tokio::sync::watch;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn settings() -> KernelSettings {
    KernelSettings {
        command: Vec::new(),
        ready_timeout_secs: 10,
        idle_timeout_secs: 10,
        shutdown_timeout_secs: 2,
    }
}

fn text_of(result: &ExecutionResult, kind: OutputKind) -> String {
    result
        .outputs
        .iter()
        .filter(|output| output.kind == kind)
        .map(|output| output.text.as_str())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn python_driver_keeps_state_and_reports_every_output_kind() {
    if !python_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    let (_close_tx, close_rx) = watch::channel(false);
    let session = KernelSession::start(&ProcessLauncher::embedded_python(), settings(), close_rx)
        .await
        .expect("kernel ready");

    let defined = session.execute("x = 21\nprint('set', x)").await;
    assert_eq!(defined.status, ExecutionStatus::Completed);
    assert_eq!(text_of(&defined, OutputKind::Stdout), "set 21\n");

    let result = session.execute("x * 2").await;
    assert_eq!(text_of(&result, OutputKind::Result), "42");

    let shown = session.execute("display([x])\nNone").await;
    assert_eq!(text_of(&shown, OutputKind::Display), "[21]");
    assert!(text_of(&shown, OutputKind::Result).is_empty());

    let failed = session.execute("1 / 0").await;
    assert_eq!(failed.status, ExecutionStatus::Completed);
    assert!(failed.has_error());
    let traceback = text_of(&failed, OutputKind::Error);
    assert!(traceback.contains("Traceback"));
    assert!(traceback.contains("ZeroDivisionError"));

    let after_error = session.execute("x").await;
    assert_eq!(text_of(&after_error, OutputKind::Result), "21");

    session.shutdown().await;
    assert!(!session.is_alive());
}
