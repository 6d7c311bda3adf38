use nbflow_core::collab_wire::CollabMsg;
use nbflow_core::settings::Settings;
use nbflow_core::{CellId, CellKind, ExecutionStatus, OutputKind};
use nbflow_deps::GraphError;
use nbflow_kernel::{KernelEvent, ScriptedLauncher, ScriptedReply};
use nbflow_notebook::{EditOrigin, Notebook, NotebookError, RunKind};
use std::sync::Arc;

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.kernel.ready_timeout_secs = 1;
    settings.kernel.idle_timeout_secs = 1;
    settings.kernel.shutdown_timeout_secs = 1;
    settings
}

/// Prints what it ran; code containing `raise` fails with a traceback.
fn echo_launcher() -> ScriptedLauncher {
    ScriptedLauncher::new(|code| {
        if code.contains("raise") {
            ScriptedReply::Events(vec![KernelEvent::Error {
                ename: "ValueError".to_string(),
                traceback: vec![
                    "Traceback (most recent call last):".to_string(),
                    "ValueError: boom".to_string(),
                ],
            }])
        } else {
            ScriptedReply::Events(vec![KernelEvent::Stream {
                text: format!("ran {code}\n"),
            }])
        }
    })
}

fn notebook_with(launcher: &ScriptedLauncher, settings: Settings) -> Notebook {
    Notebook::new("nb-runs", settings, Arc::new(launcher.clone()))
}

fn add_code(nb: &mut Notebook, source: &str) -> CellId {
    nb.add_cell(CellKind::Code, source, None).expect("add code cell")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shadowed_definer_feeds_the_reader() {
    let launcher = echo_launcher();
    let mut nb = notebook_with(&launcher, fast_settings());
    let a = add_code(&mut nb, "x = 1");
    let b = add_code(&mut nb, "x = 2");
    let c = add_code(&mut nb, "print(x)");

    let graph = nb.dependency_graph();
    assert!(graph.has_edge(b, c));
    assert!(!graph.has_edge(a, c));

    let report = nb.run_cell(b).await.expect("run b");
    assert_eq!(report.executed(), vec![b, c]);
    assert!(launcher.executed().iter().all(|code| code != "x = 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cell_run_executes_only_the_cell_and_its_dependents() {
    let launcher = echo_launcher();
    let mut nb = notebook_with(&launcher, fast_settings());
    add_code(&mut nb, "a = 1");
    let b = add_code(&mut nb, "b = a + 1");
    add_code(&mut nb, "c = b * 2");
    add_code(&mut nb, "d = a - 1");

    let report = nb.run_cell(b).await.expect("run b");
    assert_eq!(report.total(), 2);
    assert_eq!(launcher.executed(), vec!["b = a + 1".to_string(), "c = b * 2".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_all_follows_dependencies_not_document_order() {
    let launcher = echo_launcher();
    let mut nb = notebook_with(&launcher, fast_settings());
    add_code(&mut nb, "total = base * 2");
    nb.add_cell(CellKind::Markdown, "base is defined below", None).expect("prose");
    add_code(&mut nb, "base = 21");

    let report = nb.run_all().await.expect("run all");
    assert_eq!(report.total(), 2);
    assert_eq!(
        launcher.executed(),
        vec!["base = 21".to_string(), "total = base * 2".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycle_aborts_before_anything_executes() {
    let launcher = echo_launcher();
    let mut nb = notebook_with(&launcher, fast_settings());
    let a = add_code(&mut nb, "a = b + 1");
    let b = add_code(&mut nb, "b = a + 1");
    add_code(&mut nb, "c = 3");

    match nb.run_all().await {
        Err(NotebookError::Graph(GraphError::CycleDetected { cells })) => assert_eq!(cells, vec![a, b]),
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(nb.run_cell(a).await.is_err());
    assert!(launcher.executed().is_empty());
    assert_eq!(launcher.launches(), 0);

    // Breaking the cycle makes the notebook runnable again.
    nb.update_cell(b, "b = 5", EditOrigin::Local).expect("fix");
    assert_eq!(nb.run_all().await.expect("run all").total(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_cell_does_not_stop_the_queue_and_outputs_are_replaced() {
    let launcher = echo_launcher();
    let mut nb = notebook_with(&launcher, fast_settings());
    let a = add_code(&mut nb, "a = 1");
    let b = add_code(&mut nb, "if a: raise ValueError('boom')");
    let c = add_code(&mut nb, "c = a + 1");

    let report = nb.run_all().await.expect("run all");
    assert_eq!(report.total(), 3);
    assert_eq!(report.failed(), vec![b]);

    let failed = nb.cell(b).expect("b");
    assert_eq!(failed.outputs().len(), 1);
    assert_eq!(failed.outputs()[0].kind, OutputKind::Error);
    assert!(failed.outputs()[0].text.ends_with("ValueError: boom"));
    assert_eq!(nb.cell(c).expect("c").last_status(), Some(ExecutionStatus::Completed));

    nb.run_cell(a).await.expect("rerun");
    let outputs = nb.cell(a).expect("a").outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].text, "ran a = 1\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_edit_reruns_dependents_and_remote_edit_runs_nothing() {
    let launcher = echo_launcher();
    let mut nb = notebook_with(&launcher, fast_settings());
    let a = add_code(&mut nb, "x = 1");
    add_code(&mut nb, "y = x + 1");

    let report = nb.edit_cell(a, "x = 10").await.expect("edit").expect("reactive run");
    assert_eq!(report.kind, RunKind::CellAndDependents(a));
    assert_eq!(launcher.executed(), vec!["x = 10".to_string(), "y = x + 1".to_string()]);

    nb.apply_remote(CollabMsg::CellUpdate {
        cell_id: a,
        content: "x = 99".to_string(),
    })
    .expect("remote update");
    assert_eq!(nb.cell(a).expect("a").content(), "x = 99");
    assert_eq!(launcher.executed().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_reports_passes_in_document_order() {
    let launcher = echo_launcher();
    let mut nb = notebook_with(&launcher, fast_settings());
    let passing = add_code(&mut nb, "#| test\nassert True");
    add_code(&mut nb, "value = 3");
    let failing = add_code(&mut nb, "#| test\nraise AssertionError()");

    let report = nb.run_tests().await.expect("tests");
    assert_eq!(report.executed(), vec![passing, failing]);
    assert_eq!((report.passed(), report.total()), (1, 2));
    assert!(!report.all_passed());

    let empty = Notebook::new("nb-empty", fast_settings(), Arc::new(launcher.clone()))
        .run_tests()
        .await
        .expect("no tests");
    assert!(empty.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_test_flag_moves_a_cell_in_and_out_of_test_runs() {
    let launcher = echo_launcher();
    let mut settings = fast_settings();
    settings.auto_run_dependents = false;
    let mut nb = notebook_with(&launcher, settings);
    let cell = add_code(&mut nb, "assert 1 + 1 == 2");

    assert!(nb.run_tests().await.expect("tests").is_empty());
    nb.set_test_flag(cell, true).expect("flag");
    assert!(nb.cell(cell).expect("cell").is_test());
    assert_eq!(nb.run_tests().await.expect("tests").executed(), vec![cell]);

    nb.set_test_flag(cell, false).expect("unflag");
    assert_eq!(nb.cell(cell).expect("cell").content(), "assert 1 + 1 == 2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_kernel_yields_partial_output_without_failing_the_run() {
    let launcher = ScriptedLauncher::new(|code| {
        if code.starts_with("slow") {
            ScriptedReply::Hang(vec![KernelEvent::Stream {
                text: "halfway\n".to_string(),
            }])
        } else {
            ScriptedReply::Events(Vec::new())
        }
    });
    let mut nb = notebook_with(&launcher, fast_settings());
    let slow = add_code(&mut nb, "slow = compute()");
    let after = add_code(&mut nb, "done = slow");

    let report = nb.run_all().await.expect("run all");
    let partial = report.result_for(slow).expect("slow result");
    assert_eq!(partial.status, ExecutionStatus::TimedOut);
    assert_eq!(partial.outputs[0].text, "halfway\n");
    assert_eq!(
        report.result_for(after).expect("after result").status,
        ExecutionStatus::Completed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kernel_that_never_becomes_ready_is_not_retried() {
    let launcher = ScriptedLauncher::quiet().unresponsive();
    let mut nb = notebook_with(&launcher, fast_settings());
    let cell = add_code(&mut nb, "x = 1");

    let report = nb.run_all().await.expect("run all");
    let result = report.result_for(cell).expect("result");
    assert_eq!(result.status, ExecutionStatus::KernelUnavailable);
    assert_eq!(result.outputs[0].text, "Kernel is not running.");
    assert!(!nb.kernel_ready());

    nb.run_all().await.expect("second run");
    assert_eq!(launcher.launches(), 1);

    assert!(nb.restart_kernel().await.is_err());
    assert_eq!(launcher.launches(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closed_notebook_refuses_runs() {
    let launcher = echo_launcher();
    let mut nb = notebook_with(&launcher, fast_settings());
    add_code(&mut nb, "x = 1");
    nb.run_all().await.expect("run");
    assert!(nb.kernel_ready());

    nb.close().await;
    assert!(nb.is_closed());
    assert!(!nb.kernel_ready());
    assert!(matches!(nb.run_all().await, Err(NotebookError::Closed)));
}
