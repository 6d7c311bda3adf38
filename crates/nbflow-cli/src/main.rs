use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nbflow_core::logging::{init_logging, LogConfig};
use nbflow_core::settings::{env_value, Settings};
use nbflow_core::{CellId, ExecutionStatus};
use nbflow_deps::GraphError;
use nbflow_notebook::{Notebook, NotebookHost, RunReport};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nbflow")]
#[command(about = "Reactive notebook runtime", long_about = None)]
struct Cli {
    /// Settings file; defaults to the per-user config directory.
    #[arg(long, global = true, default_value = "")]
    settings: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every code cell, or one cell and everything that depends on it
    Run {
        document: PathBuf,
        /// Zero-based cell index
        #[arg(long)]
        cell: Option<usize>,
    },
    /// Run the test cells and summarize
    Test { document: PathBuf },
    /// Print execution order and dependency edges
    Graph { document: PathBuf },
    /// Write the non-test code cells as a single script
    Export {
        document: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Join a collaboration room and mirror its edits into the document
    Sync {
        document: PathBuf,
        #[arg(long)]
        notebook_id: String,
        #[arg(long, default_value = "")]
        collab_uri: String,
    },
}

fn resolve_settings(settings_flag: &str) -> Settings {
    let path = if settings_flag.trim().is_empty() {
        Settings::default_path()
    } else {
        Some(PathBuf::from(settings_flag))
    };
    path.map(Settings::load)
        .unwrap_or_default()
        .with_env_overrides()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value("NBFLOW_LOG_DIR").unwrap_or_default()
}

fn resolve_collab_uri(uri_flag: &str, settings: &Settings) -> String {
    if !uri_flag.trim().is_empty() {
        return uri_flag.trim().to_string();
    }
    settings.collab_server_uri.clone()
}

fn notebook_id_for(document: &Path) -> String {
    document
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "notebook".to_string())
}

fn open_notebook(document: &Path, notebook_id: String, settings: Settings) -> Result<Notebook> {
    let mut notebook = Notebook::with_process_kernel(notebook_id, settings);
    notebook
        .load(document)
        .with_context(|| format!("failed to load {}", document.display()))?;
    Ok(notebook)
}

fn status_label(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Completed => "ok",
        ExecutionStatus::TimedOut => "timed out",
        ExecutionStatus::Cancelled => "cancelled",
        ExecutionStatus::KernelUnavailable => "kernel unavailable",
    }
}

fn label(notebook: &Notebook, cell_id: CellId) -> String {
    match notebook.position_of(cell_id) {
        Some(index) => format!("[{index}]"),
        None => format!("[{cell_id}]"),
    }
}

fn print_report(notebook: &Notebook, report: &RunReport) {
    for run in &report.runs {
        let status = if run.result.has_error() {
            "error"
        } else {
            status_label(run.result.status)
        };
        println!("{} {}", label(notebook, run.cell_id), status);
        for output in &run.result.outputs {
            for line in output.text.trim_end_matches('\n').lines() {
                println!("    {}| {line}", output.kind.as_str());
            }
        }
    }
}

async fn run_command(document: &Path, cell: Option<usize>, settings: Settings) -> Result<()> {
    let mut notebook = open_notebook(document, notebook_id_for(document), settings)?;
    let outcome = match cell {
        Some(index) => match notebook.cell_at(index).map(|cell| cell.id()) {
            Some(cell_id) => notebook.run_cell(cell_id).await,
            None => {
                notebook.close().await;
                bail!("no cell at index {index}");
            }
        },
        None => notebook.run_all().await,
    };
    notebook.close().await;
    let report = outcome.context("run aborted")?;
    print_report(&notebook, &report);
    Ok(())
}

/// Returns whether every test passed.
async fn test_command(document: &Path, settings: Settings) -> Result<bool> {
    let mut notebook = open_notebook(document, notebook_id_for(document), settings)?;
    let outcome = notebook.run_tests().await;
    notebook.close().await;
    let report = outcome.context("test run aborted")?;
    if report.is_empty() {
        println!("no tests");
        return Ok(true);
    }
    for run in &report.runs {
        let verdict = if run.result.is_pass() { "PASS" } else { "FAIL" };
        println!("{verdict} {}", label(&notebook, run.cell_id));
        if !run.result.is_pass() {
            for output in run.result.outputs.iter().filter(|output| output.is_error()) {
                println!("    {}", output.text.trim_end().replace('\n', "\n    "));
            }
            if run.result.status != ExecutionStatus::Completed {
                println!("    {}", status_label(run.result.status));
            }
        }
    }
    println!("{} / {} passed", report.passed(), report.total());
    Ok(report.all_passed())
}

fn graph_command(document: &Path, settings: Settings) -> Result<()> {
    let notebook = open_notebook(document, notebook_id_for(document), settings)?;
    let graph = notebook.dependency_graph();

    for (producer, consumer) in graph.edges() {
        let symbols = notebook
            .cell(consumer)
            .map(|cell| {
                cell.used_symbols()
                    .iter()
                    .filter(|symbol| graph.definer_of(symbol) == Some(producer))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        println!(
            "{} -> {}  {}",
            label(&notebook, producer),
            label(&notebook, consumer),
            symbols.join(", ")
        );
    }

    match graph.topological_order(None) {
        Ok(order) => {
            let order = order
                .into_iter()
                .filter(|id| notebook.cell(*id).is_some_and(|cell| cell.is_code()))
                .map(|id| label(&notebook, id))
                .collect::<Vec<_>>();
            println!("order: {}", order.join(" "));
            Ok(())
        }
        Err(GraphError::CycleDetected { cells }) => {
            let cells = cells
                .into_iter()
                .map(|id| label(&notebook, id))
                .collect::<Vec<_>>();
            bail!("dependency cycle between cells {}", cells.join(" "))
        }
    }
}

fn export_command(document: &Path, out: Option<&Path>, settings: Settings) -> Result<()> {
    let notebook = open_notebook(document, notebook_id_for(document), settings)?;
    match out {
        Some(path) => {
            notebook
                .export_to(path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(event = "exported", path = %path.display());
        }
        None => print!("{}", notebook.export_script()),
    }
    Ok(())
}

async fn sync_command(document: &Path, notebook_id: String, collab_uri: &str, mut settings: Settings) -> Result<()> {
    settings.collab_server_uri = resolve_collab_uri(collab_uri, &settings);
    let notebook = open_notebook(document, notebook_id.clone(), settings)?;
    let host = NotebookHost::start(notebook, true).context("failed to join collaboration room")?;
    info!(event = "sync_started", notebook_id = %notebook_id, document = %document.display());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(event = "sync_shutdown_requested", status = ?host.connection_status());

    host.save(None).await.context("failed to save document")?;
    let notebook = host.close().await.context("failed to close notebook")?;
    info!(event = "sync_stopped", notebook_id = %notebook_id, cells = notebook.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&LogConfig {
        component: "nbflow".to_string(),
        debug: cli.debug,
        log_dir: resolve_log_dir(&cli.log_dir),
        stderr: true,
    });
    let settings = resolve_settings(&cli.settings);

    match cli.command {
        Commands::Run { document, cell } => run_command(&document, cell, settings).await,
        Commands::Test { document } => {
            if !test_command(&document, settings).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Graph { document } => graph_command(&document, settings),
        Commands::Export { document, out } => export_command(&document, out.as_deref(), settings),
        Commands::Sync {
            document,
            notebook_id,
            collab_uri,
        } => sync_command(&document, notebook_id, &collab_uri, settings).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_parse_with_global_flags() {
        let cli = Cli::try_parse_from(["nbflow", "run", "nb.json", "--cell", "2", "--debug"]).expect("parse run");
        assert!(cli.debug);
        match cli.command {
            Commands::Run { document, cell } => {
                assert_eq!(document, PathBuf::from("nb.json"));
                assert_eq!(cell, Some(2));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["nbflow", "sync", "nb.json", "--notebook-id", "team-nb"]).expect("parse sync");
        match cli.command {
            Commands::Sync {
                notebook_id,
                collab_uri,
                ..
            } => {
                assert_eq!(notebook_id, "team-nb");
                assert!(collab_uri.is_empty());
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["nbflow", "sync", "nb.json"]).is_err());
    }

    #[test]
    fn collab_uri_flag_wins_over_settings() {
        let settings = Settings::default();
        assert_eq!(resolve_collab_uri("", &settings), settings.collab_server_uri);
        assert_eq!(resolve_collab_uri(" ws://relay:9000 ", &settings), "ws://relay:9000");
    }

    #[test]
    fn notebook_id_comes_from_the_file_stem() {
        assert_eq!(notebook_id_for(Path::new("/tmp/sales.nbflow")), "sales");
        assert_eq!(notebook_id_for(Path::new("/")), "notebook");
    }

    #[test]
    fn explicit_settings_file_is_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"auto_run_dependents": false, "chat_model": "local/tiny"}"#).expect("write");
        let settings = resolve_settings(&path.display().to_string());
        assert!(!settings.auto_run_dependents);
        assert_eq!(settings.chat_model, "local/tiny");
    }

    #[test]
    fn graph_and_export_work_without_a_kernel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let document = dir.path().join("flow.json");
        std::fs::write(
            &document,
            r#"{"version": "1.0", "cells": [
                {"type": "code", "content": "a = 1"},
                {"type": "code", "content": "b = a + 1"},
                {"type": "code", "content": "a = b"}
            ]}"#,
        )
        .expect("write");

        let err = graph_command(&document, Settings::default()).expect_err("cycle");
        assert!(err.to_string().contains("dependency cycle"));

        let out = dir.path().join("flow.py");
        export_command(&document, Some(&out), Settings::default()).expect("export");
        let script = std::fs::read_to_string(&out).expect("read");
        assert!(script.starts_with("# --- Exported from flow.json ---"));
        assert!(script.ends_with("a = b"));
    }
}
