use nbflow_core::document::{DocumentCell, DocumentError, NotebookDocument};
use nbflow_core::settings::Settings;
use nbflow_core::CellKind;
use nbflow_kernel::ScriptedLauncher;
use nbflow_notebook::{EditOrigin, Notebook, NotebookError};
use std::sync::Arc;

fn launcher() -> Arc<ScriptedLauncher> {
    Arc::new(ScriptedLauncher::quiet())
}

#[test]
fn save_then_load_reproduces_cells_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("analysis.nbflow.json");

    let mut original = Notebook::new("nb-docs", Settings::default(), launcher());
    original.add_cell(CellKind::Markdown, "# Loading", None).expect("add");
    let data = original.add_cell(CellKind::Code, "rows = load()", None).expect("add");
    original.add_cell(CellKind::Code, "#| test\nassert rows", None).expect("add");
    original.add_cell(CellKind::Code, "import csv", Some(1)).expect("add");
    assert!(original.is_dirty());

    original.save_as(&path).expect("save");
    assert!(!original.is_dirty());
    assert_eq!(original.path(), Some(path.as_path()));

    let reopened = Notebook::open(&path, "nb-docs", Settings::default(), launcher()).expect("open");
    assert!(!reopened.is_dirty());
    assert_eq!(reopened.to_document(), original.to_document());
    let kinds = reopened.cells().map(|cell| cell.kind()).collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![CellKind::Markdown, CellKind::Code, CellKind::Code, CellKind::Code]
    );
    // Ids are not persisted.
    assert!(reopened.cell(data).is_none());
    assert!(reopened.cell_at(3).expect("test cell").is_test());
}

#[test]
fn loading_rebuilds_the_graph_from_the_document() {
    let document = NotebookDocument::new(vec![
        DocumentCell::new(CellKind::Code, "x = 1"),
        DocumentCell::new(CellKind::Code, "y = x * 2"),
    ]);
    let mut nb = Notebook::new("nb-docs", Settings::default(), launcher());
    nb.add_cell(CellKind::Code, "stale = True", None).expect("add");
    nb.load_document(document);

    assert_eq!(nb.len(), 2);
    let producer = nb.cell_at(0).expect("producer").id();
    let consumer = nb.cell_at(1).expect("consumer").id();
    assert!(nb.dependency_graph().has_edge(producer, consumer));
    assert_eq!(nb.dependency_graph().node_count(), 2);
}

#[test]
fn save_without_a_path_is_an_error() {
    let mut nb = Notebook::new("nb-docs", Settings::default(), launcher());
    assert!(matches!(nb.save(), Err(NotebookError::NoPath)));
}

#[test]
fn newer_document_versions_are_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("future.json");
    std::fs::write(&path, r#"{"version": "2.0", "cells": []}"#).expect("write");

    let err = Notebook::open(&path, "nb-docs", Settings::default(), launcher())
        .err()
        .expect("version error");
    assert!(matches!(
        err,
        NotebookError::Document(DocumentError::UnsupportedVersion(version)) if version == "2.0"
    ));
}

#[test]
fn export_names_the_saved_document_and_skips_tests() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("report.json");
    let script = dir.path().join("report.py");

    let mut nb = Notebook::new("nb-docs", Settings::default(), launcher());
    let first = nb.add_cell(CellKind::Code, "a = 1", None).expect("add");
    nb.add_cell(CellKind::Code, "b = a + 1", None).expect("add");
    nb.add_cell(CellKind::Code, "#| test\nassert b == 2", None).expect("add");
    nb.save_as(&path).expect("save");
    nb.delete_cell(first, EditOrigin::Local).expect("delete");

    nb.export_to(&script).expect("export");
    let exported = std::fs::read_to_string(&script).expect("read export");
    assert_eq!(exported, "# --- Exported from report.json ---\n\nb = a + 1");
    assert!(nb.is_dirty());
}
