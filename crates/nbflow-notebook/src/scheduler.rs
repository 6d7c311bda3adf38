use nbflow_core::{CellId, ExecutionResult};
use nbflow_deps::{DependencyGraph, GraphError};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "cell_id", rename_all = "snake_case")]
pub enum RunKind {
    All,
    CellAndDependents(CellId),
    Tests,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::All => "all",
            RunKind::CellAndDependents(_) => "cell_and_dependents",
            RunKind::Tests => "tests",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the planner needs to know about one cell, in document order.
#[derive(Debug, Clone, Copy)]
pub struct PlanCell {
    pub id: CellId,
    pub is_code: bool,
    pub is_test: bool,
}

/// Orders the cells a run will execute. Graph-driven runs fail on a cycle
/// before anything executes; test runs follow document order.
pub fn plan(kind: RunKind, graph: &DependencyGraph, cells: &[PlanCell]) -> Result<Vec<CellId>, GraphError> {
    let is_code = |id: &CellId| cells.iter().any(|cell| cell.id == *id && cell.is_code);
    match kind {
        RunKind::All => Ok(graph
            .topological_order(None)?
            .into_iter()
            .filter(is_code)
            .collect()),
        RunKind::CellAndDependents(root) => {
            if !graph.contains(root) {
                return Ok(Vec::new());
            }
            let mut subset = graph.descendants(root);
            subset.insert(root);
            Ok(graph
                .topological_order(Some(&subset))?
                .into_iter()
                .filter(is_code)
                .collect())
        }
        RunKind::Tests => Ok(cells
            .iter()
            .filter(|cell| cell.is_code && cell.is_test)
            .map(|cell| cell.id)
            .collect()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellRun {
    pub cell_id: CellId,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub kind: RunKind,
    pub runs: Vec<CellRun>,
}

impl RunReport {
    pub fn new(kind: RunKind) -> Self {
        Self {
            kind,
            runs: Vec::new(),
        }
    }

    pub fn push(&mut self, cell_id: CellId, result: ExecutionResult) {
        self.runs.push(CellRun { cell_id, result });
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn executed(&self) -> Vec<CellId> {
        self.runs.iter().map(|run| run.cell_id).collect()
    }

    pub fn total(&self) -> usize {
        self.runs.len()
    }

    pub fn passed(&self) -> usize {
        self.runs.iter().filter(|run| run.result.is_pass()).count()
    }

    pub fn failed(&self) -> Vec<CellId> {
        self.runs
            .iter()
            .filter(|run| !run.result.is_pass())
            .map(|run| run.cell_id)
            .collect()
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.total()
    }

    pub fn result_for(&self, cell_id: CellId) -> Option<&ExecutionResult> {
        self.runs
            .iter()
            .find(|run| run.cell_id == cell_id)
            .map(|run| &run.result)
    }
}
