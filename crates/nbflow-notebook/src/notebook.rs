use crate::scheduler::{plan, PlanCell, RunKind, RunReport};
use crate::NotebookError;
use nbflow_collab::{connect, CollabEvents, CollabHandle};
use nbflow_core::collab_wire::CollabMsg;
use nbflow_core::document::{DocumentCell, DocumentError, NotebookDocument};
use nbflow_core::settings::Settings;
use nbflow_core::{
    is_test_content, CellId, CellKind, ExecutionResult, ExecutionStatus, OutputRecord, TEST_MARKER,
};
use nbflow_deps::{analyze, Analysis, DependencyGraph};
use nbflow_kernel::{KernelError, KernelLauncher, KernelSession, ProcessLauncher};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const EXPORT_SEPARATOR: &str = "\n\n# --------\n\n";

/// Where an edit came from. Remote edits are never rebroadcast, never mark
/// the notebook dirty and never execute anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    None,
    RunDependents(CellId),
}

#[derive(Debug, Clone)]
pub struct Cell {
    id: CellId,
    kind: CellKind,
    content: String,
    analysis: Analysis,
    outputs: Vec<OutputRecord>,
    status: Option<ExecutionStatus>,
}

impl Cell {
    fn new(id: CellId, kind: CellKind, content: String) -> Self {
        let mut cell = Self {
            id,
            kind,
            content: String::new(),
            analysis: Analysis::default(),
            outputs: Vec::new(),
            status: None,
        };
        cell.set_content(content);
        cell
    }

    fn set_content(&mut self, content: String) {
        self.analysis = if self.kind.is_code() {
            analyze(&content)
        } else {
            Analysis::default()
        };
        self.content = content;
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_code(&self) -> bool {
        self.kind.is_code()
    }

    pub fn is_test(&self) -> bool {
        self.is_code() && is_test_content(&self.content)
    }

    pub fn defined_symbols(&self) -> &BTreeSet<String> {
        &self.analysis.defined
    }

    pub fn used_symbols(&self) -> &BTreeSet<String> {
        &self.analysis.used
    }

    pub fn outputs(&self) -> &[OutputRecord] {
        &self.outputs
    }

    pub fn last_status(&self) -> Option<ExecutionStatus> {
        self.status
    }
}

enum KernelSlot {
    NotStarted,
    Ready(KernelSession),
    Failed,
}

#[derive(Clone)]
pub struct CloseHandle(Arc<watch::Sender<bool>>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct Notebook {
    notebook_id: String,
    settings: Settings,
    order: Vec<CellId>,
    cells: HashMap<CellId, Cell>,
    graph: DependencyGraph,
    dirty: bool,
    path: Option<PathBuf>,
    collab: Option<CollabHandle>,
    launcher: Arc<dyn KernelLauncher>,
    kernel: KernelSlot,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
}

impl Notebook {
    pub fn new(
        notebook_id: impl Into<String>,
        settings: Settings,
        launcher: Arc<dyn KernelLauncher>,
    ) -> Self {
        let (close_tx, close_rx) = watch::channel(false);
        Self {
            notebook_id: notebook_id.into(),
            settings,
            order: Vec::new(),
            cells: HashMap::new(),
            graph: DependencyGraph::rebuild(std::iter::empty::<(CellId, &Analysis)>()),
            dirty: false,
            path: None,
            collab: None,
            launcher,
            kernel: KernelSlot::NotStarted,
            close_tx: Arc::new(close_tx),
            close_rx,
        }
    }

    pub fn with_process_kernel(notebook_id: impl Into<String>, settings: Settings) -> Self {
        let launcher = Arc::new(ProcessLauncher::from_settings(&settings.kernel));
        Self::new(notebook_id, settings, launcher)
    }

    pub fn open(
        path: impl AsRef<Path>,
        notebook_id: impl Into<String>,
        settings: Settings,
        launcher: Arc<dyn KernelLauncher>,
    ) -> Result<Self, NotebookError> {
        let mut notebook = Self::new(notebook_id, settings, launcher);
        notebook.load(path)?;
        Ok(notebook)
    }

    pub fn notebook_id(&self) -> &str {
        &self.notebook_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn cell_ids(&self) -> &[CellId] {
        &self.order
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> + '_ {
        self.order.iter().filter_map(|id| self.cells.get(id))
    }

    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&id)
    }

    pub fn cell_at(&self, index: usize) -> Option<&Cell> {
        self.order.get(index).and_then(|id| self.cells.get(id))
    }

    pub fn position_of(&self, id: CellId) -> Option<usize> {
        self.order.iter().position(|candidate| *candidate == id)
    }

    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn client_id(&self) -> Option<&str> {
        self.collab.as_ref().map(CollabHandle::client_id)
    }

    pub fn is_collaborating(&self) -> bool {
        self.collab.is_some()
    }

    pub fn kernel_ready(&self) -> bool {
        matches!(&self.kernel, KernelSlot::Ready(session) if session.is_alive())
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(Arc::clone(&self.close_tx))
    }

    pub fn is_closed(&self) -> bool {
        *self.close_rx.borrow()
    }

    pub fn add_cell(
        &mut self,
        kind: CellKind,
        content: impl Into<String>,
        index: Option<usize>,
    ) -> Result<CellId, NotebookError> {
        self.insert_cell(CellId::generate(), kind, content, index, EditOrigin::Local)
    }

    pub fn insert_cell(
        &mut self,
        cell_id: CellId,
        kind: CellKind,
        content: impl Into<String>,
        index: Option<usize>,
        origin: EditOrigin,
    ) -> Result<CellId, NotebookError> {
        if self.cells.contains_key(&cell_id) {
            return Err(NotebookError::DuplicateCell(cell_id));
        }
        let position = index.map_or(self.order.len(), |index| index.min(self.order.len()));
        let cell = Cell::new(cell_id, kind, content.into());
        let content = cell.content.clone();
        self.order.insert(position, cell_id);
        self.cells.insert(cell_id, cell);
        self.rebuild_graph();
        debug!(event = "cell_added", cell_id = %cell_id, kind = %kind, index = position, origin = ?origin);

        if origin == EditOrigin::Local {
            self.dirty = true;
            self.broadcast(CollabMsg::AddCell {
                cell_id,
                cell_type: kind,
                content,
                index: Some(position),
            });
        }
        Ok(cell_id)
    }

    /// Replaces a cell's content. Unchanged content is a no-op and is not
    /// broadcast.
    pub fn update_cell(
        &mut self,
        cell_id: CellId,
        content: impl Into<String>,
        origin: EditOrigin,
    ) -> Result<Reaction, NotebookError> {
        let content = content.into();
        let cell = self
            .cells
            .get_mut(&cell_id)
            .ok_or(NotebookError::UnknownCell(cell_id))?;
        if cell.content == content {
            return Ok(Reaction::None);
        }
        cell.set_content(content.clone());
        let is_code = cell.is_code();
        self.rebuild_graph();
        debug!(event = "cell_updated", cell_id = %cell_id, bytes = content.len(), origin = ?origin);

        if origin == EditOrigin::Remote {
            return Ok(Reaction::None);
        }
        self.dirty = true;
        self.broadcast(CollabMsg::CellUpdate { cell_id, content });
        if is_code && self.settings.auto_run_dependents {
            Ok(Reaction::RunDependents(cell_id))
        } else {
            Ok(Reaction::None)
        }
    }

    pub fn delete_cell(&mut self, cell_id: CellId, origin: EditOrigin) -> Result<(), NotebookError> {
        if self.cells.remove(&cell_id).is_none() {
            return Err(NotebookError::UnknownCell(cell_id));
        }
        self.order.retain(|id| *id != cell_id);
        self.rebuild_graph();
        debug!(event = "cell_deleted", cell_id = %cell_id, origin = ?origin);

        if origin == EditOrigin::Local {
            self.dirty = true;
            self.broadcast(CollabMsg::DeleteCell { cell_id });
        }
        Ok(())
    }

    pub async fn edit_cell(
        &mut self,
        cell_id: CellId,
        content: impl Into<String>,
    ) -> Result<Option<RunReport>, NotebookError> {
        match self.update_cell(cell_id, content, EditOrigin::Local)? {
            Reaction::None => Ok(None),
            Reaction::RunDependents(root) => self.run_cell(root).await.map(Some),
        }
    }

    pub fn set_test_flag(&mut self, cell_id: CellId, is_test: bool) -> Result<Reaction, NotebookError> {
        let cell = self.cells.get(&cell_id).ok_or(NotebookError::UnknownCell(cell_id))?;
        if !cell.is_code() {
            return Err(NotebookError::NotCode(cell_id));
        }
        let content = with_test_marker(&cell.content, is_test);
        self.update_cell(cell_id, content, EditOrigin::Local)
    }

    pub fn apply_remote(&mut self, msg: CollabMsg) -> Result<(), NotebookError> {
        match msg {
            CollabMsg::AddCell {
                cell_id,
                cell_type,
                content,
                index,
            } => self
                .insert_cell(cell_id, cell_type, content, index, EditOrigin::Remote)
                .map(|_| ()),
            CollabMsg::CellUpdate { cell_id, content } => self
                .update_cell(cell_id, content, EditOrigin::Remote)
                .map(|_| ()),
            CollabMsg::DeleteCell { cell_id } => self.delete_cell(cell_id, EditOrigin::Remote),
            CollabMsg::CursorUpdate { .. } => Ok(()),
        }
    }

    fn rebuild_graph(&mut self) {
        let graph = DependencyGraph::rebuild(
            self.order
                .iter()
                .filter_map(|id| self.cells.get(id).map(|cell| (*id, &cell.analysis))),
        );
        self.graph = graph;
    }

    fn broadcast(&self, msg: CollabMsg) {
        let Some(collab) = &self.collab else {
            return;
        };
        let kind = msg.kind();
        if let Err(err) = collab.send(msg) {
            warn!(event = "collab_broadcast_failed", notebook_id = %self.notebook_id, kind, error = %err);
        }
    }

    pub async fn run_all(&mut self) -> Result<RunReport, NotebookError> {
        self.run(RunKind::All).await
    }

    pub async fn run_cell(&mut self, cell_id: CellId) -> Result<RunReport, NotebookError> {
        self.run(RunKind::CellAndDependents(cell_id)).await
    }

    pub async fn run_tests(&mut self) -> Result<RunReport, NotebookError> {
        self.run(RunKind::Tests).await
    }

    /// Plans the run, then executes the queue one cell at a time. A cycle
    /// aborts before anything executes; a failing cell does not stop the
    /// queue; cancellation does.
    pub async fn run(&mut self, kind: RunKind) -> Result<RunReport, NotebookError> {
        if self.is_closed() {
            return Err(NotebookError::Closed);
        }
        if let RunKind::CellAndDependents(cell_id) = kind {
            if !self.cells.contains_key(&cell_id) {
                return Err(NotebookError::UnknownCell(cell_id));
            }
        }
        self.rebuild_graph();
        let queue = match plan(kind, &self.graph, &self.plan_cells()) {
            Ok(queue) => queue,
            Err(err) => {
                warn!(event = "run_aborted", notebook_id = %self.notebook_id, run = %kind, error = %err);
                return Err(err.into());
            }
        };
        info!(event = "run_started", notebook_id = %self.notebook_id, run = %kind, cells = queue.len());

        let mut report = RunReport::new(kind);
        if !queue.is_empty() {
            self.ensure_kernel().await;
        }
        for cell_id in queue {
            let Some(code) = self.cells.get(&cell_id).map(|cell| cell.content.clone()) else {
                continue;
            };
            let result = self.execute(&code).await;
            debug!(
                event = "cell_executed",
                cell_id = %cell_id,
                status = ?result.status,
                outputs = result.outputs.len()
            );
            let cancelled = result.status == ExecutionStatus::Cancelled;
            if let Some(cell) = self.cells.get_mut(&cell_id) {
                cell.outputs = result.outputs.clone();
                cell.status = Some(result.status);
            }
            report.push(cell_id, result);
            if cancelled {
                warn!(event = "run_cancelled", notebook_id = %self.notebook_id, run = %kind);
                break;
            }
        }

        info!(
            event = "run_finished",
            notebook_id = %self.notebook_id,
            run = %kind,
            executed = report.total(),
            passed = report.passed()
        );
        Ok(report)
    }

    fn plan_cells(&self) -> Vec<PlanCell> {
        self.cells()
            .map(|cell| PlanCell {
                id: cell.id,
                is_code: cell.is_code(),
                is_test: cell.is_test(),
            })
            .collect()
    }

    async fn execute(&self, code: &str) -> ExecutionResult {
        match &self.kernel {
            KernelSlot::Ready(session) => session.execute(code).await,
            KernelSlot::NotStarted | KernelSlot::Failed => ExecutionResult::kernel_unavailable(),
        }
    }

    /// Starts the kernel on first use. A failed start is remembered and not
    /// retried until `restart_kernel`.
    async fn ensure_kernel(&mut self) {
        if !matches!(self.kernel, KernelSlot::NotStarted) {
            return;
        }
        if let Err(err) = self.start_kernel().await {
            warn!(event = "kernel_unavailable", notebook_id = %self.notebook_id, error = %err);
        }
    }

    async fn start_kernel(&mut self) -> Result<(), KernelError> {
        match KernelSession::start(
            self.launcher.as_ref(),
            self.settings.kernel.clone(),
            self.close_rx.clone(),
        )
        .await
        {
            Ok(session) => {
                self.kernel = KernelSlot::Ready(session);
                Ok(())
            }
            Err(err) => {
                self.kernel = KernelSlot::Failed;
                Err(err)
            }
        }
    }

    pub async fn restart_kernel(&mut self) -> Result<(), NotebookError> {
        if self.is_closed() {
            return Err(NotebookError::Closed);
        }
        self.shutdown_kernel().await;
        info!(event = "kernel_restart", notebook_id = %self.notebook_id);
        self.start_kernel().await?;
        Ok(())
    }

    async fn shutdown_kernel(&mut self) {
        if let KernelSlot::Ready(session) = std::mem::replace(&mut self.kernel, KernelSlot::NotStarted) {
            session.shutdown().await;
        }
    }

    pub fn to_document(&self) -> NotebookDocument {
        NotebookDocument::new(
            self.cells()
                .map(|cell| DocumentCell::new(cell.kind, cell.content.clone()))
                .collect(),
        )
    }

    /// Replaces every cell with the document's, under fresh ids. Nothing is
    /// broadcast.
    pub fn load_document(&mut self, document: NotebookDocument) {
        self.order.clear();
        self.cells.clear();
        for entry in document.cells {
            let cell = Cell::new(CellId::generate(), entry.kind, entry.content);
            self.order.push(cell.id);
            self.cells.insert(cell.id, cell);
        }
        self.rebuild_graph();
        self.dirty = false;
        info!(event = "notebook_loaded", notebook_id = %self.notebook_id, cells = self.order.len());
    }

    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), NotebookError> {
        let path = path.as_ref();
        let document = NotebookDocument::read(path)?;
        self.load_document(document);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn save_as(&mut self, path: impl AsRef<Path>) -> Result<(), NotebookError> {
        let path = path.as_ref();
        self.to_document().write(path)?;
        self.path = Some(path.to_path_buf());
        self.dirty = false;
        info!(event = "notebook_saved", notebook_id = %self.notebook_id, path = %path.display());
        Ok(())
    }

    pub fn save(&mut self) -> Result<(), NotebookError> {
        let path = self.path.clone().ok_or(NotebookError::NoPath)?;
        self.save_as(path)
    }

    pub fn export_script(&self) -> String {
        let source = self
            .path
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.notebook_id.clone());
        let body = self
            .cells()
            .filter(|cell| cell.is_code() && !cell.is_test())
            .map(Cell::content)
            .collect::<Vec<_>>()
            .join(EXPORT_SEPARATOR);
        format!("# --- Exported from {source} ---\n\n{body}")
    }

    pub fn export_to(&self, path: impl AsRef<Path>) -> Result<(), NotebookError> {
        std::fs::write(path, self.export_script()).map_err(DocumentError::from)?;
        Ok(())
    }

    pub fn connect_collab(&mut self) -> Result<CollabEvents, NotebookError> {
        let room_url = self.settings.room_url(&self.notebook_id);
        let (handle, events) = connect(&room_url, &self.notebook_id, &self.settings.collab)?;
        info!(
            event = "collab_attached",
            notebook_id = %self.notebook_id,
            client_id = handle.client_id(),
            url = %room_url
        );
        self.collab = Some(handle);
        Ok(events)
    }

    pub fn send_cursor(
        &self,
        cell_id: CellId,
        cursor_pos: usize,
        selection_end: usize,
    ) -> Result<(), NotebookError> {
        if !self.cells.contains_key(&cell_id) {
            return Err(NotebookError::UnknownCell(cell_id));
        }
        if let Some(collab) = &self.collab {
            collab.send_cursor(cell_id, cursor_pos, selection_end)?;
        }
        Ok(())
    }

    /// Aborts any in-flight kernel wait, leaves the room and shuts the
    /// kernel down. Runs fail with `Closed` afterwards.
    pub async fn close(&mut self) {
        self.close_tx.send_replace(true);
        if let Some(collab) = self.collab.take() {
            collab.stop().await;
        }
        self.shutdown_kernel().await;
        info!(event = "notebook_closed", notebook_id = %self.notebook_id, dirty = self.dirty);
    }
}

fn with_test_marker(content: &str, is_test: bool) -> String {
    if is_test == is_test_content(content) {
        return content.to_string();
    }
    if is_test {
        return format!("{TEST_MARKER}\n{content}");
    }
    let body = content.trim_start();
    match body.split_once('\n') {
        Some((first, rest)) if first.trim_end() == TEST_MARKER => rest.to_string(),
        None if body.trim_end() == TEST_MARKER => String::new(),
        _ => content.to_string(),
    }
}
