//! A notebook cell and its execution state machine.
//!
//! ```text
//! Hidden --active/hover--> Stopped --future in progress--> Running
//! ```
//!
//! `Running` wins over `Stopped`, which wins over `Hidden`. `Error` exists
//! for callers that track failures themselves; it is never derived here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;
use jupyter_protocol::{ExecuteRequest, JupyterMessage, JupyterMessageContent, ReplyStatus};
use kernel_messages::{classify_iopub, rewrite_output_links, IopubAction, Output};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::contents::CellType;
use crate::contents::{CellContents, CellMetadata};
use crate::error::ExecutionError;
use crate::events::Emitter;
use crate::future::ExecutionFuture;
use crate::kernel::{Kernel, KernelStatus};
use crate::notebook_model::{NotebookChangeType, NotebookModel, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellExecutionState {
    Hidden,
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputsChanged {
    pub outputs: Vec<Output>,
    /// Set when the first output of a run arrives.
    pub should_scroll: bool,
}

struct CellState {
    cell_type: CellType,
    source: String,
    language: Option<String>,
    cell_guid: String,
    metadata: Map<String, Value>,
    outputs: Vec<Output>,
    display_ids: HashMap<String, Vec<usize>>,
    trusted: bool,
    active: bool,
    hover: bool,
    execution_count: Option<i64>,
    future: Option<Arc<ExecutionFuture>>,
    is_edit_mode: bool,
}

pub struct CellModel {
    id: u64,
    me: Weak<CellModel>,
    notebook: Weak<NotebookModel>,
    state: Mutex<CellState>,
    outputs_changed: Emitter<OutputsChanged>,
    execution_state_changed: Emitter<CellExecutionState>,
    cell_mode_changed: Emitter<bool>,
}

enum RunOutcome {
    Finished(bool),
    Interrupted,
    NoKernel,
}

impl CellModel {
    pub fn new(id: u64, cell_type: CellType, notebook: Weak<NotebookModel>) -> Arc<Self> {
        Self::from_contents(id, &CellContents::new(cell_type, ""), notebook, false)
    }

    /// Build a cell from persisted contents. Outputs are kept as saved;
    /// links in them are only rewritten during live execution.
    pub fn from_contents(
        id: u64,
        contents: &CellContents,
        notebook: Weak<NotebookModel>,
        trusted: bool,
    ) -> Arc<Self> {
        let cell_guid = contents
            .metadata
            .cell_guid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Arc::new_cyclic(|me| CellModel {
            id,
            me: me.clone(),
            notebook,
            state: Mutex::new(CellState {
                cell_type: contents.cell_type,
                source: contents.source.clone(),
                language: contents.metadata.language.clone(),
                cell_guid,
                metadata: contents.metadata.additional.clone(),
                outputs: contents.outputs.clone().unwrap_or_default(),
                display_ids: HashMap::new(),
                trusted,
                active: false,
                hover: false,
                execution_count: contents.execution_count.flatten(),
                future: None,
                is_edit_mode: contents.cell_type != CellType::Markdown,
            }),
            outputs_changed: Emitter::new(),
            execution_state_changed: Emitter::new(),
            cell_mode_changed: Emitter::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CellState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cell_guid(&self) -> String {
        self.lock().cell_guid.clone()
    }

    pub fn cell_type(&self) -> CellType {
        self.lock().cell_type
    }

    pub fn source(&self) -> String {
        self.lock().source.clone()
    }

    pub fn set_source(&self, source: impl Into<String>) {
        let source = source.into();
        {
            let mut state = self.lock();
            if state.source == source {
                return;
            }
            state.source = source;
        }
        self.send_change_to_notebook(NotebookChangeType::CellSourceUpdated);
    }

    /// Markdown cells are always `markdown`; code cells use their own
    /// language, else the notebook's.
    pub fn language(&self) -> String {
        let (cell_type, language) = {
            let state = self.lock();
            (state.cell_type, state.language.clone())
        };
        if cell_type == CellType::Markdown {
            return "markdown".to_string();
        }
        if let Some(language) = language.filter(|l| !l.is_empty()) {
            return language;
        }
        self.notebook
            .upgrade()
            .map(|nb| nb.language())
            .unwrap_or_default()
    }

    pub fn set_language(&self, language: Option<String>) {
        self.lock().language = language;
    }

    pub fn outputs(&self) -> Vec<Output> {
        self.lock().outputs.clone()
    }

    pub fn trusted_mode(&self) -> bool {
        self.lock().trusted
    }

    pub fn set_trusted_mode(&self, trusted: bool) {
        {
            let mut state = self.lock();
            if state.trusted == trusted {
                return;
            }
            state.trusted = trusted;
        }
        self.fire_outputs_changed(false);
    }

    pub fn active(&self) -> bool {
        self.lock().active
    }

    pub fn set_active(&self, active: bool) {
        {
            let mut state = self.lock();
            if state.active == active {
                return;
            }
            state.active = active;
        }
        self.fire_execution_state_changed();
    }

    pub fn hover(&self) -> bool {
        self.lock().hover
    }

    pub fn set_hover(&self, hover: bool) {
        {
            let mut state = self.lock();
            if state.hover == hover {
                return;
            }
            state.hover = hover;
        }
        self.fire_execution_state_changed();
    }

    pub fn execution_count(&self) -> Option<i64> {
        self.lock().execution_count
    }

    pub fn set_execution_count(&self, execution_count: Option<i64>) {
        {
            let mut state = self.lock();
            if state.execution_count == execution_count {
                return;
            }
            state.execution_count = execution_count;
        }
        self.fire_execution_state_changed();
    }

    pub fn is_edit_mode(&self) -> bool {
        self.lock().is_edit_mode
    }

    pub fn set_edit_mode(&self, is_edit_mode: bool) {
        {
            let mut state = self.lock();
            if state.is_edit_mode == is_edit_mode {
                return;
            }
            state.is_edit_mode = is_edit_mode;
        }
        self.cell_mode_changed.emit(&is_edit_mode);
    }

    pub fn future(&self) -> Option<Arc<ExecutionFuture>> {
        self.lock().future.clone()
    }

    pub fn execution_state(&self) -> CellExecutionState {
        let state = self.lock();
        if state.future.as_ref().is_some_and(|f| f.in_progress()) {
            CellExecutionState::Running
        } else if state.active || state.hover {
            CellExecutionState::Stopped
        } else {
            CellExecutionState::Hidden
        }
    }

    pub fn outputs_changed(&self) -> &Emitter<OutputsChanged> {
        &self.outputs_changed
    }

    pub fn execution_state_changed(&self) -> &Emitter<CellExecutionState> {
        &self.execution_state_changed
    }

    pub fn cell_mode_changed(&self) -> &Emitter<bool> {
        &self.cell_mode_changed
    }

    /// Run the cell's source on the notebook's kernel.
    ///
    /// Calling this while a previous run is still in progress interrupts the
    /// kernel instead of submitting again. Returns whether the run finished
    /// with an `ok` reply. Failed replies are `Ok(false)`; transport errors
    /// are reported to the user and returned.
    pub async fn run_cell(&self) -> Result<bool> {
        let notebook = self.notebook.upgrade();
        if let Some(notebook) = &notebook {
            if !self.active() {
                notebook.update_active_cell(self);
                self.set_active(true);
            }
        }
        if self.cell_type() != CellType::Code {
            return Ok(false);
        }

        let outcome = self.execute(notebook.as_ref()).await;
        self.fire_execution_state_changed();
        self.send_change_to_notebook(NotebookChangeType::CellOutputUpdated);
        self.send_change_to_notebook(NotebookChangeType::CellExecuted);

        match outcome {
            Ok(RunOutcome::Finished(succeeded)) => Ok(succeeded),
            Ok(RunOutcome::Interrupted) => Ok(true),
            Ok(RunOutcome::NoKernel) => Ok(false),
            Err(e) if is_canceled(&e) => {
                self.notify(Severity::Info, "Query execution was canceled");
                Ok(false)
            }
            Err(e) => {
                self.notify(Severity::Error, &e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(&self, notebook: Option<&Arc<NotebookModel>>) -> Result<RunOutcome> {
        let Some(kernel) = self.get_or_start_kernel(notebook).await? else {
            return Ok(RunOutcome::NoKernel);
        };

        if let Some(future) = self.future().filter(|f| f.in_progress()) {
            future.set_in_progress(false);
            kernel.interrupt().await?;
            self.notify(Severity::Info, "Cell execution cancelled");
            return Ok(RunOutcome::Interrupted);
        }

        if kernel.requires_connection() {
            let connected = match notebook {
                Some(notebook) if notebook.active_connection().is_some() => true,
                Some(notebook) => notebook.request_connection().await,
                None => false,
            };
            if !connected {
                return Ok(RunOutcome::Finished(false));
            }
        }

        let source = self.source();
        if source.is_empty() {
            return Ok(RunOutcome::Finished(true));
        }

        let mut request = ExecuteRequest::new(source);
        request.stop_on_error = true;
        let future = kernel.request_execute(request, false)?;
        debug!("[cell] Cell {} submitted as {}", self.id, future.msg_id());
        self.set_future(future.clone());
        self.fire_execution_state_changed();

        let reply = future.done().await;
        self.release_future(&future);
        Ok(RunOutcome::Finished(reply_succeeded(&reply?)))
    }

    async fn get_or_start_kernel(
        &self,
        notebook: Option<&Arc<NotebookModel>>,
    ) -> Result<Option<Arc<dyn Kernel>>> {
        let Some(notebook) = notebook else {
            warn!("[cell] Cell {} is not attached to a notebook", self.id);
            return Ok(None);
        };
        notebook.session_load_finished().wait().await;

        let Some(session) = notebook.active_client_session() else {
            self.notify(
                Severity::Error,
                "The session for this notebook is not yet ready",
            );
            return Ok(None);
        };
        if !session.is_ready() || session.status() == KernelStatus::Dead {
            self.notify(
                Severity::Info,
                "The session for this notebook will start momentarily",
            );
            session.kernel_change_completed().wait().await;
        }

        if session.kernel().is_none() {
            let Some(default_kernel) = notebook.default_kernel() else {
                self.notify(Severity::Error, "No kernel is available for this notebook");
                return Ok(None);
            };
            session.change_kernel(&default_kernel).await?;
        }

        match session.kernel() {
            Some(kernel) => Ok(Some(kernel)),
            None => {
                self.notify(Severity::Error, "No kernel is available for this notebook");
                Ok(None)
            }
        }
    }

    /// Attach the future of a new run. Marks the cell trusted, disposes any
    /// previous future and clears its outputs before any message arrives.
    pub fn set_future(&self, future: Arc<ExecutionFuture>) {
        let previous = {
            let mut state = self.lock();
            if state
                .future
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &future))
            {
                return;
            }
            state.trusted = true;
            state.future.take()
        };
        if let Some(previous) = previous {
            previous.dispose();
        }
        self.clear_outputs();

        let me = self.me.clone();
        future.set_reply_handler(Box::new(move |msg| {
            if let Some(cell) = me.upgrade() {
                cell.handle_reply(msg);
            }
        }));
        let me = self.me.clone();
        future.set_iopub_handler(Box::new(move |msg| {
            if let Some(cell) = me.upgrade() {
                cell.handle_iopub(msg);
            }
        }));
        self.lock().future = Some(future);
    }

    fn dispose_future(&self) {
        let future = self.lock().future.take();
        if let Some(future) = future {
            future.dispose();
        }
    }

    /// Dispose a run's own future, detaching it only if a later run has
    /// not already replaced it.
    fn release_future(&self, future: &Arc<ExecutionFuture>) {
        {
            let mut state = self.lock();
            if state
                .future
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, future))
            {
                state.future = None;
            }
        }
        future.dispose();
    }

    fn handle_reply(&self, msg: &JupyterMessage) {
        if let JupyterMessageContent::ExecuteReply(reply) = &msg.content {
            if matches!(reply.status, ReplyStatus::Ok) {
                self.set_execution_count(Some(reply.execution_count.0 as i64));
            }
        }
        let finished = {
            let mut state = self.lock();
            match &state.future {
                Some(future) if !future.in_progress() => state.future.take(),
                _ => None,
            }
        };
        if let Some(future) = finished {
            future.dispose();
            self.fire_execution_state_changed();
        }
    }

    fn handle_iopub(&self, msg: &JupyterMessage) {
        if let Some(status) = KernelStatus::from_message(&msg.content) {
            if let Some(notebook) = self.notebook.upgrade() {
                notebook.on_kernel_status(status);
            }
            return;
        }
        match classify_iopub(&msg.content) {
            IopubAction::Append {
                mut output,
                display_id,
            } => {
                self.rewrite_links(&mut output);
                let should_scroll = {
                    let mut state = self.lock();
                    state.outputs.push(output);
                    let index = state.outputs.len() - 1;
                    if let Some(display_id) = display_id {
                        state.display_ids.entry(display_id).or_default().push(index);
                    }
                    state.outputs.len() == 1
                };
                self.fire_outputs_changed(should_scroll);
            }
            IopubAction::Update {
                display_id,
                mut output,
            } => {
                self.rewrite_links(&mut output);
                {
                    let mut state = self.lock();
                    let targets = state.display_ids.get(&display_id).cloned().unwrap_or_default();
                    if targets.is_empty() {
                        warn!(
                            "[cell] No output for display id {}, appending",
                            display_id
                        );
                        state.outputs.push(output);
                        let index = state.outputs.len() - 1;
                        state.display_ids.entry(display_id).or_default().push(index);
                    } else {
                        for index in targets {
                            if let Some(slot) = state.outputs.get_mut(index) {
                                *slot = output.clone();
                            }
                        }
                    }
                }
                self.fire_outputs_changed(false);
            }
            IopubAction::Clear { .. } => self.clear_outputs(),
            IopubAction::Ignore => {}
        }
    }

    /// Route internal cluster links through the gateway. Only applies while
    /// a run is attached.
    fn rewrite_links(&self, output: &mut Output) {
        if self.lock().future.is_none() {
            return;
        }
        let Some(gateway) = self.notebook.upgrade().and_then(|nb| nb.gateway_address()) else {
            return;
        };
        if rewrite_output_links(output, &gateway) {
            debug!("[cell] Rewrote links through {}{}", gateway.host, gateway.port);
        }
    }

    /// Drop every output and the execution count.
    pub fn clear_outputs(&self) {
        {
            let mut state = self.lock();
            state.outputs.clear();
            state.display_ids.clear();
        }
        self.fire_outputs_changed(false);
        self.set_execution_count(None);
    }

    fn fire_outputs_changed(&self, should_scroll: bool) {
        let outputs = self.outputs();
        let is_empty = outputs.is_empty();
        self.outputs_changed.emit(&OutputsChanged {
            outputs,
            should_scroll,
        });
        if is_empty {
            self.send_change_to_notebook(NotebookChangeType::CellOutputCleared);
        }
    }

    fn fire_execution_state_changed(&self) {
        let state = self.execution_state();
        self.execution_state_changed.emit(&state);
    }

    fn send_change_to_notebook(&self, change: NotebookChangeType) {
        if let Some(notebook) = self.notebook.upgrade() {
            notebook.on_cell_change(self, change);
        }
    }

    fn notify(&self, severity: Severity, message: &str) {
        match self.notebook.upgrade() {
            Some(notebook) => notebook.notify(severity, message),
            None => warn!("[cell] {}", message),
        }
    }

    /// Outstanding work is abandoned; used when the cell is deleted or the
    /// document closes.
    pub fn dispose(&self) {
        self.dispose_future();
    }

    pub fn to_json(&self) -> CellContents {
        let state = self.lock();
        let is_code = state.cell_type == CellType::Code;
        CellContents {
            cell_type: state.cell_type,
            source: state.source.clone(),
            metadata: CellMetadata {
                language: state.language.clone(),
                cell_guid: Some(state.cell_guid.clone()),
                additional: state.metadata.clone(),
            },
            outputs: is_code.then(|| state.outputs.clone()),
            execution_count: is_code.then_some(state.execution_count),
        }
    }
}

impl std::fmt::Debug for CellModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellModel")
            .field("id", &self.id)
            .field("cell_type", &self.cell_type())
            .finish()
    }
}

fn reply_succeeded(reply: &JupyterMessage) -> bool {
    match &reply.content {
        JupyterMessageContent::ExecuteReply(reply) => matches!(reply.status, ReplyStatus::Ok),
        _ => false,
    }
}

fn is_canceled(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<ExecutionError>(),
        Some(ExecutionError::Canceled)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use jupyter_protocol::{ExecuteReply, ExecutionCount};
    use serde_json::json;

    fn code_cell(source: &str) -> Arc<CellModel> {
        CellModel::from_contents(
            1,
            &CellContents::new(CellType::Code, source),
            Weak::new(),
            false,
        )
    }

    fn parent() -> JupyterMessage {
        ExecuteRequest::new("SELECT 1".to_string()).into()
    }

    fn iopub(parent: &JupyterMessage, msg_type: &str, content: Value) -> JupyterMessage {
        let content = JupyterMessageContent::from_type_and_content(msg_type, content).unwrap();
        JupyterMessage::new(content, Some(parent))
    }

    fn reply(parent: &JupyterMessage, status: ReplyStatus, count: usize) -> JupyterMessage {
        let content = JupyterMessageContent::ExecuteReply(ExecuteReply {
            status,
            execution_count: ExecutionCount::new(count),
            error: None,
            payload: Vec::new(),
            user_expressions: None,
        });
        JupyterMessage::new(content, Some(parent))
    }

    #[test]
    fn test_execution_state_derivation() {
        let cell = code_cell("1");
        assert_eq!(cell.execution_state(), CellExecutionState::Hidden);

        cell.set_hover(true);
        assert_eq!(cell.execution_state(), CellExecutionState::Stopped);

        let (future, _sender) = ExecutionFuture::new("m1", false);
        cell.set_future(future.clone());
        assert_eq!(cell.execution_state(), CellExecutionState::Running);

        future.set_in_progress(false);
        assert_eq!(cell.execution_state(), CellExecutionState::Stopped);
    }

    #[test]
    fn test_state_changes_are_published() {
        let cell = code_cell("1");
        let (_sub, mut rx) = cell.execution_state_changed().subscribe_channel();

        cell.set_active(true);
        cell.set_active(true);
        cell.set_hover(true);
        cell.set_active(false);
        cell.set_hover(false);

        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                CellExecutionState::Stopped,
                CellExecutionState::Stopped,
                CellExecutionState::Stopped,
                CellExecutionState::Hidden,
            ]
        );
    }

    #[tokio::test]
    async fn test_iopub_applied_in_order_and_reply_sets_count() {
        let cell = code_cell("SELECT 1");
        let parent = parent();
        let (future, mut sender) = ExecutionFuture::new(parent.header.msg_id.clone(), false);
        cell.set_future(future.clone());

        sender.send_iopub(iopub(&parent, "status", json!({"execution_state": "busy"})));
        sender.send_iopub(iopub(&parent, "stream", json!({"name": "stdout", "text": "a"})));
        sender.send_iopub(iopub(
            &parent,
            "execute_result",
            json!({"execution_count": 1, "data": {"text/plain": "1"}, "metadata": {}}),
        ));
        sender.send_iopub(iopub(&parent, "stream", json!({"name": "stdout", "text": "b"})));
        sender.send_reply(reply(&parent, ReplyStatus::Ok, 1));

        let result = future.done().await.unwrap();
        assert!(reply_succeeded(&result));

        let kinds: Vec<_> = cell.outputs().iter().map(|o| o.output_type()).collect();
        assert_eq!(kinds, vec!["stream", "execute_result", "stream"]);
        assert_eq!(cell.execution_count(), Some(1));
        assert!(cell.future().is_none());
        assert!(future.is_disposed());
    }

    #[tokio::test]
    async fn test_failed_reply_leaves_count_unset() {
        let cell = code_cell("raise");
        let parent = parent();
        let (future, mut sender) = ExecutionFuture::new(parent.header.msg_id.clone(), false);
        cell.set_future(future.clone());

        sender.send_reply(reply(&parent, ReplyStatus::Error, 3));
        let result = future.done().await.unwrap();

        assert!(!reply_succeeded(&result));
        assert_eq!(cell.execution_count(), None);
    }

    #[test]
    fn test_update_display_data_replaces_in_place() {
        let cell = code_cell("display");
        let parent = parent();
        let (future, _sender) = ExecutionFuture::new(parent.header.msg_id.clone(), false);
        cell.set_future(future);

        cell.handle_iopub(&iopub(
            &parent,
            "display_data",
            json!({"data": {"text/plain": "v1"}, "metadata": {}, "transient": {"display_id": "d"}}),
        ));
        cell.handle_iopub(&iopub(&parent, "stream", json!({"name": "stdout", "text": "x"})));
        cell.handle_iopub(&iopub(
            &parent,
            "update_display_data",
            json!({"data": {"text/plain": "v2"}, "metadata": {}, "transient": {"display_id": "d"}}),
        ));

        let outputs = cell.outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].data().unwrap()["text/plain"], json!("v2"));

        cell.handle_iopub(&iopub(
            &parent,
            "update_display_data",
            json!({"data": {"text/plain": "new"}, "metadata": {}, "transient": {"display_id": "other"}}),
        ));
        assert_eq!(cell.outputs().len(), 3);
    }

    #[test]
    fn test_clear_output_message_clears_immediately() {
        let cell = code_cell("x");
        let parent = parent();
        cell.handle_iopub(&iopub(&parent, "stream", json!({"name": "stdout", "text": "x"})));
        assert_eq!(cell.outputs().len(), 1);

        cell.handle_iopub(&iopub(&parent, "clear_output", json!({"wait": true})));
        assert!(cell.outputs().is_empty());
    }

    #[test]
    fn test_clear_outputs_twice() {
        let cell = code_cell("x");
        let parent = parent();
        cell.handle_iopub(&iopub(&parent, "stream", json!({"name": "stdout", "text": "x"})));
        let (_sub, mut rx) = cell.outputs_changed().subscribe_channel();

        cell.clear_outputs();
        cell.clear_outputs();

        let mut seen = Vec::new();
        while let Ok(change) = rx.try_recv() {
            seen.push(change);
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|c| c.outputs.is_empty()));
        assert!(cell.outputs().is_empty());
    }

    #[test]
    fn test_set_future_clears_outputs_and_trusts() {
        let contents: CellContents = serde_json::from_value(json!({
            "cell_type": "code",
            "source": "print(1)",
            "outputs": [{"output_type": "stream", "name": "stdout", "text": "1\n"}],
            "execution_count": 4
        }))
        .unwrap();
        let cell = CellModel::from_contents(7, &contents, Weak::new(), false);
        assert_eq!(cell.outputs().len(), 1);
        assert!(!cell.trusted_mode());

        let (first, _s1) = ExecutionFuture::new("first", false);
        cell.set_future(first.clone());
        assert!(cell.outputs().is_empty());
        assert!(cell.trusted_mode());
        assert_eq!(cell.execution_count(), None);

        let (second, _s2) = ExecutionFuture::new("second", false);
        cell.set_future(second);
        assert!(first.is_disposed());
    }

    #[test]
    fn test_markdown_language_ignores_metadata() {
        let contents: CellContents = serde_json::from_value(json!({
            "cell_type": "markdown",
            "source": "# Title",
            "metadata": {"language": "python"}
        }))
        .unwrap();
        let cell = CellModel::from_contents(1, &contents, Weak::new(), false);
        assert_eq!(cell.language(), "markdown");
        assert!(!cell.is_edit_mode());
    }

    #[test]
    fn test_to_json_keeps_metadata_and_guid() {
        let contents: CellContents = serde_json::from_value(json!({
            "cell_type": "code",
            "source": ["SELECT\n", "1"],
            "metadata": {"language": "sql", "tags": ["a"], "azdata_cell_guid": "g-7"},
            "outputs": [],
            "execution_count": null
        }))
        .unwrap();
        let cell = CellModel::from_contents(1, &contents, Weak::new(), false);
        assert_eq!(cell.to_json(), contents);
        assert_eq!(cell.cell_guid(), "g-7");

        let fresh = CellModel::new(2, CellType::Code, Weak::new());
        assert_eq!(uuid::Uuid::parse_str(&fresh.cell_guid()).unwrap().get_version_num(), 4);
    }

    #[test]
    fn test_edit_mode_change_is_published() {
        let cell = code_cell("");
        let (_sub, mut rx) = cell.cell_mode_changed().subscribe_channel();
        cell.set_edit_mode(false);
        cell.set_edit_mode(false);
        assert!(!rx.try_recv().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_without_notebook_returns_false() {
        let cell = code_cell("SELECT 1");
        assert!(!cell.run_cell().await.unwrap());

        let markdown = CellModel::new(2, CellType::Markdown, Weak::new());
        assert!(!markdown.run_cell().await.unwrap());
    }
}
