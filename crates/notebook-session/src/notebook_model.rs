//! Document-level orchestration: cells, one client session per backend, and
//! kernel routing between backends.
//!
//! Exactly one session is active at a time. Selecting a kernel picks the
//! first backend (in configured order) that advertises it, falling back to
//! the standard kernel table, and keeps `provider_id` and the active session
//! in step.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use kernel_messages::GatewayAddress;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::cell::CellModel;
use crate::client_session::{ClientSession, ClientSessionOptions, KernelChangedArgs};
use crate::contents::{
    CellContents, CellType, LanguageInfo, NotebookContents, NotebookMetadata, NBFORMAT_MAJOR,
    NBFORMAT_MINOR,
};
use crate::contexts::{
    is_valid_connection, sanitize_display_name, ConnectionProfile, NotebookContexts,
};
use crate::deferred::{Deferred, DeferredWaiter};
use crate::error::NotebookError;
use crate::events::{Emitter, Subscription};
use crate::kernel::{
    ConnectionService, ContentManager, Kernel, KernelSpec, KernelSpecs, KernelStatus,
    NotebookManager,
};
use crate::settings::{
    sql_kernel_spec, EngineSettings, GatewaySettings, StandardKernel, DEFAULT_NOTEBOOK_PROVIDER,
    SQL_NOTEBOOK_PROVIDER,
};

/// Asks the user (or host) for a connection. Resolves to whether one was
/// selected.
pub type ConnectionRequester = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

pub struct NotebookOptions {
    pub notebook_uri: String,
    pub notebook_managers: Vec<NotebookManager>,
    pub provider_id: String,
    pub standard_kernels: Vec<StandardKernel>,
    pub default_kernel: Option<KernelSpec>,
    pub connection_service: Option<Arc<dyn ConnectionService>>,
    pub connection_profile: Option<ConnectionProfile>,
    pub gateway: GatewaySettings,
}

impl NotebookOptions {
    pub fn new(notebook_uri: impl Into<String>, notebook_managers: Vec<NotebookManager>) -> Self {
        Self::from_settings(notebook_uri, notebook_managers, &EngineSettings::default())
    }

    /// Managers are ordered by `provider_order`; unlisted providers keep
    /// their relative order after the listed ones.
    pub fn from_settings(
        notebook_uri: impl Into<String>,
        mut notebook_managers: Vec<NotebookManager>,
        settings: &EngineSettings,
    ) -> Self {
        let rank = |provider: &str| {
            settings
                .provider_order
                .iter()
                .position(|p| p == provider)
                .unwrap_or(usize::MAX)
        };
        notebook_managers.sort_by_key(|m| rank(&m.provider_id));
        let provider_id = notebook_managers
            .first()
            .map(|m| m.provider_id.clone())
            .unwrap_or_else(|| DEFAULT_NOTEBOOK_PROVIDER.to_string());

        NotebookOptions {
            notebook_uri: notebook_uri.into(),
            notebook_managers,
            provider_id,
            standard_kernels: settings.standard_kernels.clone(),
            default_kernel: settings.default_kernel.clone(),
            connection_service: None,
            connection_profile: None,
            gateway: settings.gateway.clone(),
        }
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_connection_service(mut self, service: Arc<dyn ConnectionService>) -> Self {
        self.connection_service = Some(service);
        self
    }

    pub fn with_connection_profile(mut self, profile: ConnectionProfile) -> Self {
        self.connection_profile = Some(profile);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotebookChangeType {
    CellsAdded,
    CellDeleted,
    CellSourceUpdated,
    CellOutputUpdated,
    CellOutputCleared,
    DirtyStateChanged,
    CellExecuted,
}

#[derive(Debug, Clone)]
pub struct NotebookContentChange {
    pub change_type: NotebookChangeType,
    pub cells: Vec<Arc<CellModel>>,
    pub cell_index: Option<usize>,
    pub is_dirty: Option<bool>,
}

impl NotebookContentChange {
    fn new(change_type: NotebookChangeType, cells: Vec<Arc<CellModel>>) -> Self {
        NotebookContentChange {
            change_type,
            cells,
            cell_index: None,
            is_dirty: None,
        }
    }
}

/// Replace the cells in `range` with `cells`.
#[derive(Debug, Clone)]
pub struct NotebookEditOperation {
    pub range: std::ops::Range<usize>,
    pub cells: Vec<CellContents>,
}

struct ModelState {
    cells: Vec<Arc<CellModel>>,
    active_cell: Option<Arc<CellModel>>,
    sessions: Vec<Arc<ClientSession>>,
    active_session: Option<Arc<ClientSession>>,
    active_session_sub: Option<Subscription>,
    provider_id: String,
    default_kernel: Option<KernelSpec>,
    saved_kernel_info: Option<KernelSpec>,
    language_info: Option<LanguageInfo>,
    language: String,
    metadata: Map<String, Value>,
    trusted_mode: bool,
    in_error_state: bool,
    active_connection: Option<ConnectionProfile>,
    other_connections: Vec<ConnectionProfile>,
    contexts: NotebookContexts,
    connection_requester: Option<ConnectionRequester>,
}

pub struct NotebookModel {
    me: Weak<NotebookModel>,
    options: NotebookOptions,
    managers: Vec<NotebookManager>,
    next_cell_id: AtomicU64,
    state: Mutex<ModelState>,
    session_load_finished: Deferred,
    content_changed: Emitter<NotebookContentChange>,
    kernels_changed: Emitter<KernelStatus>,
    kernel_changed: Emitter<KernelChangedArgs>,
    contexts_changed: Emitter<NotebookContexts>,
    provider_id_changed: Emitter<String>,
    client_session_ready: Emitter<Arc<ClientSession>>,
    valid_connection_selected: Emitter<bool>,
    notifications: Emitter<Notification>,
}

impl NotebookModel {
    pub fn new(options: NotebookOptions) -> Result<Arc<Self>, NotebookError> {
        if options.notebook_uri.is_empty() || options.notebook_managers.is_empty() {
            return Err(NotebookError::InvalidOptions);
        }
        // The placeholder backend only counts when nothing else is configured.
        let mut managers: Vec<NotebookManager> = options
            .notebook_managers
            .iter()
            .filter(|m| m.provider_id != DEFAULT_NOTEBOOK_PROVIDER)
            .cloned()
            .collect();
        if managers.is_empty() {
            managers = options.notebook_managers.clone();
        }
        let provider_id = if options.provider_id.is_empty() {
            managers[0].provider_id.clone()
        } else {
            options.provider_id.clone()
        };
        let default_kernel = options.default_kernel.clone();

        Ok(Arc::new_cyclic(|me| NotebookModel {
            me: me.clone(),
            options,
            managers,
            next_cell_id: AtomicU64::new(1),
            state: Mutex::new(ModelState {
                cells: Vec::new(),
                active_cell: None,
                sessions: Vec::new(),
                active_session: None,
                active_session_sub: None,
                provider_id,
                default_kernel,
                saved_kernel_info: None,
                language_info: None,
                language: String::new(),
                metadata: Map::new(),
                trusted_mode: false,
                in_error_state: false,
                active_connection: None,
                other_connections: Vec::new(),
                contexts: NotebookContexts::default(),
                connection_requester: None,
            }),
            session_load_finished: Deferred::new(),
            content_changed: Emitter::new(),
            kernels_changed: Emitter::new(),
            kernel_changed: Emitter::new(),
            contexts_changed: Emitter::new(),
            provider_id_changed: Emitter::new(),
            client_session_ready: Emitter::new(),
            valid_connection_selected: Emitter::new(),
            notifications: Emitter::new(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_cell_id(&self) -> u64 {
        self.next_cell_id.fetch_add(1, Ordering::Relaxed)
    }

    fn create_cell(&self, contents: &CellContents, trusted: bool) -> Arc<CellModel> {
        CellModel::from_contents(self.next_cell_id(), contents, self.me.clone(), trusted)
    }

    // ---- Loading and saving -------------------------------------------------

    /// Load the document through the first content manager, then pick the
    /// default kernel and provider for it.
    pub async fn request_model_load(&self, trusted: bool) -> Result<()> {
        let content_manager = self
            .content_manager()
            .ok_or(NotebookError::NoContentManager("load"))?;
        match content_manager
            .get_notebook_contents(&self.options.notebook_uri)
            .await
        {
            Ok(contents) => {
                self.load_contents(contents, trusted);
                self.set_default_kernel_and_provider_id();
                Ok(())
            }
            Err(e) => {
                error!("[notebook] Failed to load {}: {}", self.options.notebook_uri, e);
                self.lock().in_error_state = true;
                Err(e)
            }
        }
    }

    pub fn from_json(&self, json: &str, trusted: bool) -> Result<()> {
        let contents = crate::contents::parse_notebook(json)?;
        self.load_contents(contents, trusted);
        Ok(())
    }

    /// Replace the document with `contents`. A document without code cells
    /// is trusted.
    pub fn load_contents(&self, contents: NotebookContents, trusted: bool) {
        let cells: Vec<Arc<CellModel>> = contents
            .cells
            .iter()
            .map(|c| self.create_cell(c, trusted))
            .collect();
        let no_code = cells.iter().all(|c| c.cell_type() == CellType::Markdown);
        debug!("[notebook] Loaded {} cell(s)", cells.len());
        {
            let mut state = self.lock();
            state.cells = cells;
            state.active_cell = None;
            state.trusted_mode = trusted;
            state.saved_kernel_info = contents.metadata.kernelspec;
            state.language_info = contents.metadata.language_info;
            state.metadata = contents.metadata.additional;
        }
        if no_code {
            self.set_trusted_mode(true);
        }
        self.try_set_language_from_info();
    }

    pub fn to_json(&self) -> NotebookContents {
        let (cells, metadata) = {
            let state = self.lock();
            (
                state.cells.clone(),
                NotebookMetadata {
                    kernelspec: state.saved_kernel_info.clone(),
                    language_info: state.language_info.clone(),
                    additional: state.metadata.clone(),
                },
            )
        };
        NotebookContents {
            metadata,
            nbformat: NBFORMAT_MAJOR,
            nbformat_minor: NBFORMAT_MINOR,
            cells: cells.iter().map(|c| c.to_json()).collect(),
        }
    }

    pub async fn save_model(&self) -> Result<()> {
        let content_manager = self
            .content_manager()
            .ok_or(NotebookError::NoContentManager("save"))?;
        content_manager
            .save(&self.options.notebook_uri, &self.to_json())
            .await?;
        info!("[notebook] Saved {}", self.options.notebook_uri);
        self.content_changed.emit(&NotebookContentChange {
            is_dirty: Some(false),
            ..NotebookContentChange::new(NotebookChangeType::DirtyStateChanged, Vec::new())
        });
        Ok(())
    }

    fn content_manager(&self) -> Option<Arc<dyn ContentManager>> {
        self.options
            .notebook_managers
            .iter()
            .find_map(|m| m.content_manager.clone())
    }

    /// Choose the default kernel from the saved kernelspec, else the
    /// configured default, else SQL, and route to its provider.
    pub fn set_default_kernel_and_provider_id(&self) {
        let saved = self.lock().saved_kernel_info.clone();
        let (provider_changed, provider_id) = {
            let mut state = self.lock();
            let previous = state.provider_id.clone();
            if let Some(saved) = saved {
                let saved = self.sanitize_saved_kernel(saved);
                if let Some(provider) = self.provider_for_display_name(&saved.display_name) {
                    state.provider_id = provider;
                }
                state.saved_kernel_info = Some(saved.clone());
                state.default_kernel = Some(saved);
            } else if let Some(default_kernel) = state.default_kernel.clone() {
                match self.provider_for_display_name(&default_kernel.display_name) {
                    Some(provider) => state.provider_id = provider,
                    None => {
                        state.default_kernel = Some(sql_kernel_spec());
                        state.provider_id = SQL_NOTEBOOK_PROVIDER.to_string();
                    }
                }
            } else {
                state.default_kernel = Some(sql_kernel_spec());
                state.provider_id = SQL_NOTEBOOK_PROVIDER.to_string();
            }
            if state.language_info.is_none() {
                state.language_info = Some(default_language_info(&state.provider_id));
            }
            (state.provider_id != previous, state.provider_id.clone())
        };
        self.try_set_language_from_info();
        if provider_changed {
            self.provider_id_changed.emit(&provider_id);
        }
    }

    /// `"PySpark (10.0.0.1)"` becomes the standard `PySpark` kernel.
    fn sanitize_saved_kernel(&self, mut saved: KernelSpec) -> KernelSpec {
        saved.display_name = sanitize_display_name(&saved.display_name);
        let standard = self.options.standard_kernels.iter().find(|k| {
            k.display_name == saved.display_name || saved.display_name.starts_with(&k.display_name)
        });
        if let Some(standard) = standard {
            if !saved.name.is_empty() && saved.name != standard.name {
                saved.name = standard.name.clone();
                saved.display_name = standard.display_name.clone();
            }
        }
        saved
    }

    fn try_set_language_from_info(&self) {
        let mut state = self.lock();
        if let Some(language) = state.language_info.as_ref().and_then(|i| i.language()) {
            state.language = language.to_lowercase();
        }
    }

    fn update_language_info(&self, info: LanguageInfo) {
        self.lock().language_info = Some(info);
        self.try_set_language_from_info();
    }

    // ---- Sessions -----------------------------------------------------------

    /// Create one client session per backend and initialize them all.
    ///
    /// Only the session of the current provider starts a kernel. Failures of
    /// the active session put the model in error state.
    pub async fn start_sessions(&self) {
        let (provider_id, default_kernel) = {
            let state = self.lock();
            (state.provider_id.clone(), state.default_kernel.clone())
        };

        let sessions: Vec<Arc<ClientSession>> = self
            .managers
            .iter()
            .map(|manager| {
                let kernel_spec = if manager.provider_id == provider_id {
                    default_kernel.clone()
                } else {
                    None
                };
                Arc::new(ClientSession::new(ClientSessionOptions {
                    notebook_uri: self.options.notebook_uri.clone(),
                    notebook_manager: manager.clone(),
                    kernel_spec,
                }))
            })
            .collect();
        for session in &sessions {
            self.register_session_hooks(session);
        }

        let active = sessions
            .iter()
            .find(|s| s.provider_id() == provider_id)
            .or_else(|| sessions.first())
            .cloned();
        self.lock().sessions = sessions.clone();
        if let Some(active) = &active {
            self.set_active_session(active.clone());
        }
        if let Some(profile) = self.options.connection_profile.clone() {
            if self.is_valid_connection(&profile) {
                self.lock().active_connection = Some(profile);
            }
        }

        join_all(sessions.iter().map(|s| s.initialize())).await;

        if let Some(active) = active {
            if active.is_in_error_state() {
                self.set_error_state(&active.error_message().unwrap_or_default());
            } else {
                self.client_session_ready.emit(&active);
                self.load_kernel_info(&active).await;
            }
        }
        self.session_load_finished.resolve();
    }

    fn register_session_hooks(&self, session: &Arc<ClientSession>) {
        let me = self.me.clone();
        session.on_kernel_changing(Arc::new(move |args: KernelChangedArgs| {
            let me = me.clone();
            async move {
                if let Some(model) = me.upgrade() {
                    model.load_active_contexts(&args).await;
                }
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        }));

        let me = self.me.clone();
        let provider_id = session.provider_id().to_string();
        // Lives as long as the session.
        let _ = session.status_changed().subscribe(move |status| {
            if let Some(model) = me.upgrade() {
                if model.provider_id() == provider_id {
                    model.kernels_changed.emit(status);
                }
            }
        });
    }

    fn set_active_session(&self, session: Arc<ClientSession>) {
        let me = self.me.clone();
        let subscription = session.kernel_changed().subscribe(move |args| {
            if let Some(model) = me.upgrade() {
                model.kernel_changed.emit(args);
            }
        });
        let previous = {
            let mut state = self.lock();
            state.active_session = Some(session);
            state.active_session_sub.replace(subscription)
        };
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    /// Adopt the backend's view of the default kernel once its session is up.
    async fn load_kernel_info(&self, session: &Arc<ClientSession>) {
        let Some(specs) = session.notebook_manager().session_manager.specs() else {
            return;
        };
        let display_name = self
            .default_kernel()
            .map(|k| k.display_name)
            .unwrap_or_default();
        let default_kernel = self
            .kernel_spec_from_display_name(&display_name)
            .or_else(|| crate::contexts::default_kernel_for(&specs, &display_name));
        let Some(default_kernel) = default_kernel else {
            return;
        };
        self.lock().default_kernel = Some(default_kernel.clone());

        match session.kernel() {
            Some(kernel) if kernel.name() == default_kernel.name => {
                self.update_kernel_info_on_kernel_change(session, kernel).await;
            }
            _ => {
                if let Err(e) = self.do_change_kernel(&default_kernel.display_name, false).await {
                    warn!("[notebook] Loading kernel info failed: {}", e);
                }
            }
        }
    }

    pub async fn change_kernel(&self, display_name: &str) -> Result<()> {
        self.do_change_kernel(display_name, true).await
    }

    /// Switch the active kernel, optionally moving to the backend that
    /// advertises it first.
    ///
    /// A kernel the active backend doesn't advertise is replaced by that
    /// backend's default.
    pub async fn do_change_kernel(&self, display_name: &str, need_set_provider: bool) -> Result<()> {
        if display_name.is_empty() {
            return Ok(());
        }
        if need_set_provider {
            self.set_provider_id_and_session(display_name)?;
        }
        let spec = self.resolve_kernel_spec(display_name);
        let Some(session) = self.active_client_session() else {
            return Ok(());
        };
        session.ready().wait().await;

        match session.change_kernel(&spec).await {
            Ok(kernel) => {
                self.update_kernel_info_on_kernel_change(&session, kernel)
                    .await;
                Ok(())
            }
            Err(e) => {
                self.notify(Severity::Error, &format!("Failed to change kernel: {}", e));
                Err(e)
            }
        }
    }

    /// Route to the first backend advertising `display_name`, else the one
    /// the standard kernel table names.
    fn set_provider_id_and_session(&self, display_name: &str) -> Result<(), NotebookError> {
        let Some(provider) = self.find_provider_for_kernel(display_name) else {
            debug!("[notebook] No provider found supporting kernel {}", display_name);
            return Ok(());
        };

        let (session, needs_switch, provider_changed) = {
            let mut state = self.lock();
            let session = state
                .sessions
                .iter()
                .find(|s| s.provider_id() == provider)
                .cloned();
            if session.is_none() && !state.sessions.is_empty() {
                return Err(NotebookError::ManagerNotFound(provider));
            }
            let needs_switch = match (&session, &state.active_session) {
                (Some(session), Some(active)) => !Arc::ptr_eq(session, active),
                (Some(_), None) => true,
                _ => false,
            };
            let provider_changed = state.provider_id != provider;
            state.provider_id = provider.clone();
            (session, needs_switch, provider_changed)
        };

        if needs_switch {
            if let Some(session) = session {
                info!("[notebook] Switching to provider {}", provider);
                self.set_active_session(session);
            }
        }
        if provider_changed {
            self.provider_id_changed.emit(&provider);
        }
        Ok(())
    }

    fn find_provider_for_kernel(&self, display_name: &str) -> Option<String> {
        let display_name = sanitize_display_name(display_name);
        self.managers
            .iter()
            .find(|m| {
                m.session_manager.specs().is_some_and(|specs| {
                    specs.find_by_display_name(&display_name).is_some()
                        || specs.find_by_name(&display_name).is_some()
                })
            })
            .map(|m| m.provider_id.clone())
            .or_else(|| self.provider_for_display_name(&display_name))
    }

    fn provider_for_display_name(&self, display_name: &str) -> Option<String> {
        self.standard_kernel(display_name)
            .map(|k| k.notebook_provider.clone())
    }

    fn standard_kernel(&self, display_name: &str) -> Option<&StandardKernel> {
        self.options
            .standard_kernels
            .iter()
            .find(|k| k.display_name.eq_ignore_ascii_case(display_name))
    }

    fn resolve_kernel_spec(&self, display_name: &str) -> KernelSpec {
        let active_specs = self
            .active_client_session()
            .and_then(|s| s.notebook_manager().session_manager.specs())
            .filter(|specs| !specs.kernels.is_empty());

        match (self.kernel_spec_from_display_name(display_name), active_specs) {
            (Some(spec), Some(specs)) if specs.find_by_display_name(&spec.display_name).is_none() => {
                specs.default_spec().cloned().unwrap_or(spec)
            }
            (Some(spec), _) => spec,
            (None, Some(specs)) => specs.default_spec().cloned().unwrap_or_else(sql_kernel_spec),
            (None, None) => sql_kernel_spec(),
        }
    }

    fn kernel_spec_from_display_name(&self, display_name: &str) -> Option<KernelSpec> {
        let display_name = sanitize_display_name(display_name);
        let specs = self.specs();
        let mut spec = specs
            .find_by_display_name(&display_name)
            .or_else(|| specs.find_by_name(&display_name))
            .cloned()?;
        if spec.name.is_empty() {
            spec.name = specs.default_kernel.clone();
        }
        Some(spec)
    }

    async fn update_kernel_info_on_kernel_change(
        &self,
        session: &Arc<ClientSession>,
        kernel: Arc<dyn Kernel>,
    ) {
        match kernel.spec().await {
            Ok(spec) => {
                let info = KernelSpec {
                    name: kernel.name(),
                    display_name: spec.display_name,
                    language: spec.language,
                };
                self.lock().saved_kernel_info = Some(info.clone());
                if let Err(e) = session.configure_kernel(&info).await {
                    warn!("[notebook] Failed to configure kernel {}: {}", info.name, e);
                }
            }
            Err(e) => debug!("[notebook] Keeping saved kernel info: {}", e),
        }
        if kernel.ready().await.is_ok() {
            if let Some(info) = kernel.info().and_then(|i| i.language_info) {
                self.update_language_info(info);
            }
        }
    }

    pub fn set_error_state(&self, message: &str) {
        self.lock().in_error_state = true;
        self.notify(
            Severity::Error,
            &format!("Could not start session: {}", message),
        );
    }

    /// Disconnect connections, abandon running cells and shut down every
    /// session.
    pub async fn handle_closed(&self) {
        let (connections, cells, sessions, subscription) = {
            let mut state = self.lock();
            let mut connections = std::mem::take(&mut state.other_connections);
            connections.extend(state.active_connection.take());
            state.active_session = None;
            (
                connections,
                state.cells.clone(),
                std::mem::take(&mut state.sessions),
                state.active_session_sub.take(),
            )
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }

        if let Some(service) = &self.options.connection_service {
            for connection in &connections {
                if let Err(e) = service.disconnect(connection).await {
                    warn!("[notebook] Failed to disconnect {}: {}", connection.server_name, e);
                }
            }
        }
        for cell in &cells {
            cell.dispose();
        }
        for session in sessions {
            session.ready().wait().await;
            if let Err(e) = session.shutdown().await {
                self.notify(
                    Severity::Error,
                    &format!("An error occurred when closing the notebook: {}", e),
                );
            }
        }
        info!("[notebook] Closed {}", self.options.notebook_uri);
    }

    // ---- Connections --------------------------------------------------------

    async fn load_active_contexts(&self, args: &KernelChangedArgs) {
        let Some(kernel) = &args.new_value else {
            return;
        };
        let display_name = self.display_name_from_spec_name(&kernel.name());
        let provider_ids = self.connection_provider_ids(&display_name);
        let current = self
            .active_connection()
            .or_else(|| self.options.connection_profile.clone());

        let contexts = match NotebookContexts::for_kernel(
            self.options.connection_service.as_deref(),
            &provider_ids,
            current.as_ref(),
        )
        .await
        {
            Ok(contexts) => contexts,
            Err(e) => {
                warn!("[notebook] Could not load connections for {}: {}", display_name, e);
                NotebookContexts::default()
            }
        };
        self.lock().contexts = contexts.clone();
        self.contexts_changed.emit(&contexts);

        if let Some(default_connection) = contexts.default_connection {
            let server_name = default_connection.server_name.clone();
            self.change_context(&server_name, Some(default_connection))
                .await;
        }
    }

    /// Make `connection` (or the known context for `server_name`) the active
    /// connection and point the kernel at it.
    pub async fn change_context(&self, server_name: &str, connection: Option<ConnectionProfile>) {
        let connection = connection.or_else(|| {
            self.lock()
                .contexts
                .find_by_server(server_name)
                .cloned()
        });
        let Some(connection) = connection else {
            self.valid_connection_selected.emit(&false);
            return;
        };

        {
            let mut state = self.lock();
            if let Some(previous) = state.active_connection.take() {
                if previous.id != connection.id
                    && !state.other_connections.iter().any(|c| c.id == previous.id)
                {
                    state.other_connections.push(previous);
                }
            }
            state.active_connection = Some(connection.clone());
        }
        self.refresh_connections(&connection);

        let Some(session) = self.active_client_session() else {
            self.valid_connection_selected.emit(&false);
            return;
        };
        match session.update_connection(&connection).await {
            Ok(()) => self.valid_connection_selected.emit(&true),
            Err(e) => {
                self.notify(Severity::Error, &e.to_string());
                self.valid_connection_selected.emit(&false);
            }
        }
    }

    fn refresh_connections(&self, connection: &ConnectionProfile) {
        if !self.is_valid_connection(connection) {
            return;
        }
        let contexts = {
            let mut state = self.lock();
            if state
                .contexts
                .default_connection
                .as_ref()
                .is_some_and(|d| d.id == connection.id)
            {
                return;
            }
            state.contexts.promote(connection);
            state.contexts.clone()
        };
        self.contexts_changed.emit(&contexts);
    }

    fn is_valid_connection(&self, profile: &ConnectionProfile) -> bool {
        let display_name = {
            let state = self.lock();
            state
                .default_kernel
                .as_ref()
                .or(state.saved_kernel_info.as_ref())
                .map(|k| k.display_name.clone())
        };
        display_name.is_some_and(|name| {
            is_valid_connection(profile, &self.connection_provider_ids(&name))
        })
    }

    /// Connection providers the kernel shown as `display_name` accepts.
    pub fn connection_provider_ids(&self, display_name: &str) -> Vec<String> {
        self.standard_kernel(display_name)
            .map(|k| k.connection_provider_ids.clone())
            .unwrap_or_default()
    }

    pub fn set_connection_requester(&self, requester: ConnectionRequester) {
        self.lock().connection_requester = Some(requester);
    }

    pub async fn request_connection(&self) -> bool {
        let requester = self.lock().connection_requester.clone();
        match requester {
            Some(requester) => requester().await,
            None => {
                self.notify(
                    Severity::Error,
                    "Please select a connection to run cells for this kernel",
                );
                false
            }
        }
    }

    /// Address of the gateway for the active connection, when it has one.
    pub fn gateway_address(&self) -> Option<GatewayAddress> {
        let connection = self.active_connection()?;
        let gateway = &self.options.gateway;
        if !connection
            .provider_name
            .eq_ignore_ascii_case(&gateway.sql_connection_provider)
        {
            return None;
        }
        let service = self.options.connection_service.as_ref()?;
        let endpoint = service
            .cluster_endpoints(&connection)
            .into_iter()
            .find(|e| e.service_name == gateway.service_name)?;
        Some(GatewayAddress::from_endpoint(
            &endpoint.endpoint,
            &connection.server_name,
            &gateway.default_port,
        ))
    }

    // ---- Cells --------------------------------------------------------------

    /// Insert a new cell at `index` (or at the end) and make it active.
    pub fn add_cell(&self, cell_type: CellType, index: Option<usize>) -> Option<Arc<CellModel>> {
        if self.in_error_state() {
            return None;
        }
        let cell = CellModel::new(self.next_cell_id(), cell_type, self.me.clone());
        let cell_index = {
            let mut state = self.lock();
            match index.filter(|i| *i < state.cells.len()) {
                Some(i) => {
                    state.cells.insert(i, cell.clone());
                    Some(i)
                }
                None => {
                    state.cells.push(cell.clone());
                    None
                }
            }
        };
        self.update_active_cell(&cell);
        cell.set_edit_mode(true);
        self.content_changed.emit(&NotebookContentChange {
            cell_index,
            ..NotebookContentChange::new(NotebookChangeType::CellsAdded, vec![cell.clone()])
        });
        Some(cell)
    }

    /// Insert a copy of `cell` right after it. The copy gets a fresh guid.
    pub fn duplicate_cell(&self, cell: &CellModel) -> Option<Arc<CellModel>> {
        if self.in_error_state() {
            return None;
        }
        let index = self.find_cell_index(cell)?;
        let mut contents = cell.to_json();
        contents.metadata.cell_guid = None;
        let copy = self.create_cell(&contents, cell.trusted_mode());
        self.lock().cells.insert(index + 1, copy.clone());
        self.content_changed.emit(&NotebookContentChange {
            cell_index: Some(index + 1),
            ..NotebookContentChange::new(NotebookChangeType::CellsAdded, vec![copy.clone()])
        });
        Some(copy)
    }

    pub fn delete_cell(&self, cell: &CellModel) {
        if self.in_error_state() {
            return;
        }
        let removed = {
            let mut state = self.lock();
            match state.cells.iter().position(|c| c.id() == cell.id()) {
                Some(index) => {
                    let removed = state.cells.remove(index);
                    if state
                        .active_cell
                        .as_ref()
                        .is_some_and(|a| a.id() == removed.id())
                    {
                        state.active_cell = None;
                    }
                    Some((index, removed))
                }
                None => None,
            }
        };
        match removed {
            Some((index, removed)) => {
                removed.dispose();
                self.content_changed.emit(&NotebookContentChange {
                    cell_index: Some(index),
                    ..NotebookContentChange::new(NotebookChangeType::CellDeleted, vec![removed])
                });
            }
            None => self.notify(Severity::Error, "Failed to delete cell."),
        }
    }

    /// Apply edits from an external editor.
    pub fn push_edit_operations(&self, edits: Vec<NotebookEditOperation>) {
        if self.in_error_state() {
            return;
        }
        for edit in edits {
            let trusted = self.trusted_mode();
            let new_cells: Vec<Arc<CellModel>> = edit
                .cells
                .iter()
                .map(|c| self.create_cell(c, trusted))
                .collect();
            let (start, removed) = {
                let mut state = self.lock();
                let len = state.cells.len();
                let start = edit.range.start.min(len);
                let end = edit.range.end.clamp(start, len);
                let removed: Vec<Arc<CellModel>> = state
                    .cells
                    .splice(start..end, new_cells.iter().cloned())
                    .collect();
                (start, removed)
            };
            for cell in &removed {
                cell.dispose();
            }
            self.content_changed.emit(&NotebookContentChange {
                cell_index: Some(start),
                ..NotebookContentChange::new(NotebookChangeType::CellsAdded, new_cells)
            });
        }
    }

    pub fn find_cell_index(&self, cell: &CellModel) -> Option<usize> {
        self.lock().cells.iter().position(|c| c.id() == cell.id())
    }

    fn find_cell(&self, id: u64) -> Option<Arc<CellModel>> {
        self.lock().cells.iter().find(|c| c.id() == id).cloned()
    }

    pub fn update_active_cell(&self, cell: &CellModel) {
        let Some(cell) = self.find_cell(cell.id()) else {
            return;
        };
        let previous = self.lock().active_cell.replace(cell.clone());
        if let Some(previous) = previous.filter(|p| p.id() != cell.id()) {
            previous.set_active(false);
        }
        cell.set_active(true);
    }

    /// Called by cells. Source and output updates mark the document dirty.
    pub fn on_cell_change(&self, cell: &CellModel, change: NotebookChangeType) {
        let cells: Vec<Arc<CellModel>> = self.find_cell(cell.id()).into_iter().collect();
        let event = match change {
            NotebookChangeType::CellOutputUpdated | NotebookChangeType::CellSourceUpdated => {
                NotebookContentChange {
                    is_dirty: Some(true),
                    ..NotebookContentChange::new(NotebookChangeType::DirtyStateChanged, cells)
                }
            }
            other => NotebookContentChange::new(other, cells),
        };
        self.content_changed.emit(&event);
    }

    /// Called by cells when the kernel announces a status on iopub.
    pub fn on_kernel_status(&self, status: KernelStatus) {
        if let Some(session) = self.active_client_session() {
            session.on_kernel_status(status);
        }
    }

    pub fn set_trusted_mode(&self, trusted: bool) {
        let cells = {
            let mut state = self.lock();
            state.trusted_mode = trusted;
            state.cells.clone()
        };
        for cell in cells {
            cell.set_trusted_mode(trusted);
        }
    }

    pub(crate) fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Error => error!("[notebook] {}", message),
            Severity::Warning => warn!("[notebook] {}", message),
            Severity::Info => info!("[notebook] {}", message),
        }
        self.notifications.emit(&Notification {
            severity,
            message: message.to_string(),
        });
    }

    // ---- Kernel lookups -----------------------------------------------------

    /// Kernels advertised by every backend, in configured order. The default
    /// is the active backend's.
    pub fn specs(&self) -> KernelSpecs {
        let active_default = self
            .active_client_session()
            .and_then(|s| s.notebook_manager().session_manager.specs())
            .map(|s| s.default_kernel);
        let mut all = KernelSpecs::default();
        for manager in &self.managers {
            if let Some(specs) = manager.session_manager.specs() {
                if all.default_kernel.is_empty() {
                    all.default_kernel = specs.default_kernel.clone();
                }
                all.kernels.extend(specs.kernels);
            }
        }
        if let Some(default_kernel) = active_default.filter(|d| !d.is_empty()) {
            all.default_kernel = default_kernel;
        }
        all
    }

    pub fn display_name_from_spec_name(&self, name: &str) -> String {
        let active_specs = self
            .active_client_session()
            .and_then(|s| s.notebook_manager().session_manager.specs());
        active_specs
            .as_ref()
            .and_then(|specs| specs.find_by_name(name))
            .map(|k| k.display_name.clone())
            .or_else(|| self.specs().find_by_name(name).map(|k| k.display_name.clone()))
            .or_else(|| {
                self.options
                    .standard_kernels
                    .iter()
                    .find(|k| k.name.eq_ignore_ascii_case(name))
                    .map(|k| k.display_name.clone())
            })
            .unwrap_or_else(|| name.to_string())
    }

    pub fn standard_kernels_display_name(&self) -> Vec<String> {
        self.options
            .standard_kernels
            .iter()
            .map(|k| k.display_name.clone())
            .collect()
    }

    // ---- Accessors ----------------------------------------------------------

    pub fn notebook_uri(&self) -> &str {
        &self.options.notebook_uri
    }

    pub fn notebook_managers(&self) -> &[NotebookManager] {
        &self.managers
    }

    pub fn cells(&self) -> Vec<Arc<CellModel>> {
        self.lock().cells.clone()
    }

    pub fn active_cell(&self) -> Option<Arc<CellModel>> {
        self.lock().active_cell.clone()
    }

    pub fn provider_id(&self) -> String {
        self.lock().provider_id.clone()
    }

    pub fn default_kernel(&self) -> Option<KernelSpec> {
        self.lock().default_kernel.clone()
    }

    pub fn saved_kernel_info(&self) -> Option<KernelSpec> {
        self.lock().saved_kernel_info.clone()
    }

    pub fn language_info(&self) -> Option<LanguageInfo> {
        self.lock().language_info.clone()
    }

    pub fn language(&self) -> String {
        self.lock().language.clone()
    }

    pub fn trusted_mode(&self) -> bool {
        self.lock().trusted_mode
    }

    pub fn in_error_state(&self) -> bool {
        self.lock().in_error_state
    }

    pub fn active_connection(&self) -> Option<ConnectionProfile> {
        self.lock().active_connection.clone()
    }

    pub fn other_connections(&self) -> Vec<ConnectionProfile> {
        self.lock().other_connections.clone()
    }

    pub fn contexts(&self) -> NotebookContexts {
        self.lock().contexts.clone()
    }

    pub fn active_client_session(&self) -> Option<Arc<ClientSession>> {
        self.lock().active_session.clone()
    }

    pub fn client_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.lock().sessions.clone()
    }

    pub fn is_session_ready(&self) -> bool {
        self.active_client_session()
            .is_some_and(|s| s.is_ready())
    }

    /// Resolves once `start_sessions` has finished.
    pub fn session_load_finished(&self) -> DeferredWaiter {
        self.session_load_finished.waiter()
    }

    pub fn content_changed(&self) -> &Emitter<NotebookContentChange> {
        &self.content_changed
    }

    pub fn kernels_changed(&self) -> &Emitter<KernelStatus> {
        &self.kernels_changed
    }

    pub fn kernel_changed(&self) -> &Emitter<KernelChangedArgs> {
        &self.kernel_changed
    }

    pub fn contexts_changed(&self) -> &Emitter<NotebookContexts> {
        &self.contexts_changed
    }

    pub fn provider_id_changed(&self) -> &Emitter<String> {
        &self.provider_id_changed
    }

    pub fn client_session_ready(&self) -> &Emitter<Arc<ClientSession>> {
        &self.client_session_ready
    }

    pub fn valid_connection_selected(&self) -> &Emitter<bool> {
        &self.valid_connection_selected
    }

    pub fn notifications(&self) -> &Emitter<Notification> {
        &self.notifications
    }
}

fn default_language_info(provider_id: &str) -> LanguageInfo {
    let name = if provider_id == SQL_NOTEBOOK_PROVIDER {
        "sql"
    } else {
        "python"
    };
    LanguageInfo {
        version: Some(String::new()),
        mimetype: Some(format!("x-{}", name)),
        ..LanguageInfo::new(name)
    }
}
