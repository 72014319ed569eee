//! Lifecycle of one document's session on one backend.
//!
//! ```text
//! Uninitialized --initialize()--> Starting --> Ready | ErrorState
//!                                              Ready --change_kernel()--> KernelChanging --> Ready
//! ```
//!
//! `initialize` never fails; callers check [`ClientSession::is_in_error_state`].
//! Each `change_kernel` arms a fresh completion signal before doing any work,
//! so a waiter captured earlier never observes a later change.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};

use crate::contexts::ConnectionProfile;
use crate::deferred::{Deferred, DeferredWaiter};
use crate::error::SessionError;
use crate::events::Emitter;
use crate::kernel::{Kernel, KernelSpec, KernelStatus, NotebookManager, Session, SessionOptions};

pub struct ClientSessionOptions {
    pub notebook_uri: String,
    pub notebook_manager: NotebookManager,
    /// Kernel to start during `initialize`. `None` starts nothing.
    pub kernel_spec: Option<KernelSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelPreference {
    pub name: Option<String>,
    pub language: Option<String>,
    pub should_start: bool,
}

#[derive(Clone)]
pub struct KernelChangedArgs {
    pub old_value: Option<Arc<dyn Kernel>>,
    pub new_value: Option<Arc<dyn Kernel>>,
}

/// Runs after a kernel change and before it is announced. Hooks run one at
/// a time in registration order.
pub type KernelChangingHook =
    Arc<dyn Fn(KernelChangedArgs) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct SessionState {
    session: Option<Arc<dyn Session>>,
    is_ready: bool,
    in_error: bool,
    error_message: Option<String>,
    /// Last status the running kernel announced on iopub.
    reported_status: Option<KernelStatus>,
    cached_kernel_spec: Option<KernelSpec>,
    kernel_preference: KernelPreference,
    kernel_change_completed: Deferred,
    default_kernel_loaded: bool,
    initialized: bool,
}

pub struct ClientSession {
    notebook_uri: String,
    manager: NotebookManager,
    state: Mutex<SessionState>,
    ready: Deferred,
    hooks: Mutex<Vec<KernelChangingHook>>,
    kernel_changed: Emitter<KernelChangedArgs>,
    status_changed: Emitter<KernelStatus>,
    terminated: Emitter<()>,
}

impl ClientSession {
    pub fn new(options: ClientSessionOptions) -> Self {
        let kernel_preference = match &options.kernel_spec {
            Some(spec) => KernelPreference {
                name: Some(spec.name.clone()),
                language: spec.language.clone(),
                should_start: true,
            },
            None => KernelPreference::default(),
        };
        ClientSession {
            notebook_uri: options.notebook_uri,
            manager: options.notebook_manager,
            state: Mutex::new(SessionState {
                session: None,
                is_ready: false,
                in_error: false,
                error_message: None,
                reported_status: None,
                cached_kernel_spec: None,
                kernel_preference,
                kernel_change_completed: Deferred::new(),
                default_kernel_loaded: false,
                initialized: false,
            }),
            ready: Deferred::new(),
            hooks: Mutex::new(Vec::new()),
            kernel_changed: Emitter::new(),
            status_changed: Emitter::new(),
            terminated: Emitter::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bring up the backend and, if preferred, start a kernel. Runs once;
    /// later calls return immediately.
    pub async fn initialize(&self) {
        {
            let mut state = self.lock();
            if state.initialized {
                return;
            }
            state.initialized = true;
        }

        if let Err(e) = self.start().await {
            error!(
                "[session] Failed to start session for {} on {}: {}",
                self.notebook_uri, self.manager.provider_id, e
            );
            let mut state = self.lock();
            state.in_error = true;
            state.error_message = Some(e.to_string());
        }

        let (completed, in_error) = {
            let mut state = self.lock();
            state.is_ready = true;
            (state.kernel_change_completed.clone(), state.in_error)
        };
        self.ready.resolve();
        if !in_error {
            if let Some(kernel) = self.kernel() {
                self.notify_kernel_changed(KernelChangedArgs {
                    old_value: None,
                    new_value: Some(kernel),
                })
                .await;
            }
        }
        completed.resolve();
        self.notify_status_changed();
    }

    async fn start(&self) -> Result<()> {
        if let Some(server) = &self.manager.server_manager {
            if !server.is_started() {
                server.start_server().await?;
                if !server.is_started() {
                    bail!("Server for provider '{}' did not start", self.manager.provider_id);
                }
            }
        }
        self.manager.session_manager.ready().await?;

        let preference = self.kernel_preference();
        if preference.should_start {
            self.start_session_instance(preference.name).await?;
        }
        self.update_cached_kernel_spec().await
    }

    async fn start_session_instance(&self, kernel_name: Option<String>) -> Result<Arc<dyn Session>> {
        let session_manager = &self.manager.session_manager;
        let options = SessionOptions {
            path: self.notebook_uri.clone(),
            kernel_name,
        };

        let session = match session_manager.start_new(options).await {
            Ok(session) => session,
            Err(SessionError::UnsupportedKernel(name)) => {
                warn!(
                    "[session] Kernel '{}' unsupported by {}, starting the default kernel",
                    name, self.manager.provider_id
                );
                let session = session_manager
                    .start_new(SessionOptions {
                        path: self.notebook_uri.clone(),
                        kernel_name: None,
                    })
                    .await?;
                self.lock().default_kernel_loaded = true;
                session
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "[session] Started session {} for {}",
            session.id(),
            self.notebook_uri
        );
        self.lock().session = Some(session.clone());
        Ok(session)
    }

    async fn update_cached_kernel_spec(&self) -> Result<()> {
        if let Some(kernel) = self.kernel() {
            let spec = kernel.spec().await?;
            self.lock().cached_kernel_spec = Some(spec);
        }
        Ok(())
    }

    /// Switch to `spec`, starting a session first if there is none.
    ///
    /// The completion signal is resolved whether or not the change succeeds.
    pub async fn change_kernel(&self, spec: &KernelSpec) -> Result<Arc<dyn Kernel>> {
        let (completed, old_kernel) = {
            let mut state = self.lock();
            state.is_ready = false;
            state.reported_status = None;
            let completed = Deferred::new();
            state.kernel_change_completed = completed.clone();
            let old_kernel = state.session.as_ref().and_then(|s| s.kernel());
            (completed, old_kernel)
        };
        self.notify_status_changed();

        match self.do_change_kernel(spec).await {
            Ok(kernel) => {
                {
                    let mut state = self.lock();
                    state.is_ready = true;
                    state.in_error = false;
                    state.error_message = None;
                }
                if let Err(e) = self.update_cached_kernel_spec().await {
                    warn!("[session] Could not read spec of new kernel: {}", e);
                }
                info!("[session] Kernel changed to {}", spec.display_name);
                self.notify_kernel_changed(KernelChangedArgs {
                    old_value: old_kernel,
                    new_value: Some(kernel.clone()),
                })
                .await;
                completed.resolve();
                self.notify_status_changed();
                Ok(kernel)
            }
            Err(e) => {
                warn!("[session] Could not change kernel to {}: {}", spec.display_name, e);
                let ready = self.kernel().is_some_and(|k| k.is_ready());
                {
                    let mut state = self.lock();
                    state.is_ready = ready;
                    state.error_message = Some(e.to_string());
                }
                completed.resolve();
                self.notify_status_changed();
                Err(e)
            }
        }
    }

    async fn do_change_kernel(&self, spec: &KernelSpec) -> Result<Arc<dyn Kernel>> {
        let kernel = match self.session() {
            Some(session) => session.change_kernel(spec).await?,
            None => {
                let session = self.start_session_instance(Some(spec.name.clone())).await?;
                match session.kernel() {
                    Some(kernel) => kernel,
                    None => bail!("Session {} has no kernel", session.id()),
                }
            }
        };
        kernel.ready().await?;
        Ok(kernel)
    }

    async fn notify_kernel_changed(&self, args: KernelChangedArgs) {
        let hooks: Vec<KernelChangingHook> = self
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for hook in hooks {
            if let Err(e) = hook(args.clone()).await {
                warn!("[session] Kernel change hook failed: {}", e);
            }
        }
        self.kernel_changed.emit(&args);
    }

    pub fn on_kernel_changing(&self, hook: KernelChangingHook) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub async fn configure_kernel(&self, spec: &KernelSpec) -> Result<()> {
        match self.session() {
            Some(session) => session.configure_kernel(spec).await,
            None => Ok(()),
        }
    }

    /// Point the running kernel at `profile`. Without a kernel this is a no-op.
    pub async fn update_connection(&self, profile: &ConnectionProfile) -> Result<()> {
        let Some(kernel) = self.kernel() else {
            return Ok(());
        };
        kernel.ready().await?;
        if let Some(session) = self.session() {
            session.configure_connection(profile).await?;
        }
        Ok(())
    }

    /// Shut down the backend session. Without a session this is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let session = self.lock().session.take();
        let Some(session) = session else {
            return Ok(());
        };
        info!("[session] Shutting down session {}", session.id());
        let result = self.manager.session_manager.shutdown(&session.id()).await;
        {
            let mut state = self.lock();
            state.is_ready = false;
            state.reported_status = None;
        }
        self.terminated.emit(&());
        result
    }

    /// `Starting` whenever the session is not ready, whatever the backend
    /// reports. Otherwise the kernel's last announced status, falling back
    /// to the backend's view.
    pub fn status(&self) -> KernelStatus {
        let (session, reported) = {
            let state = self.lock();
            if !state.is_ready {
                return KernelStatus::Starting;
            }
            (state.session.clone(), state.reported_status)
        };
        match (session, reported) {
            (Some(_), Some(reported)) => reported,
            (Some(session), None) => session.status(),
            (None, _) => KernelStatus::Dead,
        }
    }

    /// Record a status the kernel announced in a `status` message and
    /// publish it.
    pub fn on_kernel_status(&self, status: KernelStatus) {
        debug!("[session] Kernel for {} is {}", self.notebook_uri, status);
        self.lock().reported_status = Some(status);
        self.notify_status_changed();
    }

    /// Publish the current status.
    pub fn notify_status_changed(&self) {
        let status = self.status();
        self.status_changed.emit(&status);
    }

    pub fn notebook_uri(&self) -> &str {
        &self.notebook_uri
    }

    pub fn provider_id(&self) -> &str {
        &self.manager.provider_id
    }

    pub fn notebook_manager(&self) -> &NotebookManager {
        &self.manager
    }

    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.lock().session.clone()
    }

    pub fn kernel(&self) -> Option<Arc<dyn Kernel>> {
        self.session().and_then(|s| s.kernel())
    }

    pub fn is_ready(&self) -> bool {
        self.lock().is_ready
    }

    pub fn is_in_error_state(&self) -> bool {
        self.lock().in_error
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock().error_message.clone()
    }

    pub fn cached_kernel_spec(&self) -> Option<KernelSpec> {
        self.lock().cached_kernel_spec.clone()
    }

    pub fn kernel_preference(&self) -> KernelPreference {
        self.lock().kernel_preference.clone()
    }

    pub fn set_kernel_preference(&self, preference: KernelPreference) {
        self.lock().kernel_preference = preference;
    }

    /// True when the requested kernel was unsupported and the backend
    /// default was started instead.
    pub fn default_kernel_loaded(&self) -> bool {
        self.lock().default_kernel_loaded
    }

    /// Resolves once `initialize` has finished.
    pub fn ready(&self) -> DeferredWaiter {
        self.ready.waiter()
    }

    /// Resolves when the most recent kernel change (or initialization)
    /// finishes.
    pub fn kernel_change_completed(&self) -> DeferredWaiter {
        self.lock().kernel_change_completed.waiter()
    }

    pub fn kernel_changed(&self) -> &Emitter<KernelChangedArgs> {
        &self.kernel_changed
    }

    pub fn status_changed(&self) -> &Emitter<KernelStatus> {
        &self.status_changed
    }

    pub fn terminated(&self) -> &Emitter<()> {
        &self.terminated
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("notebook_uri", &self.notebook_uri)
            .field("provider_id", &self.manager.provider_id)
            .field("is_ready", &self.is_ready())
            .finish()
    }
}
