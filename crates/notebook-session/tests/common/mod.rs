//! In-memory backends for integration tests.
//!
//! `FakeSessionManager` hands out `FakeSession`s whose kernels answer execute
//! requests from a per-kernel script, routed through a real `FutureRouter`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use jupyter_protocol::{
    ExecuteReply, ExecuteRequest, ExecutionCount, JupyterMessage, JupyterMessageContent,
    ReplyStatus,
};
use kernel_messages::{message_from_value, message_to_json};
use notebook_session::{
    ClusterEndpoint, ConnectionProfile, ConnectionService, ContentManager, ExecutionFuture,
    FutureRouter, Kernel, KernelInfo, KernelSpec, KernelSpecs, KernelStatus, LanguageInfo,
    NotebookContents, NotebookManager, ServerManager, Session, SessionError, SessionManager,
    SessionOptions,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Receive the next event or fail the test after a second.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn sql_specs() -> KernelSpecs {
    KernelSpecs {
        default_kernel: "SQL".into(),
        kernels: vec![KernelSpec::new("SQL", "SQL").with_language("sql")],
    }
}

pub fn jupyter_specs() -> KernelSpecs {
    KernelSpecs {
        default_kernel: "python3".into(),
        kernels: vec![
            KernelSpec::new("python3", "Python 3").with_language("python"),
            KernelSpec::new("pysparkkernel", "PySpark").with_language("python"),
        ],
    }
}

/// One step of a scripted execution.
#[derive(Debug, Clone)]
pub enum Step {
    Iopub(&'static str, Value),
    /// Wait until [`FakeKernel::release`] is called.
    Hold,
    Reply(ReplyStatus),
    /// Drop the route without replying.
    Vanish,
}

pub struct FakeKernel {
    id: String,
    spec: KernelSpec,
    language_info: Option<LanguageInfo>,
    requires_connection: bool,
    router: FutureRouter,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    release: Arc<Notify>,
    execution_count: AtomicUsize,
    pub executed: Mutex<Vec<String>>,
    pub interrupts: AtomicUsize,
}

impl FakeKernel {
    pub fn new(spec: KernelSpec, requires_connection: bool) -> Arc<Self> {
        let language_info = spec.language.as_deref().map(LanguageInfo::new);
        Arc::new(FakeKernel {
            id: uuid::Uuid::new_v4().to_string(),
            spec,
            language_info,
            requires_connection,
            router: FutureRouter::new(),
            scripts: Mutex::new(VecDeque::new()),
            release: Arc::new(Notify::new()),
            execution_count: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
        })
    }

    /// Script the next execute request. Unscripted requests reply `ok`.
    pub fn push_script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.router.pending()
    }

    fn reply(&self, parent: &JupyterMessage, status: ReplyStatus) -> JupyterMessage {
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
        let content = JupyterMessageContent::ExecuteReply(ExecuteReply {
            status,
            execution_count: ExecutionCount::new(count),
            error: None,
            payload: Vec::new(),
            user_expressions: None,
        });
        JupyterMessage::new(content, Some(parent))
    }
}

/// Wire form of an iopub message answering `parent`.
fn iopub_envelope(parent: &JupyterMessage, msg_type: &str, content: Value) -> Result<Value> {
    let mut header = serde_json::to_value(&parent.header)?;
    header["msg_id"] = json!(uuid::Uuid::new_v4().to_string());
    header["msg_type"] = json!(msg_type);
    Ok(json!({
        "header": header,
        "parent_header": parent.header,
        "metadata": {},
        "content": content,
        "channel": "iopub"
    }))
}

#[async_trait]
impl Kernel for FakeKernel {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn name(&self) -> String {
        self.spec.name.clone()
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn info(&self) -> Option<KernelInfo> {
        Some(KernelInfo {
            language_info: self.language_info.clone(),
        })
    }

    async fn spec(&self) -> Result<KernelSpec> {
        Ok(self.spec.clone())
    }

    fn requires_connection(&self) -> bool {
        self.requires_connection
    }

    fn request_execute(
        &self,
        request: ExecuteRequest,
        dispose_on_done: bool,
    ) -> Result<Arc<ExecutionFuture>> {
        self.executed.lock().unwrap().push(request.code.clone());
        let parent: JupyterMessage = request.into();
        let future = self.router.register(&parent.header.msg_id, dispose_on_done);

        let steps = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![Step::Reply(ReplyStatus::Ok)]);
        // Messages travel as JSON, the way a backend delivers them.
        let mut messages = Vec::new();
        for step in steps {
            let message = match step {
                Step::Iopub(msg_type, content) => {
                    let message = message_from_value(iopub_envelope(&parent, msg_type, content)?)?;
                    Some(message_to_json(&message)?)
                }
                Step::Reply(status) => Some(message_to_json(&self.reply(&parent, status))?),
                Step::Hold => None,
                Step::Vanish => {
                    self.router.clear();
                    break;
                }
            };
            messages.push(message);
        }

        let router = self.router.clone();
        let release = self.release.clone();
        tokio::spawn(async move {
            for message in messages {
                match message {
                    Some(json) => {
                        router
                            .route_json(&json)
                            .expect("scripted message should decode");
                    }
                    None => release.notified().await,
                }
            }
        });
        Ok(future)
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Shared by a manager and its sessions so tests can reach every kernel.
pub struct KernelFactory {
    specs: KernelSpecs,
    requires_connection: AtomicBool,
    fail_changes: AtomicBool,
    kernels: Mutex<Vec<Arc<FakeKernel>>>,
}

impl KernelFactory {
    fn create(&self, name: &str) -> Arc<FakeKernel> {
        let spec = self
            .specs
            .find_by_name(name)
            .cloned()
            .unwrap_or_else(|| KernelSpec::new(name, name));
        let kernel = FakeKernel::new(spec, self.requires_connection.load(Ordering::SeqCst));
        self.kernels.lock().unwrap().push(kernel.clone());
        kernel
    }
}

pub struct FakeSession {
    id: String,
    path: String,
    factory: Arc<KernelFactory>,
    kernel: Mutex<Option<Arc<FakeKernel>>>,
    status: Mutex<KernelStatus>,
    pub configured_kernels: Mutex<Vec<KernelSpec>>,
    pub configured_connections: Mutex<Vec<ConnectionProfile>>,
}

impl FakeSession {
    pub fn set_status(&self, status: KernelStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn configured_connections(&self) -> Vec<ConnectionProfile> {
        self.configured_connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl Session for FakeSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn path(&self) -> String {
        self.path.clone()
    }

    fn kernel(&self) -> Option<Arc<dyn Kernel>> {
        self.kernel
            .lock()
            .unwrap()
            .clone()
            .map(|k| k as Arc<dyn Kernel>)
    }

    fn status(&self) -> KernelStatus {
        *self.status.lock().unwrap()
    }

    async fn change_kernel(&self, spec: &KernelSpec) -> Result<Arc<dyn Kernel>> {
        if self.factory.fail_changes.load(Ordering::SeqCst) {
            bail!("Kernel {} failed to start", spec.name);
        }
        let kernel = self.factory.create(&spec.name);
        *self.kernel.lock().unwrap() = Some(kernel.clone());
        Ok(kernel as Arc<dyn Kernel>)
    }

    async fn configure_kernel(&self, spec: &KernelSpec) -> Result<()> {
        self.configured_kernels.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn configure_connection(&self, profile: &ConnectionProfile) -> Result<()> {
        self.configured_connections
            .lock()
            .unwrap()
            .push(profile.clone());
        Ok(())
    }
}

pub struct FakeSessionManager {
    factory: Arc<KernelFactory>,
    unsupported: Mutex<Vec<String>>,
    fail_start: AtomicBool,
    pub start_requests: Mutex<Vec<Option<String>>>,
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
    pub shutdowns: Mutex<Vec<String>>,
}

impl FakeSessionManager {
    pub fn new(specs: KernelSpecs) -> Arc<Self> {
        Arc::new(FakeSessionManager {
            factory: Arc::new(KernelFactory {
                specs,
                requires_connection: AtomicBool::new(false),
                fail_changes: AtomicBool::new(false),
                kernels: Mutex::new(Vec::new()),
            }),
            unsupported: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            start_requests: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            shutdowns: Mutex::new(Vec::new()),
        })
    }

    pub fn set_requires_connection(&self, requires: bool) {
        self.factory
            .requires_connection
            .store(requires, Ordering::SeqCst);
    }

    pub fn set_fail_changes(&self, fail: bool) {
        self.factory.fail_changes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn mark_unsupported(&self, name: &str) {
        self.unsupported.lock().unwrap().push(name.to_string());
    }

    pub fn kernels(&self) -> Vec<Arc<FakeKernel>> {
        self.factory.kernels.lock().unwrap().clone()
    }

    pub fn last_kernel(&self) -> Arc<FakeKernel> {
        self.kernels().last().cloned().expect("no kernel started")
    }

    pub fn last_session(&self) -> Arc<FakeSession> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session started")
    }

    pub fn start_requests(&self) -> Vec<Option<String>> {
        self.start_requests.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.shutdowns.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionManager for FakeSessionManager {
    fn is_ready(&self) -> bool {
        true
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn specs(&self) -> Option<KernelSpecs> {
        Some(self.factory.specs.clone())
    }

    async fn start_new(&self, options: SessionOptions) -> Result<Arc<dyn Session>, SessionError> {
        self.start_requests
            .lock()
            .unwrap()
            .push(options.kernel_name.clone());
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SessionError::Backend(anyhow::anyhow!(
                "backend unavailable"
            )));
        }
        let name = options
            .kernel_name
            .unwrap_or_else(|| self.factory.specs.default_kernel.clone());
        if self.unsupported.lock().unwrap().contains(&name) {
            return Err(SessionError::UnsupportedKernel(name));
        }

        let session = Arc::new(FakeSession {
            id: uuid::Uuid::new_v4().to_string(),
            path: options.path,
            factory: self.factory.clone(),
            kernel: Mutex::new(Some(self.factory.create(&name))),
            status: Mutex::new(KernelStatus::Idle),
            configured_kernels: Mutex::new(Vec::new()),
            configured_connections: Mutex::new(Vec::new()),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session as Arc<dyn Session>)
    }

    async fn shutdown(&self, session_id: &str) -> Result<()> {
        self.shutdowns.lock().unwrap().push(session_id.to_string());
        Ok(())
    }
}

/// A server that may refuse to come up.
pub struct FakeServerManager {
    started: AtomicBool,
    comes_up: bool,
    pub start_calls: AtomicUsize,
}

impl FakeServerManager {
    pub fn new(comes_up: bool) -> Arc<Self> {
        Arc::new(FakeServerManager {
            started: AtomicBool::new(false),
            comes_up,
            start_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ServerManager for FakeServerManager {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn start_server(&self) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.started.store(self.comes_up, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryContentManager {
    documents: Mutex<HashMap<String, NotebookContents>>,
}

impl MemoryContentManager {
    pub fn with_document(uri: &str, contents: NotebookContents) -> Arc<Self> {
        let manager = MemoryContentManager::default();
        manager
            .documents
            .lock()
            .unwrap()
            .insert(uri.to_string(), contents);
        Arc::new(manager)
    }

    pub fn document(&self, uri: &str) -> Option<NotebookContents> {
        self.documents.lock().unwrap().get(uri).cloned()
    }
}

#[async_trait]
impl ContentManager for MemoryContentManager {
    async fn get_notebook_contents(&self, uri: &str) -> Result<NotebookContents> {
        match self.document(uri) {
            Some(contents) => Ok(contents),
            None => bail!("No such notebook: {}", uri),
        }
    }

    async fn save(&self, uri: &str, contents: &NotebookContents) -> Result<()> {
        self.documents
            .lock()
            .unwrap()
            .insert(uri.to_string(), contents.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnectionService {
    pub connections: Vec<ConnectionProfile>,
    pub endpoints: Vec<ClusterEndpoint>,
    pub disconnected: Mutex<Vec<String>>,
}

impl FakeConnectionService {
    pub fn new(connections: Vec<ConnectionProfile>) -> Arc<Self> {
        Arc::new(FakeConnectionService {
            connections,
            ..Default::default()
        })
    }

    pub fn with_endpoints(
        connections: Vec<ConnectionProfile>,
        endpoints: Vec<ClusterEndpoint>,
    ) -> Arc<Self> {
        Arc::new(FakeConnectionService {
            connections,
            endpoints,
            ..Default::default()
        })
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionService for FakeConnectionService {
    async fn active_connections(&self, provider_ids: &[String]) -> Result<Vec<ConnectionProfile>> {
        Ok(self
            .connections
            .iter()
            .filter(|c| {
                provider_ids
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(&c.provider_name))
            })
            .cloned()
            .collect())
    }

    fn cluster_endpoints(&self, _profile: &ConnectionProfile) -> Vec<ClusterEndpoint> {
        self.endpoints.clone()
    }

    async fn disconnect(&self, profile: &ConnectionProfile) -> Result<()> {
        self.disconnected.lock().unwrap().push(profile.id.clone());
        Ok(())
    }
}

pub fn manager(provider_id: &str, session_manager: &Arc<FakeSessionManager>) -> NotebookManager {
    NotebookManager::new(provider_id, session_manager.clone())
}
