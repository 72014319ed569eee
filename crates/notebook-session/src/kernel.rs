//! Capabilities the engine consumes from notebook backends.
//!
//! A backend (provider) supplies a session manager and optionally a server
//! manager and a content manager. Sessions bind a document path to a running
//! kernel; kernels accept execute requests and hand back futures.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use jupyter_protocol::{ExecuteRequest, ExecutionState, JupyterMessageContent};
use serde::{Deserialize, Serialize};

use crate::contents::{LanguageInfo, NotebookContents};
use crate::contexts::{ClusterEndpoint, ConnectionProfile};
use crate::error::SessionError;
use crate::future::ExecutionFuture;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl KernelSpec {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        KernelSpec {
            name: name.into(),
            display_name: display_name.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

/// Kernels a backend advertises, with the name of its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpecs {
    pub default_kernel: String,
    pub kernels: Vec<KernelSpec>,
}

impl KernelSpecs {
    pub fn find_by_name(&self, name: &str) -> Option<&KernelSpec> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn find_by_display_name(&self, display_name: &str) -> Option<&KernelSpec> {
        self.kernels
            .iter()
            .find(|k| k.display_name.eq_ignore_ascii_case(display_name))
    }

    pub fn default_spec(&self) -> Option<&KernelSpec> {
        self.find_by_name(&self.default_kernel)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelInfo {
    pub language_info: Option<LanguageInfo>,
}

/// Lifecycle status reported for a session's kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Unknown,
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Unknown => write!(f, "unknown"),
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Idle => write!(f, "idle"),
            KernelStatus::Busy => write!(f, "busy"),
            KernelStatus::Restarting => write!(f, "restarting"),
            KernelStatus::Dead => write!(f, "dead"),
        }
    }
}

impl KernelStatus {
    /// The status a kernel `status` message reports, if `content` is one.
    pub fn from_message(content: &JupyterMessageContent) -> Option<Self> {
        let JupyterMessageContent::Status(status) = content else {
            return None;
        };
        Some(match status.execution_state {
            ExecutionState::Starting => KernelStatus::Starting,
            ExecutionState::Idle => KernelStatus::Idle,
            ExecutionState::Busy => KernelStatus::Busy,
            ExecutionState::Restarting | ExecutionState::AutoRestarting => {
                KernelStatus::Restarting
            }
            ExecutionState::Dead => KernelStatus::Dead,
            _ => KernelStatus::Unknown,
        })
    }
}

#[async_trait]
pub trait Kernel: Send + Sync {
    fn id(&self) -> String;
    fn name(&self) -> String;
    fn is_ready(&self) -> bool;
    async fn ready(&self) -> Result<()>;
    fn info(&self) -> Option<KernelInfo>;
    async fn spec(&self) -> Result<KernelSpec>;

    /// Kernels that execute against a data source need an active connection.
    fn requires_connection(&self) -> bool {
        false
    }

    /// Send an execute request. The future is returned as soon as the
    /// request is on its way; replies arrive through it.
    fn request_execute(
        &self,
        request: ExecuteRequest,
        dispose_on_done: bool,
    ) -> Result<Arc<ExecutionFuture>>;

    async fn interrupt(&self) -> Result<()>;
}

#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> String;
    fn path(&self) -> String;
    fn kernel(&self) -> Option<Arc<dyn Kernel>>;
    fn status(&self) -> KernelStatus;
    async fn change_kernel(&self, spec: &KernelSpec) -> Result<Arc<dyn Kernel>>;
    async fn configure_kernel(&self, spec: &KernelSpec) -> Result<()>;
    async fn configure_connection(&self, profile: &ConnectionProfile) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub path: String,
    /// `None` asks the backend for its default kernel.
    pub kernel_name: Option<String>,
}

#[async_trait]
pub trait SessionManager: Send + Sync {
    fn is_ready(&self) -> bool;
    async fn ready(&self) -> Result<()>;
    fn specs(&self) -> Option<KernelSpecs>;
    async fn start_new(&self, options: SessionOptions) -> Result<Arc<dyn Session>, SessionError>;
    async fn shutdown(&self, session_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ServerManager: Send + Sync {
    fn is_started(&self) -> bool;
    async fn start_server(&self) -> Result<()>;
}

#[async_trait]
pub trait ContentManager: Send + Sync {
    async fn get_notebook_contents(&self, uri: &str) -> Result<NotebookContents>;
    async fn save(&self, uri: &str, contents: &NotebookContents) -> Result<()>;
}

#[async_trait]
pub trait ConnectionService: Send + Sync {
    /// Open connections whose provider is one of `provider_ids`.
    async fn active_connections(&self, provider_ids: &[String]) -> Result<Vec<ConnectionProfile>>;
    fn cluster_endpoints(&self, profile: &ConnectionProfile) -> Vec<ClusterEndpoint>;
    async fn disconnect(&self, profile: &ConnectionProfile) -> Result<()>;
}

/// Everything one backend provides to a notebook.
#[derive(Clone)]
pub struct NotebookManager {
    pub provider_id: String,
    pub server_manager: Option<Arc<dyn ServerManager>>,
    pub session_manager: Arc<dyn SessionManager>,
    pub content_manager: Option<Arc<dyn ContentManager>>,
}

impl NotebookManager {
    pub fn new(provider_id: impl Into<String>, session_manager: Arc<dyn SessionManager>) -> Self {
        NotebookManager {
            provider_id: provider_id.into(),
            server_manager: None,
            session_manager,
            content_manager: None,
        }
    }

    pub fn with_server_manager(mut self, server_manager: Arc<dyn ServerManager>) -> Self {
        self.server_manager = Some(server_manager);
        self
    }

    pub fn with_content_manager(mut self, content_manager: Arc<dyn ContentManager>) -> Self {
        self.content_manager = Some(content_manager);
        self
    }
}

impl std::fmt::Debug for NotebookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookManager")
            .field("provider_id", &self.provider_id)
            .field("has_server_manager", &self.server_manager.is_some())
            .field("has_content_manager", &self.content_manager.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_status_display() {
        assert_eq!(KernelStatus::Starting.to_string(), "starting");
        assert_eq!(KernelStatus::Dead.to_string(), "dead");
        assert_eq!(
            serde_json::to_string(&KernelStatus::Idle).unwrap(),
            "\"idle\""
        );
    }

    #[test]
    fn test_kernel_status_from_message() {
        let status = |state: &str| {
            JupyterMessageContent::from_type_and_content(
                "status",
                serde_json::json!({"execution_state": state}),
            )
            .unwrap()
        };
        assert_eq!(
            KernelStatus::from_message(&status("busy")),
            Some(KernelStatus::Busy)
        );
        assert_eq!(
            KernelStatus::from_message(&status("idle")),
            Some(KernelStatus::Idle)
        );
        assert_eq!(
            KernelStatus::from_message(&status("autorestarting")),
            Some(KernelStatus::Restarting)
        );
        assert_eq!(
            KernelStatus::from_message(&status("terminating")),
            Some(KernelStatus::Unknown)
        );
        let stream = JupyterMessageContent::from_type_and_content(
            "stream",
            serde_json::json!({"name": "stdout", "text": "x"}),
        )
        .unwrap();
        assert_eq!(KernelStatus::from_message(&stream), None);
    }

    #[test]
    fn test_kernel_specs_lookup() {
        let specs = KernelSpecs {
            default_kernel: "python3".into(),
            kernels: vec![
                KernelSpec::new("python3", "Python 3").with_language("python"),
                KernelSpec::new("pysparkkernel", "PySpark"),
            ],
        };
        assert_eq!(specs.default_spec().unwrap().display_name, "Python 3");
        assert_eq!(specs.find_by_display_name("pyspark").unwrap().name, "pysparkkernel");
        assert!(specs.find_by_name("ir").is_none());
    }

    #[test]
    fn test_kernel_spec_skips_missing_language() {
        let json = serde_json::to_value(KernelSpec::new("SQL", "SQL")).unwrap();
        assert!(json.get("language").is_none());

        let parsed: KernelSpec =
            serde_json::from_str(r#"{"name": "python3", "display_name": "Python 3", "language": "python"}"#)
                .unwrap();
        assert_eq!(parsed.language.as_deref(), Some("python"));
    }
}
