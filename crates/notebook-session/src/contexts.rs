//! Connections a kernel can run against.
//!
//! Data-source kernels (SQL, Spark) execute against a connection profile.
//! A profile is only a valid context for a kernel when its provider is one
//! of the connection providers that kernel declares.

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::kernel::{ConnectionService, KernelSpec, KernelSpecs};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: String,
    /// Connection provider, e.g. `MSSQL` or `HADOOP_KNOX`.
    pub provider_name: String,
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

impl ConnectionProfile {
    pub fn new(
        id: impl Into<String>,
        provider_name: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        ConnectionProfile {
            id: id.into(),
            provider_name: provider_name.into(),
            server_name: server_name.into(),
            database_name: None,
            user_name: None,
        }
    }
}

/// A service exposed by a data cluster behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub service_name: String,
    pub endpoint: String,
}

/// The default connection for a kernel plus the other usable ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotebookContexts {
    pub default_connection: Option<ConnectionProfile>,
    pub other_connections: Vec<ConnectionProfile>,
}

impl NotebookContexts {
    /// Resolve the contexts available to a kernel that accepts connections
    /// from `provider_ids`.
    ///
    /// `current` becomes the default when it is valid; otherwise the first
    /// active connection does. A kernel with no connection providers has no
    /// contexts.
    pub async fn for_kernel(
        service: Option<&dyn ConnectionService>,
        provider_ids: &[String],
        current: Option<&ConnectionProfile>,
    ) -> Result<Self> {
        if provider_ids.is_empty() {
            return Ok(NotebookContexts::default());
        }

        let mut connections = match service {
            Some(service) => service.active_connections(provider_ids).await?,
            None => Vec::new(),
        };
        connections.retain(|c| is_valid_connection(c, provider_ids));
        if let Some(current) = current.filter(|c| is_valid_connection(c, provider_ids)) {
            connections.retain(|c| c.id != current.id);
            connections.insert(0, current.clone());
        }
        debug!(
            "[contexts] {} valid connection(s) for providers {:?}",
            connections.len(),
            provider_ids
        );

        let mut connections = connections.into_iter();
        Ok(NotebookContexts {
            default_connection: connections.next(),
            other_connections: connections.collect(),
        })
    }

    pub fn find_by_server(&self, server_name: &str) -> Option<&ConnectionProfile> {
        self.default_connection
            .iter()
            .chain(self.other_connections.iter())
            .find(|c| c.server_name == server_name)
    }

    /// Make `profile` the default, moving the previous default to the head of
    /// the others.
    pub fn promote(&mut self, profile: &ConnectionProfile) {
        self.other_connections.retain(|c| c.id != profile.id);
        if let Some(previous) = self.default_connection.take() {
            if previous.id != profile.id {
                self.other_connections.insert(0, previous);
            }
        }
        self.default_connection = Some(profile.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.default_connection.is_none() && self.other_connections.is_empty()
    }
}

pub fn is_valid_connection(profile: &ConnectionProfile, provider_ids: &[String]) -> bool {
    provider_ids
        .iter()
        .any(|p| p.eq_ignore_ascii_case(&profile.provider_name))
}

/// Strip the address suffix some backends append: `"PySpark (10.0.0.1)"` →
/// `"PySpark"`.
pub fn sanitize_display_name(display_name: &str) -> String {
    match display_name.find(" (") {
        Some(idx) if display_name.ends_with(')') => display_name[..idx].to_string(),
        _ => display_name.to_string(),
    }
}

/// The kernel spec a backend advertises under `display_name`, falling back to its
/// default kernel.
pub fn default_kernel_for(specs: &KernelSpecs, display_name: &str) -> Option<KernelSpec> {
    specs
        .find_by_display_name(display_name)
        .or_else(|| specs.default_spec())
        .cloned()
}
