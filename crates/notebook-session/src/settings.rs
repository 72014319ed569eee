//! Engine settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/notebook-session/settings.json
//! - Linux: ~/.config/notebook-session/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\notebook-session\settings.json

use std::path::{Path, PathBuf};

use anyhow::Result;
use kernel_messages::DEFAULT_GATEWAY_PORT;
use serde::{Deserialize, Deserializer, Serialize};

use crate::kernel::KernelSpec;

/// Provider id of the SQL backend.
pub const SQL_NOTEBOOK_PROVIDER: &str = "sql";
/// Provider id of the placeholder backend used when nothing else is configured.
pub const DEFAULT_NOTEBOOK_PROVIDER: &str = "builtin";
pub const JUPYTER_NOTEBOOK_PROVIDER: &str = "jupyter";
pub const SQL_CONNECTION_PROVIDER: &str = "MSSQL";
pub const HADOOP_KNOX_PROVIDER: &str = "HADOOP_KNOX";

pub fn sql_kernel_spec() -> KernelSpec {
    KernelSpec::new("SQL", "SQL").with_language("sql")
}

/// A kernel the engine knows about before any backend reports its specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardKernel {
    pub name: String,
    pub display_name: String,
    /// Connection providers this kernel can execute against.
    #[serde(default, deserialize_with = "deserialize_provider_list")]
    pub connection_provider_ids: Vec<String>,
    pub notebook_provider: String,
}

impl StandardKernel {
    fn new(
        name: &str,
        display_name: &str,
        notebook_provider: &str,
        connection_provider_ids: &[&str],
    ) -> Self {
        StandardKernel {
            name: name.to_string(),
            display_name: display_name.to_string(),
            connection_provider_ids: connection_provider_ids.iter().map(|s| s.to_string()).collect(),
            notebook_provider: notebook_provider.to_string(),
        }
    }
}

pub fn default_standard_kernels() -> Vec<StandardKernel> {
    let spark = [HADOOP_KNOX_PROVIDER, SQL_CONNECTION_PROVIDER];
    vec![
        StandardKernel::new("SQL", "SQL", SQL_NOTEBOOK_PROVIDER, &[SQL_CONNECTION_PROVIDER]),
        StandardKernel::new("python3", "Python 3", JUPYTER_NOTEBOOK_PROVIDER, &[]),
        StandardKernel::new("pysparkkernel", "PySpark", JUPYTER_NOTEBOOK_PROVIDER, &spark),
        StandardKernel::new("sparkkernel", "Spark | Scala", JUPYTER_NOTEBOOK_PROVIDER, &spark),
        StandardKernel::new("sparkrkernel", "Spark | R", JUPYTER_NOTEBOOK_PROVIDER, &spark),
    ]
}

/// Where internal cluster links are redirected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_port")]
    pub default_port: String,
    #[serde(default = "default_gateway_service")]
    pub service_name: String,
    /// Only connections from this provider have a gateway.
    #[serde(default = "default_sql_connection_provider")]
    pub sql_connection_provider: String,
}

fn default_gateway_port() -> String {
    DEFAULT_GATEWAY_PORT.to_string()
}

fn default_gateway_service() -> String {
    "gateway".to_string()
}

fn default_sql_connection_provider() -> String {
    SQL_CONNECTION_PROVIDER.to_string()
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            default_port: default_gateway_port(),
            service_name: default_gateway_service(),
            sql_connection_provider: default_sql_connection_provider(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_standard_kernels")]
    pub standard_kernels: Vec<StandardKernel>,

    /// Kernel for documents that don't name one. SQL when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_kernel: Option<KernelSpec>,

    /// Backend order used when several advertise the same kernel.
    #[serde(default, deserialize_with = "deserialize_provider_list")]
    pub provider_order: Vec<String>,

    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            standard_kernels: default_standard_kernels(),
            default_kernel: None,
            provider_order: vec![],
            gateway: GatewaySettings::default(),
        }
    }
}

/// Accepts both `"MSSQL, HADOOP_KNOX"` and `["MSSQL", "HADOOP_KNOX"]`.
fn deserialize_provider_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct ProviderListVisitor;

    impl<'de> de::Visitor<'de> for ProviderListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<String>, E> {
            Ok(v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<String>, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                let trimmed = item.trim().to_string();
                if !trimmed.is_empty() {
                    items.push(trimmed);
                }
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(ProviderListVisitor)
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notebook-session")
        .join("settings.json")
}

/// Load settings from disk, returning defaults if file doesn't exist
pub fn load_settings() -> EngineSettings {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(path: &Path) -> EngineSettings {
    if !path.exists() {
        return EngineSettings::default();
    }
    match std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from))
    {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("[settings] Ignoring {}: {}", path.display(), e);
            EngineSettings::default()
        }
    }
}

/// Save settings to disk
pub fn save_settings(settings: &EngineSettings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &EngineSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
