//! strided.toml configuration parser.
//!
//! ```toml
//! [server]
//! port = 8443
//! data_dir = "/var/lib/stride"
//!
//! [controller]
//! workers = 4
//!
//! [[plugins]]
//! name = "statefulset"
//! kind = "remote"
//! command = "/usr/local/bin/stride-statefulset"
//!
//! [[plugins]]
//! name = "memory"
//! kind = "memory"
//!
//! [[plugins.workloads]]
//! kind = "StatefulSet"
//! namespace = "prod"
//! name = "api"
//! replicas = 4
//! current_revision = "rev-1"
//! updated_revision = "rev-2"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use stride_plugin::WorkloadStatus;
use stride_rollout::ControllerConfig;
use stride_state::WorkloadRef;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub controller: ControllerConfig,
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            data_dir: PathBuf::from("/var/lib/stride"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Name rollouts use in `spec.plugin`.
    pub name: String,
    pub kind: PluginKind,
    /// Executable for a remote plugin.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Workloads seeded into a memory plugin at startup.
    #[serde(default)]
    pub workloads: Vec<WorkloadSeed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Memory,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSeed {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub replicas: i32,
    pub current_revision: String,
    /// Defaults to `current_revision`, i.e. a workload at rest.
    #[serde(default)]
    pub updated_revision: Option<String>,
}

impl WorkloadSeed {
    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef {
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Fully ready workload; only a settled one has its replicas updated.
    pub fn status(&self) -> WorkloadStatus {
        let updated_revision = self
            .updated_revision
            .clone()
            .unwrap_or_else(|| self.current_revision.clone());
        let updated_replicas = if updated_revision == self.current_revision {
            self.replicas
        } else {
            0
        };
        WorkloadStatus {
            replicas: self.replicas,
            updated_replicas,
            ready_replicas: self.replicas,
            available_replicas: self.replicas,
            current_revision: self.current_revision.clone(),
            updated_revision,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (i, plugin) in self.plugins.iter().enumerate() {
            if plugin.name.is_empty() {
                anyhow::bail!("plugins[{i}]: name is empty");
            }
            if self.plugins[..i].iter().any(|p| p.name == plugin.name) {
                anyhow::bail!("plugins[{i}]: duplicate plugin name {:?}", plugin.name);
            }
            match plugin.kind {
                PluginKind::Remote if plugin.command.is_none() => {
                    anyhow::bail!("plugin {:?}: remote plugins need a command", plugin.name);
                }
                PluginKind::Remote if !plugin.workloads.is_empty() => {
                    anyhow::bail!(
                        "plugin {:?}: workloads can only be seeded into memory plugins",
                        plugin.name
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
