//! labvm.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::types::DEFAULT_PARTITION_KEY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub queue: QueueConfig,
    pub cluster: ClusterConfig,
    pub notifier: NotifierConfig,
    pub api: ApiConfig,
    pub port_forward: PortForwardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub path: PathBuf,
    pub partition_key: String,
    pub redelivery_base: String,
    pub redelivery_max: String,
    /// Deliveries before a transiently failing message is dead-lettered.
    /// Unset means redeliver forever.
    pub max_deliveries: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/labvm/queue.redb"),
            partition_key: DEFAULT_PARTITION_KEY.to_string(),
            redelivery_base: "1s".to_string(),
            redelivery_max: "60s".to_string(),
            max_deliveries: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace: String,
    /// Explicit kubeconfig. Falls back to in-cluster / `$KUBECONFIG`.
    pub kubeconfig: Option<PathBuf>,
    pub template: PathBuf,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubeconfig: None,
            template: PathBuf::from("/etc/labvm/vm-deployment.yaml.tera"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub callback_url: String,
    pub timeout: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            callback_url: "http://127.0.0.1:8888/virtualmachines/vm-status-callback".to_string(),
            timeout: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8480 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortForwardConfig {
    pub enabled: bool,
    pub kubectl: String,
    /// Local port is `base_port + workload_id`.
    pub base_port: u16,
    pub target_port: u16,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kubectl: "kubectl".to_string(),
            base_port: 6080,
            target_port: 80,
        }
    }
}

impl LabConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LabConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject duration strings up front so the daemon fails at startup.
    fn validate(&self) -> Result<(), ConfigError> {
        self.queue.redelivery_base()?;
        self.queue.redelivery_max()?;
        self.notifier.timeout()?;
        Ok(())
    }
}

impl QueueConfig {
    pub fn redelivery_base(&self) -> Result<Duration, ConfigError> {
        duration_field("queue.redelivery_base", &self.redelivery_base)
    }

    pub fn redelivery_max(&self) -> Result<Duration, ConfigError> {
        duration_field("queue.redelivery_max", &self.redelivery_max)
    }
}

impl NotifierConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("notifier.timeout", &self.timeout)
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = LabConfig::from_toml_str("").unwrap();
        assert_eq!(config.queue.partition_key, "k8s");
        assert_eq!(config.cluster.namespace, "default");
        assert_eq!(config.api.port, 8480);
        assert!(!config.port_forward.enabled);
        assert_eq!(config.queue.redelivery_base().unwrap(), Duration::from_secs(1));
        assert_eq!(config.notifier.timeout().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn parse_sections() {
        let toml_str = r#"
[queue]
path = "/tmp/q.redb"
redelivery_base = "250ms"
max_deliveries = 5

[cluster]
namespace = "labs"
kubeconfig = "/etc/labvm/k8sconfig.yml"

[notifier]
callback_url = "http://records:8888/virtualmachines/vm-status-callback"

[port_forward]
enabled = true
"#;
        let config = LabConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.queue.path, PathBuf::from("/tmp/q.redb"));
        assert_eq!(
            config.queue.redelivery_base().unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(config.queue.max_deliveries, Some(5));
        assert_eq!(config.cluster.namespace, "labs");
        assert!(config.cluster.kubeconfig.is_some());
        assert!(config.port_forward.enabled);
        assert_eq!(config.port_forward.base_port, 6080);
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = LabConfig::from_toml_str("[notifier]\ntimeout = \"forever\"\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Duration {
                field: "notifier.timeout",
                ..
            }
        ));
    }

    #[test]
    fn sample_config_parses() {
        let config =
            LabConfig::from_toml_str(include_str!("../../../deploy/labvm.toml")).unwrap();
        assert_eq!(config.queue.max_deliveries, None);
        assert_eq!(config.queue.redelivery_max().unwrap(), Duration::from_secs(60));
        assert_eq!(config.port_forward.base_port, 6080);
        assert_eq!(config.port_forward.target_port, 80);
    }

    #[test]
    fn missing_file() {
        let err = LabConfig::from_file(Path::new("/nonexistent/labvm.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
