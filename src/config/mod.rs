use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::fs;

use crate::health::RetryPolicy;

/// Physical addresses backing a logical node: one address, or an ordered
/// list of alternates to fail over among.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NodeConfig {
    Single { address: String },
    Multi { addresses: Vec<String> },
}

impl NodeConfig {
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        let slice: Vec<&str> = match self {
            NodeConfig::Single { address } => vec![address.as_str()],
            NodeConfig::Multi { addresses } => addresses.iter().map(|a| a.as_str()).collect(),
        };
        slice.into_iter()
    }

    pub(crate) fn ensure_valid(&self, node: &str) -> Result<()> {
        let mut count = 0usize;
        for address in self.addresses() {
            parse_port(address).with_context(|| {
                format!("node {} address {} is not a valid host:port", node, address)
            })?;
            count += 1;
        }
        if count == 0 {
            bail!("node {} must provide at least one address", node);
        }
        Ok(())
    }
}

/// Client configuration. Durations are in seconds; zero disables the
/// corresponding behavior where noted.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Logical node name to address descriptor. Required, non-empty.
    pub nodes: HashMap<String, NodeConfig>,

    /// Informational replica topology (`slave -> master`). Stored but
    /// not consulted; reserved for future failover logic.
    #[serde(default)]
    pub master_of: HashMap<String, String>,

    /// Opaque tag enabling process-wide instance sharing.
    #[serde(default)]
    pub tag: Option<String>,

    /// Per-batch command timeout for `poll`. Zero disables.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: f64,

    #[serde(default = "default_max_host_retries")]
    pub max_host_retries: u32,
    #[serde(default = "default_base_retry_interval")]
    pub base_retry_interval: f64,
    #[serde(default = "default_retry_interval_mult")]
    pub retry_interval_mult: u32,
    #[serde(default = "default_retry_slop_secs")]
    pub retry_slop_secs: f64,
    #[serde(default = "default_max_retry_interval")]
    pub max_retry_interval: f64,

    /// Idle expiry for cached backend connections. Zero disables.
    #[serde(default)]
    pub idle_timeout: f64,

    /// Reuse backend connections across commands.
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Bound on establishing a backend connection. Zero disables,
    /// leaving the batch timeout as the only limit.
    #[serde(default)]
    pub connect_timeout: f64,

    /// Emit verbose routing traces.
    #[serde(default)]
    pub debug: bool,
}

impl ClientConfig {
    /// Configuration with default tuning for the given node map.
    pub fn new(nodes: HashMap<String, NodeConfig>) -> Self {
        Self {
            nodes,
            master_of: HashMap::new(),
            tag: None,
            command_timeout: default_command_timeout(),
            max_host_retries: default_max_host_retries(),
            base_retry_interval: default_base_retry_interval(),
            retry_interval_mult: default_retry_interval_mult(),
            retry_slop_secs: default_retry_slop_secs(),
            max_retry_interval: default_max_retry_interval(),
            idle_timeout: 0.0,
            persistent: true,
            connect_timeout: 0.0,
            debug: false,
        }
    }

    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: ClientConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// Ensure configuration correctness. Construction aborts on failure.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("configuration must declare at least one node");
        }
        for (name, node) in &self.nodes {
            if name.trim().is_empty() {
                bail!("node names cannot be empty");
            }
            node.ensure_valid(name)?;
        }
        if self.command_timeout < 0.0 {
            bail!("command_timeout cannot be negative");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_host_retries: self.max_host_retries,
            base_retry_interval: Duration::from_secs_f64(self.base_retry_interval),
            retry_interval_mult: self.retry_interval_mult,
            retry_slop: Duration::from_secs_f64(self.retry_slop_secs),
            max_retry_interval: Duration::from_secs_f64(self.max_retry_interval),
        }
    }

    /// `None` when the batch timeout is disabled.
    pub fn command_timeout_duration(&self) -> Option<Duration> {
        duration_option(self.command_timeout)
    }

    pub fn idle_timeout_duration(&self) -> Option<Duration> {
        duration_option(self.idle_timeout)
    }

    pub fn connect_timeout_duration(&self) -> Option<Duration> {
        duration_option(self.connect_timeout)
    }
}

fn duration_option(seconds: f64) -> Option<Duration> {
    if seconds > 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}

fn parse_port(addr: &str) -> Result<u16> {
    if let Ok(socket) = addr.parse::<std::net::SocketAddr>() {
        return Ok(socket.port());
    }
    if let Some((host, port_str)) = addr.rsplit_once(':') {
        if host.is_empty() {
            bail!("missing host in address {}", addr);
        }
        let port = port_str
            .trim()
            .parse::<u16>()
            .with_context(|| format!("invalid port component {}", port_str))?;
        return Ok(port);
    }
    bail!("unable to extract port from address {}", addr)
}

fn default_command_timeout() -> f64 {
    1.0
}

fn default_max_host_retries() -> u32 {
    3
}

fn default_base_retry_interval() -> f64 {
    10.0
}

fn default_retry_interval_mult() -> u32 {
    2
}

fn default_retry_slop_secs() -> f64 {
    5.0
}

fn default_max_retry_interval() -> f64 {
    600.0
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_node_forms_from_toml() {
        let raw = r#"
            command_timeout = 2.5

            [nodes.redis_0]
            address = "127.0.0.1:6379"

            [nodes.redis_1]
            addresses = ["10.0.0.1:6379", "10.0.0.2:6379"]
        "#;
        let config: ClientConfig = toml::from_str(raw).unwrap();
        config.ensure_valid().unwrap();
        assert_eq!(config.command_timeout, 2.5);
        assert_eq!(config.nodes.len(), 2);
        assert!(matches!(
            config.nodes.get("redis_0"),
            Some(NodeConfig::Single { .. })
        ));
        let multi = config.nodes.get("redis_1").unwrap();
        assert_eq!(multi.addresses().count(), 2);
    }

    #[test]
    fn defaults_match_the_documented_tuning() {
        let raw = r#"
            [nodes.redis_0]
            address = "127.0.0.1:6379"
        "#;
        let config: ClientConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.command_timeout, 1.0);
        assert_eq!(config.max_host_retries, 3);
        assert_eq!(config.base_retry_interval, 10.0);
        assert_eq!(config.retry_interval_mult, 2);
        assert_eq!(config.retry_slop_secs, 5.0);
        assert_eq!(config.max_retry_interval, 600.0);
        assert_eq!(config.idle_timeout, 0.0);
        assert!(config.persistent);
        assert_eq!(config.connect_timeout, 0.0);
        assert!(config.idle_timeout_duration().is_none());
        assert!(config.connect_timeout_duration().is_none());
        assert_eq!(
            config.command_timeout_duration(),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn master_of_is_parsed_but_informational() {
        let raw = r#"
            [nodes.redis_0]
            address = "127.0.0.1:6379"

            [master_of]
            "10.0.0.2:6379" = "10.0.0.1:6379"
        "#;
        let config: ClientConfig = toml::from_str(raw).unwrap();
        config.ensure_valid().unwrap();
        assert_eq!(config.master_of.len(), 1);
    }

    #[test]
    fn empty_node_set_is_rejected() {
        let config = ClientConfig::new(HashMap::new());
        assert!(config.ensure_valid().is_err());
    }

    #[test]
    fn bad_addresses_are_rejected() {
        let mut nodes = HashMap::new();
        nodes.insert(
            "bad".to_string(),
            NodeConfig::Single {
                address: "no-port-here".into(),
            },
        );
        let config = ClientConfig::new(nodes);
        assert!(config.ensure_valid().is_err());

        let mut nodes = HashMap::new();
        nodes.insert(
            "empty".to_string(),
            NodeConfig::Multi {
                addresses: Vec::new(),
            },
        );
        let config = ClientConfig::new(nodes);
        assert!(config.ensure_valid().is_err());
    }

    #[test]
    fn retry_policy_converts_seconds() {
        let mut nodes = HashMap::new();
        nodes.insert(
            "redis_0".to_string(),
            NodeConfig::Single {
                address: "127.0.0.1:6379".into(),
            },
        );
        let mut config = ClientConfig::new(nodes);
        config.base_retry_interval = 0.25;
        let policy = config.retry_policy();
        assert_eq!(policy.base_retry_interval, Duration::from_millis(250));
        assert_eq!(policy.max_retry_interval, Duration::from_secs(600));
    }
}
