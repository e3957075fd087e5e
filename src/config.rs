//! Configuration loading, defaulting and validation
//!
//! Configuration comes from a TOML file, with indexed environment
//! variables (`TSROUTER_GROUP_0_NAME`, `TSROUTER_GROUP_0_SERVERS`, ...)
//! able to define backend groups for container deployments. Environment
//! variables take precedence over the file.
//!
//! All durations serialize as integer milliseconds.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::types::{LoadBalanceMethod, Timeouts};

/// Helper for (de)serializing `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Default values for configuration fields, centralized for serde
pub mod defaults {
    use std::time::Duration;

    #[inline]
    pub fn connect_timeout() -> Duration {
        Duration::from_millis(200)
    }

    #[inline]
    pub fn find_timeout() -> Duration {
        Duration::from_secs(2)
    }

    #[inline]
    pub fn render_timeout() -> Duration {
        Duration::from_secs(10)
    }

    #[inline]
    pub fn probe_interval() -> Duration {
        Duration::from_secs(300)
    }

    #[inline]
    pub fn cache_expiry() -> Duration {
        Duration::from_secs(600)
    }

    #[inline]
    pub fn concurrency_limit() -> usize {
        100
    }

    #[inline]
    pub fn max_tries() -> usize {
        3
    }
}

/// One backend group: a named set of servers speaking one protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    /// Group name; must be unique, used for limiter slots and logs
    pub name: String,
    /// Protocol adapter to instantiate, e.g. "msgpack" or "prometheus"
    pub protocol: String,
    /// Server base addresses, e.g. `http://10.0.0.1:8080`
    pub servers: Vec<String>,
    /// Round-robin over servers, or broadcast to all of them
    #[serde(default)]
    pub lb_method: LoadBalanceMethod,
    /// TCP/TLS connect budget per attempt
    #[serde(with = "duration_ms", default = "defaults::connect_timeout")]
    pub connect_timeout: Duration,
    /// Deadline for find/info/probe operations
    #[serde(with = "duration_ms", default = "defaults::find_timeout")]
    pub find_timeout: Duration,
    /// Deadline for datapoint fetches
    #[serde(with = "duration_ms", default = "defaults::render_timeout")]
    pub render_timeout: Duration,
    /// Max simultaneous in-flight requests against this group
    #[serde(default = "defaults::concurrency_limit")]
    pub concurrency_limit: usize,
    /// How many servers to try before reporting failure
    #[serde(default = "defaults::max_tries")]
    pub max_tries: usize,
    /// Split fetches into batches of at most this many metrics; 0 disables
    /// batching
    #[serde(default)]
    pub max_batch_size: usize,
    /// Protocol-specific options, passed through to the adapter
    #[serde(default)]
    pub options: HashMap<String, toml::Value>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: String::new(),
            servers: Vec::new(),
            lb_method: LoadBalanceMethod::default(),
            connect_timeout: defaults::connect_timeout(),
            find_timeout: defaults::find_timeout(),
            render_timeout: defaults::render_timeout(),
            concurrency_limit: defaults::concurrency_limit(),
            max_tries: defaults::max_tries(),
            max_batch_size: 0,
            options: HashMap::new(),
        }
    }
}

impl GroupConfig {
    /// The group's per-operation-class deadlines
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: self.connect_timeout,
            find: self.find_timeout,
            render: self.render_timeout,
        }
    }
}

/// Router-level settings: top deadlines and probe scheduling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub find_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub render_timeout: Duration,
    /// How often the TLD probe refreshes the routing cache
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,
    /// How long a routing-cache entry stays valid
    #[serde(with = "duration_ms")]
    pub cache_expiry: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            connect_timeout: defaults::connect_timeout(),
            find_timeout: defaults::find_timeout(),
            render_timeout: defaults::render_timeout(),
            probe_interval: defaults::probe_interval(),
            cache_expiry: defaults::cache_expiry(),
        }
    }
}

impl RouterConfig {
    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: self.connect_timeout,
            find: self.find_timeout,
            render: self.render_timeout,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub router: RouterConfig,
}

impl Config {
    /// Parse and validate a TOML document (no environment lookup)
    pub fn from_toml(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file path; `TSROUTER_GROUP_n_*` variables, when set,
    /// replace the file's group list
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&raw).context("failed to parse configuration")?;
        if let Some(env_groups) = load_groups_from_env()? {
            config.groups = env_groups;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.groups.is_empty(), "at least one backend group is required");

        let mut names = HashSet::new();
        for group in &self.groups {
            anyhow::ensure!(!group.name.is_empty(), "backend group with empty name");
            anyhow::ensure!(
                names.insert(group.name.as_str()),
                "duplicate backend group name '{}'",
                group.name
            );
            anyhow::ensure!(
                !group.protocol.is_empty(),
                "group '{}' has no protocol",
                group.name
            );
            anyhow::ensure!(
                !group.servers.is_empty(),
                "group '{}' has no servers",
                group.name
            );
            anyhow::ensure!(
                group.concurrency_limit > 0,
                "group '{}' has a zero concurrency limit",
                group.name
            );
            anyhow::ensure!(
                group.max_tries > 0,
                "group '{}' has zero max tries",
                group.name
            );
            for (label, timeout) in [
                ("connect", group.connect_timeout),
                ("find", group.find_timeout),
                ("render", group.render_timeout),
            ] {
                anyhow::ensure!(
                    !timeout.is_zero(),
                    "group '{}' has a zero {} timeout",
                    group.name,
                    label
                );
            }
        }
        Ok(())
    }
}

/// Read indexed `TSROUTER_GROUP_n_*` variables; `None` when index 0 is
/// absent. `SERVERS` is comma-separated.
fn load_groups_from_env() -> Result<Option<Vec<GroupConfig>>> {
    let mut groups = Vec::new();
    let mut index = 0;

    loop {
        let name = match std::env::var(format!("TSROUTER_GROUP_{index}_NAME")) {
            Ok(name) => name,
            Err(_) => break,
        };
        let protocol = std::env::var(format!("TSROUTER_GROUP_{index}_PROTOCOL"))
            .with_context(|| format!("TSROUTER_GROUP_{index}_PROTOCOL is required"))?;
        let servers: Vec<String> = std::env::var(format!("TSROUTER_GROUP_{index}_SERVERS"))
            .with_context(|| format!("TSROUTER_GROUP_{index}_SERVERS is required"))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let concurrency_limit = std::env::var(format!("TSROUTER_GROUP_{index}_CONCURRENCY"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(defaults::concurrency_limit);
        let max_tries = std::env::var(format!("TSROUTER_GROUP_{index}_MAX_TRIES"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(defaults::max_tries);

        groups.push(GroupConfig {
            name,
            protocol,
            servers,
            concurrency_limit,
            max_tries,
            ..GroupConfig::default()
        });
        index += 1;
    }

    if groups.is_empty() {
        Ok(None)
    } else {
        Ok(Some(groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [[groups]]
            name = "local"
            protocol = "msgpack"
            servers = ["http://127.0.0.1:8080"]
        "#
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = Config::from_toml(minimal_toml()).unwrap();
        assert_eq!(config.groups.len(), 1);

        let group = &config.groups[0];
        assert_eq!(group.concurrency_limit, 100);
        assert_eq!(group.max_tries, 3);
        assert_eq!(group.max_batch_size, 0);
        assert_eq!(group.lb_method, LoadBalanceMethod::RoundRobin);
        assert_eq!(group.connect_timeout, Duration::from_millis(200));
        assert_eq!(config.router.probe_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_durations_parse_as_millis() {
        let config = Config::from_toml(
            r#"
                [router]
                render_timeout = 5000

                [[groups]]
                name = "g"
                protocol = "msgpack"
                servers = ["http://127.0.0.1:8080"]
                find_timeout = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.router.render_timeout, Duration::from_secs(5));
        assert_eq!(config.groups[0].find_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(Config::from_toml("").is_err());
    }

    #[test]
    fn test_duplicate_group_names_rejected() {
        let result = Config::from_toml(
            r#"
                [[groups]]
                name = "g"
                protocol = "msgpack"
                servers = ["http://a:1"]

                [[groups]]
                name = "g"
                protocol = "prometheus"
                servers = ["http://b:2"]
            "#,
        );
        assert!(result.unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let result = Config::from_toml(
            r#"
                [[groups]]
                name = "g"
                protocol = "msgpack"
                servers = ["http://a:1"]
                concurrency_limit = 0
            "#,
        );
        assert!(result.unwrap_err().to_string().contains("concurrency"));
    }

    #[test]
    fn test_empty_servers_rejected() {
        let result = Config::from_toml(
            r#"
                [[groups]]
                name = "g"
                protocol = "msgpack"
                servers = []
            "#,
        );
        assert!(result.unwrap_err().to_string().contains("no servers"));
    }

    #[test]
    fn test_broadcast_lb_method_parses() {
        let config = Config::from_toml(
            r#"
                [[groups]]
                name = "g"
                protocol = "msgpack"
                servers = ["http://a:1", "http://b:2"]
                lb_method = "broadcast"
            "#,
        )
        .unwrap();
        assert_eq!(config.groups[0].lb_method, LoadBalanceMethod::Broadcast);
    }

    #[test]
    fn test_protocol_options_pass_through() {
        let config = Config::from_toml(
            r#"
                [[groups]]
                name = "g"
                protocol = "prometheus"
                servers = ["http://a:1"]

                [groups.options]
                step = 60
            "#,
        )
        .unwrap();
        assert_eq!(
            config.groups[0]
                .options
                .get("step")
                .and_then(toml::Value::as_integer),
            Some(60)
        );
    }
}
