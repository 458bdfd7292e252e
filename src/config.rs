//! Configuration types for the proxy.
//!
//! The binary loads a global config plus one or more cluster files from TOML;
//! the library consumes the parsed structs. Builder-style `with_*` methods
//! cover programmatic construction in tests and embedders.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cluster::ring::{HashDistribution, HashMethod};
use crate::cluster::Backend;
use crate::error::{Error, Result};
use crate::proto::CacheType;

/// Global (per-process) configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Optional stats listener (`host:port`) dumping a metrics snapshot.
    #[serde(default)]
    pub stat_addr: Option<String>,
    /// Log filter, e.g. `info` or `porter=debug`.
    #[serde(default)]
    pub log_level: Option<String>,
    /// Serve metrics on the stats listener.
    #[serde(default)]
    pub use_metrics: bool,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("read {}: {e}", path.as_ref().display())))?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }
}

/// A cluster file: a list of `[[clusters]]` tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfigs {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl ClusterConfigs {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<ClusterConfigs> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("read {}: {e}", path.as_ref().display())))?;
        toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Listener transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenProto {
    #[default]
    Tcp,
    Unix,
}

/// Socket deadlines derived from a cluster config. `None` disables one.
#[derive(Debug, Clone, Copy)]
pub struct ConnTimeouts {
    pub dial: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

/// One proxied cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub hash_method: HashMethod,
    #[serde(default)]
    pub hash_distribution: HashDistribution,
    /// Empty, or exactly two characters (e.g. `"{}"`).
    #[serde(default)]
    pub hash_tag: String,
    pub cache_type: CacheType,
    #[serde(default)]
    pub listen_proto: ListenProto,
    pub listen_addr: String,
    /// Passed through to Redis backends as `AUTH` on connect.
    #[serde(default)]
    pub redis_auth: String,
    /// Milliseconds; 0 disables the deadline.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    #[serde(default)]
    pub read_timeout: u64,
    #[serde(default)]
    pub write_timeout: u64,
    /// Traffic connections per backend.
    #[serde(default = "default_node_connections")]
    pub node_connections: usize,
    /// Consecutive ping failures before ejection.
    #[serde(default = "default_ping_fail_limit")]
    pub ping_fail_limit: u32,
    #[serde(default)]
    pub ping_auto_eject: bool,
    /// Milliseconds between health probes.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// `"host:port:weight"` or `"host:port:weight alias"` entries.
    #[serde(default)]
    pub servers: Vec<String>,
}

fn default_dial_timeout() -> u64 {
    1000
}

fn default_node_connections() -> usize {
    1
}

fn default_ping_fail_limit() -> u32 {
    3
}

fn default_ping_interval() -> u64 {
    1000
}

impl ClusterConfig {
    pub fn new(name: &str, cache_type: CacheType, listen_addr: &str) -> Self {
        Self {
            name: name.to_owned(),
            hash_method: HashMethod::default(),
            hash_distribution: HashDistribution::default(),
            hash_tag: String::new(),
            cache_type,
            listen_proto: ListenProto::default(),
            listen_addr: listen_addr.to_owned(),
            redis_auth: String::new(),
            dial_timeout: default_dial_timeout(),
            read_timeout: 0,
            write_timeout: 0,
            node_connections: default_node_connections(),
            ping_fail_limit: default_ping_fail_limit(),
            ping_auto_eject: false,
            ping_interval: default_ping_interval(),
            servers: Vec::new(),
        }
    }

    pub fn with_servers(mut self, servers: &[&str]) -> Self {
        self.servers = servers.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_hash_tag(mut self, tag: &str) -> Self {
        self.hash_tag = tag.to_owned();
        self
    }

    pub fn with_node_connections(mut self, n: usize) -> Self {
        self.node_connections = n;
        self
    }

    pub fn with_ping(mut self, interval_ms: u64, fail_limit: u32, auto_eject: bool) -> Self {
        self.ping_interval = interval_ms;
        self.ping_fail_limit = fail_limit;
        self.ping_auto_eject = auto_eject;
        self
    }

    /// Reject configurations the router cannot serve.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("cluster name must not be empty".into()));
        }
        if self.servers.is_empty() {
            return Err(Error::Config(format!(
                "cluster '{}' has no servers",
                self.name
            )));
        }
        if !self.hash_tag.is_empty() && self.hash_tag.len() != 2 {
            return Err(Error::Config(format!(
                "cluster '{}': hash_tag must be empty or two characters",
                self.name
            )));
        }
        if self.node_connections == 0 {
            return Err(Error::Config(format!(
                "cluster '{}': node_connections must be at least 1",
                self.name
            )));
        }
        if self.ping_fail_limit == 0 {
            return Err(Error::Config(format!(
                "cluster '{}': ping_fail_limit must be at least 1",
                self.name
            )));
        }
        for entry in &self.servers {
            Backend::parse(entry)?;
        }
        Ok(())
    }

    pub fn backends(&self) -> Result<Vec<Backend>> {
        self.servers.iter().map(|s| Backend::parse(s)).collect()
    }

    pub fn hash_tag_pair(&self) -> Option<(u8, u8)> {
        let bs = self.hash_tag.as_bytes();
        if bs.len() == 2 {
            Some((bs[0], bs[1]))
        } else {
            None
        }
    }

    pub fn conn_timeouts(&self) -> ConnTimeouts {
        let ms = |v: u64| {
            if v == 0 {
                None
            } else {
                Some(Duration::from_millis(v))
            }
        };
        ConnTimeouts {
            dial: ms(self.dial_timeout),
            read: ms(self.read_timeout),
            write: ms(self.write_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_toml_round_trip() {
        let text = r#"
            [[clusters]]
            name = "alpha"
            cache_type = "redis"
            listen_addr = "0.0.0.0:26379"
            hash_method = "fnv1a_64"
            hash_tag = "{}"
            ping_auto_eject = true
            servers = [
                "127.0.0.1:6379:1",
                "127.0.0.1:6380:2 shard-b",
            ]

            [[clusters]]
            name = "beta"
            cache_type = "memcache"
            listen_addr = "0.0.0.0:21211"
            servers = ["127.0.0.1:11211:1"]
        "#;
        let ccs: ClusterConfigs = toml::from_str(text).unwrap();
        assert_eq!(ccs.clusters.len(), 2);

        let alpha = &ccs.clusters[0];
        assert_eq!(alpha.cache_type, CacheType::Redis);
        assert_eq!(alpha.hash_tag_pair(), Some((b'{', b'}')));
        assert_eq!(alpha.ping_fail_limit, 3);
        assert_eq!(alpha.ping_interval, 1000);
        alpha.validate().unwrap();

        let backends = alpha.backends().unwrap();
        assert_eq!(backends[1].name, "shard-b");
        assert_eq!(backends[1].weight, 2);

        assert_eq!(ccs.clusters[1].cache_type, CacheType::Memcache);
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let base = ClusterConfig::new("c", CacheType::Redis, "127.0.0.1:0");
        assert!(base.clone().validate().is_err()); // no servers

        let ok = base.clone().with_servers(&["127.0.0.1:6379:1"]);
        ok.validate().unwrap();

        assert!(ok.clone().with_hash_tag("{").validate().is_err());
        assert!(ok.clone().with_node_connections(0).validate().is_err());
        assert!(ok
            .clone()
            .with_servers(&["127.0.0.1:6379:0"])
            .validate()
            .is_err());
    }

    #[test]
    fn test_timeouts_zero_disables() {
        let cc = ClusterConfig::new("c", CacheType::Redis, "127.0.0.1:0");
        let t = cc.conn_timeouts();
        assert_eq!(t.dial, Some(Duration::from_millis(1000)));
        assert_eq!(t.read, None);
        assert_eq!(t.write, None);
    }
}
