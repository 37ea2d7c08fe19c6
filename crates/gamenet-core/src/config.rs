// Copyright (C) 2025 gamenet contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use gamenet_protocol::Codec;

use crate::discovery::DEFAULT_ROOT;

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Logical name of this node
    pub node_name: String,
    /// QUIC server bind address
    pub bind_addr: SocketAddr,
    /// Address other nodes reach this one at, as registered in discovery
    pub advertise_addr: String,
    /// Static `node -> address` map
    pub cluster: HashMap<String, String>,
    /// JSON service table, if any
    pub services_file: Option<PathBuf>,
    pub call_timeout: Duration,
    /// Per-connection inbound queue depth
    pub stream_queue: usize,
    pub codec: Codec,
    /// Coordination service addresses (`host:port,...`); discovery is off
    /// when unset
    pub coordinator: Option<String>,
    pub discovery_root: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `GAMENET_NODE_NAME`: this node's logical name
    ///
    /// Optional (with defaults):
    /// - `GAMENET_PORT`: QUIC server port (default: 7100)
    /// - `GAMENET_ADVERTISE_ADDR`: registered address (default: 127.0.0.1:<port>)
    /// - `GAMENET_CLUSTER`: `name=host:port,...` (default: empty)
    /// - `GAMENET_SERVICES_FILE`: JSON service table (default: none)
    /// - `GAMENET_CALL_TIMEOUT_MS`: unary call timeout (default: 5000)
    /// - `GAMENET_STREAM_QUEUE`: inbound queue depth (default: 64)
    /// - `GAMENET_CODEC`: `msgpack` or `json` (default: msgpack)
    /// - `GAMENET_COORDINATOR`: ZooKeeper ensemble, `host:port,...` (default: none)
    /// - `GAMENET_DISCOVERY_ROOT`: coordination namespace root (default: gamenet)
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_name = std::env::var("GAMENET_NODE_NAME")
            .ok()
            .filter(|n| !n.trim().is_empty())
            .ok_or(ConfigError::Missing("GAMENET_NODE_NAME"))?;

        let port: u16 = std::env::var("GAMENET_PORT")
            .unwrap_or_else(|_| "7100".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("GAMENET_PORT", "must be a valid port number"))?;

        let advertise_addr = std::env::var("GAMENET_ADVERTISE_ADDR")
            .unwrap_or_else(|_| format!("127.0.0.1:{port}"));

        let cluster = match std::env::var("GAMENET_CLUSTER") {
            Ok(raw) => parse_cluster(&raw)?,
            Err(_) => HashMap::new(),
        };

        let services_file = std::env::var("GAMENET_SERVICES_FILE")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let call_timeout_ms: u64 = std::env::var("GAMENET_CALL_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .ok()
            .filter(|ms| *ms > 0)
            .ok_or(ConfigError::Invalid(
                "GAMENET_CALL_TIMEOUT_MS",
                "must be a positive integer",
            ))?;

        let stream_queue: usize = std::env::var("GAMENET_STREAM_QUEUE")
            .unwrap_or_else(|_| "64".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "GAMENET_STREAM_QUEUE",
                "must be a positive integer",
            ))?;

        let codec: Codec = std::env::var("GAMENET_CODEC")
            .unwrap_or_else(|_| "msgpack".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("GAMENET_CODEC", "must be 'msgpack' or 'json'"))?;

        let coordinator = std::env::var("GAMENET_COORDINATOR")
            .ok()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        let discovery_root =
            std::env::var("GAMENET_DISCOVERY_ROOT").unwrap_or_else(|_| DEFAULT_ROOT.to_string());

        Ok(Self {
            node_name,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            advertise_addr,
            cluster,
            services_file,
            call_timeout: Duration::from_millis(call_timeout_ms),
            stream_queue,
            codec,
            coordinator,
            discovery_root,
        })
    }
}

/// Parse `name=host:port,name=host:port`.
fn parse_cluster(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut cluster = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, addr) = entry
            .split_once('=')
            .map(|(n, a)| (n.trim(), a.trim()))
            .filter(|(n, a)| !n.is_empty() && !a.is_empty())
            .ok_or(ConfigError::Invalid(
                "GAMENET_CLUSTER",
                "entries must look like name=host:port",
            ))?;
        cluster.insert(name.to_string(), addr.to_string());
    }
    Ok(cluster)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 10] = [
        "GAMENET_NODE_NAME",
        "GAMENET_PORT",
        "GAMENET_ADVERTISE_ADDR",
        "GAMENET_CLUSTER",
        "GAMENET_SERVICES_FILE",
        "GAMENET_CALL_TIMEOUT_MS",
        "GAMENET_STREAM_QUEUE",
        "GAMENET_CODEC",
        "GAMENET_COORDINATOR",
        "GAMENET_DISCOVERY_ROOT",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate: every variable unset.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("GAMENET_NODE_NAME", "battle1");

        let config = Config::from_env().unwrap();

        assert_eq!(config.node_name, "battle1");
        assert_eq!(config.bind_addr.port(), 7100);
        assert_eq!(config.advertise_addr, "127.0.0.1:7100");
        assert!(config.cluster.is_empty());
        assert!(config.services_file.is_none());
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.stream_queue, 64);
        assert_eq!(config.codec, Codec::MsgPack);
        assert!(config.coordinator.is_none());
        assert_eq!(config.discovery_root, "gamenet");
    }

    #[test]
    fn test_config_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("GAMENET_NODE_NAME", "gate");
        guard.set("GAMENET_PORT", "9100");
        guard.set("GAMENET_ADVERTISE_ADDR", "10.1.2.3:9100");
        guard.set("GAMENET_CLUSTER", "node1=10.0.0.1:7100, node2 = 10.0.0.2:7100");
        guard.set("GAMENET_SERVICES_FILE", "/etc/gamenet/services.json");
        guard.set("GAMENET_CALL_TIMEOUT_MS", "250");
        guard.set("GAMENET_STREAM_QUEUE", "8");
        guard.set("GAMENET_CODEC", "JSON");
        guard.set("GAMENET_COORDINATOR", " zk1:2181,zk2:2181 ");
        guard.set("GAMENET_DISCOVERY_ROOT", "staging");

        let config = Config::from_env().unwrap();

        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.advertise_addr, "10.1.2.3:9100");
        assert_eq!(config.cluster.len(), 2);
        assert_eq!(config.cluster["node2"], "10.0.0.2:7100");
        assert_eq!(
            config.services_file,
            Some(PathBuf::from("/etc/gamenet/services.json"))
        );
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.stream_queue, 8);
        assert_eq!(config.codec, Codec::Json);
        assert_eq!(config.coordinator.as_deref(), Some("zk1:2181,zk2:2181"));
        assert_eq!(config.discovery_root, "staging");
    }

    #[test]
    fn test_config_missing_node_name() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("GAMENET_NODE_NAME", "  ");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GAMENET_NODE_NAME")));
        assert!(err.to_string().contains("GAMENET_NODE_NAME"));
    }

    #[test]
    fn test_config_invalid_port_out_of_range() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("GAMENET_NODE_NAME", "battle1");
        guard.set("GAMENET_PORT", "99999"); // > 65535

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("GAMENET_PORT", _))
        ));
    }

    #[test]
    fn test_config_invalid_cluster_entry() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("GAMENET_NODE_NAME", "battle1");
        guard.set("GAMENET_CLUSTER", "node1=10.0.0.1:7100,node2");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("GAMENET_CLUSTER", _))
        ));
    }

    #[test]
    fn test_config_zero_values_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("GAMENET_NODE_NAME", "battle1");
        guard.set("GAMENET_STREAM_QUEUE", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("GAMENET_STREAM_QUEUE", _))
        ));

        guard.set("GAMENET_STREAM_QUEUE", "16");
        guard.set("GAMENET_CALL_TIMEOUT_MS", "-5");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("GAMENET_CALL_TIMEOUT_MS", _))
        ));
    }

    #[test]
    fn test_config_unknown_codec() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("GAMENET_NODE_NAME", "battle1");
        guard.set("GAMENET_CODEC", "protobuf");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("GAMENET_CODEC", _))
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
