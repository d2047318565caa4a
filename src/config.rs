use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the shepherd server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Owner-facing HTTP API configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Agent stream listener configuration.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Document store connection configuration.
    #[serde(default)]
    pub mongodb: MongoConfig,

    /// Heartbeat checker configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Snapshot recorder configuration.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Owner-facing HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen host. Default: "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port. Default: 8080.
    #[serde(default = "default_server_port")]
    pub port: u16,
}

/// Agent stream listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Listen host. Default: "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port. Default: 50051.
    #[serde(default = "default_rpc_port")]
    pub port: u16,

    /// Address handed to enrolling agents. Defaults to "host:port".
    #[serde(default)]
    pub advertise: String,

    /// Maximum wait for the identifying first frame. Default: 10s.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl RpcConfig {
    /// The address agents should dial, falling back to the bind address.
    pub fn advertised_addr(&self) -> String {
        if self.advertise.is_empty() {
            format!("{}:{}", self.host, self.port)
        } else {
            self.advertise.clone()
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Document store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    /// Connection URI. Default: "mongodb://localhost:27017".
    #[serde(default = "default_mongo_uri")]
    pub uri: String,

    /// Database name. Default: "shepherd".
    #[serde(default = "default_mongo_database")]
    pub database: String,
}

/// Heartbeat checker configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HeartbeatConfig {
    /// Time between sweeps. Default: 30s.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    /// Per-ping timeout (applied to enqueue and reply independently).
    /// Default: 5s.
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,

    /// Consecutive misses before a machine is marked dead. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Snapshot recorder configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SnapshotConfig {
    /// Time between recording passes. Default: 5m.
    #[serde(default = "default_snapshot_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Snapshot retention before TTL eviction. Default: 30d.
    #[serde(default = "default_snapshot_ttl", with = "humantime_serde")]
    pub ttl: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_rpc_port() -> u16 {
    50051
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_mongo_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_mongo_database() -> String {
    "shepherd".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_ping_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    3
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_snapshot_ttl() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            rpc: RpcConfig::default(),
            health: HealthConfig::default(),
            mongodb: MongoConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_rpc_port(),
            advertise: String::new(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: default_mongo_uri(),
            database: default_mongo_database(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            ping_timeout: default_ping_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: default_snapshot_interval(),
            ttl: default_snapshot_ttl(),
        }
    }
}

// --- Loading, environment overrides, validation ---

impl Config {
    /// Load configuration: defaults, then the YAML file if given, then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;

                serde_yaml::from_str(&data)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        cfg.apply_env_from(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Apply environment overrides from the given lookup.
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("SERVER_PORT") {
            self.server.port = parse_port("SERVER_PORT", &v)?;
        }
        if let Some(v) = get("RPC_HOST") {
            self.rpc.host = v;
        }
        if let Some(v) = get("RPC_PORT") {
            self.rpc.port = parse_port("RPC_PORT", &v)?;
        }
        if let Some(v) = get("RPC_ADVERTISE") {
            self.rpc.advertise = v;
        }
        if let Some(v) = get("HEALTH_ADDR") {
            self.health.addr = v;
        }
        if let Some(v) = get("MONGODB_URI") {
            self.mongodb.uri = v;
        }
        if let Some(v) = get("MONGODB_DATABASE") {
            self.mongodb.database = v;
        }
        if let Some(v) = get("HEARTBEAT_CHECK_INTERVAL") {
            self.heartbeat.check_interval = parse_duration("HEARTBEAT_CHECK_INTERVAL", &v)?;
        }
        if let Some(v) = get("HEARTBEAT_PING_TIMEOUT") {
            self.heartbeat.ping_timeout = parse_duration("HEARTBEAT_PING_TIMEOUT", &v)?;
        }
        if let Some(v) = get("HEARTBEAT_MAX_RETRIES") {
            self.heartbeat.max_retries = v
                .parse()
                .with_context(|| format!("invalid HEARTBEAT_MAX_RETRIES: {v}"))?;
        }
        if let Some(v) = get("SNAPSHOT_INTERVAL") {
            self.snapshot.interval = parse_duration("SNAPSHOT_INTERVAL", &v)?;
        }
        if let Some(v) = get("SNAPSHOT_TTL") {
            self.snapshot.ttl = parse_duration("SNAPSHOT_TTL", &v)?;
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be positive");
        }

        if self.rpc.port == 0 {
            bail!("rpc.port must be positive");
        }

        if self.mongodb.uri.is_empty() {
            bail!("mongodb.uri is required");
        }

        if self.mongodb.database.is_empty() {
            bail!("mongodb.database is required");
        }

        if self.heartbeat.check_interval.is_zero() {
            bail!("heartbeat.check_interval must be positive");
        }

        if self.heartbeat.ping_timeout.is_zero() {
            bail!("heartbeat.ping_timeout must be positive");
        }

        if self.heartbeat.max_retries == 0 {
            bail!("heartbeat.max_retries must be at least 1");
        }

        if self.snapshot.interval.is_zero() {
            bail!("snapshot.interval must be positive");
        }

        if self.snapshot.ttl < self.snapshot.interval {
            bail!("snapshot.ttl must not be shorter than snapshot.interval");
        }

        Ok(())
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .with_context(|| format!("invalid {key}: {value}"))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {key}: {value}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.rpc.port, 50051);
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.heartbeat.check_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat.ping_timeout, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat.max_retries, 3);
        assert_eq!(cfg.snapshot.interval, Duration::from_secs(300));
        assert_eq!(cfg.snapshot.ttl, Duration::from_secs(30 * 24 * 60 * 60));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_advertised_addr_falls_back_to_bind() {
        let mut rpc = RpcConfig::default();
        assert_eq!(rpc.advertised_addr(), "0.0.0.0:50051");

        rpc.advertise = "fleet.example.com:443".to_string();
        assert_eq!(rpc.advertised_addr(), "fleet.example.com:443");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SERVER_PORT", "9999"),
            ("RPC_HOST", "10.0.0.1"),
            ("MONGODB_URI", "mongodb://db:27017"),
            ("HEARTBEAT_CHECK_INTERVAL", "1s"),
            ("HEARTBEAT_MAX_RETRIES", "5"),
            ("SNAPSHOT_INTERVAL", "1m"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .expect("apply env");

        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.rpc.host, "10.0.0.1");
        assert_eq!(cfg.mongodb.uri, "mongodb://db:27017");
        assert_eq!(cfg.heartbeat.check_interval, Duration::from_secs(1));
        assert_eq!(cfg.heartbeat.max_retries, 5);
        assert_eq!(cfg.snapshot.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_from(|key| (key == "HEARTBEAT_PING_TIMEOUT").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("HEARTBEAT_PING_TIMEOUT"));
    }

    #[test]
    fn test_validation_rejects_zero_retries() {
        let mut cfg = Config::default();
        cfg.heartbeat.max_retries = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn test_validation_rejects_ttl_below_interval() {
        let mut cfg = Config::default();
        cfg.snapshot.ttl = Duration::from_secs(60);
        cfg.snapshot.interval = Duration::from_secs(300);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("snapshot.ttl"));
    }

    #[test]
    fn test_yaml_parsing_with_humantime_durations() {
        let cfg: Config = serde_yaml::from_str(
            r#"
heartbeat:
  check_interval: 10s
  ping_timeout: 500ms
  max_retries: 2
snapshot:
  interval: 30s
"#,
        )
        .expect("parse yaml");

        assert_eq!(cfg.heartbeat.check_interval, Duration::from_secs(10));
        assert_eq!(cfg.heartbeat.ping_timeout, Duration::from_millis(500));
        assert_eq!(cfg.heartbeat.max_retries, 2);
        assert_eq!(cfg.snapshot.interval, Duration::from_secs(30));
    }
}
