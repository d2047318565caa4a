//! Persistent data model: machines, snapshots, commands, users, claim codes.
//!
//! Documents serialize to BSON for the Mongo backend; dates use BSON
//! datetimes so TTL indexes apply. HTTP responses are shaped separately in
//! the `http` module.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Length of a generated claim-code token.
pub const CLAIM_CODE_LEN: usize = 20;

/// Lifecycle state of a machine, driven by the heartbeat checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// Enrolled, agent has not connected yet.
    Pending,
    /// Agent connected at least once, no pong observed yet.
    Registered,
    /// Responding to pings.
    Alive,
    /// Exhausted its retries; excluded from sweeps until re-enabled.
    Dead,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Registered => "registered",
            Self::Alive => "alive",
            Self::Dead => "dead",
        }
    }

    /// Whether the heartbeat checker sweeps this machine.
    pub fn is_monitored(&self) -> bool {
        matches!(self, Self::Alive | Self::Registered)
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical metric set as carried on a live machine record.
///
/// Fields a pong never reported stay `None`; the snapshot projection
/// ([`MetricSet::to_snapshot`]) fills them with zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_load: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_usage_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_used_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_total_gb: Option<f64>,
}

impl MetricSet {
    pub fn is_empty(&self) -> bool {
        self.cpu_load.is_none()
            && self.mem_usage_mb.is_none()
            && self.disk_used_gb.is_none()
            && self.disk_total_gb.is_none()
    }

    /// Full canonical projection: missing values become 0.
    pub fn to_snapshot(&self) -> SnapshotMetrics {
        SnapshotMetrics {
            cpu_load: self.cpu_load.unwrap_or(0.0),
            mem_usage_mb: self.mem_usage_mb.unwrap_or(0.0),
            disk_used_gb: self.disk_used_gb.unwrap_or(0.0),
            disk_total_gb: self.disk_total_gb.unwrap_or(0.0),
        }
    }
}

/// Snapshot metrics always carry exactly the four canonical keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetrics {
    pub cpu_load: f64,
    pub mem_usage_mb: f64,
    pub disk_used_gb: f64,
    pub disk_total_gb: f64,
}

/// One machine document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
    pub status: MachineStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "bson_datetime_opt"
    )]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "MetricSet::is_empty")]
    pub metrics: MetricSet,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    /// Creates a new machine in `pending` state with a server-assigned id.
    pub fn new(user_id: &str, name: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            is_public: false,
            status: MachineStatus::Pending,
            retry_count: 0,
            last_seen: None,
            metrics: MetricSet::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One append-only time-series row. Absence of a row in a time bucket
/// encodes downtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub machine_id: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub at: DateTime<Utc>,
    pub metrics: SnapshotMetrics,
}

/// Command queue entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A queued command for a machine's agent. Not on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "_id")]
    pub id: String,
    pub machine_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub status: CommandStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl Command {
    pub fn new(machine_id: &str, command: &str, args: Vec<String>, env: HashMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            machine_id: machine_id.to_string(),
            command: command.to_string(),
            args,
            env,
            status: CommandStatus::Pending,
            output: String::new(),
            exit_code: 0,
            error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Minimal owner identity; bounds the machine set a query may observe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    pub api_token: String,
}

/// Single-use enrollment ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimCode {
    #[serde(rename = "_id")]
    pub code: String,
    pub user_id: String,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub used: bool,
}

impl ClaimCode {
    /// Issues a fresh alphanumeric token for the given owner.
    pub fn generate(user_id: &str, ttl: std::time::Duration) -> Self {
        const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghjkmnpqrstuvwxyz23456789";
        let mut rng = rand::thread_rng();
        let code: String = (0..CLAIM_CODE_LEN)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect();

        Self {
            code,
            user_id: user_id.to_string(),
            expires_at: Utc::now()
                + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::minutes(15)),
            used: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// BSON-datetime serde for optional timestamps (the bson helpers only cover
/// the non-optional case).
pub mod bson_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => bson::DateTime::from_chrono(*dt).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value = Option::<bson::DateTime>::deserialize(deserializer)?;
        Ok(value.map(bson::DateTime::to_chrono))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&MachineStatus::Registered).expect("serialize");
        assert_eq!(json, "\"registered\"");

        let back: MachineStatus = serde_json::from_str("\"dead\"").expect("deserialize");
        assert_eq!(back, MachineStatus::Dead);
    }

    #[test]
    fn test_monitored_statuses() {
        assert!(MachineStatus::Alive.is_monitored());
        assert!(MachineStatus::Registered.is_monitored());
        assert!(!MachineStatus::Pending.is_monitored());
        assert!(!MachineStatus::Dead.is_monitored());
    }

    #[test]
    fn test_snapshot_projection_zero_fills() {
        let partial = MetricSet {
            cpu_load: Some(0.5),
            disk_total_gb: Some(100.0),
            ..Default::default()
        };

        let full = partial.to_snapshot();
        assert_eq!(full.cpu_load, 0.5);
        assert_eq!(full.mem_usage_mb, 0.0);
        assert_eq!(full.disk_used_gb, 0.0);
        assert_eq!(full.disk_total_gb, 100.0);
    }

    #[test]
    fn test_metric_set_empty() {
        assert!(MetricSet::default().is_empty());
        assert!(!MetricSet {
            mem_usage_mb: Some(1.0),
            ..Default::default()
        }
        .is_empty());
    }

    #[test]
    fn test_new_machine_starts_pending() {
        let m = Machine::new("u1", "build-box", "CI runner");
        assert_eq!(m.status, MachineStatus::Pending);
        assert_eq!(m.retry_count, 0);
        assert!(m.last_seen.is_none());
        assert!(m.metrics.is_empty());
        assert!(!m.id.is_empty());
    }

    #[test]
    fn test_claim_code_shape() {
        let claim = ClaimCode::generate("u1", std::time::Duration::from_secs(900));
        assert_eq!(claim.code.len(), CLAIM_CODE_LEN);
        assert!(claim.code.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(!claim.used);
        assert!(!claim.is_expired(Utc::now()));
        assert!(claim.is_expired(Utc::now() + ChronoDuration::minutes(16)));
    }

    #[test]
    fn test_claim_codes_are_unique() {
        let a = ClaimCode::generate("u1", std::time::Duration::from_secs(900));
        let b = ClaimCode::generate("u1", std::time::Duration::from_secs(900));
        assert_ne!(a.code, b.code);
    }
}
