//! Document store behind the whole control plane.
//!
//! Enum dispatch over two backends: MongoDB for production, an in-memory
//! twin for tests and local experiments. The per-machine document is the
//! serialisation point for all state transitions, so every mutation here is
//! a single-document atomic update.

pub mod memory;
pub mod mongo;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::model::{
    ClaimCode, Command, Machine, MachineStatus, MetricSet, Snapshot, SnapshotMetrics, User,
};

use self::memory::MemoryStore;
use self::mongo::MongoStore;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,

    #[error(transparent)]
    Database(#[from] mongodb::error::Error),

    #[error("encoding document: {0}")]
    Encode(#[from] bson::ser::Error),
}

/// The document store, dispatching to the configured backend.
pub enum Store {
    Mongo(MongoStore),
    Memory(MemoryStore),
}

impl Store {
    /// Opens a Mongo-backed store and verifies connectivity. Failure here is
    /// fatal for the server.
    pub async fn connect(cfg: &crate::config::MongoConfig) -> Result<Self, StoreError> {
        Ok(Self::Mongo(MongoStore::connect(cfg).await?))
    }

    /// An in-memory store. Used by tests; TTL eviction does not apply.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// Backend name for logging.
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Mongo(_) => "mongodb",
            Self::Memory(_) => "memory",
        }
    }

    /// Creates the TTL and query indexes the collections rely on.
    pub async fn ensure_indexes(&self, snapshot_ttl: Duration) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.ensure_indexes(snapshot_ttl).await,
            Self::Memory(_) => Ok(()),
        }
    }

    // --- Machines ---

    pub async fn create_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.create_machine(machine).await,
            Self::Memory(s) => s.create_machine(machine),
        }
    }

    pub async fn machine(&self, id: &str) -> Result<Machine, StoreError> {
        match self {
            Self::Mongo(s) => s.machine(id).await,
            Self::Memory(s) => s.machine(id),
        }
    }

    pub async fn machines_for_user(&self, user_id: &str) -> Result<Vec<Machine>, StoreError> {
        match self {
            Self::Mongo(s) => s.machines_for_user(user_id).await,
            Self::Memory(s) => s.machines_for_user(user_id),
        }
    }

    pub async fn delete_machine(&self, id: &str) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.delete_machine(id).await,
            Self::Memory(s) => s.delete_machine(id),
        }
    }

    pub async fn update_machine_status(
        &self,
        id: &str,
        status: MachineStatus,
    ) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.update_machine_status(id, status).await,
            Self::Memory(s) => s.update_machine_status(id, status),
        }
    }

    /// The single heartbeat-success write: `status ← alive`, `retry_count ←
    /// 0`, `last_seen ← now`, and `metrics ← extracted` unless extraction
    /// was empty.
    pub async fn record_heartbeat(&self, id: &str, metrics: &MetricSet) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.record_heartbeat(id, metrics).await,
            Self::Memory(s) => s.record_heartbeat(id, metrics),
        }
    }

    /// Atomically increments the retry counter and returns the new value.
    pub async fn increment_retry(&self, id: &str) -> Result<u32, StoreError> {
        match self {
            Self::Mongo(s) => s.increment_retry(id).await,
            Self::Memory(s) => s.increment_retry(id),
        }
    }

    /// Machines the heartbeat checker sweeps: `alive` or `registered`.
    pub async fn monitored_machines(&self) -> Result<Vec<Machine>, StoreError> {
        match self {
            Self::Mongo(s) => s.monitored_machines().await,
            Self::Memory(s) => s.monitored_machines(),
        }
    }

    pub async fn machines_by_status(
        &self,
        status: MachineStatus,
    ) -> Result<Vec<Machine>, StoreError> {
        match self {
            Self::Mongo(s) => s.machines_by_status(status).await,
            Self::Memory(s) => s.machines_by_status(status),
        }
    }

    /// Owner action moving a `dead` machine back to `pending`. Returns false
    /// when the machine was not dead.
    pub async fn re_enable_machine(&self, id: &str) -> Result<bool, StoreError> {
        match self {
            Self::Mongo(s) => s.re_enable_machine(id).await,
            Self::Memory(s) => s.re_enable_machine(id),
        }
    }

    // --- Snapshots ---

    pub async fn insert_snapshot(
        &self,
        machine_id: &str,
        at: DateTime<Utc>,
        metrics: SnapshotMetrics,
    ) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.insert_snapshot(machine_id, at, metrics).await,
            Self::Memory(s) => s.insert_snapshot(machine_id, at, metrics),
        }
    }

    /// Snapshots for any of the given machines with `at` in
    /// `[start, end]`, sorted ascending.
    pub async fn snapshots_in_range(
        &self,
        machine_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        match self {
            Self::Mongo(s) => s.snapshots_in_range(machine_ids, start, end).await,
            Self::Memory(s) => s.snapshots_in_range(machine_ids, start, end),
        }
    }

    // --- Users ---

    pub async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.create_user(user).await,
            Self::Memory(s) => s.create_user(user),
        }
    }

    pub async fn user_by_token(&self, token: &str) -> Result<User, StoreError> {
        match self {
            Self::Mongo(s) => s.user_by_token(token).await,
            Self::Memory(s) => s.user_by_token(token),
        }
    }

    // --- Commands ---

    pub async fn create_command(&self, command: &Command) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.create_command(command).await,
            Self::Memory(s) => s.create_command(command),
        }
    }

    pub async fn commands_for_machine(&self, machine_id: &str) -> Result<Vec<Command>, StoreError> {
        match self {
            Self::Mongo(s) => s.commands_for_machine(machine_id).await,
            Self::Memory(s) => s.commands_for_machine(machine_id),
        }
    }

    // --- Claim codes ---

    pub async fn create_claim(&self, claim: &ClaimCode) -> Result<(), StoreError> {
        match self {
            Self::Mongo(s) => s.create_claim(claim).await,
            Self::Memory(s) => s.create_claim(claim),
        }
    }

    /// Atomically consumes an unused, unexpired claim code.
    pub async fn redeem_claim(&self, code: &str) -> Result<ClaimCode, StoreError> {
        match self {
            Self::Mongo(s) => s.redeem_claim(code).await,
            Self::Memory(s) => s.redeem_claim(code),
        }
    }
}
