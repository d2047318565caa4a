//! MongoDB store backend.
//!
//! Collections: `machines`, `machine_snapshots` (TTL-evicted), `users`,
//! `commands`, `claim_codes`. Writes rely on MongoDB's single-document
//! atomicity; there is no cross-document transaction anywhere.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use tracing::info;

use crate::config::MongoConfig;
use crate::model::{
    ClaimCode, Command, Machine, MachineStatus, MetricSet, Snapshot, SnapshotMetrics, User,
};

use super::StoreError;

const MACHINES: &str = "machines";
const SNAPSHOTS: &str = "machine_snapshots";
const USERS: &str = "users";
const COMMANDS: &str = "commands";
const CLAIM_CODES: &str = "claim_codes";

pub struct MongoStore {
    machines: Collection<Machine>,
    snapshots: Collection<Snapshot>,
    users: Collection<User>,
    commands: Collection<Command>,
    claims: Collection<ClaimCode>,
}

impl MongoStore {
    /// Connects and verifies the deployment answers a ping.
    pub async fn connect(cfg: &MongoConfig) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&cfg.uri).await?;
        let db = client.database(&cfg.database);

        db.run_command(doc! { "ping": 1 }).await?;
        info!(database = %cfg.database, "document store connected");

        Ok(Self {
            machines: db.collection(MACHINES),
            snapshots: db.collection(SNAPSHOTS),
            users: db.collection(USERS),
            commands: db.collection(COMMANDS),
            claims: db.collection(CLAIM_CODES),
        })
    }

    /// Index layout: snapshots age out via a TTL index on `at` and are read
    /// by `(machine_id, at)`; claim codes expire at their deadline.
    pub async fn ensure_indexes(&self, snapshot_ttl: Duration) -> Result<(), StoreError> {
        self.snapshots
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "at": 1 })
                    .options(IndexOptions::builder().expire_after(snapshot_ttl).build())
                    .build(),
            )
            .await?;

        self.snapshots
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "machine_id": 1, "at": 1 })
                    .build(),
            )
            .await?;

        self.machines
            .create_index(IndexModel::builder().keys(doc! { "user_id": 1 }).build())
            .await?;

        self.machines
            .create_index(IndexModel::builder().keys(doc! { "status": 1 }).build())
            .await?;

        self.users
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "api_token": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;

        self.claims
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "expires_at": 1 })
                    .options(
                        IndexOptions::builder()
                            .expire_after(Duration::from_secs(0))
                            .build(),
                    )
                    .build(),
            )
            .await?;

        self.commands
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "machine_id": 1, "created_at": 1 })
                    .build(),
            )
            .await?;

        Ok(())
    }

    // --- Machines ---

    pub async fn create_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        self.machines.insert_one(machine).await?;
        Ok(())
    }

    pub async fn machine(&self, id: &str) -> Result<Machine, StoreError> {
        self.machines
            .find_one(doc! { "_id": id })
            .await?
            .ok_or(StoreError::NotFound)
    }

    pub async fn machines_for_user(&self, user_id: &str) -> Result<Vec<Machine>, StoreError> {
        let cursor = self.machines.find(doc! { "user_id": user_id }).await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn delete_machine(&self, id: &str) -> Result<(), StoreError> {
        let result = self.machines.delete_one(doc! { "_id": id }).await?;
        if result.deleted_count == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn update_machine_status(
        &self,
        id: &str,
        status: MachineStatus,
    ) -> Result<(), StoreError> {
        let result = self
            .machines
            .update_one(
                doc! { "_id": id },
                doc! { "$set": {
                    "status": status.as_str(),
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
            )
            .await?;

        if result.matched_count == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn record_heartbeat(&self, id: &str, metrics: &MetricSet) -> Result<(), StoreError> {
        let now = bson::DateTime::from_chrono(Utc::now());
        let mut set = doc! {
            "status": MachineStatus::Alive.as_str(),
            "retry_count": 0_i64,
            "last_seen": now,
            "updated_at": now,
        };
        if !metrics.is_empty() {
            set.insert("metrics", bson::to_bson(metrics)?);
        }

        let result = self
            .machines
            .update_one(doc! { "_id": id }, doc! { "$set": set })
            .await?;

        if result.matched_count == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn increment_retry(&self, id: &str) -> Result<u32, StoreError> {
        let updated = self
            .machines
            .find_one_and_update(
                doc! { "_id": id },
                doc! {
                    "$inc": { "retry_count": 1_i64 },
                    "$set": { "updated_at": bson::DateTime::from_chrono(Utc::now()) },
                },
            )
            .return_document(ReturnDocument::After)
            .await?
            .ok_or(StoreError::NotFound)?;

        Ok(updated.retry_count)
    }

    pub async fn monitored_machines(&self) -> Result<Vec<Machine>, StoreError> {
        let cursor = self
            .machines
            .find(doc! { "status": { "$in": ["alive", "registered"] } })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn machines_by_status(
        &self,
        status: MachineStatus,
    ) -> Result<Vec<Machine>, StoreError> {
        let cursor = self
            .machines
            .find(doc! { "status": status.as_str() })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    pub async fn re_enable_machine(&self, id: &str) -> Result<bool, StoreError> {
        let result = self
            .machines
            .update_one(
                doc! { "_id": id, "status": MachineStatus::Dead.as_str() },
                doc! { "$set": {
                    "status": MachineStatus::Pending.as_str(),
                    "retry_count": 0_i64,
                    "updated_at": bson::DateTime::from_chrono(Utc::now()),
                }},
            )
            .await?;

        Ok(result.matched_count == 1)
    }

    // --- Snapshots ---

    pub async fn insert_snapshot(
        &self,
        machine_id: &str,
        at: DateTime<Utc>,
        metrics: SnapshotMetrics,
    ) -> Result<(), StoreError> {
        self.snapshots
            .insert_one(&Snapshot {
                machine_id: machine_id.to_string(),
                at,
                metrics,
            })
            .await?;
        Ok(())
    }

    pub async fn snapshots_in_range(
        &self,
        machine_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        if machine_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Bson> = machine_ids.iter().map(|id| Bson::from(id.clone())).collect();
        let cursor = self
            .snapshots
            .find(doc! {
                "machine_id": { "$in": ids },
                "at": {
                    "$gte": bson::DateTime::from_chrono(start),
                    "$lte": bson::DateTime::from_chrono(end),
                },
            })
            .sort(doc! { "at": 1 })
            .await?;

        Ok(cursor.try_collect().await?)
    }

    // --- Users ---

    pub async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        self.users.insert_one(user).await?;
        Ok(())
    }

    pub async fn user_by_token(&self, token: &str) -> Result<User, StoreError> {
        self.users
            .find_one(doc! { "api_token": token })
            .await?
            .ok_or(StoreError::NotFound)
    }

    // --- Commands ---

    pub async fn create_command(&self, command: &Command) -> Result<(), StoreError> {
        self.commands.insert_one(command).await?;
        Ok(())
    }

    pub async fn commands_for_machine(&self, machine_id: &str) -> Result<Vec<Command>, StoreError> {
        let cursor = self
            .commands
            .find(doc! { "machine_id": machine_id })
            .sort(doc! { "created_at": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    // --- Claim codes ---

    pub async fn create_claim(&self, claim: &ClaimCode) -> Result<(), StoreError> {
        self.claims.insert_one(claim).await?;
        Ok(())
    }

    pub async fn redeem_claim(&self, code: &str) -> Result<ClaimCode, StoreError> {
        self.claims
            .find_one_and_update(
                doc! {
                    "_id": code,
                    "used": false,
                    "expires_at": { "$gt": bson::DateTime::from_chrono(Utc::now()) },
                },
                doc! { "$set": { "used": true } },
            )
            .await?
            .ok_or(StoreError::NotFound)
    }
}
