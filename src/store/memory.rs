//! In-memory store backend.
//!
//! Mirrors the Mongo backend's semantics over plain maps so the rest of the
//! system can be exercised without a database. Per-collection locks stand in
//! for per-document write atomicity.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::model::{
    ClaimCode, Command, Machine, MachineStatus, MetricSet, Snapshot, SnapshotMetrics, User,
};

use super::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    machines: RwLock<HashMap<String, Machine>>,
    snapshots: RwLock<Vec<Snapshot>>,
    users: RwLock<HashMap<String, User>>,
    commands: RwLock<Vec<Command>>,
    claims: RwLock<HashMap<String, ClaimCode>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Machines ---

    pub fn create_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        self.machines
            .write()
            .insert(machine.id.clone(), machine.clone());
        Ok(())
    }

    pub fn machine(&self, id: &str) -> Result<Machine, StoreError> {
        self.machines
            .read()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    pub fn machines_for_user(&self, user_id: &str) -> Result<Vec<Machine>, StoreError> {
        Ok(self
            .machines
            .read()
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    pub fn delete_machine(&self, id: &str) -> Result<(), StoreError> {
        self.machines
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    pub fn update_machine_status(&self, id: &str, status: MachineStatus) -> Result<(), StoreError> {
        let mut machines = self.machines.write();
        let machine = machines.get_mut(id).ok_or(StoreError::NotFound)?;
        machine.status = status;
        machine.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_heartbeat(&self, id: &str, metrics: &MetricSet) -> Result<(), StoreError> {
        let mut machines = self.machines.write();
        let machine = machines.get_mut(id).ok_or(StoreError::NotFound)?;

        let now = Utc::now();
        machine.status = MachineStatus::Alive;
        machine.retry_count = 0;
        machine.last_seen = Some(now);
        machine.updated_at = now;
        if !metrics.is_empty() {
            machine.metrics = metrics.clone();
        }

        Ok(())
    }

    pub fn increment_retry(&self, id: &str) -> Result<u32, StoreError> {
        let mut machines = self.machines.write();
        let machine = machines.get_mut(id).ok_or(StoreError::NotFound)?;
        machine.retry_count += 1;
        machine.updated_at = Utc::now();
        Ok(machine.retry_count)
    }

    pub fn monitored_machines(&self) -> Result<Vec<Machine>, StoreError> {
        Ok(self
            .machines
            .read()
            .values()
            .filter(|m| m.status.is_monitored())
            .cloned()
            .collect())
    }

    pub fn machines_by_status(&self, status: MachineStatus) -> Result<Vec<Machine>, StoreError> {
        Ok(self
            .machines
            .read()
            .values()
            .filter(|m| m.status == status)
            .cloned()
            .collect())
    }

    pub fn re_enable_machine(&self, id: &str) -> Result<bool, StoreError> {
        let mut machines = self.machines.write();
        let machine = machines.get_mut(id).ok_or(StoreError::NotFound)?;

        if machine.status != MachineStatus::Dead {
            return Ok(false);
        }

        machine.status = MachineStatus::Pending;
        machine.retry_count = 0;
        machine.updated_at = Utc::now();
        Ok(true)
    }

    // --- Snapshots ---

    pub fn insert_snapshot(
        &self,
        machine_id: &str,
        at: DateTime<Utc>,
        metrics: SnapshotMetrics,
    ) -> Result<(), StoreError> {
        self.snapshots.write().push(Snapshot {
            machine_id: machine_id.to_string(),
            at,
            metrics,
        });
        Ok(())
    }

    pub fn snapshots_in_range(
        &self,
        machine_ids: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let mut out: Vec<Snapshot> = self
            .snapshots
            .read()
            .iter()
            .filter(|s| machine_ids.contains(&s.machine_id) && s.at >= start && s.at <= end)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.at);
        Ok(out)
    }

    // --- Users ---

    pub fn create_user(&self, user: &User) -> Result<(), StoreError> {
        self.users.write().insert(user.id.clone(), user.clone());
        Ok(())
    }

    pub fn user_by_token(&self, token: &str) -> Result<User, StoreError> {
        self.users
            .read()
            .values()
            .find(|u| u.api_token == token)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    // --- Commands ---

    pub fn create_command(&self, command: &Command) -> Result<(), StoreError> {
        self.commands.write().push(command.clone());
        Ok(())
    }

    pub fn commands_for_machine(&self, machine_id: &str) -> Result<Vec<Command>, StoreError> {
        Ok(self
            .commands
            .read()
            .iter()
            .filter(|c| c.machine_id == machine_id)
            .cloned()
            .collect())
    }

    // --- Claim codes ---

    pub fn create_claim(&self, claim: &ClaimCode) -> Result<(), StoreError> {
        self.claims.write().insert(claim.code.clone(), claim.clone());
        Ok(())
    }

    pub fn redeem_claim(&self, code: &str) -> Result<ClaimCode, StoreError> {
        let mut claims = self.claims.write();
        let claim = claims.get_mut(code).ok_or(StoreError::NotFound)?;

        if claim.used || claim.is_expired(Utc::now()) {
            return Err(StoreError::NotFound);
        }

        claim.used = true;
        Ok(claim.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn machine_with_status(status: MachineStatus) -> Machine {
        let mut m = Machine::new("u1", "box", "");
        m.status = status;
        m
    }

    #[test]
    fn test_heartbeat_resets_retry_and_sets_last_seen() {
        let store = MemoryStore::new();
        let mut m = machine_with_status(MachineStatus::Registered);
        m.retry_count = 2;
        store.create_machine(&m).expect("create");

        let metrics = MetricSet {
            cpu_load: Some(0.5),
            ..Default::default()
        };
        store.record_heartbeat(&m.id, &metrics).expect("heartbeat");

        let stored = store.machine(&m.id).expect("machine");
        assert_eq!(stored.status, MachineStatus::Alive);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.last_seen.is_some());
        assert_eq!(stored.metrics.cpu_load, Some(0.5));
    }

    #[test]
    fn test_empty_extraction_does_not_clobber_metrics() {
        let store = MemoryStore::new();
        let mut m = machine_with_status(MachineStatus::Alive);
        m.metrics = MetricSet {
            mem_usage_mb: Some(200.0),
            ..Default::default()
        };
        store.create_machine(&m).expect("create");

        store
            .record_heartbeat(&m.id, &MetricSet::default())
            .expect("heartbeat");

        let stored = store.machine(&m.id).expect("machine");
        assert_eq!(stored.metrics.mem_usage_mb, Some(200.0));
    }

    #[test]
    fn test_increment_retry_returns_new_value() {
        let store = MemoryStore::new();
        let m = machine_with_status(MachineStatus::Alive);
        store.create_machine(&m).expect("create");

        assert_eq!(store.increment_retry(&m.id).expect("inc"), 1);
        assert_eq!(store.increment_retry(&m.id).expect("inc"), 2);
    }

    #[test]
    fn test_monitored_excludes_pending_and_dead() {
        let store = MemoryStore::new();
        for status in [
            MachineStatus::Pending,
            MachineStatus::Registered,
            MachineStatus::Alive,
            MachineStatus::Dead,
        ] {
            store
                .create_machine(&machine_with_status(status))
                .expect("create");
        }

        let monitored = store.monitored_machines().expect("list");
        assert_eq!(monitored.len(), 2);
        assert!(monitored.iter().all(|m| m.status.is_monitored()));
    }

    #[test]
    fn test_re_enable_only_moves_dead_machines() {
        let store = MemoryStore::new();
        let alive = machine_with_status(MachineStatus::Alive);
        let mut dead = machine_with_status(MachineStatus::Dead);
        dead.retry_count = 5;
        store.create_machine(&alive).expect("create");
        store.create_machine(&dead).expect("create");

        assert!(!store.re_enable_machine(&alive.id).expect("re-enable"));
        assert!(store.re_enable_machine(&dead.id).expect("re-enable"));

        let stored = store.machine(&dead.id).expect("machine");
        assert_eq!(stored.status, MachineStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn test_snapshot_range_is_inclusive_and_sorted() {
        let store = MemoryStore::new();
        let base = Utc::now();
        let ids = vec!["m-1".to_string()];

        for minutes in [3, 1, 2, 10] {
            store
                .insert_snapshot(
                    "m-1",
                    base + ChronoDuration::minutes(minutes),
                    SnapshotMetrics::default(),
                )
                .expect("insert");
        }

        let rows = store
            .snapshots_in_range(
                &ids,
                base + ChronoDuration::minutes(1),
                base + ChronoDuration::minutes(3),
            )
            .expect("range");

        let offsets: Vec<i64> = rows
            .iter()
            .map(|s| (s.at - base).num_minutes())
            .collect();
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[test]
    fn test_claim_codes_are_single_use() {
        let store = MemoryStore::new();
        let claim = ClaimCode::generate("u1", std::time::Duration::from_secs(900));
        store.create_claim(&claim).expect("create");

        let redeemed = store.redeem_claim(&claim.code).expect("redeem");
        assert_eq!(redeemed.user_id, "u1");

        assert!(matches!(
            store.redeem_claim(&claim.code),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_expired_claim_is_rejected() {
        let store = MemoryStore::new();
        let mut claim = ClaimCode::generate("u1", std::time::Duration::from_secs(900));
        claim.expires_at = Utc::now() - ChronoDuration::minutes(1);
        store.create_claim(&claim).expect("create");

        assert!(matches!(
            store.redeem_claim(&claim.code),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_user_lookup_by_token() {
        let store = MemoryStore::new();
        let user = User {
            id: "u1".to_string(),
            email: "op@example.com".to_string(),
            display_name: String::new(),
            api_token: "tok-1".to_string(),
        };
        store.create_user(&user).expect("create");

        assert_eq!(store.user_by_token("tok-1").expect("lookup").id, "u1");
        assert!(matches!(
            store.user_by_token("tok-2"),
            Err(StoreError::NotFound)
        ));
    }
}
