//! Heartbeat checker: periodic liveness sweeps over monitored machines.
//!
//! Each sweep pings every `alive`/`registered` machine through its stream
//! dispatcher. A pong resets the retry counter and refreshes the canonical
//! metrics in one write; a miss advances the counter until the machine is
//! marked `dead`. A coalesced trigger channel lets a fresh connection be
//! checked immediately instead of waiting out the interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HeartbeatConfig;
use crate::health::HealthMetrics;
use crate::model::{MachineStatus, MetricSet};
use crate::rpc::connection::{ConnectionRegistry, PingError};
use crate::rpc::wire::{HeartbeatPong, Scalar};
use crate::store::Store;

/// Fire-and-forget handle for requesting an immediate sweep.
///
/// The underlying channel holds one slot; a trigger fired while one is
/// already pending is dropped, so bursts of connects coalesce into a single
/// extra sweep.
#[derive(Clone)]
pub struct HeartbeatTrigger(mpsc::Sender<()>);

impl HeartbeatTrigger {
    pub fn fire(&self) {
        let _ = self.0.try_send(());
    }

    pub(crate) fn from_sender(tx: mpsc::Sender<()>) -> Self {
        Self(tx)
    }
}

pub struct HeartbeatChecker {
    cfg: HeartbeatConfig,
    store: Arc<Store>,
    registry: ConnectionRegistry,
    health: Arc<HealthMetrics>,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: mpsc::Receiver<()>,
}

impl HeartbeatChecker {
    pub fn new(
        cfg: HeartbeatConfig,
        store: Arc<Store>,
        registry: ConnectionRegistry,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            cfg,
            store,
            registry,
            health,
            trigger_tx,
            trigger_rx,
        }
    }

    /// Handle for connect handlers to request an immediate sweep.
    pub fn trigger(&self) -> HeartbeatTrigger {
        HeartbeatTrigger(self.trigger_tx.clone())
    }

    /// Spawns the sweep loop. The first sweep runs immediately.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval = ?self.cfg.check_interval,
            ping_timeout = ?self.cfg.ping_timeout,
            max_retries = self.cfg.max_retries,
            "heartbeat checker started",
        );

        let mut ticker = tokio::time::interval(self.cfg.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("heartbeat checker stopped");
                    return;
                }
                _ = ticker.tick() => self.sweep().await,
                _ = self.trigger_rx.recv() => self.sweep().await,
            }
        }
    }

    /// One pass over all monitored machines. Machines are handled
    /// independently; no failure aborts the sweep.
    pub async fn sweep(&self) {
        let started = Instant::now();

        let machines = match self.store.monitored_machines().await {
            Ok(machines) => machines,
            Err(e) => {
                error!(error = %e, "listing monitored machines failed");
                return;
            }
        };

        self.health.machines_monitored.set(machines.len() as f64);

        for machine in machines {
            let result = match self.registry.get(&machine.id) {
                Some(conn) => {
                    self.health.pings_total.inc();
                    conn.ping(self.cfg.ping_timeout).await
                }
                None => Err(PingError::NoConnection),
            };

            match result {
                Ok(pong) => {
                    let metrics = extract_metrics(&pong);
                    if let Err(e) = self.store.record_heartbeat(&machine.id, &metrics).await {
                        warn!(machine = %machine.id, error = %e, "recording heartbeat failed");
                    }
                }
                Err(PingError::NoConnection) => {
                    debug!(machine = %machine.id, "no active stream");
                    self.record_miss(&machine.id).await;
                }
                Err(e) => {
                    debug!(machine = %machine.id, error = %e, "ping failed");
                    self.health.ping_failures_total.inc();
                    self.record_miss(&machine.id).await;
                }
            }
        }

        self.health
            .sweep_duration
            .observe(started.elapsed().as_secs_f64());
    }

    /// A miss advances the retry counter; at `max_retries` the machine is
    /// marked dead and leaves the sweep set.
    async fn record_miss(&self, machine_id: &str) {
        self.health.heartbeat_misses_total.inc();

        let new_retry = match self.store.increment_retry(machine_id).await {
            Ok(value) => value,
            Err(e) => {
                warn!(machine = %machine_id, error = %e, "incrementing retry failed");
                return;
            }
        };

        if new_retry >= self.cfg.max_retries {
            match self
                .store
                .update_machine_status(machine_id, MachineStatus::Dead)
                .await
            {
                Ok(()) => {
                    self.health.machines_marked_dead_total.inc();
                    warn!(
                        machine = %machine_id,
                        retry = new_retry,
                        max = self.cfg.max_retries,
                        "machine marked dead",
                    );
                }
                Err(e) => {
                    warn!(machine = %machine_id, error = %e, "marking machine dead failed");
                }
            }
        }
    }
}

/// Pulls the canonical metric fields out of a pong, coercing every scalar
/// shape to `f64` and dropping everything else. The scalar variants never
/// propagate past this boundary.
pub fn extract_metrics(pong: &HeartbeatPong) -> MetricSet {
    extract_canonical(&pong.metrics)
}

fn extract_canonical(raw: &HashMap<String, Scalar>) -> MetricSet {
    let mut set = MetricSet::default();

    for (key, value) in raw {
        let Some(value) = value.as_f64() else {
            continue;
        };
        match key.as_str() {
            "cpu_load" => set.cpu_load = Some(value),
            "mem_usage_mb" => set.mem_usage_mb = Some(value),
            "disk_used_gb" => set.disk_used_gb = Some(value),
            "disk_total_gb" => set.disk_total_gb = Some(value),
            _ => {}
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::io::duplex;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::model::Machine;
    use crate::rpc::connection::MachineConnection;
    use crate::rpc::wire::{AgentCodec, AgentFrame, ServerCodec, ServerFrame};

    fn test_checker(max_retries: u32) -> (HeartbeatChecker, Arc<Store>, ConnectionRegistry) {
        let store = Arc::new(Store::memory());
        let registry = ConnectionRegistry::new();
        let health = Arc::new(HealthMetrics::new(":0").expect("health metrics"));
        let cfg = HeartbeatConfig {
            check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_millis(200),
            max_retries,
        };
        let checker = HeartbeatChecker::new(
            cfg,
            Arc::clone(&store),
            registry.clone(),
            health,
        );
        (checker, store, registry)
    }

    async fn seed_machine(store: &Store, status: MachineStatus) -> Machine {
        let mut machine = Machine::new("u1", "box", "");
        machine.status = status;
        store.create_machine(&machine).await.expect("create");
        machine
    }

    #[test]
    fn test_extract_coerces_all_scalar_shapes() {
        let mut pong = HeartbeatPong::default();
        pong.metrics.insert("cpu_load".into(), Scalar::Float(0.5));
        pong.metrics.insert("mem_usage_mb".into(), Scalar::Int(200));
        pong.metrics
            .insert("disk_used_gb".into(), Scalar::Text("10.5".into()));
        pong.metrics
            .insert("disk_total_gb".into(), Scalar::Text("oops".into()));
        pong.metrics.insert("uptime_hours".into(), Scalar::Int(99));

        let set = extract_metrics(&pong);
        assert_eq!(set.cpu_load, Some(0.5));
        assert_eq!(set.mem_usage_mb, Some(200.0));
        assert_eq!(set.disk_used_gb, Some(10.5));
        assert_eq!(set.disk_total_gb, None);
    }

    #[test]
    fn test_extract_drops_non_canonical_keys_entirely() {
        let mut pong = HeartbeatPong::default();
        pong.metrics.insert("load_15m".into(), Scalar::Float(1.0));
        pong.metrics.insert("gpu_temp".into(), Scalar::Int(70));

        assert!(extract_metrics(&pong).is_empty());
    }

    #[tokio::test]
    async fn test_trigger_coalesces() {
        let (checker, _store, _registry) = test_checker(3);
        let trigger = checker.trigger();

        trigger.fire();
        trigger.fire();
        trigger.fire();

        let mut rx = checker.trigger_rx;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_without_stream_advances_retry_to_dead() {
        let (checker, store, _registry) = test_checker(3);
        let machine = seed_machine(&store, MachineStatus::Registered).await;

        for expected_retry in 1..=2u32 {
            checker.sweep().await;
            let stored = store.machine(&machine.id).await.expect("machine");
            assert_eq!(stored.retry_count, expected_retry);
            assert_eq!(stored.status, MachineStatus::Registered);
        }

        checker.sweep().await;
        let stored = store.machine(&machine.id).await.expect("machine");
        assert_eq!(stored.status, MachineStatus::Dead);
        assert_eq!(stored.retry_count, 3);

        // Dead machines leave the sweep set; the counter stays put.
        checker.sweep().await;
        let stored = store.machine(&machine.id).await.expect("machine");
        assert_eq!(stored.retry_count, 3);
    }

    #[tokio::test]
    async fn test_sweep_with_pong_marks_alive_and_resets_retry() {
        let (checker, store, registry) = test_checker(3);
        let mut machine = seed_machine(&store, MachineStatus::Registered).await;
        machine.retry_count = 2;
        store.create_machine(&machine).await.expect("update seed");

        let (server_io, agent_io) = duplex(4096);
        let (conn, ping_rx) =
            MachineConnection::new(machine.id.clone(), CancellationToken::new());
        registry.register(Arc::clone(&conn));

        let dispatcher_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            let mut framed = Framed::new(server_io, ServerCodec::new());
            crate::rpc::connection::serve_pings(&mut framed, ping_rx, dispatcher_conn.token())
                .await;
        });

        let agent_id = machine.id.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(agent_io, AgentCodec::new());
            while let Some(Ok(ServerFrame::HeartbeatPing(_))) = framed.next().await {
                let mut pong = HeartbeatPong::default();
                pong.metrics.insert("cpu_load".into(), Scalar::Float(0.25));
                pong.metrics.insert("mem_usage_mb".into(), Scalar::Int(512));
                if framed.send(AgentFrame::pong(&agent_id, pong)).await.is_err() {
                    return;
                }
            }
        });

        checker.sweep().await;

        let stored = store.machine(&machine.id).await.expect("machine");
        assert_eq!(stored.status, MachineStatus::Alive);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.last_seen.is_some());
        assert_eq!(stored.metrics.cpu_load, Some(0.25));
        assert_eq!(stored.metrics.mem_usage_mb, Some(512.0));

        conn.close();
    }

    #[tokio::test]
    async fn test_boundary_one_miss_from_max_goes_dead() {
        let (checker, store, _registry) = test_checker(3);
        let mut machine = seed_machine(&store, MachineStatus::Alive).await;
        machine.retry_count = 2;
        store.create_machine(&machine).await.expect("update seed");

        checker.sweep().await;

        let stored = store.machine(&machine.id).await.expect("machine");
        assert_eq!(stored.status, MachineStatus::Dead);
    }
}
