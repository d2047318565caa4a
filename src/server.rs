//! Server orchestration: wires the store, stream registry, heartbeat
//! checker, snapshot recorder, and the HTTP surfaces together, and owns
//! their shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::health::HealthMetrics;
use crate::heartbeat::HeartbeatChecker;
use crate::http::{self, AppState};
use crate::rpc::connection::ConnectionRegistry;
use crate::rpc::{RpcServer, StreamContext};
use crate::snapshot::SnapshotRecorder;
use crate::store::Store;

pub struct Server {
    cfg: Config,
    store: Arc<Store>,
    registry: ConnectionRegistry,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Server {
    /// Connects the store and prepares all shared state. An unreachable
    /// store is fatal: there is nothing useful to serve without it.
    pub async fn new(cfg: Config) -> Result<Self> {
        let store = Store::connect(&cfg.mongodb)
            .await
            .context("connecting to document store")?;

        Self::with_store(cfg, store)
    }

    /// Builds a server over an already-constructed store backend.
    pub fn with_store(cfg: Config, store: Store) -> Result<Self> {
        let health = Arc::new(
            HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
        );

        Ok(Self {
            cfg,
            store: Arc::new(store),
            registry: ConnectionRegistry::new(),
            health,
            cancel: CancellationToken::new(),
            tasks: Vec::with_capacity(4),
        })
    }

    /// Start all components and begin serving.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health listener first so probes answer during index builds.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Indexes: snapshot TTL eviction and the query paths.
        self.store
            .ensure_indexes(self.cfg.snapshot.ttl)
            .await
            .context("ensuring store indexes")?;
        info!(backend = self.store.backend(), "store ready");

        // 3. Heartbeat checker; its trigger handle goes to the stream layer.
        let checker = HeartbeatChecker::new(
            self.cfg.heartbeat,
            Arc::clone(&self.store),
            self.registry.clone(),
            Arc::clone(&self.health),
        );
        let trigger = checker.trigger();
        self.tasks
            .push(("heartbeat", checker.start(self.cancel.child_token())));

        // 4. Snapshot recorder.
        let recorder = SnapshotRecorder::new(
            self.cfg.snapshot,
            Arc::clone(&self.store),
            Arc::clone(&self.health),
        );
        self.tasks
            .push(("snapshot", recorder.start(self.cancel.child_token())));

        // 5. Agent stream listener.
        let rpc = RpcServer::new(
            self.cfg.rpc.clone(),
            StreamContext {
                store: Arc::clone(&self.store),
                registry: self.registry.clone(),
                trigger,
                health: Arc::clone(&self.health),
                handshake_timeout: self.cfg.rpc.handshake_timeout,
            },
        );
        let (_, rpc_task) = rpc
            .start(self.cancel.child_token())
            .await
            .context("starting stream listener")?;
        self.tasks.push(("rpc", rpc_task));

        // 6. Owner-facing API.
        let app_state = Arc::new(AppState {
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            health: Arc::clone(&self.health),
            snapshot_interval: self.cfg.snapshot.interval,
            rpc_advertise: self.cfg.rpc.advertised_addr(),
        });
        let router = http::build_router(app_state);
        let (_, http_task) = http::serve(
            &self.cfg.server.host,
            self.cfg.server.port,
            router,
            self.cancel.child_token(),
        )
        .await
        .context("starting api server")?;
        self.tasks.push(("http", http_task));

        info!("server fully started");

        Ok(())
    }

    /// Gracefully stop all components: tickers stop, dispatchers return and
    /// close their streams, listeners drain.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        for (name, task) in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "task join failed");
            }
        }

        self.health.stop().await?;

        info!("server stopped");

        Ok(())
    }
}
