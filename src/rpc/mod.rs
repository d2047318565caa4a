//! Agent-facing stream listener and connect protocol.
//!
//! Each accepted stream must identify its machine in the first frame. Known,
//! non-dead machines get a dispatcher registered for them; the heartbeat
//! checker is then triggered so a fresh connection is probed immediately.

pub mod connection;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RpcConfig;
use crate::health::HealthMetrics;
use crate::heartbeat::HeartbeatTrigger;
use crate::model::MachineStatus;
use crate::store::{Store, StoreError};

use self::connection::{serve_pings, ConnectionRegistry, MachineConnection};
use self::wire::ServerCodec;

/// Everything one stream handler needs.
#[derive(Clone)]
pub struct StreamContext {
    pub store: Arc<Store>,
    pub registry: ConnectionRegistry,
    pub trigger: HeartbeatTrigger,
    pub health: Arc<HealthMetrics>,
    pub handshake_timeout: Duration,
}

pub struct RpcServer {
    cfg: RpcConfig,
    ctx: StreamContext,
}

impl RpcServer {
    pub fn new(cfg: RpcConfig, ctx: StreamContext) -> Self {
        Self { cfg, ctx }
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address (useful when the configured port is 0) and the loop handle.
    pub async fn start(self, cancel: CancellationToken) -> Result<(SocketAddr, JoinHandle<()>)> {
        let bind_addr = format!("{}:{}", self.cfg.host, self.cfg.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        info!(addr = %local_addr, "stream listener started");

        let ctx = self.ctx;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("stream listener stopped");
                        return;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                error!(error = %e, "accept failed");
                                continue;
                            }
                        };

                        let ctx = ctx.clone();
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            handle_stream(stream, peer.to_string(), ctx, conn_cancel).await;
                        });
                    }
                }
            }
        });

        Ok((local_addr, handle))
    }
}

/// Serves one agent stream: handshake, register, dispatch pings until the
/// stream dies, unregister.
pub async fn handle_stream<S>(stream: S, peer: String, ctx: StreamContext, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, ServerCodec::new());

    // The first frame must identify the machine; a silent or garbled peer is
    // dropped after the handshake timeout.
    let hello = match tokio::time::timeout(ctx.handshake_timeout, framed.next()).await {
        Err(_) => {
            warn!(%peer, "handshake timed out");
            ctx.health
                .connect_rejects_total
                .with_label_values(&["handshake_timeout"])
                .inc();
            return;
        }
        Ok(None) => {
            debug!(%peer, "stream closed before handshake");
            return;
        }
        Ok(Some(Err(e))) => {
            warn!(%peer, error = %e, "handshake frame invalid");
            ctx.health
                .connect_rejects_total
                .with_label_values(&["bad_frame"])
                .inc();
            return;
        }
        Ok(Some(Ok(frame))) => frame,
    };

    if hello.machine_id.is_empty() {
        warn!(%peer, "first frame carried no machine id");
        ctx.health
            .connect_rejects_total
            .with_label_values(&["no_machine_id"])
            .inc();
        return;
    }

    let machine = match ctx.store.machine(&hello.machine_id).await {
        Ok(machine) => machine,
        Err(StoreError::NotFound) => {
            warn!(%peer, machine = %hello.machine_id, "unknown machine refused");
            ctx.health
                .connect_rejects_total
                .with_label_values(&["unknown"])
                .inc();
            return;
        }
        Err(e) => {
            error!(%peer, machine = %hello.machine_id, error = %e, "machine lookup failed");
            return;
        }
    };

    if machine.status == MachineStatus::Dead {
        warn!(%peer, machine = %machine.id, "dead machine refused; re-enable it first");
        ctx.health
            .connect_rejects_total
            .with_label_values(&["dead"])
            .inc();
        return;
    }

    if machine.status == MachineStatus::Pending {
        if let Err(e) = ctx
            .store
            .update_machine_status(&machine.id, MachineStatus::Registered)
            .await
        {
            error!(machine = %machine.id, error = %e, "registering machine failed");
            return;
        }
    }

    let (conn, ping_rx) = MachineConnection::new(machine.id.clone(), cancel);
    if ctx.registry.register(Arc::clone(&conn)).is_some() {
        info!(machine = %machine.id, "replaced existing stream");
    }

    ctx.health.connects_total.inc();
    ctx.health.connections_active.inc();
    info!(machine = %machine.id, %peer, "stream registered");

    // Probe the fresh connection right away instead of waiting out the
    // check interval.
    ctx.trigger.fire();

    serve_pings(&mut framed, ping_rx, conn.token()).await;

    ctx.registry.unregister_if(&conn);
    ctx.health.connections_active.dec();
    info!(machine = %machine.id, %peer, "stream closed");
}

#[cfg(test)]
mod tests {
    use futures::SinkExt;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::model::Machine;
    use crate::rpc::wire::{AgentCodec, AgentFrame, ServerFrame};

    fn test_ctx() -> (StreamContext, Arc<Store>, mpsc::Receiver<()>) {
        let store = Arc::new(Store::memory());
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let ctx = StreamContext {
            store: Arc::clone(&store),
            registry: ConnectionRegistry::new(),
            trigger: HeartbeatTrigger::from_sender(trigger_tx),
            health: Arc::new(HealthMetrics::new(":0").expect("health metrics")),
            handshake_timeout: Duration::from_millis(500),
        };
        (ctx, store, trigger_rx)
    }

    async fn seed_machine(store: &Store, status: MachineStatus) -> Machine {
        let mut machine = Machine::new("u1", "box", "");
        machine.status = status;
        store.create_machine(&machine).await.expect("create");
        machine
    }

    #[tokio::test]
    async fn test_unknown_machine_is_refused() {
        let (ctx, _store, _trigger_rx) = test_ctx();
        let (server_io, agent_io) = duplex(4096);
        let registry = ctx.registry.clone();

        let handler = tokio::spawn(handle_stream(
            server_io,
            "test-peer".to_string(),
            ctx,
            CancellationToken::new(),
        ));

        let mut agent = Framed::new(agent_io, AgentCodec::new());
        agent
            .send(AgentFrame::hello("nope"))
            .await
            .expect("send hello");

        // Server closes the stream without registering anything.
        assert!(agent.next().await.is_none());
        handler.await.expect("handler exits");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dead_machine_is_refused() {
        let (ctx, store, _trigger_rx) = test_ctx();
        let machine = seed_machine(&store, MachineStatus::Dead).await;
        let (server_io, agent_io) = duplex(4096);
        let registry = ctx.registry.clone();

        let handler = tokio::spawn(handle_stream(
            server_io,
            "test-peer".to_string(),
            ctx,
            CancellationToken::new(),
        ));

        let mut agent = Framed::new(agent_io, AgentCodec::new());
        agent
            .send(AgentFrame::hello(&machine.id))
            .await
            .expect("send hello");

        assert!(agent.next().await.is_none());
        handler.await.expect("handler exits");
        assert!(registry.is_empty());

        let stored = store.machine(&machine.id).await.expect("machine");
        assert_eq!(stored.status, MachineStatus::Dead);
    }

    #[tokio::test]
    async fn test_pending_machine_registers_and_fires_trigger() {
        let (ctx, store, mut trigger_rx) = test_ctx();
        let machine = seed_machine(&store, MachineStatus::Pending).await;
        let (server_io, agent_io) = duplex(4096);
        let registry = ctx.registry.clone();

        let handler = tokio::spawn(handle_stream(
            server_io,
            "test-peer".to_string(),
            ctx,
            CancellationToken::new(),
        ));

        let mut agent = Framed::new(agent_io, AgentCodec::new());
        agent
            .send(AgentFrame::hello(&machine.id))
            .await
            .expect("send hello");

        trigger_rx.recv().await.expect("trigger fired");

        assert_eq!(registry.len(), 1);
        let stored = store.machine(&machine.id).await.expect("machine");
        assert_eq!(stored.status, MachineStatus::Registered);

        // Answer one ping through the registered dispatcher.
        let conn = registry.get(&machine.id).expect("connection");
        let agent_task = tokio::spawn(async move {
            if let Some(Ok(ServerFrame::HeartbeatPing(_))) = agent.next().await {
                let _ = agent
                    .send(AgentFrame::pong(
                        "ignored",
                        crate::rpc::wire::HeartbeatPong::default(),
                    ))
                    .await;
            }
            agent
        });

        conn.ping(Duration::from_secs(1)).await.expect("ping");

        let agent = agent_task.await.expect("agent side");
        drop(agent);

        handler.await.expect("handler exits");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_second_connect_replaces_first() {
        let (ctx, store, mut trigger_rx) = test_ctx();
        let machine = seed_machine(&store, MachineStatus::Registered).await;
        let registry = ctx.registry.clone();

        let (server_io_a, agent_io_a) = duplex(4096);
        let handler_a = tokio::spawn(handle_stream(
            server_io_a,
            "peer-a".to_string(),
            ctx.clone(),
            CancellationToken::new(),
        ));

        let mut agent_a = Framed::new(agent_io_a, AgentCodec::new());
        agent_a
            .send(AgentFrame::hello(&machine.id))
            .await
            .expect("hello a");
        trigger_rx.recv().await.expect("trigger a");
        let first = registry.get(&machine.id).expect("first registered");

        let (server_io_b, agent_io_b) = duplex(4096);
        let handler_b = tokio::spawn(handle_stream(
            server_io_b,
            "peer-b".to_string(),
            ctx,
            CancellationToken::new(),
        ));

        let mut agent_b = Framed::new(agent_io_b, AgentCodec::new());
        agent_b
            .send(AgentFrame::hello(&machine.id))
            .await
            .expect("hello b");
        trigger_rx.recv().await.expect("trigger b");

        // The first handler exits (its dispatcher was cancelled) without
        // removing the replacement.
        handler_a.await.expect("first handler exits");
        assert_eq!(registry.len(), 1);

        let current = registry.get(&machine.id).expect("second registered");
        assert!(!Arc::ptr_eq(&current, &first));

        drop(agent_b);
        handler_b.await.expect("second handler exits");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_timeout_drops_silent_peer() {
        let (ctx, _store, _trigger_rx) = test_ctx();
        let (server_io, agent_io) = duplex(4096);

        let handler = tokio::spawn(handle_stream(
            server_io,
            "test-peer".to_string(),
            ctx,
            CancellationToken::new(),
        ));

        // Say nothing; the server must give up on its own.
        let mut agent = Framed::new(agent_io, AgentCodec::new());
        assert!(agent.next().await.is_none());
        handler.await.expect("handler exits");
    }
}
