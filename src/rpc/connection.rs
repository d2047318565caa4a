//! Per-stream dispatcher and the registry of live agent streams.
//!
//! All I/O for one stream happens inside [`serve_pings`], run by the task
//! that accepted the stream. Other subsystems reach the stream only through
//! [`MachineConnection::ping`], a request/response hop over a single-slot
//! channel, so sends and receives never interleave on the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::wire::{HeartbeatPing, HeartbeatPong, ServerCodec, ServerFrame};

/// Errors surfaced to ping callers.
#[derive(Debug, Error)]
pub enum PingError {
    #[error("no active stream for machine")]
    NoConnection,

    #[error("heartbeat ping timed out")]
    Timeout,

    #[error("stream closed")]
    StreamClosed,
}

/// One in-flight ping: the dispatcher answers on `reply`.
pub(crate) struct PingRequest {
    pub(crate) reply: oneshot::Sender<Result<HeartbeatPong, PingError>>,
}

/// Handle to one live agent stream.
///
/// The dispatcher task owns the transport; this handle only submits ping
/// requests and can cancel the dispatcher. The registry's reference is
/// non-owning: dropping the handle never tears down the stream by itself.
pub struct MachineConnection {
    machine_id: String,
    ping_tx: mpsc::Sender<PingRequest>,
    cancel: CancellationToken,
}

impl MachineConnection {
    /// Creates a handle and the request receiver for its dispatcher.
    pub(crate) fn new(
        machine_id: String,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<PingRequest>) {
        let (ping_tx, ping_rx) = mpsc::channel(1);
        (
            Arc::new(Self {
                machine_id,
                ping_tx,
                cancel,
            }),
            ping_rx,
        )
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Signals the dispatcher to stop, which closes the stream.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sends a heartbeat ping over the stream and waits for the pong.
    ///
    /// Enqueue and reply are bounded by `timeout` independently: a dispatcher
    /// busy with a prior ping counts the wait for the slot against the first
    /// window, the wait for the agent against the second. A pong arriving
    /// after the caller gave up lands in a dropped channel and is discarded.
    pub async fn ping(&self, timeout: Duration) -> Result<HeartbeatPong, PingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = PingRequest { reply: reply_tx };

        match tokio::time::timeout(timeout, self.ping_tx.send(request)).await {
            Err(_) => return Err(PingError::Timeout),
            Ok(Err(_)) => return Err(PingError::StreamClosed),
            Ok(Ok(())) => {}
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(PingError::Timeout),
            Ok(Err(_)) => Err(PingError::StreamClosed),
            Ok(Ok(result)) => result,
        }
    }
}

/// Dispatcher loop: the only code that touches the stream.
///
/// Processes ping requests strictly one at a time; returns on cancellation or
/// any transport error, at which point the caller unregisters the machine.
/// While idle it keeps one receive pending so a closed stream is noticed
/// without waiting for the next ping.
pub(crate) async fn serve_pings<S>(
    framed: &mut Framed<S, ServerCodec>,
    mut ping_rx: mpsc::Receiver<PingRequest>,
    cancel: &CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            inbound = framed.next() => {
                match inbound {
                    // Agents only speak when pinged; idle chatter is dropped.
                    Some(Ok(_)) => debug!("unsolicited frame discarded"),
                    Some(Err(e)) => {
                        debug!(error = %e, "stream receive failed");
                        return;
                    }
                    None => return,
                }
            }
            request = ping_rx.recv() => {
                let Some(request) = request else { return };

                let ping = ServerFrame::HeartbeatPing(HeartbeatPing {
                    timestamp: Utc::now().timestamp(),
                });

                if let Err(e) = framed.send(ping).await {
                    debug!(error = %e, "ping send failed");
                    let _ = request.reply.send(Err(PingError::StreamClosed));
                    return;
                }

                let received = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = request.reply.send(Err(PingError::StreamClosed));
                        return;
                    }
                    received = framed.next() => received,
                };

                match received {
                    Some(Ok(frame)) => {
                        // A frame without a pong is tolerated as an empty
                        // pong: liveness observed, no metrics.
                        let pong = frame.heartbeat_pong.unwrap_or_default();
                        let _ = request.reply.send(Ok(pong));
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "pong receive failed");
                        let _ = request.reply.send(Err(PingError::StreamClosed));
                        return;
                    }
                    None => {
                        let _ = request.reply.send(Err(PingError::StreamClosed));
                        return;
                    }
                }
            }
        }
    }
}

/// Live streams keyed by machine id, behind one reader/writer lock.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<MachineConnection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a handle, replacing (and closing) any prior one for the same
    /// machine. Returns the replaced handle.
    pub fn register(&self, conn: Arc<MachineConnection>) -> Option<Arc<MachineConnection>> {
        let replaced = self
            .inner
            .write()
            .insert(conn.machine_id().to_string(), conn);

        if let Some(old) = &replaced {
            old.close();
        }

        replaced
    }

    /// Removes the mapping only if it still points at `conn`, so a replaced
    /// dispatcher never unregisters its successor.
    pub fn unregister_if(&self, conn: &Arc<MachineConnection>) -> bool {
        let mut map = self.inner.write();
        match map.get(conn.machine_id()) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                map.remove(conn.machine_id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, machine_id: &str) -> Option<Arc<MachineConnection>> {
        self.inner.read().get(machine_id).cloned()
    }

    /// Snapshot of all connected machine ids.
    pub fn connected_ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
