//! Agent wire protocol: length-delimited JSON frames over one stream.
//!
//! The framing (u32 length prefix via [`LengthDelimitedCodec`]) is transport
//! detail; the frame contents are the contract. Agents identify themselves in
//! their first frame and answer heartbeat pings afterwards.

use std::collections::HashMap;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Maximum accepted frame size. An agent frame is a handful of metric
/// scalars; anything near this limit is garbage or abuse.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Errors surfaced by the frame codec.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A metric value as agents send it: integer, float, or string.
///
/// Everything is coerced to `f64` at the server boundary; the variant never
/// propagates past extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Numeric coercion. Non-numeric strings yield `None` and the key is
    /// treated as absent.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Agent reply to a heartbeat ping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPong {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub metrics: HashMap<String, Scalar>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Server-issued heartbeat probe carrying the server's send time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPing {
    pub timestamp: i64,
}

/// Any frame an agent sends. The first frame on a stream carries only the
/// machine id; later frames carry pongs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentFrame {
    #[serde(default)]
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_pong: Option<HeartbeatPong>,
}

impl AgentFrame {
    pub fn hello(machine_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            heartbeat_pong: None,
        }
    }

    pub fn pong(machine_id: &str, pong: HeartbeatPong) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            heartbeat_pong: Some(pong),
        }
    }
}

/// Any frame the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    #[serde(rename = "heartbeat_ping")]
    HeartbeatPing(HeartbeatPing),
}

/// Length-delimited JSON codec, typed per direction.
///
/// `Tx` is what this side encodes, `Rx` what it decodes. The server speaks
/// [`ServerCodec`]; an agent (or a test standing in for one) speaks
/// [`AgentCodec`].
pub struct JsonCodec<Tx, Rx> {
    inner: LengthDelimitedCodec,
    _frames: PhantomData<fn() -> (Tx, Rx)>,
}

pub type ServerCodec = JsonCodec<ServerFrame, AgentFrame>;
pub type AgentCodec = JsonCodec<AgentFrame, ServerFrame>;

impl<Tx, Rx> JsonCodec<Tx, Rx> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _frames: PhantomData,
        }
    }
}

impl<Tx, Rx> Default for JsonCodec<Tx, Rx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Tx, Rx: DeserializeOwned> Decoder for JsonCodec<Tx, Rx> {
    type Item = Rx;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Rx>, WireError> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<Tx: Serialize, Rx> Encoder<Tx> for JsonCodec<Tx, Rx> {
    type Error = WireError;

    fn encode(&mut self, item: Tx, dst: &mut BytesMut) -> Result<(), WireError> {
        let payload = serde_json::to_vec(&item)?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}
