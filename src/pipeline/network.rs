//! Network seam of the pipe system.
//!
//! The manager only talks to the network through [`NetworkChannel`] and
//! resolves remote owners through [`OwnerRegistry`]. Messages are flat
//! little-endian byte buffers ([`NetMessage`]).
//!
//! Transform update layout:
//!
//! ```text
//! [owner u32][pipe_id u64][position 3×f32][orientation 4×f32]
//! [has_non_identity_scale u8][scale 3×f32][scale_orientation 4×f32]
//! ```
//!
//! The two scale entries are only present when the flag is set.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{OwnerId, PipeId};
use crate::transform::Transformation;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Channel carrying transform updates.
pub const TRANSFORM_CHANNEL: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    #[default]
    Udp,
}

// ── Message buffer ──────────────────────────────────────────────────────────

/// Append-only write buffer with a read cursor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetMessage {
    buf: Vec<u8>,
    cursor: usize,
}

impl NetMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: bytes.into(),
            cursor: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_f32s(&mut self, values: &[f32]) {
        for &v in values {
            self.put_f32(v);
        }
    }

    fn take<const N: usize>(&mut self) -> PipelineResult<[u8; N]> {
        let end = self.cursor + N;
        let bytes = self.buf.get(self.cursor..end).ok_or_else(|| {
            PipelineError::Decode(format!(
                "need {} bytes at offset {}, message has {}",
                N,
                self.cursor,
                self.buf.len()
            ))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.cursor = end;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> PipelineResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn get_bool(&mut self) -> PipelineResult<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(PipelineError::Decode(format!("invalid bool byte {}", other))),
        }
    }

    pub fn get_u32(&mut self) -> PipelineResult<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn get_u64(&mut self) -> PipelineResult<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    pub fn get_f32(&mut self) -> PipelineResult<f32> {
        Ok(f32::from_le_bytes(self.take()?))
    }

    pub fn get_f32s<const N: usize>(&mut self) -> PipelineResult<[f32; N]> {
        let mut out = [0.0f32; N];
        for v in &mut out {
            *v = self.get_f32()?;
        }
        Ok(out)
    }
}

// ── Transform updates ───────────────────────────────────────────────────────

/// One transform value addressed to a remote pipe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformUpdate {
    pub owner: u32,
    pub pipe_id: PipeId,
    pub value: Transformation,
}

impl TransformUpdate {
    pub fn encode(&self, msg: &mut NetMessage) {
        msg.put_u32(self.owner);
        msg.put_u64(self.pipe_id.0);
        msg.put_f32s(&self.value.position);
        msg.put_f32s(&self.value.orientation);
        let scaled = !self.value.has_identity_scale();
        msg.put_bool(scaled);
        if scaled {
            msg.put_f32s(&self.value.scale);
            msg.put_f32s(&self.value.scale_orientation);
        }
    }

    pub fn to_message(&self) -> NetMessage {
        let mut msg = NetMessage::new();
        self.encode(&mut msg);
        msg
    }

    pub fn decode(msg: &mut NetMessage) -> PipelineResult<Self> {
        let owner = msg.get_u32()?;
        let pipe_id = PipeId(msg.get_u64()?);
        let mut value = Transformation::new(msg.get_f32s()?, msg.get_f32s()?);
        if msg.get_bool()? {
            value.scale = msg.get_f32s()?;
            value.scale_orientation = msg.get_f32s()?;
        }
        Ok(Self {
            owner,
            pipe_id,
            value,
        })
    }
}

// ── Collaborator interfaces ─────────────────────────────────────────────────

/// Message transport used by the manager and the distribution stage.
pub trait NetworkChannel {
    /// All messages received on `channel` since the last call.
    fn pop_all(&mut self, channel: u32) -> Vec<NetMessage>;
    fn send(&mut self, message: NetMessage, channel: u32, transport: Transport);
}

/// Maps raw owner ids from the wire to known sessions.
pub trait OwnerRegistry {
    fn local_owner(&self) -> OwnerId;
    fn resolve(&self, raw: u32) -> Option<OwnerId>;
}

/// Fixed set of known owners.
#[derive(Debug, Clone)]
pub struct StaticOwnerRegistry {
    local: OwnerId,
    known: HashSet<OwnerId>,
}

impl StaticOwnerRegistry {
    pub fn new(local: OwnerId) -> Self {
        let mut known = HashSet::new();
        known.insert(local);
        Self { local, known }
    }

    pub fn with_remote(mut self, owner: OwnerId) -> Self {
        self.add_remote(owner);
        self
    }

    pub fn add_remote(&mut self, owner: OwnerId) {
        self.known.insert(owner);
    }

    pub fn remove(&mut self, owner: OwnerId) -> bool {
        owner != self.local && self.known.remove(&owner)
    }
}

impl OwnerRegistry for StaticOwnerRegistry {
    fn local_owner(&self) -> OwnerId {
        self.local
    }

    fn resolve(&self, raw: u32) -> Option<OwnerId> {
        let owner = OwnerId(raw);
        self.known.contains(&owner).then_some(owner)
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    channel: u32,
    message: NetMessage,
}

/// In-process network over crossbeam channels.
pub struct LoopbackNetwork {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    pending: Vec<Envelope>,
    sent: HashMap<Transport, usize>,
}

impl LoopbackNetwork {
    /// A network that receives its own messages.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self::from_parts(tx, rx)
    }

    /// Two endpoints, each receiving what the other sends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = crossbeam_channel::unbounded();
        let (b_tx, b_rx) = crossbeam_channel::unbounded();
        (Self::from_parts(b_tx, a_rx), Self::from_parts(a_tx, b_rx))
    }

    fn from_parts(tx: Sender<Envelope>, rx: Receiver<Envelope>) -> Self {
        Self {
            tx,
            rx,
            pending: Vec::new(),
            sent: HashMap::new(),
        }
    }

    /// Messages handed to the peer over `transport`.
    pub fn sent_count(&self, transport: Transport) -> usize {
        self.sent.get(&transport).copied().unwrap_or(0)
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkChannel for LoopbackNetwork {
    fn pop_all(&mut self, channel: u32) -> Vec<NetMessage> {
        self.pending.extend(self.rx.try_iter());
        let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|e| e.channel == channel);
        self.pending = rest;
        matched.into_iter().map(|e| e.message).collect()
    }

    fn send(&mut self, message: NetMessage, channel: u32, transport: Transport) {
        tracing::trace!(channel, ?transport, bytes = message.len(), "loopback send");
        if self
            .tx
            .send(Envelope { channel, message })
            .is_err()
        {
            tracing::warn!("Loopback peer disconnected, message dropped");
            return;
        }
        *self.sent.entry(transport).or_insert(0) += 1;
    }
}
