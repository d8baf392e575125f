//! Events executed by the manager between scheduling passes.
//!
//! Other threads (input drivers, network receivers, session handling) never
//! touch the manager directly. They send boxed [`ManagerEvent`]s through an
//! [`EventSender`]; the scheduler thread drains the bus at the start of each
//! `step` and executes them with exclusive access to the registry.
//!
//! Open/close events have a wire form so peers can mirror each other's pipes:
//!
//! ```text
//! open:  [count u32] { [src dst type class objtype objid u32×6][priority u32][owner u32][synchronized u8] }*
//! close: [count u32] { [src dst type class objtype objid u32×6][owner u32] }*
//! ```

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{OwnerId, PipeIdFields};
use crate::pipeline::manager::TransformManager;
use crate::pipeline::network::NetMessage;
use crate::pipeline::pipe::PipeOptions;
use crossbeam_channel::{Receiver, Sender};
use std::fmt;

/// Work item run on the scheduler thread.
pub trait ManagerEvent: Send + fmt::Debug {
    fn name(&self) -> &str;
    fn execute(self: Box<Self>, manager: &mut TransformManager);
}

/// Source of pending events.
pub trait EventBus {
    fn drain_pending(&mut self) -> Vec<Box<dyn ManagerEvent>>;
}

// ── Channel bus ─────────────────────────────────────────────────────────────

/// Cloneable handle for posting events from any thread.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<Box<dyn ManagerEvent>>,
}

impl EventSender {
    pub fn send(&self, event: impl ManagerEvent + 'static) -> PipelineResult<()> {
        self.send_boxed(Box::new(event))
    }

    pub fn send_boxed(&self, event: Box<dyn ManagerEvent>) -> PipelineResult<()> {
        self.tx.send(event).map_err(|_| PipelineError::ChannelClosed)
    }
}

/// Event bus backed by a crossbeam channel.
pub struct ChannelEventBus {
    rx: Receiver<Box<dyn ManagerEvent>>,
}

impl ChannelEventBus {
    pub fn new() -> (EventSender, Self) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (EventSender { tx }, Self { rx })
    }
}

impl EventBus for ChannelEventBus {
    fn drain_pending(&mut self) -> Vec<Box<dyn ManagerEvent>> {
        self.rx.try_iter().collect()
    }
}

// ── Open / close pipe events ────────────────────────────────────────────────

fn put_fields(msg: &mut NetMessage, fields: &PipeIdFields) {
    msg.put_u32(fields.src_id);
    msg.put_u32(fields.dst_id);
    msg.put_u32(fields.pipe_type);
    msg.put_u32(fields.object_class);
    msg.put_u32(fields.object_type);
    msg.put_u32(fields.object_id);
}

fn get_fields(msg: &mut NetMessage) -> PipelineResult<PipeIdFields> {
    PipeIdFields::new(
        msg.get_u32()?,
        msg.get_u32()?,
        msg.get_u32()?,
        msg.get_u32()?,
        msg.get_u32()?,
        msg.get_u32()?,
        false,
    )
}

fn get_count(msg: &mut NetMessage, entry_size: usize) -> PipelineResult<usize> {
    let count = msg.get_u32()? as usize;
    if count.saturating_mul(entry_size) > msg.remaining() {
        return Err(PipelineError::Decode(format!(
            "{} entries announced, {} bytes left",
            count,
            msg.remaining()
        )));
    }
    Ok(count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenPipeEntry {
    /// `from_network` is ignored; the receiver derives it from `owner`.
    pub fields: PipeIdFields,
    pub priority: u32,
    pub owner: u32,
    pub synchronized: bool,
}

/// Ask a manager to open pipes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpenPipeEvent {
    pub entries: Vec<OpenPipeEntry>,
}

impl OpenPipeEvent {
    const ENTRY_SIZE: usize = 6 * 4 + 4 + 4 + 1;

    pub fn single(fields: PipeIdFields, priority: u32, owner: OwnerId, synchronized: bool) -> Self {
        Self {
            entries: vec![OpenPipeEntry {
                fields,
                priority,
                owner: owner.0,
                synchronized,
            }],
        }
    }

    pub fn encode(&self, msg: &mut NetMessage) {
        msg.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            put_fields(msg, &entry.fields);
            msg.put_u32(entry.priority);
            msg.put_u32(entry.owner);
            msg.put_bool(entry.synchronized);
        }
    }

    pub fn decode(msg: &mut NetMessage) -> PipelineResult<Self> {
        let count = get_count(msg, Self::ENTRY_SIZE)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(OpenPipeEntry {
                fields: get_fields(msg)?,
                priority: msg.get_u32()?,
                owner: msg.get_u32()?,
                synchronized: msg.get_bool()?,
            });
        }
        Ok(Self { entries })
    }

    pub fn to_message(&self) -> NetMessage {
        let mut msg = NetMessage::new();
        self.encode(&mut msg);
        msg
    }
}

impl ManagerEvent for OpenPipeEvent {
    fn name(&self) -> &str {
        "open_pipe"
    }

    fn execute(self: Box<Self>, manager: &mut TransformManager) {
        for entry in &self.entries {
            let Some(owner) = manager.owners().resolve(entry.owner) else {
                tracing::info!("Open pipe event for unknown owner {} ignored", entry.owner);
                continue;
            };
            let options = PipeOptions {
                priority: entry.priority,
                from_network: owner != manager.local_owner(),
                owner,
                synchronized: entry.synchronized,
            };
            if let Err(e) = manager.open_pipe(&entry.fields, options) {
                tracing::warn!("Open pipe event failed: {}", e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePipeEntry {
    pub fields: PipeIdFields,
    pub owner: u32,
}

/// Ask a manager to close pipes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosePipeEvent {
    pub entries: Vec<ClosePipeEntry>,
}

impl ClosePipeEvent {
    const ENTRY_SIZE: usize = 6 * 4 + 4;

    pub fn single(fields: PipeIdFields, owner: OwnerId) -> Self {
        Self {
            entries: vec![ClosePipeEntry {
                fields,
                owner: owner.0,
            }],
        }
    }

    pub fn encode(&self, msg: &mut NetMessage) {
        msg.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            put_fields(msg, &entry.fields);
            msg.put_u32(entry.owner);
        }
    }

    pub fn decode(msg: &mut NetMessage) -> PipelineResult<Self> {
        let count = get_count(msg, Self::ENTRY_SIZE)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(ClosePipeEntry {
                fields: get_fields(msg)?,
                owner: msg.get_u32()?,
            });
        }
        Ok(Self { entries })
    }

    pub fn to_message(&self) -> NetMessage {
        let mut msg = NetMessage::new();
        self.encode(&mut msg);
        msg
    }
}

impl ManagerEvent for ClosePipeEvent {
    fn name(&self) -> &str {
        "close_pipe"
    }

    fn execute(self: Box<Self>, manager: &mut TransformManager) {
        for entry in &self.entries {
            let Some(owner) = manager.owners().resolve(entry.owner) else {
                tracing::info!("Close pipe event for unknown owner {} ignored", entry.owner);
                continue;
            };
            let fields = entry
                .fields
                .with_from_network(owner != manager.local_owner());
            match manager.get_pipe(&fields, owner) {
                Some(key) => {
                    if let Err(e) = manager.close_pipe(key) {
                        tracing::warn!("Close pipe event failed: {}", e);
                    }
                }
                None => tracing::warn!(
                    "Close pipe event: no pipe {} for {}",
                    fields.pack(),
                    owner
                ),
            }
        }
    }
}
