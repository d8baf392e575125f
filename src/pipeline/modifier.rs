//! The stage abstraction run by every pipe.
//!
//! A [`Modifier`] turns the previous stage's value into a new one. Its
//! [`OutputMode`] decides whether that result flows on (`Result`) or whether
//! the stage only runs for its side effects (`Passthrough`). Instances are
//! either owned by one pipe or shared through the [`ModifierRegistry`]
//! according to the factory's [`SharingPolicy`].
//!
//! Stages never touch the manager. Anything that needs the registry (pushing
//! into another pipe, opening a pipe, sending a network message) is posted as
//! a [`StageRequest`] and applied by the manager after the pipe finishes.
//!
//! [`ModifierRegistry`]: crate::pipeline::factory::ModifierRegistry

use crate::pipeline::id::{OwnerId, PipeId, PipeIdFields, PipeKey};
use crate::pipeline::network::{NetMessage, Transport};
use crate::pipeline::pipe::PipeOptions;
use crate::pipeline::queue::TransformQueue;
use crate::transform::Transformation;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// What a pipe does with a stage's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// The returned value becomes the pipe's current value.
    #[default]
    Result,
    /// `execute` still runs, the previous value keeps flowing.
    Passthrough,
}

/// How many instances a factory hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SharingPolicy {
    PerPipe,
    PerConfiguration,
    Singleton,
}

/// Deferred side effect posted by a stage.
#[derive(Debug, Clone)]
pub enum StageRequest {
    /// Push `value` into the open pipe `(pipe_id, owner)`.
    Forward {
        pipe_id: PipeId,
        owner: OwnerId,
        value: Transformation,
    },
    /// Open a pipe unless one with the same id and owner already exists.
    OpenPipe {
        fields: PipeIdFields,
        options: PipeOptions,
    },
    /// Hand a message to the network channel.
    Send {
        channel: u32,
        message: NetMessage,
        transport: Transport,
    },
}

/// Per-execution view of the running pipe.
pub struct StageContext<'a> {
    pub key: PipeKey,
    pub pipe_id: PipeId,
    pub owner: OwnerId,
    pub priority: u32,
    queue: &'a TransformQueue,
    requests: Vec<StageRequest>,
}

impl<'a> StageContext<'a> {
    pub fn new(
        key: PipeKey,
        pipe_id: PipeId,
        owner: OwnerId,
        priority: u32,
        queue: &'a TransformQueue,
    ) -> Self {
        Self {
            key,
            pipe_id,
            owner,
            priority,
            queue,
            requests: Vec::new(),
        }
    }

    /// Pipe's queued inputs, for stages that look at history.
    pub fn queue(&self) -> &TransformQueue {
        self.queue
    }

    pub fn request(&mut self, request: StageRequest) {
        self.requests.push(request);
    }

    pub fn into_requests(self) -> Vec<StageRequest> {
        self.requests
    }
}

/// A single pipeline step.
pub trait Modifier {
    fn name(&self) -> &str;

    fn execute(&mut self, prev: &Transformation, ctx: &mut StageContext<'_>) -> Transformation;

    /// Returning `true` stops the current cycle of the pipe before this
    /// stage, including any merger dispatch.
    fn interrupt(&mut self, _prev: &Transformation, _ctx: &StageContext<'_>) -> bool {
        false
    }
}

pub type SharedModifier = Rc<RefCell<Box<dyn Modifier>>>;

/// A stage instance as held by a pipe.
pub enum StageHandle {
    Owned(Box<dyn Modifier>),
    Shared(SharedModifier),
}

impl StageHandle {
    pub fn name(&self) -> String {
        match self {
            StageHandle::Owned(m) => m.name().to_string(),
            StageHandle::Shared(m) => m.borrow().name().to_string(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, StageHandle::Shared(_))
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut dyn Modifier) -> R) -> R {
        match self {
            StageHandle::Owned(m) => f(m.as_mut()),
            StageHandle::Shared(m) => f(m.borrow_mut().as_mut()),
        }
    }
}

/// A stage in a pipe's ordered list.
pub struct Stage {
    pub handle: StageHandle,
    pub output: OutputMode,
}

impl Stage {
    pub fn new(handle: StageHandle, output: OutputMode) -> Self {
        Self { handle, output }
    }

    pub fn owned(modifier: impl Modifier + 'static, output: OutputMode) -> Self {
        Self::new(StageHandle::Owned(Box::new(modifier)), output)
    }

    pub fn interrupt(&mut self, prev: &Transformation, ctx: &StageContext<'_>) -> bool {
        self.handle.with(|m| m.interrupt(prev, ctx))
    }

    /// Run the stage and apply its output mode.
    pub fn run(&mut self, prev: Transformation, ctx: &mut StageContext<'_>) -> Transformation {
        let result = self.handle.with(|m| m.execute(&prev, ctx));
        match self.output {
            OutputMode::Result => result,
            OutputMode::Passthrough => prev,
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.handle.name())
            .field("output", &self.output)
            .field("shared", &self.handle.is_shared())
            .finish()
    }
}
