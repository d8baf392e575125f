//! Priority-scheduled transform pipes.
//!
//! Transform values (position, orientation, scale) flow from producers into
//! addressable pipes. Each pipe runs an ordered list of stages over its latest
//! value; pipes that need to be combined report into a shared merger, which
//! emits an aggregate once every input has reported.
//!
//! # Architecture
//!
//! ```text
//! producer ──► [Pipe 80: stages ─┐]
//! producer ──► [Pipe 60: stages ─┼─► Merger] ──► [Pipe 60: stages after merger] ──► sink / network
//! network  ──► [Pipe 40: stages ─┘]
//! ```
//!
//! # Design
//!
//! - **Explicit context**: one `TransformManager` per session owns pipes, templates and factories.
//! - **Shared only where required**: mergers and per-configuration/singleton stages are `Rc` handles; everything else is owned by its pipe.
//! - **Deferred side effects**: stages post `StageRequest`s instead of calling back into the manager.
//! - **Cross-thread input**: synchronized pipes hand out a `PipeProducer`; open/close requests arrive as events over a channel.

pub mod error;
pub mod events;
pub mod factory;
pub mod id;
pub mod manager;
pub mod merger;
pub mod modifier;
pub mod modifiers;
pub mod network;
pub mod pipe;
pub mod queue;

pub use error::{PipelineError, PipelineResult};
pub use events::{
    ChannelEventBus, ClosePipeEntry, ClosePipeEvent, EventBus, EventSender, ManagerEvent,
    OpenPipeEntry, OpenPipeEvent,
};
pub use factory::{BuiltinFactory, ModifierFactory, ModifierKind, ModifierRegistry, ModifierSpec};
pub use id::{FieldPattern, IdField, OwnerId, PipeId, PipeIdFields, PipeKey, PipeMask, PipeSelector};
pub use manager::{ManagerStats, TransformManager};
pub use merger::{
    AverageMerge, MergeStrategy, Merger, MergerEmission, MergerFactory, MergerRegistry,
    MergerSpec, SharedMerger,
};
pub use modifier::{
    Modifier, OutputMode, SharedModifier, SharingPolicy, Stage, StageContext, StageHandle,
    StageRequest,
};
pub use network::{
    LoopbackNetwork, NetMessage, NetworkChannel, OwnerRegistry, StaticOwnerRegistry,
    TransformUpdate, Transport, TRANSFORM_CHANNEL,
};
pub use pipe::{Pipe, PipeExecution, PipeOptions};
pub use queue::{FlushPolicy, PipeProducer, TimedTransform, TransformQueue};
