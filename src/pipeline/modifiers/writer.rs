//! Hands committed values to the world outside the pipe system.

use crate::pipeline::id::{OwnerId, PipeId};
use crate::pipeline::modifier::{Modifier, StageContext};
use crate::transform::Transformation;
use std::rc::Rc;

/// Entity a writer stage updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkTarget {
    pub owner: OwnerId,
    pub object_class: u32,
    pub object_type: u32,
    pub object_id: u32,
}

impl SinkTarget {
    pub fn for_pipe(owner: OwnerId, pipe_id: PipeId) -> Self {
        let fields = pipe_id.unpack();
        Self {
            owner,
            object_class: fields.object_class,
            object_type: fields.object_type,
            object_id: fields.object_id,
        }
    }
}

/// Consumer of committed transforms (avatars, entities, cameras).
/// Fire and forget.
#[cfg_attr(test, mockall::automock)]
pub trait TransformSink {
    fn apply(&self, target: SinkTarget, transform: &Transformation);
}

/// Sink that only traces what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TransformSink for TracingSink {
    fn apply(&self, target: SinkTarget, transform: &Transformation) {
        tracing::debug!(
            owner = target.owner.0,
            object_id = target.object_id,
            x = transform.position[0],
            y = transform.position[1],
            z = transform.position[2],
            "transform committed"
        );
    }
}

pub struct SinkWriter {
    sink: Rc<dyn TransformSink>,
}

impl SinkWriter {
    pub fn new(sink: Rc<dyn TransformSink>) -> Self {
        Self { sink }
    }
}

impl Modifier for SinkWriter {
    fn name(&self) -> &str {
        "sink_writer"
    }

    fn execute(&mut self, prev: &Transformation, ctx: &mut StageContext<'_>) -> Transformation {
        self.sink.apply(SinkTarget::for_pipe(ctx.owner, ctx.pipe_id), prev);
        *prev
    }
}
