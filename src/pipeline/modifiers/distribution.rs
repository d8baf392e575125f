use crate::pipeline::modifier::{Modifier, StageContext, StageRequest};
use crate::pipeline::network::{TransformUpdate, Transport, TRANSFORM_CHANNEL};
use crate::transform::Transformation;

/// Publishes the pipe value to remote peers.
pub struct DistributionModifier {
    transport: Transport,
    sent: u64,
}

impl DistributionModifier {
    pub fn new(transport: Transport) -> Self {
        Self { transport, sent: 0 }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Modifier for DistributionModifier {
    fn name(&self) -> &str {
        "distribution"
    }

    fn execute(&mut self, prev: &Transformation, ctx: &mut StageContext<'_>) -> Transformation {
        let update = TransformUpdate {
            owner: ctx.owner.0,
            pipe_id: ctx.pipe_id,
            value: *prev,
        };
        ctx.request(StageRequest::Send {
            channel: TRANSFORM_CHANNEL,
            message: update.to_message(),
            transport: self.transport,
        });
        self.sent += 1;
        *prev
    }
}
