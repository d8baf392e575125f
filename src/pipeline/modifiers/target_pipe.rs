use crate::pipeline::id::PipeIdFields;
use crate::pipeline::modifier::{Modifier, StageContext, StageRequest};
use crate::pipeline::pipe::PipeOptions;
use crate::transform::Transformation;

/// Forwards the value into another pipe of the same owner.
///
/// On its first run the writer asks for the target pipe to be opened one
/// priority below the current pipe. The manager skips that request if the
/// pipe already exists.
pub struct TargetPipeWriter {
    target: PipeIdFields,
    requested_open: bool,
}

impl TargetPipeWriter {
    pub fn new(target: PipeIdFields) -> Self {
        Self {
            target,
            requested_open: false,
        }
    }
}

impl Modifier for TargetPipeWriter {
    fn name(&self) -> &str {
        "target_pipe"
    }

    fn execute(&mut self, prev: &Transformation, ctx: &mut StageContext<'_>) -> Transformation {
        if !self.requested_open {
            ctx.request(StageRequest::OpenPipe {
                fields: self.target,
                options: PipeOptions::new(ctx.priority.saturating_sub(1), ctx.owner)
                    .from_network(self.target.from_network),
            });
            self.requested_open = true;
        }
        ctx.request(StageRequest::Forward {
            pipe_id: self.target.pack(),
            owner: ctx.owner,
            value: *prev,
        });
        *prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::{OwnerId, PipeId, PipeKey};
    use crate::pipeline::queue::TransformQueue;

    #[test]
    fn test_open_requested_once_then_forward() {
        let target = PipeIdFields::new(3, 4, 0, 0, 0, 1, false).unwrap();
        let mut writer = TargetPipeWriter::new(target);
        let queue = TransformQueue::plain();

        let mut ctx = StageContext::new(PipeKey(0), PipeId(0), OwnerId(2), 20, &queue);
        writer.execute(&Transformation::identity(), &mut ctx);
        writer.execute(&Transformation::identity(), &mut ctx);
        let requests = ctx.into_requests();

        assert_eq!(requests.len(), 3);
        match &requests[0] {
            StageRequest::OpenPipe { fields, options } => {
                assert_eq!(*fields, target);
                assert_eq!(options.priority, 19);
                assert_eq!(options.owner, OwnerId(2));
            }
            other => panic!("unexpected request {:?}", other),
        }
        assert!(requests[1..]
            .iter()
            .all(|r| matches!(r, StageRequest::Forward { pipe_id, .. } if *pipe_id == target.pack())));
    }
}
