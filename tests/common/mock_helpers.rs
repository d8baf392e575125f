//! Mock construction helpers

use posepipe::pipeline::modifiers::{SinkTarget, TransformSink};
use posepipe::pipeline::{
    Modifier, ModifierFactory, ModifierKind, ModifierSpec, PipelineResult, SharingPolicy,
    StageContext,
};
use posepipe::Transformation;
use std::cell::RefCell;
use std::rc::Rc;

/// One stage invocation: (pipe priority, x of the incoming value)
pub type Trace = Rc<RefCell<Vec<(u32, f32)>>>;

/// Stage that records every value it sees and passes it on
pub struct TraceStage(Trace);

impl Modifier for TraceStage {
    fn name(&self) -> &str {
        "trace"
    }

    fn execute(&mut self, prev: &Transformation, ctx: &mut StageContext<'_>) -> Transformation {
        self.0.borrow_mut().push((ctx.priority, prev.position[0]));
        *prev
    }
}

/// Registers as `ModifierSpec::Plugin { name: "trace" }`
pub struct TraceFactory(pub Trace);

impl ModifierFactory for TraceFactory {
    fn kind(&self) -> ModifierKind {
        ModifierKind::Plugin("trace".into())
    }

    fn sharing(&self) -> SharingPolicy {
        SharingPolicy::PerPipe
    }

    fn create(&self, _spec: &ModifierSpec) -> PipelineResult<Box<dyn Modifier>> {
        Ok(Box::new(TraceStage(Rc::clone(&self.0))))
    }
}

/// Priorities in the order stages ran
pub fn priorities(trace: &Trace) -> Vec<u32> {
    trace.borrow().iter().map(|(p, _)| *p).collect()
}

/// Sink collecting every committed transform
#[derive(Default)]
pub struct CollectingSink {
    pub applied: RefCell<Vec<(SinkTarget, Transformation)>>,
}

impl TransformSink for CollectingSink {
    fn apply(&self, target: SinkTarget, transform: &Transformation) {
        self.applied.borrow_mut().push((target, *transform));
    }
}
