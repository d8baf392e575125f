use crate::pipeline::modifier::{Modifier, StageContext};
use crate::transform::Transformation;

/// Composes a fixed transform onto the pipe value.
#[derive(Debug, Clone, Copy)]
pub struct OffsetModifier {
    offset: Transformation,
    /// `offset * value` instead of `value * offset`.
    pre_multiply: bool,
}

impl OffsetModifier {
    pub fn new(offset: Transformation, pre_multiply: bool) -> Self {
        Self {
            offset,
            pre_multiply,
        }
    }
}

impl Modifier for OffsetModifier {
    fn name(&self) -> &str {
        "offset"
    }

    fn execute(&mut self, prev: &Transformation, _ctx: &mut StageContext<'_>) -> Transformation {
        if self.pre_multiply {
            self.offset.multiply(prev)
        } else {
            prev.multiply(&self.offset)
        }
    }
}
