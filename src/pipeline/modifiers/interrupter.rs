use crate::pipeline::modifier::{Modifier, StageContext};
use crate::transform::{Transformation, DEFAULT_EPSILON};

/// Stops the cycle while the value has not changed since the last run.
pub struct ChangeInterrupter {
    epsilon: f32,
    last: Option<Transformation>,
}

impl ChangeInterrupter {
    pub fn new(epsilon: f32) -> Self {
        Self {
            epsilon,
            last: None,
        }
    }
}

impl Default for ChangeInterrupter {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}

impl Modifier for ChangeInterrupter {
    fn name(&self) -> &str {
        "change_interrupter"
    }

    fn execute(&mut self, prev: &Transformation, _ctx: &mut StageContext<'_>) -> Transformation {
        self.last = Some(*prev);
        *prev
    }

    fn interrupt(&mut self, prev: &Transformation, _ctx: &StageContext<'_>) -> bool {
        self.last.is_some_and(|last| last.approx_eq(prev, self.epsilon))
    }
}
