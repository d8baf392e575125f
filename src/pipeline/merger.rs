//! N-to-1 synchronization barrier between pipes.
//!
//! Every attached input pipe reports its pre-merger value once per cycle.
//! Only when all of them have reported does the merger aggregate the values
//! and hand the result to its output pipe. The output pipe then continues
//! with the stages behind its merger index.
//!
//! Mergers are shared by their input pipes through [`SharedMerger`]. The last
//! pipe to detach drops the last handle, which drops the merger.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{PipeId, PipeKey, PipeMask, PipeSelector};
use crate::transform::Transformation;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub type SharedMerger = Rc<RefCell<Merger>>;

// ── Strategies ──────────────────────────────────────────────────────────────

/// Aggregation applied once the barrier opens.
pub trait MergeStrategy {
    fn name(&self) -> &str;
    fn merge(&mut self, inputs: &[Transformation]) -> Transformation;
}

/// Arithmetic mean of the input matrices.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageMerge;

impl MergeStrategy for AverageMerge {
    fn name(&self) -> &str {
        "average"
    }

    fn merge(&mut self, inputs: &[Transformation]) -> Transformation {
        Transformation::mean(inputs)
    }
}

/// Typed merger configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergerSpec {
    #[default]
    Average,
    Plugin { name: String },
}

/// Creates strategies for `MergerSpec::Plugin` entries.
pub trait MergerFactory {
    fn name(&self) -> &str;
    fn create(&self) -> Box<dyn MergeStrategy>;
}

/// Lookup of merge strategies by spec.
#[derive(Default)]
pub struct MergerRegistry {
    plugins: HashMap<String, Box<dyn MergerFactory>>,
}

impl MergerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Box<dyn MergerFactory>) {
        let name = factory.name().to_string();
        if self.plugins.insert(name.clone(), factory).is_some() {
            tracing::warn!("Merger factory '{}' replaced", name);
        }
    }

    pub fn has(&self, spec: &MergerSpec) -> bool {
        match spec {
            MergerSpec::Average => true,
            MergerSpec::Plugin { name } => self.plugins.contains_key(name),
        }
    }

    pub fn create_strategy(&self, spec: &MergerSpec) -> PipelineResult<Box<dyn MergeStrategy>> {
        match spec {
            MergerSpec::Average => Ok(Box::new(AverageMerge)),
            MergerSpec::Plugin { name } => self
                .plugins
                .get(name)
                .map(|f| f.create())
                .ok_or_else(|| PipelineError::UnknownMerger(name.clone())),
        }
    }
}

// ── Merger ──────────────────────────────────────────────────────────────────

/// Value produced when the barrier opens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergerEmission {
    pub output: PipeKey,
    pub value: Transformation,
}

#[derive(Debug, Clone)]
struct MaskEntry {
    mask: PipeMask,
    selector: PipeSelector,
}

impl MaskEntry {
    fn new(mask: PipeMask) -> Self {
        Self {
            selector: mask.selector(),
            mask,
        }
    }
}

#[derive(Debug)]
struct MergerInput {
    key: PipeKey,
    pipe_id: PipeId,
    value: Transformation,
    dirty: bool,
}

pub struct Merger {
    id: String,
    input_masks: Vec<MaskEntry>,
    output_masks: Vec<MaskEntry>,
    inputs: Vec<MergerInput>,
    max_inputs: Option<usize>,
    strategy: Box<dyn MergeStrategy>,
    emissions: u64,
}

impl Merger {
    pub fn new(id: impl Into<String>, strategy: Box<dyn MergeStrategy>) -> Self {
        Self {
            id: id.into(),
            input_masks: Vec::new(),
            output_masks: Vec::new(),
            inputs: Vec::new(),
            max_inputs: None,
            strategy,
            emissions: 0,
        }
    }

    pub fn average(id: impl Into<String>) -> Self {
        Self::new(id, Box::new(AverageMerge))
    }

    pub fn into_shared(self) -> SharedMerger {
        Rc::new(RefCell::new(self))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn set_max_inputs(&mut self, max: Option<usize>) {
        self.max_inputs = max;
    }

    pub fn max_inputs(&self) -> Option<usize> {
        self.max_inputs
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn emissions(&self) -> u64 {
        self.emissions
    }

    pub fn input_masks(&self) -> impl Iterator<Item = &PipeMask> {
        self.input_masks.iter().map(|e| &e.mask)
    }

    pub fn output_masks(&self) -> impl Iterator<Item = &PipeMask> {
        self.output_masks.iter().map(|e| &e.mask)
    }

    /// Input masks may only change while no pipe is attached.
    pub fn add_input_mask(&mut self, mask: PipeMask) -> PipelineResult<()> {
        if !self.inputs.is_empty() {
            return Err(PipelineError::InvalidConfig(format!(
                "merger '{}' already has attached pipes",
                self.id
            )));
        }
        mask.validate()?;
        self.input_masks.push(MaskEntry::new(mask));
        Ok(())
    }

    pub fn add_output_mask(&mut self, mask: PipeMask) -> PipelineResult<()> {
        mask.validate()?;
        self.output_masks.push(MaskEntry::new(mask));
        Ok(())
    }

    /// Whether `add_input_pipe` would take this pipe.
    pub fn accepts(&self, pipe_id: PipeId) -> bool {
        !self.is_full() && self.input_masks.iter().any(|e| e.selector.matches(pipe_id))
    }

    fn is_full(&self) -> bool {
        self.max_inputs.is_some_and(|max| self.inputs.len() >= max)
    }

    /// Attach an input pipe.
    ///
    /// The first attached pipe pins every `Equal` field of the input masks to
    /// its own value. `Any` fields stay wildcards.
    pub fn add_input_pipe(&mut self, key: PipeKey, pipe_id: PipeId) -> PipelineResult<()> {
        if let Some(max) = self.max_inputs {
            if self.inputs.len() >= max {
                return Err(PipelineError::MergerCapacity {
                    merger_id: self.id.clone(),
                    max,
                });
            }
        }
        if !self.input_masks.iter().any(|e| e.selector.matches(pipe_id)) {
            return Err(PipelineError::MergerMaskMismatch {
                merger_id: self.id.clone(),
                pipe_id,
            });
        }
        if self.inputs.iter().any(|i| i.key == key) {
            return Err(PipelineError::MergerAlreadyAttached { pipe_id });
        }

        if self.inputs.is_empty() {
            let fields = pipe_id.unpack();
            for entry in &mut self.input_masks {
                if entry.mask.has_equal_fields() {
                    *entry = MaskEntry::new(entry.mask.resolve_equal(&fields));
                }
            }
        }

        self.inputs.push(MergerInput {
            key,
            pipe_id,
            value: Transformation::identity(),
            dirty: false,
        });
        tracing::debug!(
            "Merger '{}' accepted pipe {} ({} inputs)",
            self.id,
            pipe_id,
            self.inputs.len()
        );
        Ok(())
    }

    /// Detach a pipe. Returns the number of pipes still attached.
    pub fn remove_input_pipe(&mut self, key: PipeKey) -> usize {
        let before = self.inputs.len();
        self.inputs.retain(|i| i.key != key);
        if self.inputs.len() == before {
            tracing::warn!("Merger '{}': pipe {} was not attached", self.id, key);
        }
        self.inputs.len()
    }

    pub fn is_dirty(&self, key: PipeKey) -> bool {
        self.inputs.iter().any(|i| i.key == key && i.dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.inputs.iter().filter(|i| i.dirty).count()
    }

    /// Record `value` for `key`. Emits the aggregate once every input has
    /// reported since the last emission.
    pub fn execute(&mut self, key: PipeKey, value: Transformation) -> Option<MergerEmission> {
        let Some(input) = self.inputs.iter_mut().find(|i| i.key == key) else {
            tracing::warn!("Merger '{}': execute from unattached pipe {}", self.id, key);
            return None;
        };
        input.value = value;
        input.dirty = true;

        if self.inputs.iter().any(|i| !i.dirty) {
            return None;
        }

        let values: Vec<Transformation> = self.inputs.iter().map(|i| i.value).collect();
        let aggregate = self.strategy.merge(&values);
        for input in &mut self.inputs {
            input.dirty = false;
        }

        let Some(output) = self.choose_output() else {
            tracing::error!("Merger '{}': no attached pipe matches an output mask", self.id);
            return None;
        };
        self.emissions += 1;
        tracing::trace!("Merger '{}' emitting to {}", self.id, output);
        Some(MergerEmission {
            output,
            value: aggregate,
        })
    }

    /// First attached pipe matching an output mask, masks in insertion order.
    fn choose_output(&self) -> Option<PipeKey> {
        self.output_masks.iter().find_map(|entry| {
            self.inputs
                .iter()
                .find(|i| entry.selector.matches(i.pipe_id))
                .map(|i| i.key)
        })
    }
}

impl std::fmt::Debug for Merger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Merger")
            .field("id", &self.id)
            .field("strategy", &self.strategy.name())
            .field("inputs", &self.inputs.len())
            .field("max_inputs", &self.max_inputs)
            .finish()
    }
}
