//! A single addressable transform channel.
//!
//! A pipe owns its queue and its ordered stages and may hold a shared handle
//! on one merger. `execute` runs the stages in front of the merger index and
//! reports to the merger; the manager routes a merger emission to the output
//! pipe's `execute_after_merger`, which runs the remaining stages.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{OwnerId, PipeId, PipeIdFields, PipeKey};
use crate::pipeline::merger::{MergerEmission, SharedMerger};
use crate::pipeline::modifier::{Stage, StageContext, StageRequest};
use crate::pipeline::queue::{FlushPolicy, PipeProducer, TimedTransform, TransformQueue};
use crate::transform::Transformation;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Options for `TransformManager::open_pipe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipeOptions {
    /// Requested priority. Bumped upwards until unique.
    pub priority: u32,
    pub from_network: bool,
    pub owner: OwnerId,
    /// Use the lock-guarded queue and hand out a `PipeProducer`.
    pub synchronized: bool,
}

impl PipeOptions {
    pub fn new(priority: u32, owner: OwnerId) -> Self {
        Self {
            priority,
            owner,
            ..Self::default()
        }
    }

    pub fn from_network(mut self, from_network: bool) -> Self {
        self.from_network = from_network;
        self
    }

    pub fn synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = synchronized;
        self
    }
}

/// Outcome of one `Pipe::execute` call.
#[derive(Debug)]
pub struct PipeExecution {
    /// Value after the stages in front of the merger index.
    pub value: Transformation,
    /// True if a stage interrupted the cycle.
    pub interrupted: bool,
    /// Set when this call completed the merger's barrier.
    pub merged: Option<MergerEmission>,
    pub requests: Vec<StageRequest>,
}

struct MergerAttachment {
    merger: SharedMerger,
    index: usize,
}

pub struct Pipe {
    key: PipeKey,
    pipe_id: PipeId,
    owner: OwnerId,
    priority: u32,
    queue: TransformQueue,
    stages: Vec<Stage>,
    merger: Option<MergerAttachment>,
    flush_policy: FlushPolicy,
    execution_interval: f32,
    countdown: f32,
    epoch: Instant,
    last_output: Option<Transformation>,
}

impl Pipe {
    pub fn new(key: PipeKey, fields: &PipeIdFields, options: &PipeOptions) -> PipelineResult<Self> {
        let fields = fields.with_from_network(options.from_network);
        let pipe_id = PipeId::try_pack(&fields)?;
        let queue = if options.synchronized {
            TransformQueue::synchronized()
        } else {
            TransformQueue::plain()
        };
        Ok(Self {
            key,
            pipe_id,
            owner: options.owner,
            priority: options.priority,
            queue,
            stages: Vec::new(),
            merger: None,
            flush_policy: FlushPolicy::default(),
            execution_interval: 0.0,
            countdown: 0.0,
            epoch: Instant::now(),
            last_output: None,
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn key(&self) -> PipeKey {
        self.key
    }

    pub fn pipe_id(&self) -> PipeId {
        self.pipe_id
    }

    pub fn fields(&self) -> PipeIdFields {
        self.pipe_id.unpack()
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub(crate) fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    /// Clock origin for `set_execution_interval`.
    pub(crate) fn set_epoch(&mut self, epoch: Instant) {
        self.epoch = epoch;
    }

    pub fn is_synchronized(&self) -> bool {
        self.queue.is_synchronized()
    }

    pub fn producer(&self) -> Option<PipeProducer> {
        self.queue.producer(self.pipe_id)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.handle.name()).collect()
    }

    pub fn merger(&self) -> Option<&SharedMerger> {
        self.merger.as_ref().map(|m| &m.merger)
    }

    pub fn merger_index(&self) -> Option<usize> {
        self.merger.as_ref().map(|m| m.index)
    }

    /// Value produced by the last full run through all stages.
    pub fn last_output(&self) -> Option<Transformation> {
        self.last_output
    }

    // ── Queue ───────────────────────────────────────────────────────────────

    pub fn push(&mut self, value: Transformation) {
        self.queue.push(value);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<TimedTransform> {
        self.queue.get(index)
    }

    pub fn latest(&self) -> Option<Transformation> {
        self.queue.latest()
    }

    pub fn set_flush_policy(&mut self, policy: FlushPolicy) {
        self.flush_policy = policy;
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        self.flush_policy
    }

    pub fn flush(&mut self) -> usize {
        self.queue.flush(self.flush_policy)
    }

    // ── Construction ────────────────────────────────────────────────────────

    pub fn add_stage(&mut self, stage: Stage) {
        self.stages.push(stage);
    }

    /// Attach `merger` behind the stages added so far.
    pub fn attach_merger(&mut self, merger: SharedMerger) -> PipelineResult<()> {
        if self.merger.is_some() {
            return Err(PipelineError::MergerAlreadyAttached {
                pipe_id: self.pipe_id,
            });
        }
        self.merger = Some(MergerAttachment {
            merger,
            index: self.stages.len(),
        });
        Ok(())
    }

    // ── Scheduling ──────────────────────────────────────────────────────────

    /// Minimum spacing between executions. The countdown is seeded with
    /// `(elapsed + offset) mod seconds`.
    pub fn set_execution_interval(&mut self, seconds: f32, offset: f32) {
        self.execution_interval = seconds;
        if seconds > 0.0 {
            let time = self.epoch.elapsed().as_secs_f32() + offset;
            self.countdown = time.rem_euclid(seconds);
        } else {
            self.countdown = 0.0;
        }
    }

    pub fn execution_interval(&self) -> f32 {
        self.execution_interval
    }

    pub fn countdown(&self) -> f32 {
        self.countdown
    }

    /// Subtract `dt` from the countdown. True once the pipe is due.
    pub(crate) fn advance(&mut self, dt: f32) -> bool {
        self.countdown -= dt;
        self.countdown <= 0.0
    }

    pub(crate) fn rearm(&mut self) {
        self.countdown = (self.countdown + self.execution_interval).max(0.0);
    }

    // ── Execution ───────────────────────────────────────────────────────────

    /// Run the stages up to the merger index starting from the latest queued
    /// value (identity if empty), then report to the merger.
    pub fn execute(&mut self) -> PipeExecution {
        let mut value = self.queue.latest().unwrap_or_else(Transformation::identity);
        let end = self.merger_index().unwrap_or(self.stages.len());
        let mut ctx = StageContext::new(
            self.key,
            self.pipe_id,
            self.owner,
            self.priority,
            &self.queue,
        );

        let mut interrupted = false;
        for stage in &mut self.stages[..end] {
            if stage.interrupt(&value, &ctx) {
                interrupted = true;
                break;
            }
            value = stage.run(value, &mut ctx);
        }
        let requests = ctx.into_requests();

        let merged = match &self.merger {
            Some(attachment) if !interrupted => {
                attachment.merger.borrow_mut().execute(self.key, value)
            }
            _ => None,
        };

        if self.merger.is_none() && !interrupted {
            self.last_output = Some(value);
        }

        PipeExecution {
            value,
            interrupted,
            merged,
            requests,
        }
    }

    /// Run the stages behind the merger index on the merged value.
    pub fn execute_after_merger(
        &mut self,
        value: Transformation,
    ) -> (Transformation, Vec<StageRequest>) {
        let start = self.merger_index().unwrap_or(self.stages.len());
        let mut ctx = StageContext::new(
            self.key,
            self.pipe_id,
            self.owner,
            self.priority,
            &self.queue,
        );
        let mut value = value;
        for stage in &mut self.stages[start..] {
            value = stage.run(value, &mut ctx);
        }
        let requests = ctx.into_requests();
        self.last_output = Some(value);
        (value, requests)
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if let Some(attachment) = self.merger.take() {
            match attachment.merger.try_borrow_mut() {
                Ok(mut merger) => {
                    let remaining = merger.remove_input_pipe(self.key);
                    if remaining == 0 {
                        tracing::info!("Merger '{}' released", merger.id());
                    }
                }
                Err(_) => tracing::error!(
                    "Pipe {} dropped while its merger was borrowed",
                    self.pipe_id
                ),
            }
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("key", &self.key)
            .field("pipe_id", &self.pipe_id)
            .field("owner", &self.owner)
            .field("priority", &self.priority)
            .field("queued", &self.queue.len())
            .field("stages", &self.stages)
            .field("merger_index", &self.merger_index())
            .finish()
    }
}
