//! Pipe registry and priority scheduler.
//!
//! The manager owns every open pipe, kept sorted by priority, plus the pipe
//! and merger templates that decide what a newly opened pipe looks like.
//! Each `step`:
//! 1. Drain and execute pending events (open/close requests from other threads or peers).
//! 2. Route transform updates received from the network into their pipes.
//! 3. Walk the pipes from the highest priority down, executing those that are due.
//!
//! A walk can stop early at a priority boundary (`interrupt_at`). The next
//! call then resumes below that boundary and skips steps 1 and 2, so one
//! logical frame may be split across several calls.

use crate::config::{
    ManagerConfig, MergerAttachConfig, MergerTemplateConfig, PipeTemplateConfig,
    DEFAULT_FLUSH_QUORUM,
};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::events::EventBus;
use crate::pipeline::factory::ModifierRegistry;
use crate::pipeline::id::{OwnerId, PipeId, PipeIdFields, PipeKey, PipeSelector};
use crate::pipeline::merger::{Merger, MergerEmission, MergerRegistry, SharedMerger};
use crate::pipeline::modifier::{Stage, StageRequest};
use crate::pipeline::network::{NetworkChannel, OwnerRegistry, TransformUpdate, TRANSFORM_CHANNEL};
use crate::pipeline::pipe::{Pipe, PipeOptions};
use crate::pipeline::queue::{FlushPolicy, PipeProducer};
use crate::transform::Transformation;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Counters since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub cycles: u64,
    pub executions: u64,
    pub merger_emissions: u64,
    pub network_updates: u64,
    pub dropped_updates: u64,
}

#[derive(Debug, Clone)]
struct PipeTemplate {
    selector: PipeSelector,
    config: PipeTemplateConfig,
}

pub struct TransformManager {
    /// Sorted by ascending priority; priorities are unique.
    pipes: Vec<Pipe>,
    pipe_templates: Vec<PipeTemplate>,
    merger_templates: HashMap<String, MergerTemplateConfig>,
    live_mergers: Vec<Weak<RefCell<Merger>>>,
    modifiers: ModifierRegistry,
    mergers: MergerRegistry,
    owners: Box<dyn OwnerRegistry>,
    network: Option<Box<dyn NetworkChannel>>,
    events: Option<Box<dyn EventBus>>,
    /// Boundary of an unfinished pass, 0 if none.
    interrupted_at: u32,
    next_key: u32,
    default_flush_quorum: usize,
    epoch: Instant,
    stats: ManagerStats,
}

impl TransformManager {
    pub fn new(owners: impl OwnerRegistry + 'static) -> Self {
        Self {
            pipes: Vec::new(),
            pipe_templates: Vec::new(),
            merger_templates: HashMap::new(),
            live_mergers: Vec::new(),
            modifiers: ModifierRegistry::new(),
            mergers: MergerRegistry::new(),
            owners: Box::new(owners),
            network: None,
            events: None,
            interrupted_at: 0,
            next_key: 0,
            default_flush_quorum: DEFAULT_FLUSH_QUORUM,
            epoch: Instant::now(),
            stats: ManagerStats::default(),
        }
    }

    // ── Collaborators ───────────────────────────────────────────────────────

    pub fn set_network(&mut self, network: Box<dyn NetworkChannel>) {
        self.network = Some(network);
    }

    pub fn set_event_bus(&mut self, bus: Box<dyn EventBus>) {
        self.events = Some(bus);
    }

    pub fn owners(&self) -> &dyn OwnerRegistry {
        self.owners.as_ref()
    }

    pub fn local_owner(&self) -> OwnerId {
        self.owners.local_owner()
    }

    pub fn modifiers(&self) -> &ModifierRegistry {
        &self.modifiers
    }

    /// Register stage factories or the sink before `load_config`.
    pub fn modifiers_mut(&mut self) -> &mut ModifierRegistry {
        &mut self.modifiers
    }

    pub fn mergers_mut(&mut self) -> &mut MergerRegistry {
        &mut self.mergers
    }

    // ── Templates ───────────────────────────────────────────────────────────

    /// Validate `config` against the registered factories and install its
    /// templates. Nothing is installed if any entry is rejected.
    pub fn load_config(&mut self, config: &ManagerConfig) -> PipelineResult<()> {
        for merger in &config.mergers {
            if !self.mergers.has(&merger.strategy) {
                return Err(PipelineError::UnknownMerger(format!(
                    "{} (strategy {:?})",
                    merger.id, merger.strategy
                )));
            }
            if merger.inputs.is_empty() {
                return Err(PipelineError::InvalidConfig(format!(
                    "merger '{}' has no input masks",
                    merger.id
                )));
            }
            for mask in merger.inputs.iter().chain(&merger.outputs) {
                mask.validate()?;
            }
        }

        for template in &config.pipes {
            template.selector.validate()?;
            for stage in &template.stages {
                let kind = stage.spec.kind();
                if !self.modifiers.contains(&kind) {
                    return Err(PipelineError::UnknownModifier(kind.to_string()));
                }
            }
            if let Some(attach) = &template.merger {
                let known = config.mergers.iter().any(|m| m.id == attach.merger_id)
                    || self.merger_templates.contains_key(&attach.merger_id);
                if !known {
                    return Err(PipelineError::UnknownMerger(attach.merger_id.clone()));
                }
                if attach.before_stage > template.stages.len() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "merger '{}' attached before stage {} of a {}-stage template",
                        attach.merger_id,
                        attach.before_stage,
                        template.stages.len()
                    )));
                }
                attach.mask.validate()?;
            }
            if template.flush_quorum == Some(0) {
                return Err(PipelineError::InvalidConfig(
                    "flush_quorum must be at least 1".into(),
                ));
            }
        }

        self.default_flush_quorum = config.default_flush_quorum.max(1);
        for merger in &config.mergers {
            self.add_merger_template(merger.clone());
        }
        for template in &config.pipes {
            self.add_pipe_template(template.clone());
        }
        tracing::info!(
            "Loaded {} pipe templates and {} merger templates",
            config.pipes.len(),
            config.mergers.len()
        );
        Ok(())
    }

    /// Templates are tried in insertion order, first match wins.
    pub fn add_pipe_template(&mut self, config: PipeTemplateConfig) {
        self.pipe_templates.push(PipeTemplate {
            selector: config.selector.selector(),
            config,
        });
    }

    pub fn add_merger_template(&mut self, config: MergerTemplateConfig) {
        if let Some(old) = self.merger_templates.insert(config.id.clone(), config) {
            tracing::warn!("Merger template '{}' replaced", old.id);
        }
    }

    // ── Open / close ────────────────────────────────────────────────────────

    pub fn pack_pipe_id(fields: &PipeIdFields) -> PipelineResult<PipeId> {
        PipeId::try_pack(fields)
    }

    pub fn unpack_pipe_id(pipe_id: PipeId) -> PipeIdFields {
        pipe_id.unpack()
    }

    /// Open a pipe built from the first template whose selector matches.
    ///
    /// `options.from_network` overrides the flag in `fields`. A requested
    /// priority that is already taken is bumped until it is free.
    pub fn open_pipe(
        &mut self,
        fields: &PipeIdFields,
        options: PipeOptions,
    ) -> PipelineResult<PipeKey> {
        let fields = fields.with_from_network(options.from_network);
        let pipe_id = PipeId::try_pack(&fields)?;

        if self.find_pipe(pipe_id, options.owner).is_some() {
            tracing::warn!("Pipe {} already open for {}", pipe_id, options.owner);
            return Err(PipelineError::DuplicatePipe {
                pipe_id,
                owner: options.owner,
            });
        }

        let Some(template) = self
            .pipe_templates
            .iter()
            .find(|t| t.selector.matches(pipe_id))
            .cloned()
        else {
            tracing::warn!("No pipe template matches {}", pipe_id);
            return Err(PipelineError::ConfigurationMismatch { pipe_id });
        };

        let key = PipeKey(self.next_key);
        if !key.is_valid() {
            return Err(PipelineError::InvalidConfig("pipe keys exhausted".into()));
        }
        self.next_key += 1;

        let mut pipe = Pipe::new(key, &fields, &options)?;
        pipe.set_epoch(self.epoch);
        pipe.set_flush_policy(FlushPolicy::Quorum(
            template
                .config
                .flush_quorum
                .unwrap_or(self.default_flush_quorum),
        ));

        let attach = template
            .config
            .merger
            .as_ref()
            .filter(|m| m.mask.matches(pipe_id));
        for (index, stage) in template.config.stages.iter().enumerate() {
            if let Some(attach) = attach.filter(|m| m.before_stage == index) {
                self.attach_merger(&mut pipe, attach);
            }
            let handle = match self
                .modifiers
                .instantiate(&stage.spec, template.selector, index)
            {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!("Cannot build stage {} of {}: {}", index, pipe_id, e);
                    drop(pipe);
                    self.modifiers.release_unused();
                    return Err(e);
                }
            };
            pipe.add_stage(Stage::new(handle, stage.output));
        }
        if let Some(attach) = attach.filter(|m| m.before_stage >= template.config.stages.len()) {
            self.attach_merger(&mut pipe, attach);
        }

        if let Some(interval) = template.config.execution_interval {
            pipe.set_execution_interval(interval, 0.0);
        }

        let requested = options.priority;
        let mut priority = requested;
        while self
            .pipes
            .binary_search_by_key(&priority, Pipe::priority)
            .is_ok()
        {
            priority = priority.checked_add(1).ok_or_else(|| {
                PipelineError::InvalidConfig(format!("no free priority above {}", requested))
            })?;
        }
        if priority != requested {
            tracing::debug!("Priority {} taken, {} gets {}", requested, pipe_id, priority);
        }
        pipe.set_priority(priority);

        let index = self.pipes.partition_point(|p| p.priority() < priority);
        self.pipes.insert(index, pipe);
        tracing::info!(
            "Opened pipe {} ({}) for {} at priority {}",
            pipe_id,
            key,
            options.owner,
            priority
        );
        Ok(key)
    }

    /// Merger failures leave the pipe without a merger.
    fn attach_merger(&mut self, pipe: &mut Pipe, attach: &MergerAttachConfig) {
        let merger = match self.resolve_merger(pipe, &attach.merger_id) {
            Ok(merger) => merger,
            Err(e) => {
                tracing::warn!("Pipe {} opened without merger: {}", pipe.pipe_id(), e);
                return;
            }
        };
        if let Err(e) = pipe.attach_merger(Rc::clone(&merger)) {
            merger.borrow_mut().remove_input_pipe(pipe.key());
            tracing::warn!("Pipe {} opened without merger: {}", pipe.pipe_id(), e);
        }
    }

    /// Live merger with this id that takes the pipe, or a fresh one built
    /// from the template. The pipe is registered as an input either way.
    fn resolve_merger(&mut self, pipe: &Pipe, merger_id: &str) -> PipelineResult<SharedMerger> {
        self.live_mergers.retain(|m| m.strong_count() > 0);
        for weak in &self.live_mergers {
            let Some(merger) = weak.upgrade() else {
                continue;
            };
            let accepted = {
                let mut m = merger.borrow_mut();
                m.id() == merger_id
                    && m.accepts(pipe.pipe_id())
                    && m.add_input_pipe(pipe.key(), pipe.pipe_id()).is_ok()
            };
            if accepted {
                return Ok(merger);
            }
        }

        let template = self
            .merger_templates
            .get(merger_id)
            .ok_or_else(|| PipelineError::UnknownMerger(merger_id.to_string()))?;
        let mut merger = Merger::new(merger_id, self.mergers.create_strategy(&template.strategy)?);
        for mask in &template.inputs {
            merger.add_input_mask(*mask)?;
        }
        for mask in &template.outputs {
            merger.add_output_mask(*mask)?;
        }
        merger.set_max_inputs(template.max_inputs);
        merger.add_input_pipe(pipe.key(), pipe.pipe_id())?;

        let merger = merger.into_shared();
        self.live_mergers.push(Rc::downgrade(&merger));
        tracing::info!("Merger '{}' created for pipe {}", merger_id, pipe.pipe_id());
        Ok(merger)
    }

    /// Remove a pipe. Its stages are released and it leaves its merger.
    pub fn close_pipe(&mut self, key: PipeKey) -> PipelineResult<()> {
        let index = self.index_of(key).ok_or(PipelineError::UnknownPipe(key))?;
        let pipe = self.pipes.remove(index);
        let (pipe_id, owner) = (pipe.pipe_id(), pipe.owner());
        drop(pipe);

        self.modifiers.release_unused();
        self.live_mergers.retain(|m| m.strong_count() > 0);
        tracing::info!("Closed pipe {} ({}) of {}", pipe_id, key, owner);
        Ok(())
    }

    /// Session teardown. Returns the number of pipes closed.
    pub fn close_all_pipes_from_owner(&mut self, owner: OwnerId) -> usize {
        let keys: Vec<PipeKey> = self
            .pipes
            .iter()
            .filter(|p| p.owner() == owner)
            .map(Pipe::key)
            .collect();
        for key in &keys {
            if let Err(e) = self.close_pipe(*key) {
                tracing::warn!("Closing {} failed: {}", key, e);
            }
        }
        keys.len()
    }

    /// Close every pipe, lowest priority first.
    pub fn shutdown(&mut self) {
        let count = self.pipes.len();
        while let Some(pipe) = self.pipes.pop() {
            drop(pipe);
        }
        self.modifiers.release_unused();
        self.live_mergers.clear();
        self.interrupted_at = 0;
        tracing::info!("Transform manager shut down ({} pipes closed)", count);
    }

    // ── Lookup ──────────────────────────────────────────────────────────────

    pub fn get_pipe(&self, fields: &PipeIdFields, owner: OwnerId) -> Option<PipeKey> {
        let pipe_id = PipeId::try_pack(fields).ok()?;
        self.find_pipe(pipe_id, owner)
    }

    pub fn find_pipe(&self, pipe_id: PipeId, owner: OwnerId) -> Option<PipeKey> {
        self.pipes
            .iter()
            .find(|p| p.pipe_id() == pipe_id && p.owner() == owner)
            .map(Pipe::key)
    }

    fn index_of(&self, key: PipeKey) -> Option<usize> {
        self.pipes.iter().position(|p| p.key() == key)
    }

    pub fn pipe(&self, key: PipeKey) -> Option<&Pipe> {
        self.pipes.iter().find(|p| p.key() == key)
    }

    pub fn pipe_mut(&mut self, key: PipeKey) -> Option<&mut Pipe> {
        self.pipes.iter_mut().find(|p| p.key() == key)
    }

    pub fn push(&mut self, key: PipeKey, value: Transformation) -> PipelineResult<()> {
        self.pipe_mut(key)
            .ok_or(PipelineError::UnknownPipe(key))?
            .push(value);
        Ok(())
    }

    /// Cross-thread push handle, for pipes opened with `synchronized`.
    pub fn producer(&self, key: PipeKey) -> Option<PipeProducer> {
        self.pipe(key).and_then(Pipe::producer)
    }

    pub fn pipe_count(&self) -> usize {
        self.pipes.len()
    }

    /// Priorities of the open pipes in execution order.
    pub fn priorities(&self) -> Vec<u32> {
        self.pipes.iter().rev().map(Pipe::priority).collect()
    }

    pub fn live_merger_count(&self) -> usize {
        self.live_mergers
            .iter()
            .filter(|m| m.strong_count() > 0)
            .count()
    }

    /// Boundary where the last pass stopped, if it did not finish.
    pub fn interrupted_priority(&self) -> Option<u32> {
        (self.interrupted_at != 0).then_some(self.interrupted_at)
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    // ── Scheduling ──────────────────────────────────────────────────────────

    /// One scheduler tick. Resuming an unfinished pass skips event and
    /// network processing.
    pub fn step(&mut self, dt: f32, interrupt_at: u32) {
        self.stats.cycles += 1;
        if self.interrupted_at == 0 {
            self.execute_events();
            self.handle_network_messages();
        }
        self.execute(dt, interrupt_at);
    }

    /// Walk the pipes from the highest priority down (or from below the
    /// previous boundary) and execute those that are due. Stops before the
    /// first pipe whose priority is below `interrupt_at`.
    ///
    /// Pipes opened during the walk below the current position are visited
    /// in the same walk.
    pub fn execute(&mut self, dt: f32, interrupt_at: u32) {
        let mut bound = (self.interrupted_at != 0).then_some(self.interrupted_at);
        self.interrupted_at = 0;

        loop {
            let end = match bound {
                Some(bound) => self.pipes.partition_point(|p| p.priority() < bound),
                None => self.pipes.len(),
            };
            let Some(index) = end.checked_sub(1) else {
                break;
            };

            let pipe = &mut self.pipes[index];
            if pipe.priority() < interrupt_at {
                break;
            }
            bound = Some(pipe.priority());

            if pipe.is_empty() || !pipe.advance(dt) {
                continue;
            }
            let run = pipe.execute();
            pipe.flush();
            pipe.rearm();
            self.stats.executions += 1;

            self.apply_requests(run.requests);
            if let Some(emission) = run.merged {
                self.dispatch_emission(emission);
            }
        }

        // The next call resumes below the boundary even if no pipe sits there.
        if interrupt_at != 0 {
            self.interrupted_at = interrupt_at;
            tracing::trace!("Pass interrupted at priority {}", interrupt_at);
        }
    }

    fn dispatch_emission(&mut self, emission: MergerEmission) {
        let Some(output) = self.pipe_mut(emission.output) else {
            tracing::warn!("Merger output pipe {} is gone", emission.output);
            return;
        };
        let (_, requests) = output.execute_after_merger(emission.value);
        self.stats.merger_emissions += 1;
        self.apply_requests(requests);
    }

    fn apply_requests(&mut self, requests: Vec<StageRequest>) {
        for request in requests {
            match request {
                StageRequest::Forward {
                    pipe_id,
                    owner,
                    value,
                } => match self
                    .pipes
                    .iter_mut()
                    .find(|p| p.pipe_id() == pipe_id && p.owner() == owner)
                {
                    Some(pipe) => pipe.push(value),
                    None => tracing::debug!("Forward to closed pipe {} dropped", pipe_id),
                },
                StageRequest::OpenPipe { fields, options } => {
                    let fields = fields.with_from_network(options.from_network);
                    if self.get_pipe(&fields, options.owner).is_some() {
                        continue;
                    }
                    if let Err(e) = self.open_pipe(&fields, options) {
                        tracing::warn!("Stage-requested pipe not opened: {}", e);
                    }
                }
                StageRequest::Send {
                    channel,
                    message,
                    transport,
                } => match self.network.as_mut() {
                    Some(network) => network.send(message, channel, transport),
                    None => tracing::trace!("No network, message on channel {} dropped", channel),
                },
            }
        }
    }

    fn execute_events(&mut self) {
        let events = match self.events.as_mut() {
            Some(bus) => bus.drain_pending(),
            None => return,
        };
        for event in events {
            tracing::debug!("Executing event '{}'", event.name());
            event.execute(self);
        }
    }

    /// Push received transform updates into the remote end of their pipe.
    fn handle_network_messages(&mut self) {
        let messages = match self.network.as_mut() {
            Some(network) => network.pop_all(TRANSFORM_CHANNEL),
            None => return,
        };
        for mut message in messages {
            let update = match TransformUpdate::decode(&mut message) {
                Ok(update) => update,
                Err(e) => {
                    tracing::warn!("Malformed transform update: {}", e);
                    continue;
                }
            };
            self.stats.network_updates += 1;

            let pipe_id = update.pipe_id.with_from_network(true);
            let Some(owner) = self.owners.resolve(update.owner) else {
                tracing::info!("Update for {} from unknown owner {} dropped", pipe_id, update.owner);
                self.stats.dropped_updates += 1;
                continue;
            };
            let target = self
                .pipes
                .iter_mut()
                .find(|p| p.pipe_id() == pipe_id && p.owner() == owner);
            match target {
                Some(pipe) => pipe.push(update.value),
                None => {
                    tracing::info!("No pipe {} for {}, update dropped", pipe_id, owner);
                    self.stats.dropped_updates += 1;
                }
            }
        }
    }
}

impl Drop for TransformManager {
    fn drop(&mut self) {
        if !self.pipes.is_empty() {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for TransformManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformManager")
            .field("pipes", &self.pipes.len())
            .field("pipe_templates", &self.pipe_templates.len())
            .field("merger_templates", &self.merger_templates.len())
            .field("interrupted_at", &self.interrupted_at)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::pipeline::events::{ChannelEventBus, ClosePipeEvent, OpenPipeEvent};
    use crate::pipeline::factory::{ModifierFactory, ModifierKind, ModifierSpec};
    use crate::pipeline::id::{IdField, PipeMask};
    use crate::pipeline::modifier::{Modifier, SharingPolicy, StageContext};
    use crate::pipeline::network::{LoopbackNetwork, NetMessage, StaticOwnerRegistry, Transport};

    const LOCAL: OwnerId = OwnerId(1);
    const REMOTE: OwnerId = OwnerId(2);

    type Trace = Rc<RefCell<Vec<(u32, f32)>>>;

    /// Records (priority, x) of every value it sees.
    struct Recorder(Trace);

    impl Modifier for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn execute(&mut self, prev: &Transformation, ctx: &mut StageContext<'_>) -> Transformation {
            self.0.borrow_mut().push((ctx.priority, prev.position[0]));
            *prev
        }
    }

    struct RecorderFactory(Trace);

    impl ModifierFactory for RecorderFactory {
        fn kind(&self) -> ModifierKind {
            ModifierKind::Plugin("recorder".into())
        }

        fn sharing(&self) -> SharingPolicy {
            SharingPolicy::PerPipe
        }

        fn create(&self, _spec: &ModifierSpec) -> PipelineResult<Box<dyn Modifier>> {
            Ok(Box::new(Recorder(Rc::clone(&self.0))))
        }
    }

    fn recorder() -> StageConfig {
        StageConfig::new(ModifierSpec::Plugin {
            name: "recorder".into(),
            params: serde_json::Value::Null,
        })
    }

    fn manager() -> (TransformManager, Trace) {
        let trace = Trace::default();
        let mut manager =
            TransformManager::new(StaticOwnerRegistry::new(LOCAL).with_remote(REMOTE));
        manager
            .modifiers_mut()
            .register(Box::new(RecorderFactory(Rc::clone(&trace))));
        (manager, trace)
    }

    fn recording_manager() -> (TransformManager, Trace) {
        let (mut manager, trace) = manager();
        manager.add_pipe_template(PipeTemplateConfig::new(PipeMask::any()).with_stage(recorder()));
        (manager, trace)
    }

    fn fields(src: u32, dst: u32) -> PipeIdFields {
        PipeIdFields::new(src, dst, 0, 0, 0, 5, false).unwrap()
    }

    fn at(x: f32) -> Transformation {
        Transformation::from_position([x, 0.0, 0.0])
    }

    #[test]
    fn test_colliding_priorities_are_bumped_in_order() {
        let (mut manager, _) = recording_manager();
        let keys: Vec<PipeKey> = (0..4)
            .map(|src| {
                manager
                    .open_pipe(&fields(src, 1), PipeOptions::new(10, LOCAL))
                    .unwrap()
            })
            .collect();

        let priorities: Vec<u32> = keys
            .iter()
            .map(|k| manager.pipe(*k).unwrap().priority())
            .collect();
        assert_eq!(priorities, vec![10, 11, 12, 13]);
        assert_eq!(manager.priorities(), vec![13, 12, 11, 10]);
    }

    #[test]
    fn test_interrupted_pass_resumes_below_boundary() {
        let (mut manager, trace) = recording_manager();
        for (src, priority) in [(1, 60), (2, 80), (3, 40)] {
            let key = manager
                .open_pipe(&fields(src, 1), PipeOptions::new(priority, LOCAL))
                .unwrap();
            manager.push(key, at(priority as f32)).unwrap();
        }

        manager.execute(0.016, 50);
        assert_eq!(
            trace.borrow().iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            vec![80, 60]
        );
        assert_eq!(manager.interrupted_priority(), Some(50));

        trace.borrow_mut().clear();
        manager.execute(0.016, 0);
        assert_eq!(*trace.borrow(), vec![(40, 40.0)]);
        assert_eq!(manager.interrupted_priority(), None);
    }

    #[test]
    fn test_boundary_kept_when_no_pipe_below() {
        let (mut manager, trace) = recording_manager();
        for (src, priority) in [(1, 80), (2, 60)] {
            let key = manager
                .open_pipe(&fields(src, 1), PipeOptions::new(priority, LOCAL))
                .unwrap();
            manager.push(key, at(priority as f32)).unwrap();
        }

        manager.execute(0.016, 50);
        assert_eq!(trace.borrow().len(), 2);
        assert_eq!(manager.interrupted_priority(), Some(50));

        trace.borrow_mut().clear();
        manager.execute(0.016, 0);
        assert!(trace.borrow().is_empty());
        assert_eq!(manager.interrupted_priority(), None);

        manager.execute(0.016, 0);
        assert_eq!(
            trace.borrow().iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            vec![80, 60]
        );
    }

    #[test]
    fn test_step_resume_skips_network() {
        let (mut manager, trace) = recording_manager();
        let (mut peer, local) = LoopbackNetwork::pair();
        manager.set_network(Box::new(local));

        let high = manager
            .open_pipe(&fields(1, 1), PipeOptions::new(80, LOCAL))
            .unwrap();
        let remote = manager
            .open_pipe(&fields(2, 1), PipeOptions::new(40, REMOTE).from_network(true))
            .unwrap();
        manager.push(high, at(1.0)).unwrap();
        manager.step(0.016, 50);
        assert_eq!(trace.borrow().len(), 1);

        let update = TransformUpdate {
            owner: REMOTE.0,
            pipe_id: fields(2, 1).pack(),
            value: at(7.0),
        };
        peer.send(update.to_message(), TRANSFORM_CHANNEL, Transport::Udp);

        manager.step(0.016, 0);
        assert!(manager.pipe(remote).unwrap().is_empty());
        manager.step(0.016, 0);
        assert_eq!(manager.pipe(remote).unwrap().latest(), Some(at(7.0)));
        assert_eq!(trace.borrow().last(), Some(&(40, 7.0)));
    }

    #[test]
    fn test_empty_pipes_are_skipped() {
        let (mut manager, trace) = recording_manager();
        manager
            .open_pipe(&fields(1, 1), PipeOptions::new(10, LOCAL))
            .unwrap();
        manager.step(0.016, 0);
        assert!(trace.borrow().is_empty());
        assert_eq!(manager.stats().executions, 0);
    }

    #[test]
    fn test_duplicate_pipe_is_rejected() {
        let (mut manager, _) = recording_manager();
        manager
            .open_pipe(&fields(1, 1), PipeOptions::new(10, LOCAL))
            .unwrap();
        let err = manager
            .open_pipe(&fields(1, 1), PipeOptions::new(20, LOCAL))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicatePipe { owner, .. } if owner == LOCAL));

        // Same fields, other owner or other end: distinct pipes.
        manager
            .open_pipe(&fields(1, 1), PipeOptions::new(10, REMOTE))
            .unwrap();
        manager
            .open_pipe(&fields(1, 1), PipeOptions::new(10, LOCAL).from_network(true))
            .unwrap();
        assert_eq!(manager.pipe_count(), 3);
    }

    #[test]
    fn test_unmatched_pipe_is_configuration_mismatch() {
        let (mut manager, _) = manager();
        manager.add_pipe_template(PipeTemplateConfig::new(PipeMask::any().with(IdField::DstId, 3)));
        let err = manager
            .open_pipe(&fields(1, 1), PipeOptions::new(10, LOCAL))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConfigurationMismatch { .. }));
        assert_eq!(manager.pipe_count(), 0);
        manager
            .open_pipe(&fields(1, 3), PipeOptions::new(10, LOCAL))
            .unwrap();
    }

    fn merger_manager(max_inputs: usize) -> (TransformManager, Trace) {
        let (mut manager, trace) = manager();
        manager.add_merger_template(MergerTemplateConfig {
            id: "trio".into(),
            strategy: Default::default(),
            max_inputs: Some(max_inputs),
            inputs: vec![PipeMask::any().with(IdField::DstId, 1)],
            outputs: vec![PipeMask::any().with(IdField::SrcId, 0)],
        });
        manager.add_pipe_template(
            PipeTemplateConfig::new(PipeMask::any().with(IdField::DstId, 1))
                .with_merger("trio", 0)
                .with_stage(recorder()),
        );
        (manager, trace)
    }

    #[test]
    fn test_merger_barrier_through_manager() {
        let (mut manager, trace) = merger_manager(3);
        let keys: Vec<PipeKey> = (0..3)
            .map(|src| {
                manager
                    .open_pipe(&fields(src, 1), PipeOptions::new(10 + src, LOCAL))
                    .unwrap()
            })
            .collect();

        let shared = manager.pipe(keys[0]).unwrap().merger().unwrap().clone();
        for key in &keys[1..] {
            assert!(Rc::ptr_eq(&shared, manager.pipe(*key).unwrap().merger().unwrap()));
        }
        assert_eq!(manager.live_merger_count(), 1);

        // Lowest priority reports last, so the barrier opens at the end of a pass.
        manager.push(keys[2], at(9.0)).unwrap();
        manager.push(keys[1], at(6.0)).unwrap();
        manager.step(0.016, 0);
        assert_eq!(manager.stats().merger_emissions, 0);
        assert!(trace.borrow().is_empty());

        manager.push(keys[0], at(3.0)).unwrap();
        manager.step(0.016, 0);
        assert_eq!(manager.stats().merger_emissions, 1);
        assert_eq!(trace.borrow().len(), 1);
        let (priority, x) = trace.borrow()[0];
        assert_eq!(priority, 10);
        assert!((x - 6.0).abs() < 1e-4);
        assert_eq!(shared.borrow().dirty_count(), 0);
    }

    #[test]
    fn test_full_merger_leaves_extra_pipe_unmerged() {
        let (mut manager, _) = merger_manager(2);
        let keys: Vec<PipeKey> = (0..3)
            .map(|src| {
                manager
                    .open_pipe(&fields(src, 1), PipeOptions::new(10, LOCAL))
                    .unwrap()
            })
            .collect();
        assert!(manager.pipe(keys[1]).unwrap().merger().is_some());
        // A second merger instance takes the third pipe.
        assert_eq!(manager.live_merger_count(), 2);
        assert!(!Rc::ptr_eq(
            manager.pipe(keys[0]).unwrap().merger().unwrap(),
            manager.pipe(keys[2]).unwrap().merger().unwrap()
        ));
    }

    #[test]
    fn test_closing_pipes_releases_merger() {
        let (mut manager, _) = merger_manager(3);
        let a = manager
            .open_pipe(&fields(0, 1), PipeOptions::new(10, LOCAL))
            .unwrap();
        let b = manager
            .open_pipe(&fields(1, 1), PipeOptions::new(11, LOCAL))
            .unwrap();
        let merger = Rc::downgrade(manager.pipe(a).unwrap().merger().unwrap());

        manager.close_pipe(a).unwrap();
        assert_eq!(merger.upgrade().unwrap().borrow().input_count(), 1);
        manager.close_pipe(b).unwrap();
        assert!(merger.upgrade().is_none());
        assert_eq!(manager.live_merger_count(), 0);
        assert!(matches!(
            manager.close_pipe(a),
            Err(PipelineError::UnknownPipe(_))
        ));
    }

    #[test]
    fn test_target_pipe_opened_below_and_fed_in_same_pass() {
        let (mut manager, trace) = manager();
        let target = fields(4, 3);
        manager.add_pipe_template(
            PipeTemplateConfig::new(PipeMask::any().with(IdField::DstId, 2))
                .with_stage(StageConfig::new(ModifierSpec::TargetPipe { target })),
        );
        manager.add_pipe_template(
            PipeTemplateConfig::new(PipeMask::any().with(IdField::DstId, 3)).with_stage(recorder()),
        );

        let source = manager
            .open_pipe(&fields(1, 2), PipeOptions::new(10, LOCAL))
            .unwrap();
        manager.push(source, at(2.0)).unwrap();
        manager.step(0.016, 0);

        assert_eq!(manager.pipe_count(), 2);
        assert!(manager.get_pipe(&target, LOCAL).is_some());
        assert_eq!(*trace.borrow(), vec![(9, 2.0)]);

        manager.push(source, at(3.0)).unwrap();
        manager.step(0.016, 0);
        assert_eq!(manager.pipe_count(), 2);
        assert_eq!(trace.borrow().last(), Some(&(9, 3.0)));
    }

    #[test]
    fn test_network_updates_for_unknown_pipes_are_dropped() {
        let (mut manager, _) = recording_manager();
        let (mut peer, local) = LoopbackNetwork::pair();
        manager.set_network(Box::new(local));
        let remote = manager
            .open_pipe(&fields(1, 1), PipeOptions::new(5, REMOTE).from_network(true))
            .unwrap();

        for (owner, src) in [(REMOTE.0, 1), (REMOTE.0, 2), (9, 1)] {
            let update = TransformUpdate {
                owner,
                pipe_id: fields(src, 1).pack(),
                value: at(1.0),
            };
            peer.send(update.to_message(), TRANSFORM_CHANNEL, Transport::Udp);
        }
        peer.send(NetMessage::from_bytes(vec![1]), TRANSFORM_CHANNEL, Transport::Udp);
        manager.step(0.016, 0);

        let stats = manager.stats();
        assert_eq!(stats.network_updates, 3);
        assert_eq!(stats.dropped_updates, 2);
        assert_eq!(manager.pipe(remote).unwrap().latest(), Some(at(1.0)));
    }

    #[test]
    fn test_events_open_and_close_pipes() {
        let (mut manager, _) = recording_manager();
        let (sender, bus) = ChannelEventBus::new();
        manager.set_event_bus(Box::new(bus));

        sender
            .send(OpenPipeEvent::single(fields(1, 1), 30, REMOTE, true))
            .unwrap();
        sender
            .send(OpenPipeEvent::single(fields(2, 1), 31, LOCAL, false))
            .unwrap();
        sender
            .send(OpenPipeEvent::single(fields(3, 1), 32, OwnerId(77), false))
            .unwrap();
        manager.step(0.016, 0);

        assert_eq!(manager.pipe_count(), 2);
        let remote = manager
            .find_pipe(fields(1, 1).pack().with_from_network(true), REMOTE)
            .unwrap();
        assert!(manager.pipe(remote).unwrap().is_synchronized());
        assert!(manager.producer(remote).is_some());
        assert!(manager.get_pipe(&fields(2, 1), LOCAL).is_some());

        sender
            .send(ClosePipeEvent::single(fields(1, 1), REMOTE))
            .unwrap();
        manager.step(0.016, 0);
        assert_eq!(manager.pipe_count(), 1);
    }

    #[test]
    fn test_close_all_pipes_from_owner() {
        let (mut manager, _) = recording_manager();
        for src in 0..3 {
            manager
                .open_pipe(&fields(src, 1), PipeOptions::new(1, REMOTE))
                .unwrap();
        }
        manager
            .open_pipe(&fields(0, 1), PipeOptions::new(1, LOCAL))
            .unwrap();
        assert_eq!(manager.close_all_pipes_from_owner(REMOTE), 3);
        assert_eq!(manager.pipe_count(), 1);
        manager.shutdown();
        assert_eq!(manager.pipe_count(), 0);
    }

    #[test]
    fn test_execution_interval_spaces_runs() {
        let (mut manager, trace) = manager();
        manager.add_pipe_template(
            PipeTemplateConfig::new(PipeMask::any())
                .with_stage(recorder())
                .with_execution_interval(1.0),
        );
        let key = manager
            .open_pipe(&fields(1, 1), PipeOptions::new(1, LOCAL))
            .unwrap();
        manager.push(key, at(1.0)).unwrap();

        let mut runs = Vec::new();
        for step in 0..3 {
            manager.step(0.4, 0);
            runs.push((step, trace.borrow().len()));
        }
        assert_eq!(runs, vec![(0, 1), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_flush_quorum_from_template() {
        let (mut manager, _) = manager();
        manager.add_pipe_template(PipeTemplateConfig::new(PipeMask::any()).with_flush_quorum(2));
        let key = manager
            .open_pipe(&fields(1, 1), PipeOptions::new(1, LOCAL))
            .unwrap();
        for i in 0..5 {
            manager.push(key, at(i as f32)).unwrap();
        }
        manager.step(0.016, 0);
        let pipe = manager.pipe(key).unwrap();
        assert_eq!(pipe.len(), 2);
        assert_eq!(pipe.get(0).unwrap().value, at(3.0));
    }

    #[test]
    fn test_failed_stage_releases_shared_instances() {
        let (mut manager, _) = manager();
        manager.add_pipe_template(
            PipeTemplateConfig::new(PipeMask::any())
                .with_stage(StageConfig::new(ModifierSpec::Offset {
                    offset: at(1.0),
                    pre_multiply: false,
                }))
                .with_stage(StageConfig::passthrough(ModifierSpec::SinkWriter)),
        );

        let result = manager.open_pipe(&fields(1, 1), PipeOptions::new(10, LOCAL));
        assert!(matches!(
            result,
            Err(PipelineError::UnknownModifier(kind)) if kind == "sink_writer"
        ));
        assert_eq!(manager.pipe_count(), 0);
        assert_eq!(manager.modifiers().shared_instance_count(), 0);
    }

    #[test]
    fn test_load_config_rejects_unknown_references() {
        let (mut manager, _) = manager();

        let mut config = ManagerConfig::default();
        config.pipes.push(
            PipeTemplateConfig::new(PipeMask::any())
                .with_stage(StageConfig::new(ModifierSpec::SinkWriter)),
        );
        assert!(matches!(
            manager.load_config(&config),
            Err(PipelineError::UnknownModifier(kind)) if kind == "sink_writer"
        ));

        let mut config = ManagerConfig::default();
        config
            .pipes
            .push(PipeTemplateConfig::new(PipeMask::any()).with_merger("missing", 0));
        assert!(matches!(
            manager.load_config(&config),
            Err(PipelineError::UnknownMerger(_))
        ));

        let mut config = ManagerConfig::default();
        config.mergers.push(MergerTemplateConfig {
            id: "m".into(),
            strategy: Default::default(),
            max_inputs: None,
            inputs: vec![PipeMask::any()],
            outputs: vec![PipeMask::any()],
        });
        config
            .pipes
            .push(PipeTemplateConfig::new(PipeMask::any()).with_merger("m", 1));
        assert!(matches!(
            manager.load_config(&config),
            Err(PipelineError::InvalidConfig(_))
        ));

        assert!(manager
            .open_pipe(&fields(1, 1), PipeOptions::new(1, LOCAL))
            .is_err());
    }

    #[test]
    fn test_sample_config_loads_with_sink() {
        let (mut manager, _) = manager();
        manager
            .modifiers_mut()
            .set_sink(Rc::new(crate::pipeline::modifiers::TracingSink));
        manager.load_config(&ManagerConfig::sample()).unwrap();
        let head = manager
            .open_pipe(&fields(0, 2), PipeOptions::new(50, LOCAL))
            .unwrap();
        assert_eq!(manager.pipe(head).unwrap().stage_count(), 4);
    }

    #[test]
    fn test_pack_helpers() {
        let f = fields(3, 4);
        let id = TransformManager::pack_pipe_id(&f).unwrap();
        assert_eq!(TransformManager::unpack_pipe_id(id), f);
        let bad = PipeIdFields {
            dst_id: 128,
            ..f
        };
        assert!(TransformManager::pack_pipe_id(&bad).is_err());
    }
}
