//! Stage factories and the registry that enforces sharing policies.
//!
//! Two-layer design, like the stages themselves:
//! - **`BuiltinFactory` enum** creates the stages shipped with the crate.
//! - **`ModifierFactory` trait** lets callers register their own stage types,
//!   addressed from configuration by `ModifierSpec::Plugin { name, .. }`.
//!
//! The registry decides how many instances exist: a fresh one per pipe, one
//! per (pipe template, stage slot), or one overall.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{PipeIdFields, PipeSelector};
use crate::pipeline::modifier::{Modifier, SharedModifier, SharingPolicy, StageHandle};
use crate::pipeline::modifiers::{
    ChangeInterrupter, DistributionModifier, LogSampling, OffsetModifier, SinkWriter,
    TargetPipeWriter, TransformLog, TransformLogger, TransformSink,
};
use crate::pipeline::network::Transport;
use crate::transform::{Transformation, DEFAULT_EPSILON};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

fn default_epsilon() -> f32 {
    DEFAULT_EPSILON
}

/// Typed stage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModifierSpec {
    Logger {
        #[serde(default)]
        sampling: LogSampling,
    },
    Offset {
        offset: Transformation,
        #[serde(default)]
        pre_multiply: bool,
    },
    SinkWriter,
    TargetPipe {
        target: PipeIdFields,
    },
    Distribution {
        #[serde(default)]
        transport: Transport,
    },
    ChangeInterrupter {
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    Plugin {
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl ModifierSpec {
    pub fn kind(&self) -> ModifierKind {
        match self {
            ModifierSpec::Logger { .. } => ModifierKind::Logger,
            ModifierSpec::Offset { .. } => ModifierKind::Offset,
            ModifierSpec::SinkWriter => ModifierKind::SinkWriter,
            ModifierSpec::TargetPipe { .. } => ModifierKind::TargetPipe,
            ModifierSpec::Distribution { .. } => ModifierKind::Distribution,
            ModifierSpec::ChangeInterrupter { .. } => ModifierKind::ChangeInterrupter,
            ModifierSpec::Plugin { name, .. } => ModifierKind::Plugin(name.clone()),
        }
    }
}

/// Type tag a factory is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModifierKind {
    Logger,
    Offset,
    SinkWriter,
    TargetPipe,
    Distribution,
    ChangeInterrupter,
    Plugin(String),
}

impl fmt::Display for ModifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifierKind::Logger => write!(f, "logger"),
            ModifierKind::Offset => write!(f, "offset"),
            ModifierKind::SinkWriter => write!(f, "sink_writer"),
            ModifierKind::TargetPipe => write!(f, "target_pipe"),
            ModifierKind::Distribution => write!(f, "distribution"),
            ModifierKind::ChangeInterrupter => write!(f, "change_interrupter"),
            ModifierKind::Plugin(name) => write!(f, "plugin:{}", name),
        }
    }
}

/// Creates stage instances of one kind.
pub trait ModifierFactory {
    fn kind(&self) -> ModifierKind;
    fn sharing(&self) -> SharingPolicy;
    fn create(&self, spec: &ModifierSpec) -> PipelineResult<Box<dyn Modifier>>;
}

/// Factories for the built-in stages.
pub enum BuiltinFactory {
    Logger(TransformLog),
    Offset,
    SinkWriter(Rc<dyn TransformSink>),
    TargetPipe,
    Distribution,
    ChangeInterrupter,
}

impl ModifierFactory for BuiltinFactory {
    fn kind(&self) -> ModifierKind {
        match self {
            BuiltinFactory::Logger(_) => ModifierKind::Logger,
            BuiltinFactory::Offset => ModifierKind::Offset,
            BuiltinFactory::SinkWriter(_) => ModifierKind::SinkWriter,
            BuiltinFactory::TargetPipe => ModifierKind::TargetPipe,
            BuiltinFactory::Distribution => ModifierKind::Distribution,
            BuiltinFactory::ChangeInterrupter => ModifierKind::ChangeInterrupter,
        }
    }

    fn sharing(&self) -> SharingPolicy {
        match self {
            BuiltinFactory::Logger(_) => SharingPolicy::PerPipe,
            BuiltinFactory::Offset => SharingPolicy::PerConfiguration,
            BuiltinFactory::SinkWriter(_) => SharingPolicy::PerConfiguration,
            BuiltinFactory::TargetPipe => SharingPolicy::PerPipe,
            BuiltinFactory::Distribution => SharingPolicy::Singleton,
            BuiltinFactory::ChangeInterrupter => SharingPolicy::PerPipe,
        }
    }

    fn create(&self, spec: &ModifierSpec) -> PipelineResult<Box<dyn Modifier>> {
        let modifier: Box<dyn Modifier> = match (self, spec) {
            (BuiltinFactory::Logger(log), ModifierSpec::Logger { sampling }) => {
                Box::new(TransformLogger::new(log.clone(), *sampling))
            }
            (
                BuiltinFactory::Offset,
                ModifierSpec::Offset {
                    offset,
                    pre_multiply,
                },
            ) => Box::new(OffsetModifier::new(*offset, *pre_multiply)),
            (BuiltinFactory::SinkWriter(sink), ModifierSpec::SinkWriter) => {
                Box::new(SinkWriter::new(Rc::clone(sink)))
            }
            (BuiltinFactory::TargetPipe, ModifierSpec::TargetPipe { target }) => {
                target.validate()?;
                Box::new(TargetPipeWriter::new(*target))
            }
            (BuiltinFactory::Distribution, ModifierSpec::Distribution { transport }) => {
                Box::new(DistributionModifier::new(*transport))
            }
            (BuiltinFactory::ChangeInterrupter, ModifierSpec::ChangeInterrupter { epsilon }) => {
                Box::new(ChangeInterrupter::new(*epsilon))
            }
            (factory, spec) => {
                return Err(PipelineError::InvalidConfig(format!(
                    "{} factory cannot build {:?}",
                    factory.kind(),
                    spec.kind()
                )))
            }
        };
        Ok(modifier)
    }
}

/// Owns the factories and the shared stage instances.
pub struct ModifierRegistry {
    factories: HashMap<ModifierKind, Box<dyn ModifierFactory>>,
    per_configuration: HashMap<(ModifierKind, PipeSelector, usize), SharedModifier>,
    singletons: HashMap<ModifierKind, SharedModifier>,
    log: TransformLog,
}

impl ModifierRegistry {
    /// Registry with every built-in factory except the sink writer, which
    /// needs a sink (`set_sink`).
    pub fn new() -> Self {
        let log = TransformLog::new();
        let mut registry = Self {
            factories: HashMap::new(),
            per_configuration: HashMap::new(),
            singletons: HashMap::new(),
            log: log.clone(),
        };
        registry.register(Box::new(BuiltinFactory::Logger(log)));
        registry.register(Box::new(BuiltinFactory::Offset));
        registry.register(Box::new(BuiltinFactory::TargetPipe));
        registry.register(Box::new(BuiltinFactory::Distribution));
        registry.register(Box::new(BuiltinFactory::ChangeInterrupter));
        registry
    }

    pub fn set_sink(&mut self, sink: Rc<dyn TransformSink>) {
        self.register(Box::new(BuiltinFactory::SinkWriter(sink)));
    }

    pub fn register(&mut self, factory: Box<dyn ModifierFactory>) {
        let kind = factory.kind();
        if self.factories.insert(kind.clone(), factory).is_some() {
            tracing::warn!("Modifier factory '{}' replaced", kind);
        }
    }

    pub fn contains(&self, kind: &ModifierKind) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn sharing(&self, kind: &ModifierKind) -> Option<SharingPolicy> {
        self.factories.get(kind).map(|f| f.sharing())
    }

    pub fn transform_log(&self) -> &TransformLog {
        &self.log
    }

    /// Stage instance for slot `stage_index` of the template selected by
    /// `group`, honouring the factory's sharing policy.
    pub fn instantiate(
        &mut self,
        spec: &ModifierSpec,
        group: PipeSelector,
        stage_index: usize,
    ) -> PipelineResult<StageHandle> {
        let kind = spec.kind();
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| PipelineError::UnknownModifier(kind.to_string()))?;

        match factory.sharing() {
            SharingPolicy::PerPipe => Ok(StageHandle::Owned(factory.create(spec)?)),
            SharingPolicy::PerConfiguration => {
                let key = (kind, group, stage_index);
                if let Some(shared) = self.per_configuration.get(&key) {
                    return Ok(StageHandle::Shared(Rc::clone(shared)));
                }
                let shared: SharedModifier = Rc::new(RefCell::new(factory.create(spec)?));
                tracing::debug!("Created shared '{}' stage for slot {}", key.0, stage_index);
                self.per_configuration.insert(key, Rc::clone(&shared));
                Ok(StageHandle::Shared(shared))
            }
            SharingPolicy::Singleton => {
                if let Some(shared) = self.singletons.get(&kind) {
                    return Ok(StageHandle::Shared(Rc::clone(shared)));
                }
                let shared: SharedModifier = Rc::new(RefCell::new(factory.create(spec)?));
                tracing::debug!("Created singleton '{}' stage", kind);
                self.singletons.insert(kind, Rc::clone(&shared));
                Ok(StageHandle::Shared(shared))
            }
        }
    }

    /// Drop shared instances no pipe holds any more. Returns how many.
    pub fn release_unused(&mut self) -> usize {
        let before = self.shared_instance_count();
        self.per_configuration
            .retain(|_, shared| Rc::strong_count(shared) > 1);
        self.singletons
            .retain(|_, shared| Rc::strong_count(shared) > 1);
        let released = before - self.shared_instance_count();
        if released > 0 {
            tracing::debug!("Released {} shared stage instances", released);
        }
        released
    }

    pub fn shared_instance_count(&self) -> usize {
        self.per_configuration.len() + self.singletons.len()
    }
}

impl Default for ModifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}
