//! Test data builders for creating test objects

use super::mock_helpers::{Trace, TraceFactory};
use posepipe::config::{MergerTemplateConfig, PipeTemplateConfig, StageConfig};
use posepipe::pipeline::{
    IdField, MergerSpec, ModifierSpec, OwnerId, PipeIdFields, PipeMask, StaticOwnerRegistry,
    TransformManager,
};
use std::rc::Rc;

pub const LOCAL: OwnerId = OwnerId(1);
pub const REMOTE: OwnerId = OwnerId(2);

/// Builder for pipe identities; unset fields are zero
#[derive(Debug, Default, Clone, Copy)]
pub struct PipeIdBuilder {
    fields: PipeIdFields,
}

impl PipeIdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src(mut self, src_id: u32) -> Self {
        self.fields.src_id = src_id;
        self
    }

    pub fn dst(mut self, dst_id: u32) -> Self {
        self.fields.dst_id = dst_id;
        self
    }

    pub fn object(mut self, object_id: u32) -> Self {
        self.fields.object_id = object_id;
        self
    }

    pub fn build(self) -> PipeIdFields {
        self.fields.validate().expect("test identity in range");
        self.fields
    }
}

/// Stage slot running the tracing plugin registered by `ManagerBuilder`
pub fn trace_stage() -> StageConfig {
    StageConfig::new(ModifierSpec::Plugin {
        name: "trace".into(),
        params: serde_json::Value::Null,
    })
}

/// Average merger over every pipe with `dst_id`, emitting to source 0
pub fn merger_template(id: &str, dst_id: u32, max_inputs: usize) -> MergerTemplateConfig {
    MergerTemplateConfig {
        id: id.into(),
        strategy: MergerSpec::Average,
        max_inputs: Some(max_inputs),
        inputs: vec![PipeMask::any().with(IdField::DstId, dst_id)],
        outputs: vec![PipeMask::any().with(IdField::SrcId, 0)],
    }
}

/// Builder for a manager with a local and a remote owner and the trace plugin
pub struct ManagerBuilder {
    templates: Vec<PipeTemplateConfig>,
    mergers: Vec<MergerTemplateConfig>,
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self {
            templates: Vec::new(),
            mergers: Vec::new(),
        }
    }

    /// Catch-all template with a single trace stage
    pub fn tracing_everything(self) -> Self {
        self.template(PipeTemplateConfig::new(PipeMask::any()).with_stage(trace_stage()))
    }

    pub fn template(mut self, template: PipeTemplateConfig) -> Self {
        self.templates.push(template);
        self
    }

    pub fn merger(mut self, merger: MergerTemplateConfig) -> Self {
        self.mergers.push(merger);
        self
    }

    pub fn build(self) -> (TransformManager, Trace) {
        let trace = Trace::default();
        let mut manager =
            TransformManager::new(StaticOwnerRegistry::new(LOCAL).with_remote(REMOTE));
        manager
            .modifiers_mut()
            .register(Box::new(TraceFactory(Rc::clone(&trace))));
        for merger in self.mergers {
            manager.add_merger_template(merger);
        }
        for template in self.templates {
            manager.add_pipe_template(template);
        }
        (manager, trace)
    }
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_id_builder() {
        let fields = PipeIdBuilder::new().src(1).dst(2).object(5).build();
        assert_eq!(fields.src_id, 1);
        assert_eq!(fields.dst_id, 2);
        assert_eq!(fields.object_id, 5);
        assert!(!fields.from_network);
    }
}
