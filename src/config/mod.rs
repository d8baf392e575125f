//! Configuration for a `TransformManager`.
//!
//! A `ManagerConfig` lists pipe templates (selector, ordered stages, optional
//! merger attachment) and merger templates. It is stored as TOML or JSON,
//! chosen by file extension.
//!
//! # Example
//!
//! ```toml
//! tick_rate_hz = 60
//!
//! [[mergers]]
//! id = "hands"
//! max_inputs = 2
//! inputs = [{ dst_id = 1, object_id = "equal" }]
//! outputs = [{ src_id = 0 }]
//!
//! [[pipes]]
//! selector = { dst_id = 1 }
//! merger = { merger_id = "hands", before_stage = 1 }
//!
//! [[pipes.stages]]
//! spec = { kind = "offset", offset = { position = [0.0, 1.5, 0.0] } }
//!
//! [[pipes.stages]]
//! spec = { kind = "sink_writer" }
//! output = "passthrough"
//! ```

use crate::error::{PosePipeError, Result};
use crate::pipeline::factory::ModifierSpec;
use crate::pipeline::id::{FieldPattern, IdField, PipeIdFields, PipeMask};
use crate::pipeline::merger::MergerSpec;
use crate::pipeline::modifier::OutputMode;
use crate::pipeline::modifiers::LogSampling;
use crate::pipeline::network::Transport;
use crate::transform::Transformation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default scheduler rate in Hz
pub const DEFAULT_TICK_RATE_HZ: u32 = 60;

/// Default number of queued values kept after each execution
pub const DEFAULT_FLUSH_QUORUM: usize = 10;

// ==================== Manager Config ====================

/// Top-level manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Scheduler steps per second for the headless runner
    pub tick_rate_hz: u32,

    /// Quorum used by pipes whose template sets none
    pub default_flush_quorum: usize,

    /// Optional log file (in addition to stderr)
    pub log_file: Option<PathBuf>,

    /// Where the runner dumps the transform log on shutdown
    pub transform_log_file: Option<PathBuf>,

    pub mergers: Vec<MergerTemplateConfig>,

    /// Pipe templates, first match wins
    pub pipes: Vec<PipeTemplateConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: DEFAULT_TICK_RATE_HZ,
            default_flush_quorum: DEFAULT_FLUSH_QUORUM,
            log_file: None,
            transform_log_file: None,
            mergers: Vec::new(),
            pipes: Vec::new(),
        }
    }
}

// ==================== Templates ====================

/// Merger created on demand when a pipe attaches to `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergerTemplateConfig {
    pub id: String,

    #[serde(default)]
    pub strategy: MergerSpec,

    #[serde(default)]
    pub max_inputs: Option<usize>,

    pub inputs: Vec<PipeMask>,

    #[serde(default)]
    pub outputs: Vec<PipeMask>,
}

/// Stage slot of a pipe template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub spec: ModifierSpec,

    #[serde(default)]
    pub output: OutputMode,
}

impl StageConfig {
    pub fn new(spec: ModifierSpec) -> Self {
        Self {
            spec,
            output: OutputMode::Result,
        }
    }

    pub fn passthrough(spec: ModifierSpec) -> Self {
        Self {
            spec,
            output: OutputMode::Passthrough,
        }
    }
}

/// Merger attachment of a pipe template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergerAttachConfig {
    pub merger_id: String,

    /// Stages with an index below this run before the merger
    pub before_stage: usize,

    /// Only pipes of the template that also match this mask attach
    #[serde(default)]
    pub mask: PipeMask,
}

/// Stages and timing for every pipe matching `selector`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeTemplateConfig {
    #[serde(default)]
    pub selector: PipeMask,

    #[serde(default)]
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub merger: Option<MergerAttachConfig>,

    /// Minimum seconds between executions
    #[serde(default)]
    pub execution_interval: Option<f32>,

    #[serde(default)]
    pub flush_quorum: Option<usize>,
}

impl PipeTemplateConfig {
    pub fn new(selector: PipeMask) -> Self {
        Self {
            selector,
            stages: Vec::new(),
            merger: None,
            execution_interval: None,
            flush_quorum: None,
        }
    }

    pub fn with_stage(mut self, stage: StageConfig) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_merger(mut self, merger_id: impl Into<String>, before_stage: usize) -> Self {
        self.merger = Some(MergerAttachConfig {
            merger_id: merger_id.into(),
            before_stage,
            mask: PipeMask::any(),
        });
        self
    }

    pub fn with_execution_interval(mut self, seconds: f32) -> Self {
        self.execution_interval = Some(seconds);
        self
    }

    pub fn with_flush_quorum(mut self, quorum: usize) -> Self {
        self.flush_quorum = Some(quorum);
        self
    }
}

// ==================== Load / Save ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(ConfigFormat::Toml),
            Some("json") => Ok(ConfigFormat::Json),
            other => Err(PosePipeError::Config(format!(
                "Unsupported config extension {:?} for {:?}",
                other, path
            ))),
        }
    }
}

impl ManagerConfig {
    /// Load a configuration file (`.toml` or `.json`)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| PosePipeError::from(e).with_context(format!("Reading {:?}", path)))?;
        Self::parse(&content, format).map_err(|e| e.with_context(format!("{:?}", path)))
    }

    fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| PosePipeError::Config(format!("Failed to parse TOML: {}", e))),
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| PosePipeError::Config(format!("Failed to parse JSON: {}", e))),
        }
    }

    /// Load a configuration, falling back to the sample on any error
    pub fn load_or_sample(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Using sample configuration: {}", e);
                Self::sample()
            }
        }
    }

    /// Save as TOML or JSON depending on the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PosePipeError::from(e).with_context(format!("Creating {:?}", parent))
                })?;
            }
        }

        let content = match format {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| PosePipeError::Serialization(e.to_string()))?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| PosePipeError::Serialization(e.to_string()))?,
        };

        std::fs::write(path, content)
            .map_err(|e| PosePipeError::from(e).with_context(format!("Writing {:?}", path)))
    }

    /// Demo setup: two tracked hands of one user are merged into a body pipe,
    /// head pipes get an eye-height offset, everything is logged and written
    /// to the sink, and local heads are distributed over the network.
    pub fn sample() -> Self {
        let hands = PipeMask::any()
            .with(IdField::DstId, 1)
            .with(IdField::ObjectId, FieldPattern::Equal);

        let merger = MergerTemplateConfig {
            id: "hands".into(),
            strategy: MergerSpec::Average,
            max_inputs: Some(2),
            inputs: vec![hands],
            outputs: vec![PipeMask::any().with(IdField::SrcId, 0)],
        };

        let hand_pipes = PipeTemplateConfig::new(PipeMask::any().with(IdField::DstId, 1))
            .with_stage(StageConfig::new(ModifierSpec::ChangeInterrupter {
                epsilon: crate::transform::DEFAULT_EPSILON,
            }))
            .with_merger("hands", 1)
            .with_stage(StageConfig::passthrough(ModifierSpec::SinkWriter));

        let head_pipes = PipeTemplateConfig::new(PipeMask::any().with(IdField::DstId, 2))
            .with_stage(StageConfig::new(ModifierSpec::Offset {
                offset: Transformation::from_position([0.0, 1.7, 0.0]),
                pre_multiply: false,
            }))
            .with_stage(StageConfig::passthrough(ModifierSpec::Logger {
                sampling: LogSampling::Iterations { every: 10 },
            }))
            .with_stage(StageConfig::passthrough(ModifierSpec::Distribution {
                transport: Transport::Udp,
            }))
            .with_stage(StageConfig::new(ModifierSpec::TargetPipe {
                target: PipeIdFields {
                    src_id: 2,
                    dst_id: 3,
                    ..PipeIdFields::default()
                },
            }));

        let sink_pipes = PipeTemplateConfig::new(PipeMask::any())
            .with_stage(StageConfig::passthrough(ModifierSpec::SinkWriter))
            .with_flush_quorum(2);

        Self {
            mergers: vec![merger],
            pipes: vec![hand_pipes, head_pipes, sink_pipes],
            ..Self::default()
        }
    }

    /// Seconds per scheduler step
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.tick_rate_hz.max(1) as f64)
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_default() {
        let config = ManagerConfig::default();
        assert_eq!(config.tick_rate_hz, 60);
        assert_eq!(config.default_flush_quorum, 10);
        assert!(config.pipes.is_empty());
    }

    #[test]
    fn test_sample_toml_round_trip() {
        let config = ManagerConfig::sample();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ManagerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_sample_json_round_trip() {
        let config = ManagerConfig::sample();
        let text = serde_json::to_string_pretty(&config).unwrap();
        let parsed: ManagerConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_minimal_toml() {
        let parsed: ManagerConfig = toml::from_str(
            r#"
            tick_rate_hz = 30

            [[pipes]]
            selector = { src_id = 1, object_id = "any" }

            [[pipes.stages]]
            spec = { kind = "logger" }
            output = "passthrough"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.tick_rate_hz, 30);
        assert_eq!(parsed.default_flush_quorum, DEFAULT_FLUSH_QUORUM);
        let template = &parsed.pipes[0];
        assert_eq!(template.selector.src_id, FieldPattern::Value(1));
        assert_eq!(template.selector.dst_id, FieldPattern::Any);
        assert_eq!(template.stages[0].output, OutputMode::Passthrough);
        assert_eq!(
            template.stages[0].spec,
            ModifierSpec::Logger {
                sampling: LogSampling::default()
            }
        );
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let err = ManagerConfig::default().save("config.yaml").unwrap_err();
        assert!(err.to_string().contains("Unsupported config extension"));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = ManagerConfig::load(dir.path().join("absent.toml")).unwrap_err();
        match err {
            PosePipeError::WithContext { context, source } => {
                assert!(context.contains("absent.toml"));
                assert!(matches!(*source, PosePipeError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_tick_interval() {
        let config = ManagerConfig {
            tick_rate_hz: 50,
            ..ManagerConfig::default()
        };
        assert_eq!(config.tick_interval().as_millis(), 20);
    }
}
