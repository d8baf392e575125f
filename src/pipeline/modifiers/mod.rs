//! Built-in pipeline stages.

pub mod distribution;
pub mod interrupter;
pub mod logger;
pub mod offset;
pub mod target_pipe;
pub mod writer;

pub use distribution::DistributionModifier;
pub use interrupter::ChangeInterrupter;
pub use logger::{LogRecord, LogSampling, TransformLog, TransformLogger};
pub use offset::OffsetModifier;
pub use target_pipe::TargetPipeWriter;
pub use writer::{SinkTarget, SinkWriter, TracingSink, TransformSink};
