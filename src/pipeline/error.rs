//! Pipeline-specific error types.

use crate::pipeline::id::{OwnerId, PipeId, PipeKey};
use thiserror::Error;

/// Errors that can occur within the pipe system.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No pipe template matches the requested identity.
    #[error("No pipe configuration matches pipe {pipe_id}")]
    ConfigurationMismatch { pipe_id: PipeId },

    #[error("Pipe {pipe_id} already open for {owner}")]
    DuplicatePipe { pipe_id: PipeId, owner: OwnerId },

    #[error("Pipe {pipe_id} does not match any input mask of merger '{merger_id}'")]
    MergerMaskMismatch { merger_id: String, pipe_id: PipeId },

    #[error("Merger '{merger_id}' already has {max} inputs")]
    MergerCapacity { merger_id: String, max: usize },

    #[error("Pipe {pipe_id} is already attached to a merger")]
    MergerAlreadyAttached { pipe_id: PipeId },

    #[error("Identity field {field} = {value} exceeds maximum {max}")]
    OutOfRangeIdentityField {
        field: &'static str,
        value: u32,
        max: u32,
    },

    #[error("Unknown modifier: {0}")]
    UnknownModifier(String),

    #[error("Unknown merger: {0}")]
    UnknownMerger(String),

    #[error("Unknown pipe: {0}")]
    UnknownPipe(PipeKey),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Channel closed")]
    ChannelClosed,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
