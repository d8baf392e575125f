//! # posepipe: priority-scheduled transform pipelines
//!
//! Routes pose data (position, orientation, scale) from trackers, local input
//! and network peers through addressable pipes. Every pipe applies an ordered
//! list of stages; groups of pipes can be synchronized and averaged by a
//! merger before their result is written to a sink or sent to peers.
//!
//! ## Architecture
//!
//! - **Identity**: every pipe is addressed by a 64-bit packed id (`PipeId`)
//!   plus the owner (session) that opened it
//! - **Templates**: `ManagerConfig` maps id patterns (`PipeMask`) to stage
//!   lists and merger attachments
//! - **Scheduling**: `TransformManager::step` runs pipes in descending
//!   priority, optionally stopping at a priority boundary and resuming later
//! - **Communication**: crossbeam channels for cross-thread pushes, events and
//!   the loopback network
//!
//! ## Example
//!
//! ```ignore
//! use posepipe::{
//!     config::ManagerConfig,
//!     pipeline::{OwnerId, PipeIdFields, PipeOptions, StaticOwnerRegistry, TransformManager},
//!     Transformation,
//! };
//!
//! let mut manager = TransformManager::new(StaticOwnerRegistry::new(OwnerId(1)));
//! manager.load_config(&config)?;
//!
//! let head = PipeIdFields::new(0, 2, 0, 0, 0, 1, false)?;
//! let key = manager.open_pipe(&head, PipeOptions::new(50, OwnerId(1)))?;
//! manager.push(key, Transformation::from_position([0.0, 1.6, 0.0]))?;
//! manager.step(1.0 / 60.0, 0);
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod transform;

// Re-export commonly used types
pub use config::ManagerConfig;
pub use error::{PosePipeError, Result};
pub use pipeline::{PipeIdFields, PipeKey, PipeOptions, TransformManager};
pub use transform::Transformation;
