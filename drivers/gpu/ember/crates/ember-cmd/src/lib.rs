//! # Ember Command Layer
//!
//! Command streams, dependency tokens and engine targets.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         ember-cmd                            │
//! │                                                              │
//! │   WorkDescriptor ──► CommandEncoder ──► CommandStream        │
//! │                            ▲                  │              │
//! │                      DependencySet            ▼              │
//! │                            ▲            EngineTarget::flush  │
//! │                       TagPool tokens          │              │
//! │                                               ▼              │
//! │                                  BatchBuffer ──► SubmissionSink
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod deps;
pub mod encoder;
pub mod engine;
pub mod pool;
pub mod ring;
pub mod stream;
pub mod tag;
pub mod traits;
pub mod work;

// Re-exports for convenience
pub use deps::{DependencyClass, DependencySet, TaskCountWait};
pub use encoder::{CommandEncoder, MethodEncoder, ProfilingPoint};
pub use engine::{EngineCaps, EngineDesc, EngineState, EngineTarget, FlushRequest};
pub use pool::{CommandBufferPool, PoolConfig};
pub use ring::{BatchBuffer, FlushFlags, RingConfig};
pub use stream::CommandStream;
pub use tag::{DependencyToken, TagPool};
pub use traits::{AlwaysResident, ResidencyManager, SubmissionSink};
pub use work::{
    AuxDirection, CopyRegion, FillRegion, KernelDispatch, MultiWorkDescriptor, SurfaceLayout, SurfaceRef,
    WorkDescriptor, WorkPayload, MAX_FILL_PATTERN,
};
