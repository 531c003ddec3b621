//! # Collaborator Traits
//!
//! Seams to the parts of the driver that live outside the submission path.

use ember_core::{EngineId, Result};

use crate::ring::BatchBuffer;
use crate::work::SurfaceRef;

/// Hardware kick-off and hang reporting
pub trait SubmissionSink: Send + Sync {
    /// Hand a flushed batch to the hardware
    ///
    /// Returning `Err(Error::DeviceLost)` marks the engine hung.
    fn kickoff(&self, batch: BatchBuffer) -> Result<()>;

    /// Check if the engine stopped making progress
    fn is_gpu_hang(&self, engine: EngineId) -> bool;
}

/// Memory residency bookkeeping
pub trait ResidencyManager: Send + Sync {
    /// Make `surface` resident for `engine`; must finish before the flush
    fn make_resident(&self, engine: EngineId, surface: &SurfaceRef) -> Result<()>;

    /// Release a surface whose deferred free completed
    fn release(&self, _surface: &SurfaceRef) {}
}

/// Residency manager for memory that is always resident
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysResident;

impl ResidencyManager for AlwaysResident {
    fn make_resident(&self, _engine: EngineId, _surface: &SurfaceRef) -> Result<()> {
        Ok(())
    }
}
