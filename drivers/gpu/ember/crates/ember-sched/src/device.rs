//! # Device
//!
//! Engines and collaborators of one root device.

use std::fmt;
use std::sync::Arc;
use std::vec::Vec;

use ember_cmd::{CommandBufferPool, CommandEncoder, EngineTarget, ResidencyManager};
use ember_core::{EngineKind, Error, Result};

use crate::config::QueueConfig;
use crate::queue::CommandQueue;
use crate::split::MAX_COPY_ENGINES;

/// One root device
#[derive(Clone)]
pub struct Device {
    index: u32,
    compute: Arc<EngineTarget>,
    copies: Vec<Arc<EngineTarget>>,
    encoder: Arc<dyn CommandEncoder>,
    residency: Arc<dyn ResidencyManager>,
    pool: Arc<CommandBufferPool>,
}

impl Device {
    /// Group engines and collaborators
    pub fn new(
        index: u32,
        compute: Arc<EngineTarget>,
        copies: Vec<Arc<EngineTarget>>,
        encoder: Arc<dyn CommandEncoder>,
        residency: Arc<dyn ResidencyManager>,
        pool: Arc<CommandBufferPool>,
    ) -> Result<Self> {
        if compute.kind() != EngineKind::Compute || compute.device() != index {
            return Err(Error::InvalidParameter);
        }
        if copies.len() > MAX_COPY_ENGINES {
            return Err(Error::InvalidParameter);
        }
        if copies.iter().any(|e| e.kind() != EngineKind::Copy || e.device() != index) {
            return Err(Error::InvalidParameter);
        }

        log::debug!(
            "device {}: {} + {} copy engines, encoder {}",
            index,
            compute.id(),
            copies.len(),
            encoder.name()
        );
        Ok(Self {
            index,
            compute,
            copies,
            encoder,
            residency,
            pool,
        })
    }

    /// Root device index
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Compute engine
    #[inline]
    pub fn compute(&self) -> &Arc<EngineTarget> {
        &self.compute
    }

    /// Copy engines
    #[inline]
    pub fn copy_engines(&self) -> &[Arc<EngineTarget>] {
        &self.copies
    }

    /// Command encoder
    #[inline]
    pub fn encoder(&self) -> &Arc<dyn CommandEncoder> {
        &self.encoder
    }

    /// Residency manager
    #[inline]
    pub fn residency(&self) -> &Arc<dyn ResidencyManager> {
        &self.residency
    }

    /// Command buffer pool
    #[inline]
    pub fn pool(&self) -> &Arc<CommandBufferPool> {
        &self.pool
    }

    /// Create a queue
    pub fn create_queue(&self, config: QueueConfig) -> Result<Arc<CommandQueue>> {
        CommandQueue::new(self, config)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("compute", &self.compute.id())
            .field("copies", &self.copies.len())
            .field("encoder", &self.encoder.name())
            .finish()
    }
}

static_assertions::assert_impl_all!(Device: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHardware;
    use ember_cmd::{AlwaysResident, EngineDesc, MethodEncoder};
    use ember_core::EngineId;

    #[test]
    fn test_rejects_mismatched_engines() {
        let hw = MockHardware::new();
        let compute = hw.engine_compute(EngineId(0));
        let foreign = hw.engine_on_device(EngineDesc::copy(EngineId(1)).with_device(1));
        let result = Device::new(
            0,
            compute.clone(),
            vec![foreign],
            Arc::new(MethodEncoder::new()),
            Arc::new(AlwaysResident),
            hw.pool().clone(),
        );
        assert_eq!(result.err(), Some(Error::InvalidParameter));

        let result = Device::new(
            0,
            hw.engine_copy(EngineId(2)),
            vec![],
            Arc::new(MethodEncoder::new()),
            Arc::new(AlwaysResident),
            hw.pool().clone(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_fixture_device() {
        let device = MockHardware::new().device(2);
        assert_eq!(device.copy_engines().len(), 2);
        assert_eq!(device.compute().kind(), EngineKind::Compute);
    }
}
