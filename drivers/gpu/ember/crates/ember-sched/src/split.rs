//! # Split Transfers
//!
//! Partitioning of one linear transfer across several copy engines.

use std::sync::Arc;

use arrayvec::ArrayVec;
use ember_cmd::{CopyRegion, EngineCaps, EngineTarget};
use ember_core::TransferDirection;

use crate::config::QueueConfig;

/// Most copy engines a queue drives
pub const MAX_COPY_ENGINES: usize = 8;

/// Copy engine indices of one request
pub type EngineList = ArrayVec<usize, MAX_COPY_ENGINES>;

/// One partition of a split transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Copy engine index within the queue
    pub engine: usize,
    /// The part of the transfer this engine moves
    pub region: CopyRegion,
}

/// Partitions of one transfer, in engine order
#[derive(Debug, Clone, Default)]
pub struct SplitPlan {
    partitions: ArrayVec<Partition, MAX_COPY_ENGINES>,
}

impl SplitPlan {
    /// Divide `region` across `engines`
    ///
    /// Each engine takes an even share of what is left; the last one takes the
    /// remainder.
    pub fn new(region: &CopyRegion, engines: &[usize]) -> Self {
        let mut partitions = ArrayVec::new();
        let mut offset = 0u64;
        let mut remaining = region.size;
        let count = engines.len().min(MAX_COPY_ENGINES);

        for (i, &engine) in engines.iter().take(count).enumerate() {
            let left = (count - i) as u64;
            let size = if left == 1 { remaining } else { remaining / left };
            partitions.push(Partition {
                engine,
                region: CopyRegion {
                    src_offset: region.src_offset + offset,
                    dst_offset: region.dst_offset + offset,
                    size,
                    ..*region
                },
            });
            offset += size;
            remaining -= size;
        }
        Self { partitions }
    }

    /// Plan that keeps the whole transfer on one engine
    pub fn single(region: &CopyRegion, engine: usize) -> Self {
        Self::new(region, &[engine])
    }

    /// Partitions
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Number of partitions
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Total bytes across partitions
    pub fn total(&self) -> u64 {
        self.partitions.iter().map(|p| p.region.size).sum()
    }
}

/// Copy engines a transfer may be split across, if splitting applies
///
/// Only host/device-local crossings are split, only from the configured size
/// on, and only across at least two split-capable engines.
pub fn split_engines(config: &QueueConfig, region: &CopyRegion, copies: &[Arc<EngineTarget>]) -> Option<EngineList> {
    let threshold = config.split_threshold.as_bytes();
    if threshold == 0 || region.size < threshold {
        return None;
    }
    match region.direction() {
        TransferDirection::HostToLocal | TransferDirection::LocalToHost => {}
        TransferDirection::HostToHost | TransferDirection::LocalToLocal => return None,
    }

    let required = EngineCaps::SPLIT_COPY | EngineCaps::LINEAR_COPY;
    let engines: EngineList = copies
        .iter()
        .enumerate()
        .filter(|(_, engine)| engine.supports(required) && !engine.is_hung())
        .map(|(i, _)| i)
        .take(MAX_COPY_ENGINES)
        .collect();

    if engines.len() < 2 || region.size < engines.len() as u64 {
        return None;
    }
    Some(engines)
}
