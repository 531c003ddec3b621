//! # Engine Selection
//!
//! Chooses the engine(s) that run a transfer. Kernel dispatches and requests
//! without a workload always stay on the queue's primary engine.
//!
//! Decision order:
//! 1. explicit preference override
//! 2. copy-only queue: its bound engine
//! 3. locality / layout heuristics
//! 4. load: in-order queues copy from a size threshold on, out-of-order
//!    queues copy while the compute engine is busy
//!
//! Only engines declaring the needed capabilities are chosen. Without one,
//! the transfer falls back to the primary engine.

use std::sync::Arc;

use ember_cmd::{EngineCaps, EngineTarget};
use ember_core::TransferDirection;

use crate::config::{EnginePreference, QueueConfig};
use crate::request::RequestKind;
use crate::split::{self, EngineList, SplitPlan};

/// Where a request runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The queue's compute engine, or its bound copy engine
    Primary,
    /// One copy engine, by index within the queue
    Copy(usize),
    /// Several copy engines
    Split(EngineList),
}

impl Route {
    /// Check if copy engines are involved
    #[inline]
    pub fn uses_copy_engines(&self) -> bool {
        !matches!(self, Route::Primary)
    }
}

/// Properties of a transfer the selector looks at
#[derive(Debug, Clone, Copy)]
struct TransferShape {
    caps: EngineCaps,
    direction: Option<TransferDirection>,
    size: u64,
    dst_compressed: bool,
}

impl TransferShape {
    fn of(kind: &RequestKind) -> Option<Self> {
        let (mut caps, direction, size, dst) = match kind {
            RequestKind::Copy(region) => (EngineCaps::LINEAR_COPY, Some(region.direction()), region.size, &region.dst),
            RequestKind::CopyImage(region) => (EngineCaps::IMAGE_COPY, Some(region.direction()), region.size, &region.dst),
            RequestKind::Fill(fill) => (EngineCaps::FILL, None, fill.size, &fill.dst),
            _ => return None,
        };
        if dst.is_compressed() {
            caps |= EngineCaps::COMPRESSED_SURFACES;
        }
        Some(Self {
            caps,
            direction,
            size,
            dst_compressed: dst.is_compressed(),
        })
    }
}

/// Engine selector of one queue
#[derive(Debug)]
pub struct EngineSelector<'a> {
    config: &'a QueueConfig,
    primary: &'a EngineTarget,
    copies: &'a [Arc<EngineTarget>],
}

impl<'a> EngineSelector<'a> {
    /// Selector over a queue's engines
    pub fn new(config: &'a QueueConfig, primary: &'a EngineTarget, copies: &'a [Arc<EngineTarget>]) -> Self {
        Self {
            config,
            primary,
            copies,
        }
    }

    /// Route for `kind`
    pub fn select(&self, kind: &RequestKind) -> Route {
        let Some(shape) = TransferShape::of(kind) else {
            return Route::Primary;
        };

        match self.config.engine_preference {
            EnginePreference::ForceCompute => return Route::Primary,
            EnginePreference::ForceCopy => return self.copy_route(kind, &shape),
            EnginePreference::Heuristic => {}
        }

        // A copy-only queue has no other engine to pick
        if self.config.copy_only.is_some() {
            return Route::Primary;
        }

        if !self.primary.supports(shape.caps) {
            return self.copy_route(kind, &shape);
        }
        if self.config.prefer_copy_for_device_local && shape.direction.is_some_and(|d| d.crosses_device_local()) {
            return self.copy_route(kind, &shape);
        }
        if self.config.prefer_copy_for_compressed && shape.dst_compressed {
            return self.copy_route(kind, &shape);
        }

        let prefer_copy = if self.config.is_in_order() {
            shape.size >= self.config.copy_amortize_threshold.as_bytes()
        } else {
            self.primary.outstanding() >= self.config.busy_threshold.max(1)
        };
        if prefer_copy {
            self.copy_route(kind, &shape)
        } else {
            Route::Primary
        }
    }

    fn copy_route(&self, kind: &RequestKind, shape: &TransferShape) -> Route {
        if let RequestKind::Copy(region) = kind {
            if let Some(engines) = split::split_engines(self.config, region, self.copies) {
                log::debug!(
                    "split {} bytes across {} copy engines",
                    region.size,
                    engines.len()
                );
                return Route::Split(engines);
            }
        }
        match self.least_busy(shape.caps) {
            Some(index) => Route::Copy(index),
            None => {
                log::trace!("no copy engine supports {:?}, staying on {}", shape.caps, self.primary.id());
                Route::Primary
            }
        }
    }

    /// Capable copy engine with the fewest outstanding submissions
    fn least_busy(&self, caps: EngineCaps) -> Option<usize> {
        self.copies
            .iter()
            .enumerate()
            .filter(|(_, engine)| engine.supports(caps) && !engine.is_hung())
            .min_by_key(|(_, engine)| engine.outstanding())
            .map(|(i, _)| i)
    }
}

/// Partition plan of a routed copy
pub fn plan_for(route: &Route, region: &ember_cmd::CopyRegion) -> Option<SplitPlan> {
    match route {
        Route::Primary => None,
        Route::Copy(index) => Some(SplitPlan::single(region, *index)),
        Route::Split(engines) => Some(SplitPlan::new(region, engines)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHardware;
    use crate::split::Partition;
    use arrayvec::ArrayVec;
    use ember_cmd::{CopyRegion, FillRegion, SurfaceLayout, SurfaceRef};
    use ember_core::{BufferHandle, ByteSize, EngineId, GpuAddr, MemoryLocality};

    fn surface(locality: MemoryLocality) -> SurfaceRef {
        SurfaceRef::linear(BufferHandle::from_raw(9), GpuAddr::new(0x8000), ByteSize::from_mib(64), locality)
    }

    fn copy(size: u64, src: MemoryLocality, dst: MemoryLocality) -> RequestKind {
        RequestKind::Copy(CopyRegion {
            src: surface(src),
            dst: surface(dst),
            src_offset: 0,
            dst_offset: 0,
            size,
        })
    }

    struct Engines {
        hw: MockHardware,
        compute: Arc<EngineTarget>,
        copies: Vec<Arc<EngineTarget>>,
    }

    fn engines(copies: u32) -> Engines {
        let hw = MockHardware::new();
        let compute = hw.engine_compute(EngineId(0));
        let copies = (1..=copies).map(|i| hw.engine_copy(EngineId(i))).collect();
        Engines { hw, compute, copies }
    }

    #[test]
    fn test_host_copy_stays_on_compute_in_order() {
        let e = engines(1);
        let config = QueueConfig::in_order();
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        let kind = copy(4096, MemoryLocality::System, MemoryLocality::System);
        assert_eq!(selector.select(&kind), Route::Primary);

        let large = copy(ByteSize::from_mib(8).as_bytes(), MemoryLocality::System, MemoryLocality::System);
        assert_eq!(selector.select(&large), Route::Copy(0));
    }

    #[test]
    fn test_device_local_crossing_prefers_copy() {
        let e = engines(2);
        let config = QueueConfig::in_order();
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        let kind = copy(4096, MemoryLocality::System, MemoryLocality::DeviceLocal);
        assert!(matches!(selector.select(&kind), Route::Copy(_)));
    }

    #[test]
    fn test_override_wins() {
        let e = engines(1);
        let config = QueueConfig::in_order().with_engine_preference(EnginePreference::ForceCompute);
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        let kind = copy(4096, MemoryLocality::System, MemoryLocality::DeviceLocal);
        assert_eq!(selector.select(&kind), Route::Primary);

        let config = QueueConfig::in_order().with_engine_preference(EnginePreference::ForceCopy);
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        let kind = copy(16, MemoryLocality::System, MemoryLocality::System);
        assert_eq!(selector.select(&kind), Route::Copy(0));
    }

    #[test]
    fn test_out_of_order_follows_compute_load() {
        let e = engines(1);
        let config = QueueConfig::out_of_order();
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        let kind = copy(4096, MemoryLocality::System, MemoryLocality::System);
        assert_eq!(selector.select(&kind), Route::Primary);

        e.hw.flush_empty(&e.compute);
        assert_eq!(selector.select(&kind), Route::Copy(0));
        e.hw.retire_all();
        assert_eq!(selector.select(&kind), Route::Primary);
    }

    #[test]
    fn test_least_busy_copy_engine() {
        let e = engines(2);
        e.hw.flush_empty(&e.copies[0]);
        let config = QueueConfig::in_order();
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        let kind = copy(4096, MemoryLocality::DeviceLocal, MemoryLocality::System);
        assert_eq!(selector.select(&kind), Route::Copy(1));
    }

    #[test]
    fn test_incapable_engines_fall_back() {
        let hw = MockHardware::new();
        let compute = hw.engine_compute(EngineId(0));
        let copies = vec![hw.engine_with_caps(EngineId(1), EngineCaps::LINEAR_COPY)];
        let config = QueueConfig::in_order().with_engine_preference(EnginePreference::ForceCopy);
        let selector = EngineSelector::new(&config, &compute, &copies);

        let fill = RequestKind::Fill(FillRegion {
            dst: surface(MemoryLocality::DeviceLocal),
            offset: 0,
            size: 64,
            pattern: [0u8; 4].into_iter().collect::<ArrayVec<u8, 128>>(),
        });
        assert_eq!(selector.select(&fill), Route::Primary);
    }

    #[test]
    fn test_compressed_destination_prefers_copy() {
        let e = engines(1);
        let config = QueueConfig::in_order();
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        let mut region = CopyRegion {
            src: surface(MemoryLocality::System),
            dst: surface(MemoryLocality::System),
            src_offset: 0,
            dst_offset: 0,
            size: 256,
        };
        region.dst = region.dst.with_layout(SurfaceLayout::TiledCompressed);
        assert_eq!(selector.select(&RequestKind::CopyImage(region)), Route::Copy(0));
    }

    #[test]
    fn test_split_route_and_plan() {
        let e = engines(2);
        let config = QueueConfig::out_of_order().with_split_threshold(ByteSize::from_mib(1));
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        let kind = copy(ByteSize::from_mib(8).as_bytes(), MemoryLocality::System, MemoryLocality::DeviceLocal);
        let route = selector.select(&kind);
        assert!(matches!(route, Route::Split(ref engines) if engines.len() == 2));

        let RequestKind::Copy(region) = kind else { unreachable!() };
        let plan = plan_for(&route, &region).unwrap();
        let sizes: Vec<u64> = plan.partitions().iter().map(|p: &Partition| p.region.size).collect();
        assert_eq!(sizes, [4 << 20, 4 << 20]);
    }

    #[test]
    fn test_non_transfers_stay_primary() {
        let e = engines(1);
        let config = QueueConfig::in_order().with_engine_preference(EnginePreference::ForceCopy);
        let selector = EngineSelector::new(&config, &e.compute, &e.copies);
        assert_eq!(selector.select(&RequestKind::Marker), Route::Primary);
        assert_eq!(selector.select(&RequestKind::Migrate(vec![])), Route::Primary);
    }
}
