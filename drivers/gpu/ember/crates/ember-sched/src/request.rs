//! # Requests
//!
//! One client call: what to do, what it waits on, and how the caller wants
//! to observe it.

use std::sync::Arc;
use std::vec::Vec;

use ember_cmd::{
    CopyRegion, FillRegion, MultiWorkDescriptor, SurfaceRef, WorkDescriptor, WorkPayload, MAX_FILL_PATTERN,
};
use ember_core::{Error, Result};

use crate::event::Event;

/// What a request asks for
#[derive(Debug, Clone)]
pub enum RequestKind {
    /// Kernel dispatches on the compute engine
    Dispatch(MultiWorkDescriptor),
    /// Linear buffer copy
    Copy(CopyRegion),
    /// Image copy
    CopyImage(CopyRegion),
    /// Pattern fill
    Fill(FillRegion),
    /// Make surfaces resident and flush caches
    Migrate(Vec<SurfaceRef>),
    /// Order everything before against everything after
    Barrier,
    /// Completion point of everything before
    Marker,
    /// Release surfaces once everything before retired
    Free(Vec<SurfaceRef>),
}

impl RequestKind {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Dispatch(_) => "dispatch",
            RequestKind::Copy(_) => "copy",
            RequestKind::CopyImage(_) => "copy-image",
            RequestKind::Fill(_) => "fill",
            RequestKind::Migrate(_) => "migrate",
            RequestKind::Barrier => "barrier",
            RequestKind::Marker => "marker",
            RequestKind::Free(_) => "free",
        }
    }

    /// Check if the request carries no workload of its own
    ///
    /// Such requests inherit the ordering level instead of advancing it.
    #[inline]
    pub fn is_kernel_less(&self) -> bool {
        matches!(
            self,
            RequestKind::Migrate(_) | RequestKind::Barrier | RequestKind::Marker | RequestKind::Free(_)
        )
    }

    /// Check if barrier
    #[inline]
    pub fn is_barrier(&self) -> bool {
        matches!(self, RequestKind::Barrier)
    }

    /// Single work descriptor of a transfer
    pub fn transfer_work(&self) -> Option<WorkDescriptor> {
        let payload = match self {
            RequestKind::Copy(region) | RequestKind::CopyImage(region) => WorkPayload::Copy(*region),
            RequestKind::Fill(fill) => WorkPayload::Fill(fill.clone()),
            _ => return None,
        };
        Some(WorkDescriptor::new(payload))
    }
}

/// One client call
#[derive(Debug, Clone)]
pub struct Request {
    /// What to do
    pub kind: RequestKind,
    /// Events that must complete first
    pub wait_list: Vec<Arc<Event>>,
    /// Hand an event back to the caller
    pub want_event: bool,
    /// Return only once the request retired
    pub blocking: bool,
}

impl Request {
    /// Request without wait list or event
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            wait_list: Vec::new(),
            want_event: false,
            blocking: false,
        }
    }

    /// Dispatch of several kernels
    pub fn dispatch(work: MultiWorkDescriptor) -> Self {
        Self::new(RequestKind::Dispatch(work))
    }

    /// Dispatch of one kernel
    pub fn kernel(work: WorkDescriptor) -> Self {
        Self::dispatch(MultiWorkDescriptor::single(work))
    }

    /// Buffer copy
    pub fn copy(region: CopyRegion) -> Self {
        Self::new(RequestKind::Copy(region))
    }

    /// Image copy
    pub fn copy_image(region: CopyRegion) -> Self {
        Self::new(RequestKind::CopyImage(region))
    }

    /// Fill
    pub fn fill(fill: FillRegion) -> Self {
        Self::new(RequestKind::Fill(fill))
    }

    /// Migration
    pub fn migrate(surfaces: Vec<SurfaceRef>) -> Self {
        Self::new(RequestKind::Migrate(surfaces))
    }

    /// Barrier
    pub fn barrier() -> Self {
        Self::new(RequestKind::Barrier)
    }

    /// Marker
    pub fn marker() -> Self {
        Self::new(RequestKind::Marker)
    }

    /// Deferred free
    pub fn free(surfaces: Vec<SurfaceRef>) -> Self {
        Self::new(RequestKind::Free(surfaces))
    }

    /// Add events to wait on
    pub fn wait_on<I>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = Arc<Event>>,
    {
        self.wait_list.extend(events);
        self
    }

    /// Ask for an output event
    pub fn with_event(mut self) -> Self {
        self.want_event = true;
        self
    }

    /// Block until retired
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Reject malformed requests
    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            RequestKind::Dispatch(multi) => {
                if multi.is_empty() {
                    return Err(Error::EmptyDispatch);
                }
                if multi.aux_surfaces.iter().any(|s| s.size.is_zero()) {
                    return Err(Error::ZeroSize);
                }
            }
            RequestKind::Copy(region) | RequestKind::CopyImage(region) => {
                if region.size == 0 {
                    return Err(Error::ZeroSize);
                }
                if !region.src.contains(region.src_offset, region.size)
                    || !region.dst.contains(region.dst_offset, region.size)
                {
                    return Err(Error::RangeOutOfBounds);
                }
            }
            RequestKind::Fill(fill) => {
                let len = fill.pattern.len();
                if len == 0 || len > MAX_FILL_PATTERN || !len.is_power_of_two() {
                    return Err(Error::InvalidPattern);
                }
                if fill.size == 0 {
                    return Err(Error::ZeroSize);
                }
                if fill.size % len as u64 != 0 {
                    return Err(Error::InvalidPattern);
                }
                if !fill.dst.contains(fill.offset, fill.size) {
                    return Err(Error::RangeOutOfBounds);
                }
            }
            RequestKind::Migrate(surfaces) => {
                if surfaces.is_empty() {
                    return Err(Error::InvalidParameter);
                }
            }
            RequestKind::Barrier | RequestKind::Marker | RequestKind::Free(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrayvec::ArrayVec;
    use ember_core::{BufferHandle, ByteSize, GpuAddr, MemoryLocality};

    fn buffer(size: u64) -> SurfaceRef {
        SurfaceRef::linear(
            BufferHandle::from_raw(1),
            GpuAddr::new(0x4000_0000),
            ByteSize::from_bytes(size),
            MemoryLocality::System,
        )
    }

    fn fill(pattern: &[u8], size: u64) -> Request {
        Request::fill(FillRegion {
            dst: buffer(4096),
            offset: 0,
            size,
            pattern: pattern.iter().copied().collect::<ArrayVec<u8, MAX_FILL_PATTERN>>(),
        })
    }

    #[test]
    fn test_copy_validation() {
        let region = CopyRegion {
            src: buffer(4096),
            dst: buffer(1024),
            src_offset: 0,
            dst_offset: 512,
            size: 512,
        };
        assert!(Request::copy(region).validate().is_ok());
        assert_eq!(
            Request::copy(CopyRegion { size: 513, ..region }).validate(),
            Err(Error::RangeOutOfBounds)
        );
        assert_eq!(Request::copy(CopyRegion { size: 0, ..region }).validate(), Err(Error::ZeroSize));
    }

    #[test]
    fn test_fill_pattern_rules() {
        assert!(fill(&[1, 2, 3, 4], 64).validate().is_ok());
        assert_eq!(fill(&[1, 2, 3], 63).validate(), Err(Error::InvalidPattern));
        assert_eq!(fill(&[], 64).validate(), Err(Error::InvalidPattern));
        assert_eq!(fill(&[1, 2], 3).validate(), Err(Error::InvalidPattern));
        assert_eq!(fill(&[1], 8192).validate(), Err(Error::RangeOutOfBounds));
    }

    #[test]
    fn test_empty_dispatch_rejected() {
        let request = Request::dispatch(MultiWorkDescriptor::default());
        assert_eq!(request.validate(), Err(Error::EmptyDispatch));
        assert!(Request::marker().validate().is_ok());
        assert_eq!(Request::migrate(Vec::new()).validate(), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_kind_classes() {
        assert!(RequestKind::Barrier.is_kernel_less());
        assert!(RequestKind::Barrier.transfer_work().is_none());
        assert!(Request::copy(CopyRegion {
            src: buffer(8),
            dst: buffer(8),
            src_offset: 0,
            dst_offset: 0,
            size: 8,
        })
        .kind
        .transfer_work()
        .is_some());
    }
}
