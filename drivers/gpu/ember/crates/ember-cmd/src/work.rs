//! # Work Descriptors
//!
//! Normalized shape of the work a request asks an engine to perform.

use alloc::vec::Vec;

use arrayvec::ArrayVec;
use ember_core::{BufferHandle, ByteSize, GpuAddr, KernelHandle, MemoryLocality, TransferDirection};

/// Largest fill pattern in bytes
pub const MAX_FILL_PATTERN: usize = 128;

// =============================================================================
// SURFACES
// =============================================================================

/// Memory layout of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceLayout {
    /// Plain linear memory
    #[default]
    Linear,
    /// Tiled texture surface
    Tiled,
    /// Tiled surface with lossless compression
    TiledCompressed,
}

/// A buffer or image touched by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceRef {
    /// Owning object
    pub handle: BufferHandle,
    /// GPU address of the first byte
    pub gpu_addr: GpuAddr,
    /// Size of the surface
    pub size: ByteSize,
    /// Where the surface lives
    pub locality: MemoryLocality,
    /// Layout
    pub layout: SurfaceLayout,
}

impl SurfaceRef {
    /// Linear surface
    pub const fn linear(handle: BufferHandle, gpu_addr: GpuAddr, size: ByteSize, locality: MemoryLocality) -> Self {
        Self {
            handle,
            gpu_addr,
            size,
            locality,
            layout: SurfaceLayout::Linear,
        }
    }

    /// Set the layout
    pub const fn with_layout(mut self, layout: SurfaceLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Check if `offset..offset + len` lies inside the surface
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .is_some_and(|end| end <= self.size.as_bytes())
    }

    /// Check if the surface is tiled and compressed
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.layout == SurfaceLayout::TiledCompressed
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Kernel launch shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDispatch {
    /// Kernel object
    pub kernel: KernelHandle,
    /// Work-group counts
    pub groups: [u32; 3],
    /// Work-group size
    pub group_size: [u32; 3],
}

/// Linear byte range copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Source surface
    pub src: SurfaceRef,
    /// Destination surface
    pub dst: SurfaceRef,
    /// Offset into source
    pub src_offset: u64,
    /// Offset into destination
    pub dst_offset: u64,
    /// Bytes to copy
    pub size: u64,
}

impl CopyRegion {
    /// Direction of the copy
    pub fn direction(&self) -> TransferDirection {
        TransferDirection::between(self.src.locality, self.dst.locality)
    }
}

/// Pattern fill
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillRegion {
    /// Destination surface
    pub dst: SurfaceRef,
    /// Offset into destination
    pub offset: u64,
    /// Bytes to fill
    pub size: u64,
    /// Repeated pattern
    pub pattern: ArrayVec<u8, MAX_FILL_PATTERN>,
}

/// Direction of an auxiliary (compression) translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxDirection {
    /// Resolve compressed data before a kernel reads it
    AuxToNonAux,
    /// Recompress after the kernel wrote it
    NonAuxToAux,
}

/// Work an engine executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkPayload {
    /// Kernel launch
    Kernel(KernelDispatch),
    /// Linear or image copy
    Copy(CopyRegion),
    /// Pattern fill
    Fill(FillRegion),
    /// Compression translation of one surface
    AuxTranslation {
        /// Surface being translated
        surface: SurfaceRef,
        /// Direction
        direction: AuxDirection,
    },
    /// Cache flush / migration of the listed surfaces
    CacheFlush,
}

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// One unit of work plus the surfaces it touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDescriptor {
    /// What to execute
    pub payload: WorkPayload,
    /// Surfaces referenced beyond those inside the payload
    pub surfaces: Vec<SurfaceRef>,
}

impl WorkDescriptor {
    /// Descriptor without extra surfaces
    pub fn new(payload: WorkPayload) -> Self {
        Self {
            payload,
            surfaces: Vec::new(),
        }
    }

    /// Attach surfaces
    pub fn with_surfaces(mut self, surfaces: Vec<SurfaceRef>) -> Self {
        self.surfaces = surfaces;
        self
    }

    /// Every surface that must be resident before flush
    pub fn residency(&self) -> impl Iterator<Item = &SurfaceRef> + '_ {
        let inline: ArrayVec<&SurfaceRef, 2> = match &self.payload {
            WorkPayload::Copy(region) => [&region.src, &region.dst].into_iter().collect(),
            WorkPayload::Fill(fill) => core::iter::once(&fill.dst).collect(),
            WorkPayload::AuxTranslation { surface, .. } => core::iter::once(surface).collect(),
            WorkPayload::Kernel(_) | WorkPayload::CacheFlush => ArrayVec::new(),
        };
        inline.into_iter().chain(self.surfaces.iter())
    }

    /// Check if the payload is a kernel launch
    #[inline]
    pub fn is_kernel(&self) -> bool {
        matches!(self.payload, WorkPayload::Kernel(_))
    }
}

/// Several dispatches sharing one request
///
/// Compressed surfaces listed in `aux_surfaces` are translated before the
/// first dispatch and recompressed after the last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiWorkDescriptor {
    /// Dispatches in program order
    pub dispatches: Vec<WorkDescriptor>,
    /// Surfaces needing auxiliary translation
    pub aux_surfaces: Vec<SurfaceRef>,
}

impl MultiWorkDescriptor {
    /// Single-dispatch descriptor
    pub fn single(work: WorkDescriptor) -> Self {
        let mut dispatches = Vec::with_capacity(1);
        dispatches.push(work);
        Self {
            dispatches,
            aux_surfaces: Vec::new(),
        }
    }

    /// Attach surfaces needing translation
    pub fn with_aux_surfaces(mut self, surfaces: Vec<SurfaceRef>) -> Self {
        self.aux_surfaces = surfaces;
        self
    }

    /// Check if there is nothing to dispatch
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    /// Number of dispatches
    #[inline]
    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    /// Check if a translation pass is needed
    #[inline]
    pub fn needs_aux_translation(&self) -> bool {
        !self.aux_surfaces.is_empty()
    }

    /// Translation passes for one direction
    pub fn aux_passes(&self, direction: AuxDirection) -> Vec<WorkDescriptor> {
        self.aux_surfaces
            .iter()
            .map(|surface| {
                WorkDescriptor::new(WorkPayload::AuxTranslation {
                    surface: *surface,
                    direction,
                })
            })
            .collect()
    }

    /// Every surface that must be resident before flush
    pub fn residency(&self) -> impl Iterator<Item = &SurfaceRef> + '_ {
        self.dispatches
            .iter()
            .flat_map(|work| work.residency())
            .chain(self.aux_surfaces.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::Handle;

    fn surface(size: u64, locality: MemoryLocality) -> SurfaceRef {
        SurfaceRef::linear(Handle::from_raw(1), GpuAddr::new(0x4000), ByteSize::from_bytes(size), locality)
    }

    #[test]
    fn test_contains_checks_overflow() {
        let s = surface(100, MemoryLocality::System);
        assert!(s.contains(0, 100));
        assert!(!s.contains(50, 51));
        assert!(!s.contains(u64::MAX, 2));
    }

    #[test]
    fn test_copy_residency_includes_both_sides() {
        let region = CopyRegion {
            src: surface(64, MemoryLocality::System),
            dst: surface(64, MemoryLocality::DeviceLocal),
            src_offset: 0,
            dst_offset: 0,
            size: 64,
        };
        assert_eq!(region.direction(), TransferDirection::HostToLocal);
        let work = WorkDescriptor::new(WorkPayload::Copy(region));
        assert_eq!(work.residency().count(), 2);
    }

    #[test]
    fn test_aux_passes_per_surface() {
        let compressed = surface(64, MemoryLocality::DeviceLocal).with_layout(SurfaceLayout::TiledCompressed);
        let kernel = WorkDescriptor::new(WorkPayload::Kernel(KernelDispatch {
            kernel: Handle::from_raw(9),
            groups: [1, 1, 1],
            group_size: [64, 1, 1],
        }));
        let multi = MultiWorkDescriptor::single(kernel).with_aux_surfaces(alloc::vec![compressed]);
        assert!(multi.needs_aux_translation());
        assert_eq!(multi.aux_passes(AuxDirection::AuxToNonAux).len(), 1);
        assert_eq!(multi.residency().count(), 1);
    }
}
