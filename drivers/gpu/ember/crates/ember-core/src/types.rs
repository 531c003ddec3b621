//! # Ember Core Types
//!
//! Strongly typed identifiers shared by every layer of the submission path.

use core::fmt;
use core::marker::PhantomData;
use core::ops::Add;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU Virtual Address
///
/// An address in the GPU's virtual address space. Not a CPU pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Upper 32 bits, as programmed into method pairs
    #[inline]
    pub const fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Lower 32 bits
    #[inline]
    pub const fn low(self) -> u32 {
        self.0 as u32
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero bytes
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Check if zero
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: u64 = 1024 * 1024;
        if self.0 >= MIB && self.0 % MIB == 0 {
            write!(f, "{} MiB", self.0 / MIB)
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Typed opaque handle to an object owned by an external collaborator
pub struct Handle<T> {
    raw: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create from raw value
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Get raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.raw
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Handle<T> {}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.raw)
    }
}

/// Marker for buffer and image objects
#[derive(Debug)]
pub enum BufferMarker {}

/// Marker for kernel objects
#[derive(Debug)]
pub enum KernelMarker {}

/// Handle to a buffer or image object
pub type BufferHandle = Handle<BufferMarker>;

/// Handle to a kernel object
pub type KernelHandle = Handle<KernelMarker>;

// =============================================================================
// ENGINES
// =============================================================================

/// Identifier of one physical engine within the driver
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct EngineId(pub u32);

impl fmt::Debug for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Engine#{}", self.0)
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine{}", self.0)
    }
}

/// Engine kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// General purpose compute engine
    Compute,
    /// Copy / blit engine
    Copy,
}

impl EngineKind {
    /// Short name used in logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Compute => "ccs",
            Self::Copy => "bcs",
        }
    }
}

// =============================================================================
// MEMORY LOCALITY
// =============================================================================

/// Where a surface lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocality {
    /// Host system memory
    #[default]
    System,
    /// Device-local memory
    DeviceLocal,
}

/// Direction of a transfer, derived from the two localities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// System memory to system memory
    HostToHost,
    /// System memory to device-local memory
    HostToLocal,
    /// Device-local memory to system memory
    LocalToHost,
    /// Device-local memory to device-local memory
    LocalToLocal,
}

impl TransferDirection {
    /// Direction of a transfer from `src` to `dst`
    pub const fn between(src: MemoryLocality, dst: MemoryLocality) -> Self {
        match (src, dst) {
            (MemoryLocality::System, MemoryLocality::System) => Self::HostToHost,
            (MemoryLocality::System, MemoryLocality::DeviceLocal) => Self::HostToLocal,
            (MemoryLocality::DeviceLocal, MemoryLocality::System) => Self::LocalToHost,
            (MemoryLocality::DeviceLocal, MemoryLocality::DeviceLocal) => Self::LocalToLocal,
        }
    }

    /// Whether one side is device-local and the other is not
    pub const fn crosses_device_local(self) -> bool {
        matches!(self, Self::HostToLocal | Self::LocalToHost)
    }
}

// =============================================================================
// PRIORITY
// =============================================================================

/// Queue priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum QueuePriority {
    /// Background work
    Low,
    /// Default
    #[default]
    Normal,
    /// Latency sensitive
    High,
}

/// Queue throttle hint passed along with every flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Throttle {
    /// Power saving
    Low,
    /// Default
    #[default]
    Medium,
    /// Maximum clocks
    High,
}

static_assertions::assert_impl_all!(BufferHandle: Send, Sync, Copy);
static_assertions::assert_eq_size!(GpuAddr, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_between() {
        use MemoryLocality::*;
        assert_eq!(TransferDirection::between(System, DeviceLocal), TransferDirection::HostToLocal);
        assert_eq!(TransferDirection::between(DeviceLocal, System), TransferDirection::LocalToHost);
        assert!(!TransferDirection::between(DeviceLocal, DeviceLocal).crosses_device_local());
        assert!(!TransferDirection::between(System, System).crosses_device_local());
    }

    #[test]
    fn test_gpu_addr_halves() {
        let addr = GpuAddr::new(0x1_2345_6789);
        assert_eq!(addr.high(), 0x1);
        assert_eq!(addr.low(), 0x2345_6789);
        assert_eq!(addr.offset(0x10).raw(), 0x1_2345_6799);
    }

    #[test]
    fn test_byte_size() {
        assert_eq!(ByteSize::from_mib(1).as_bytes(), 1 << 20);
        assert_eq!(ByteSize::from_kib(4).as_bytes(), 4096);
        assert!(ByteSize::ZERO.is_zero());
    }
}
