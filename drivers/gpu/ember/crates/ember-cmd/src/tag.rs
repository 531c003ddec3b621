//! # Dependency Tags
//!
//! Hardware-visible tag slots that one engine writes and another engine
//! waits on.
//!
//! A [`TagPool`] is a fixed ring of slots owned by one engine. A
//! [`DependencyToken`] is an arena + index handle to a slot. Cloning a token
//! takes a reference, dropping the last reference returns the slot to the
//! pool. A slot is never handed out again while any token still points at it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicU32, Ordering};

use ember_core::{EngineId, Error, GpuAddr, Result};
use spin::Mutex;

/// Packet value before the hardware reached the tag
pub const PACKET_PENDING: u32 = 1;
/// Packet value written by the hardware
pub const PACKET_SIGNALLED: u32 = 0;
/// Bytes between two slots in GPU memory
pub const TAG_SLOT_SIZE: u64 = 64;

// =============================================================================
// TAG SLOT
// =============================================================================

#[derive(Debug)]
struct TagSlot {
    /// Hardware-visible packet word
    packet: AtomicU32,
    /// Live token references
    refs: AtomicU32,
    /// Bumped on every allocation
    generation: AtomicU32,
}

impl TagSlot {
    const fn new() -> Self {
        Self {
            packet: AtomicU32::new(PACKET_SIGNALLED),
            refs: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }
}

// =============================================================================
// TAG POOL
// =============================================================================

/// Tag pool statistics
#[derive(Debug, Clone, Default)]
pub struct TagPoolStats {
    /// Successful allocations
    pub allocations: u64,
    /// Slots returned
    pub releases: u64,
    /// Refused allocations
    pub exhausted: u64,
}

/// Fixed-size ring of tag slots owned by one engine
pub struct TagPool {
    engine: EngineId,
    device: u32,
    base: GpuAddr,
    slots: Box<[TagSlot]>,
    free: Mutex<Vec<u32>>,
    stats: Mutex<TagPoolStats>,
}

impl TagPool {
    /// Create a pool of `capacity` slots at `base`
    pub fn new(engine: EngineId, device: u32, base: GpuAddr, capacity: u32) -> Arc<Self> {
        let slots = (0..capacity).map(|_| TagSlot::new()).collect::<Vec<_>>().into_boxed_slice();
        // Lowest index first
        let free = (0..capacity).rev().collect();
        Arc::new(Self {
            engine,
            device,
            base,
            slots,
            free: Mutex::new(free),
            stats: Mutex::new(TagPoolStats::default()),
        })
    }

    /// Engine that owns the pool
    #[inline]
    pub fn engine(&self) -> EngineId {
        self.engine
    }

    /// Root device of the owning engine
    #[inline]
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Total slots
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Slots ready for allocation
    pub fn available(&self) -> u32 {
        self.free.lock().len() as u32
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> TagPoolStats {
        self.stats.lock().clone()
    }

    /// Take a fresh pending slot
    pub fn allocate(self: &Arc<Self>) -> Result<DependencyToken> {
        let index = match self.free.lock().pop() {
            Some(index) => index,
            None => {
                self.stats.lock().exhausted += 1;
                log::warn!("{}: tag pool exhausted ({} slots)", self.engine, self.capacity());
                return Err(Error::TagPoolExhausted);
            }
        };

        let slot = &self.slots[index as usize];
        slot.packet.store(PACKET_PENDING, Ordering::Release);
        slot.refs.store(1, Ordering::Release);
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.lock().allocations += 1;

        Ok(DependencyToken {
            pool: Arc::clone(self),
            index,
            generation,
        })
    }

    fn release(&self, index: u32) {
        self.free.lock().push(index);
        self.stats.lock().releases += 1;
    }

    fn slot(&self, index: u32) -> &TagSlot {
        &self.slots[index as usize]
    }
}

impl fmt::Debug for TagPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagPool")
            .field("engine", &self.engine)
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .finish()
    }
}

// =============================================================================
// DEPENDENCY TOKEN
// =============================================================================

/// Reference-counted handle to one tag slot
pub struct DependencyToken {
    pool: Arc<TagPool>,
    index: u32,
    generation: u32,
}

impl DependencyToken {
    /// Engine whose pool owns the slot
    #[inline]
    pub fn engine(&self) -> EngineId {
        self.pool.engine
    }

    /// Root device of the owning engine
    #[inline]
    pub fn device(&self) -> u32 {
        self.pool.device
    }

    /// Slot index within the pool
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// GPU address of the packet word
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.pool.base.offset(self.index as u64 * TAG_SLOT_SIZE)
    }

    /// Check if the hardware has written the slot
    #[inline]
    pub fn is_signalled(&self) -> bool {
        self.pool.slot(self.index).packet.load(Ordering::Acquire) == PACKET_SIGNALLED
    }

    /// Hardware-side write of the slot
    ///
    /// Pending to signalled only; the slot stays signalled until it is
    /// reallocated.
    #[inline]
    pub fn signal(&self) {
        self.pool.slot(self.index).packet.store(PACKET_SIGNALLED, Ordering::Release);
    }

    /// Live references to the slot
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.pool.slot(self.index).refs.load(Ordering::Acquire)
    }

    /// Check if both tokens name the same slot allocation
    #[inline]
    pub fn same_node(&self, other: &DependencyToken) -> bool {
        self == other
    }

    fn key(&self) -> (usize, u32, u32) {
        (Arc::as_ptr(&self.pool) as usize, self.index, self.generation)
    }
}

impl Clone for DependencyToken {
    fn clone(&self) -> Self {
        self.pool.slot(self.index).refs.fetch_add(1, Ordering::AcqRel);
        Self {
            pool: Arc::clone(&self.pool),
            index: self.index,
            generation: self.generation,
        }
    }
}

impl Drop for DependencyToken {
    fn drop(&mut self) {
        if self.pool.slot(self.index).refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.pool.release(self.index);
        }
    }
}

impl PartialEq for DependencyToken {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DependencyToken {}

impl Hash for DependencyToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Debug for DependencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tag({}:{}#{} {})",
            self.engine(),
            self.index,
            self.generation,
            if self.is_signalled() { "signalled" } else { "pending" }
        )
    }
}

static_assertions::assert_impl_all!(DependencyToken: Send, Sync);
static_assertions::assert_impl_all!(TagPool: Send, Sync);
