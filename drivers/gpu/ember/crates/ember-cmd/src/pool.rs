//! # Command Buffer Pool
//!
//! Reuse pool for command streams.
//!
//! Blocked commands take a standalone stream from here and give it back once
//! their fragment has been copied into an engine stream. Engines grow their
//! own stream through the pool as well.

use alloc::vec::Vec;

use ember_core::{ByteSize, Error, GpuAddr, Result};
use spin::Mutex;

use crate::stream::CommandStream;

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// Command buffer pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Default buffer size
    pub buffer_size: ByteSize,
    /// Maximum number of live buffers
    pub max_buffers: u32,
    /// GPU address the first buffer is placed at
    pub base: GpuAddr,
    /// Pool name for debugging
    pub name: &'static str,
}

impl PoolConfig {
    /// Pool for engine command streams and blocked fragments
    pub const fn command_buffer(count: u32) -> Self {
        Self {
            buffer_size: ByteSize::from_kib(64),
            max_buffers: count,
            base: GpuAddr::new(0x1_0000_0000),
            name: "command_pool",
        }
    }

    /// Set the default buffer size
    pub const fn with_buffer_size(mut self, size: ByteSize) -> Self {
        self.buffer_size = size;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::command_buffer(256)
    }
}

// =============================================================================
// POOL
// =============================================================================

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Buffers created
    pub created: u32,
    /// Acquisitions served from the free list
    pub reused: u64,
    /// Acquisitions refused at the cap
    pub exhausted: u64,
    /// Highest number of live buffers
    pub peak_live: u32,
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<CommandStream>,
    live: u32,
    next_addr: GpuAddr,
    stats: PoolStats,
}

/// Reuse pool of command streams
#[derive(Debug)]
pub struct CommandBufferPool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl CommandBufferPool {
    /// Create an empty pool
    pub fn new(config: PoolConfig) -> Self {
        let next_addr = config.base;
        Self {
            config,
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                live: 0,
                next_addr,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Default buffer size
    pub fn buffer_size(&self) -> ByteSize {
        self.config.buffer_size
    }

    /// Take a stream holding at least `min_bytes`
    pub fn acquire(&self, min_bytes: usize) -> Result<CommandStream> {
        let mut inner = self.inner.lock();

        if let Some(pos) = inner.free.iter().position(|s| s.capacity_bytes() >= min_bytes) {
            let stream = inner.free.swap_remove(pos);
            inner.live += 1;
            inner.stats.reused += 1;
            inner.stats.peak_live = inner.stats.peak_live.max(inner.live);
            return Ok(stream);
        }

        let total = inner.live + inner.free.len() as u32;
        if total >= self.config.max_buffers {
            // A too-small free buffer can make room for a larger one
            if inner.free.is_empty() {
                inner.stats.exhausted += 1;
                log::warn!("{}: {} buffers live, refusing allocation", self.config.name, inner.live);
                return Err(Error::OutOfCommandBuffers);
            }
            inner.free.pop();
        }

        let size = ByteSize::from_bytes((min_bytes as u64).max(self.config.buffer_size.as_bytes()));
        let id = inner.stats.created;
        let addr = inner.next_addr;
        inner.next_addr = addr.offset(size.as_bytes());
        inner.stats.created += 1;
        inner.live += 1;
        inner.stats.peak_live = inner.stats.peak_live.max(inner.live);

        log::trace!("{}: new buffer {} ({:?}) at {}", self.config.name, id, size, addr);
        Ok(CommandStream::new(id, addr, size))
    }

    /// Return a stream for reuse
    pub fn release(&self, mut stream: CommandStream) {
        stream.reset();
        let mut inner = self.inner.lock();
        inner.live = inner.live.saturating_sub(1);
        inner.free.push(stream);
    }

    /// Number of streams handed out and not returned
    pub fn live_count(&self) -> u32 {
        self.inner.lock().live
    }

    /// Number of streams waiting for reuse
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Snapshot of the statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats.clone()
    }
}
