//! # Submission Ring
//!
//! Bookkeeping of flushed batches that the hardware has not retired yet.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use ember_core::{EngineId, Error, Result, TagCounter, TaskCount, Throttle};

use crate::tag::DependencyToken;

bitflags! {
    /// Flags attached to a flush
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlushFlags: u32 {
        /// Batch starts with a stalling barrier
        const STALLING = 1 << 0;
        /// Caller will block on the result
        const BLOCKING = 1 << 1;
        /// Low-priority queue
        const LOW_PRIORITY = 1 << 2;
        /// Batch only resolves dependencies or flushes caches
        const DEPENDENCY_ONLY = 1 << 3;
        /// Batch was captured while blocked and resubmitted
        const RESUBMITTED = 1 << 4;
    }
}

// =============================================================================
// RING CONFIGURATION
// =============================================================================

/// Submission ring configuration
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Maximum in-flight submissions
    pub max_pending: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self { max_pending: 1024 }
    }
}

// =============================================================================
// BATCH BUFFER
// =============================================================================

/// One flushed batch as handed to the hardware
#[derive(Debug)]
pub struct BatchBuffer {
    /// Target engine
    pub engine: EngineId,
    /// Task count the batch retires
    pub task_count: TaskCount,
    /// Encoded command words
    pub commands: Vec<u32>,
    /// Tags the batch signals when it retires
    pub signals: Vec<DependencyToken>,
    /// Completion tag the hardware writes `task_count` to
    pub completion: Arc<TagCounter>,
    /// Flush flags
    pub flags: FlushFlags,
    /// Throttle hint
    pub throttle: Throttle,
}

impl BatchBuffer {
    /// Hardware-side retirement: signal every tag, then the completion counter
    pub fn retire(self) {
        for token in &self.signals {
            token.signal();
        }
        self.completion.signal(self.task_count);
    }
}

// =============================================================================
// COMMAND RING
// =============================================================================

/// A pending entry in the ring
#[derive(Debug, Clone, Copy)]
pub struct RingEntry {
    /// Task count the entry retires at
    pub task_count: TaskCount,
    /// Size of the batch in bytes
    pub size: u32,
    /// Flush flags
    pub flags: FlushFlags,
}

/// Ring statistics
#[derive(Debug, Clone, Default)]
pub struct RingStats {
    /// Total submissions
    pub total_submissions: u64,
    /// Total completions
    pub total_completions: u64,
    /// Stalls (ring full)
    pub stalls: u64,
}

/// In-flight submission tracker of one engine
#[derive(Debug)]
pub struct CommandRing {
    config: RingConfig,
    pending: VecDeque<RingEntry>,
    stats: RingStats,
}

impl CommandRing {
    /// Create an empty ring
    pub fn new(config: RingConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            stats: RingStats::default(),
        }
    }

    /// Get number of pending submissions
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if ring has space for a submission
    pub fn has_space(&self) -> bool {
        self.pending.len() < self.config.max_pending as usize
    }

    /// Record a submission
    pub fn submit(&mut self, entry: RingEntry) -> Result<()> {
        if !self.has_space() {
            self.stats.stalls += 1;
            return Err(Error::RingOverflow);
        }
        self.pending.push_back(entry);
        self.stats.total_submissions += 1;
        Ok(())
    }

    /// Withdraw the latest entry if it carries `task_count`
    pub fn cancel(&mut self, task_count: TaskCount) {
        if self.pending.back().is_some_and(|e| e.task_count == task_count) {
            self.pending.pop_back();
            self.stats.total_submissions -= 1;
        }
    }

    /// Drop every entry retired by `completed`
    pub fn update_completions(&mut self, completed: TaskCount) {
        while let Some(entry) = self.pending.front() {
            if entry.task_count > completed {
                break;
            }
            self.pending.pop_front();
            self.stats.total_completions += 1;
        }
    }

    /// Get ring statistics
    pub fn stats(&self) -> &RingStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(task_count: TaskCount) -> RingEntry {
        RingEntry {
            task_count,
            size: 64,
            flags: FlushFlags::empty(),
        }
    }

    #[test]
    fn test_overflow_then_retire() {
        let mut ring = CommandRing::new(RingConfig { max_pending: 2 });
        ring.submit(entry(1)).unwrap();
        ring.submit(entry(2)).unwrap();
        assert_eq!(ring.submit(entry(3)), Err(Error::RingOverflow));

        ring.update_completions(1);
        assert_eq!(ring.pending_count(), 1);
        ring.submit(entry(3)).unwrap();
        ring.update_completions(3);
        assert_eq!(ring.pending_count(), 0);
        assert_eq!(ring.stats().total_completions, 3);
        assert_eq!(ring.stats().stalls, 1);
    }

    #[test]
    fn test_cancel_only_latest() {
        let mut ring = CommandRing::new(RingConfig { max_pending: 4 });
        ring.submit(entry(1)).unwrap();
        ring.submit(entry(2)).unwrap();
        ring.cancel(1);
        assert_eq!(ring.pending_count(), 2);
        ring.cancel(2);
        assert_eq!(ring.pending_count(), 1);
        assert_eq!(ring.stats().total_submissions, 1);
    }
}
