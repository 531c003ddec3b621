//! # Completion Primitives
//!
//! Host-side records of engine progress.
//!
//! Every engine owns a [`TagCounter`] that the hardware writes with the task
//! count of the last retired submission. A flush produces a
//! [`CompletionStamp`]; clients see [`CompletionToken`]s.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::types::{EngineId, GpuAddr};

/// Per-engine submission counter value
pub type TaskCount = u32;

/// Monotonic flush marker for cross-process waits
pub type FlushStamp = u64;

// =============================================================================
// COMPLETION STAMP
// =============================================================================

/// Result of a flush
///
/// Written once and never mutated. A task count above [`Self::NOT_READY`]
/// marks a failed submission even though a stamp exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStamp {
    /// New submission counter of the engine
    pub task_count: TaskCount,
    /// Ordering level after the submission
    pub task_level: TaskCount,
    /// Flush marker
    pub flush_stamp: FlushStamp,
}

impl CompletionStamp {
    /// Submission has not happened yet
    pub const NOT_READY: TaskCount = 0xFFFF_FFF0;
    /// Ring had no room for another submission
    pub const RING_OVERFLOW: TaskCount = 0xFFFF_FFF5;
    /// No dependency tag slot was free
    pub const TAG_POOL_EXHAUSTED: TaskCount = 0xFFFF_FFF6;
    /// Command buffer pool reached its cap
    pub const OUT_OF_COMMAND_BUFFERS: TaskCount = 0xFFFF_FFF7;
    /// Command stream had no room for the batch
    pub const COMMAND_BUFFER_FULL: TaskCount = 0xFFFF_FFF8;
    /// Engine hung
    pub const GPU_HANG: TaskCount = 0xFFFF_FFFA;
    /// Device memory allocation failed during submission
    pub const OUT_OF_DEVICE_MEMORY: TaskCount = 0xFFFF_FFFB;
    /// Host memory allocation failed during submission
    pub const OUT_OF_HOST_MEMORY: TaskCount = 0xFFFF_FFFC;
    /// Any other submission failure
    pub const FAILED: TaskCount = 0xFFFF_FFFE;

    /// Stamp of a successful flush
    pub const fn new(task_count: TaskCount, task_level: TaskCount, flush_stamp: FlushStamp) -> Self {
        Self {
            task_count,
            task_level,
            flush_stamp,
        }
    }

    /// Stamp for a request that has not been submitted
    pub const fn not_ready(task_level: TaskCount) -> Self {
        Self::new(Self::NOT_READY, task_level, 0)
    }

    /// Failure stamp carrying `error`
    pub const fn failed(error: Error, task_level: TaskCount) -> Self {
        let task_count = match error {
            Error::RingOverflow => Self::RING_OVERFLOW,
            Error::TagPoolExhausted => Self::TAG_POOL_EXHAUSTED,
            Error::OutOfCommandBuffers => Self::OUT_OF_COMMAND_BUFFERS,
            Error::CommandBufferFull => Self::COMMAND_BUFFER_FULL,
            Error::DeviceLost => Self::GPU_HANG,
            Error::OutOfDeviceMemory => Self::OUT_OF_DEVICE_MEMORY,
            Error::OutOfHostMemory => Self::OUT_OF_HOST_MEMORY,
            _ => Self::FAILED,
        };
        Self::new(task_count, task_level, 0)
    }

    /// Check if the stamp carries a failure
    #[inline]
    pub const fn is_failure(&self) -> bool {
        self.task_count > Self::NOT_READY
    }

    /// Check if the stamp is the not-ready sentinel
    #[inline]
    pub const fn is_not_ready(&self) -> bool {
        self.task_count == Self::NOT_READY
    }

    /// Convert the sentinel into an error
    pub fn status(&self) -> Result<()> {
        match self.task_count {
            Self::RING_OVERFLOW => Err(Error::RingOverflow),
            Self::TAG_POOL_EXHAUSTED => Err(Error::TagPoolExhausted),
            Self::OUT_OF_COMMAND_BUFFERS => Err(Error::OutOfCommandBuffers),
            Self::COMMAND_BUFFER_FULL => Err(Error::CommandBufferFull),
            Self::GPU_HANG => Err(Error::DeviceLost),
            Self::OUT_OF_DEVICE_MEMORY => Err(Error::OutOfDeviceMemory),
            Self::OUT_OF_HOST_MEMORY => Err(Error::OutOfHostMemory),
            c if c > Self::NOT_READY => Err(Error::SubmissionFailed),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// COMPLETION TOKEN
// =============================================================================

/// Client-visible record of one engine's part of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionToken {
    /// Engine that executes the work
    pub engine: EngineId,
    /// Task count that retires the work
    pub task_count: TaskCount,
    /// Ordering level of the request
    pub task_level: TaskCount,
    /// Flush marker, if the work was flushed
    pub flush_stamp: Option<FlushStamp>,
}

impl CompletionToken {
    /// Whether `completed` has reached this token
    #[inline]
    pub const fn is_retired_by(&self, completed: TaskCount) -> bool {
        completed >= self.task_count
    }
}

// =============================================================================
// TAG COUNTER
// =============================================================================

/// Hardware-written completion counter of an engine
///
/// Only ever moves forward. Reads are lock-free.
#[derive(Debug)]
pub struct TagCounter {
    /// GPU address the engine writes its task count to
    gpu_addr: GpuAddr,
    /// Last retired task count
    value: AtomicU32,
}

impl TagCounter {
    /// Create a counter at zero
    pub const fn new(gpu_addr: GpuAddr) -> Self {
        Self {
            gpu_addr,
            value: AtomicU32::new(0),
        }
    }

    /// GPU address of the counter
    #[inline]
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Last retired task count
    #[inline]
    pub fn value(&self) -> TaskCount {
        self.value.load(Ordering::Acquire)
    }

    /// Record retirement up to `task_count`; never moves backwards
    #[inline]
    pub fn signal(&self, task_count: TaskCount) {
        self.value.fetch_max(task_count, Ordering::AcqRel);
    }

    /// Check if `task_count` has retired
    #[inline]
    pub fn is_retired(&self, task_count: TaskCount) -> bool {
        self.value() >= task_count
    }
}

// =============================================================================
// FLUSH STAMP TRACKER
// =============================================================================

/// Source of monotonically increasing flush markers
#[derive(Debug, Default)]
pub struct FlushStampTracker {
    next: AtomicU64,
}

impl FlushStampTracker {
    /// Create a tracker
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    /// Take the next marker
    #[inline]
    pub fn advance(&self) -> FlushStamp {
        self.next.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Last marker handed out
    #[inline]
    pub fn peek(&self) -> FlushStamp {
        self.next.load(Ordering::Acquire)
    }
}

static_assertions::assert_impl_all!(TagCounter: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_above_not_ready() {
        let hang = CompletionStamp::failed(Error::DeviceLost, 3);
        assert!(hang.is_failure());
        assert_eq!(hang.status(), Err(Error::DeviceLost));

        let oom = CompletionStamp::failed(Error::OutOfHostMemory, 3);
        assert_eq!(oom.status(), Err(Error::OutOfHostMemory));

        let other = CompletionStamp::failed(Error::SubmissionFailed, 0);
        assert_eq!(other.task_count, CompletionStamp::FAILED);
        assert_eq!(other.status(), Err(Error::SubmissionFailed));
    }

    #[test]
    fn test_resource_failures_keep_their_error() {
        for error in [
            Error::RingOverflow,
            Error::TagPoolExhausted,
            Error::OutOfCommandBuffers,
            Error::CommandBufferFull,
            Error::OutOfDeviceMemory,
            Error::OutOfHostMemory,
        ] {
            let stamp = CompletionStamp::failed(error, 1);
            assert!(stamp.is_failure());
            assert_eq!(stamp.status(), Err(error));
            assert!(!error.is_device_lost());
        }
    }

    #[test]
    fn test_not_ready_is_not_failure() {
        let stamp = CompletionStamp::not_ready(1);
        assert!(stamp.is_not_ready());
        assert!(!stamp.is_failure());
        assert!(stamp.status().is_ok());
        assert!(CompletionStamp::new(7, 1, 1).status().is_ok());
    }

    #[test]
    fn test_tag_counter_monotonic() {
        let tag = TagCounter::new(GpuAddr::new(0x1000));
        tag.signal(5);
        tag.signal(3);
        assert_eq!(tag.value(), 5);
        assert!(tag.is_retired(4));
        assert!(!tag.is_retired(6));
    }

    #[test]
    fn test_flush_stamps_increase() {
        let tracker = FlushStampTracker::new();
        assert_eq!(tracker.advance(), 1);
        assert_eq!(tracker.advance(), 2);
        assert_eq!(tracker.peek(), 2);
    }
}
