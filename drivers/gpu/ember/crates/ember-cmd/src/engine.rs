//! # Engine Targets
//!
//! One physical submission target: a compute engine or one copy engine.
//!
//! Each target owns its command stream and ring behind its own lock, the
//! completion tag the hardware writes, and the dependency-token pool its
//! batches signal from. Submission counters are readable without the lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use ember_core::{
    ByteSize, CompletionStamp, EngineId, EngineKind, Error, FlushStamp, FlushStampTracker, GpuAddr, Result,
    TagCounter, TaskCount, Throttle,
};
use spin::{Mutex, MutexGuard};

use crate::pool::CommandBufferPool;
use crate::ring::{BatchBuffer, CommandRing, FlushFlags, RingConfig, RingEntry};
use crate::stream::{CommandStream, WORD_SIZE};
use crate::tag::{DependencyToken, TagPool};
use crate::traits::SubmissionSink;

bitflags! {
    /// Operations an engine's hardware generation supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EngineCaps: u32 {
        /// Kernel launches
        const KERNEL_DISPATCH = 1 << 0;
        /// Linear buffer copies
        const LINEAR_COPY = 1 << 1;
        /// Image / tiled copies
        const IMAGE_COPY = 1 << 2;
        /// Pattern fills
        const FILL = 1 << 3;
        /// Participation in split transfers
        const SPLIT_COPY = 1 << 4;
        /// Compression translation passes
        const AUX_TRANSLATION = 1 << 5;
        /// Writes to tiled compressed surfaces
        const COMPRESSED_SURFACES = 1 << 6;
    }
}

impl EngineCaps {
    /// Typical compute engine
    pub const COMPUTE: Self = Self::KERNEL_DISPATCH
        .union(Self::LINEAR_COPY)
        .union(Self::IMAGE_COPY)
        .union(Self::FILL)
        .union(Self::AUX_TRANSLATION)
        .union(Self::COMPRESSED_SURFACES);

    /// Typical copy engine
    pub const COPY: Self = Self::LINEAR_COPY
        .union(Self::IMAGE_COPY)
        .union(Self::FILL)
        .union(Self::SPLIT_COPY)
        .union(Self::AUX_TRANSLATION)
        .union(Self::COMPRESSED_SURFACES);
}

// =============================================================================
// ENGINE DESCRIPTION
// =============================================================================

/// Static description of an engine
#[derive(Debug, Clone)]
pub struct EngineDesc {
    /// Engine id, unique per driver
    pub id: EngineId,
    /// Engine kind
    pub kind: EngineKind,
    /// Root device index
    pub device: u32,
    /// Supported operations
    pub caps: EngineCaps,
    /// Dependency tag slots
    pub tag_pool_size: u32,
    /// GPU address of the tag pool
    pub tag_base: GpuAddr,
    /// GPU address of the completion tag
    pub completion_addr: GpuAddr,
    /// In-flight submission limit
    pub ring: RingConfig,
    /// Initial command stream size
    pub stream_size: ByteSize,
}

impl EngineDesc {
    fn base(id: EngineId, kind: EngineKind, caps: EngineCaps) -> Self {
        let slot = id.0 as u64;
        Self {
            id,
            kind,
            device: 0,
            caps,
            tag_pool_size: 256,
            tag_base: GpuAddr::new(0x2000_0000 + slot * 0x10_0000),
            completion_addr: GpuAddr::new(0x1000_0000 + slot * 0x1000),
            ring: RingConfig::default(),
            stream_size: ByteSize::from_kib(64),
        }
    }

    /// Compute engine with default capabilities
    pub fn compute(id: EngineId) -> Self {
        Self::base(id, EngineKind::Compute, EngineCaps::COMPUTE)
    }

    /// Copy engine with default capabilities
    pub fn copy(id: EngineId) -> Self {
        Self::base(id, EngineKind::Copy, EngineCaps::COPY)
    }

    /// Set the root device
    pub fn with_device(mut self, device: u32) -> Self {
        self.device = device;
        self
    }

    /// Set the capabilities
    pub fn with_caps(mut self, caps: EngineCaps) -> Self {
        self.caps = caps;
        self
    }

    /// Set the number of dependency tag slots
    pub fn with_tag_pool_size(mut self, size: u32) -> Self {
        self.tag_pool_size = size;
        self
    }

    /// Set the in-flight submission limit
    pub fn with_ring(mut self, ring: RingConfig) -> Self {
        self.ring = ring;
        self
    }
}

// =============================================================================
// ENGINE STATE
// =============================================================================

/// Lock-protected part of an engine
#[derive(Debug)]
pub struct EngineState {
    stream: CommandStream,
    ring: CommandRing,
}

impl EngineState {
    /// Command stream the next batch is encoded into
    #[inline]
    pub fn stream(&mut self) -> &mut CommandStream {
        &mut self.stream
    }

    /// In-flight submissions
    #[inline]
    pub fn ring(&self) -> &CommandRing {
        &self.ring
    }
}

/// Parameters of one flush
#[derive(Debug, Default)]
pub struct FlushRequest {
    /// Word offset where the batch starts in the engine stream
    pub start: usize,
    /// Tags the batch signals
    pub signals: Vec<DependencyToken>,
    /// Flush flags
    pub flags: FlushFlags,
    /// Ordering level recorded in the stamp
    pub task_level: TaskCount,
    /// Throttle hint
    pub throttle: Throttle,
}

// =============================================================================
// ENGINE TARGET
// =============================================================================

/// One physical submission target
pub struct EngineTarget {
    desc: EngineDesc,
    completion: Arc<TagCounter>,
    tags: Arc<TagPool>,
    sink: Arc<dyn SubmissionSink>,
    pool: Arc<CommandBufferPool>,
    submitted: AtomicU32,
    flush_stamps: FlushStampTracker,
    hung: AtomicBool,
    state: Mutex<EngineState>,
}

impl EngineTarget {
    /// Create an engine and take its first command stream from `pool`
    pub fn new(desc: EngineDesc, sink: Arc<dyn SubmissionSink>, pool: Arc<CommandBufferPool>) -> Result<Arc<Self>> {
        let stream = pool.acquire(desc.stream_size.as_bytes() as usize)?;
        let tags = TagPool::new(desc.id, desc.device, desc.tag_base, desc.tag_pool_size);
        let completion = Arc::new(TagCounter::new(desc.completion_addr));
        let ring = CommandRing::new(desc.ring.clone());

        log::debug!(
            "{} ({}) on device {}: caps {:?}",
            desc.id,
            desc.kind.name(),
            desc.device,
            desc.caps
        );

        Ok(Arc::new(Self {
            desc,
            completion,
            tags,
            sink,
            pool,
            submitted: AtomicU32::new(0),
            flush_stamps: FlushStampTracker::new(),
            hung: AtomicBool::new(false),
            state: Mutex::new(EngineState { stream, ring }),
        }))
    }

    /// Engine id
    #[inline]
    pub fn id(&self) -> EngineId {
        self.desc.id
    }

    /// Engine kind
    #[inline]
    pub fn kind(&self) -> EngineKind {
        self.desc.kind
    }

    /// Root device index
    #[inline]
    pub fn device(&self) -> u32 {
        self.desc.device
    }

    /// Supported operations
    #[inline]
    pub fn caps(&self) -> EngineCaps {
        self.desc.caps
    }

    /// Check if every operation in `caps` is supported
    #[inline]
    pub fn supports(&self, caps: EngineCaps) -> bool {
        self.desc.caps.contains(caps)
    }

    /// Take the submission lock
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock()
    }

    /// Completion tag written by the hardware
    #[inline]
    pub fn completion_tag(&self) -> &Arc<TagCounter> {
        &self.completion
    }

    /// Last retired task count
    #[inline]
    pub fn completed(&self) -> TaskCount {
        self.completion.value()
    }

    /// Last flushed task count
    #[inline]
    pub fn submitted(&self) -> TaskCount {
        self.submitted.load(Ordering::Acquire)
    }

    /// Flushed but not retired submissions
    #[inline]
    pub fn outstanding(&self) -> u32 {
        self.submitted().saturating_sub(self.completed())
    }

    /// Check if everything flushed has retired
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Task count the next flush will carry; stable while the lock is held
    #[inline]
    pub fn next_task_count(&self) -> TaskCount {
        self.submitted() + 1
    }

    /// Last flush marker handed out
    #[inline]
    pub fn last_flush_stamp(&self) -> FlushStamp {
        self.flush_stamps.peek()
    }

    /// Dependency tag pool
    #[inline]
    pub fn tag_pool(&self) -> &Arc<TagPool> {
        &self.tags
    }

    /// Allocate a pending dependency token
    pub fn allocate_token(&self) -> Result<DependencyToken> {
        self.tags.allocate()
    }

    /// Check if a hang was recorded
    #[inline]
    pub fn is_hung(&self) -> bool {
        self.hung.load(Ordering::Acquire)
    }

    /// Ask the hardware whether the engine hung, recording the answer
    pub fn check_hang(&self) -> bool {
        if self.is_hung() {
            return true;
        }
        if self.sink.is_gpu_hang(self.desc.id) {
            self.mark_hung();
            return true;
        }
        false
    }

    /// Record a hang; further flushes fail until [`Self::recover`]
    pub fn mark_hung(&self) {
        if !self.hung.swap(true, Ordering::AcqRel) {
            log::error!(
                "{}: GPU hang at task count {} (submitted {})",
                self.desc.id,
                self.completed(),
                self.submitted()
            );
        }
    }

    /// Accept submissions again after an external reset
    pub fn recover(&self) {
        if self.hung.swap(false, Ordering::AcqRel) {
            log::info!("{}: recovered", self.desc.id);
        }
    }

    /// Make room for `bytes` more bytes and return the batch start offset
    pub fn acquire_space(&self, state: &mut EngineState, bytes: usize) -> Result<usize> {
        if state.stream.available_bytes() < bytes {
            if !state.stream.is_empty() {
                return Err(Error::CommandBufferFull);
            }
            let fresh = self.pool.acquire(bytes)?;
            let old = core::mem::replace(&mut state.stream, fresh);
            self.pool.release(old);
            log::trace!("{}: stream grown to {} bytes", self.desc.id, state.stream.capacity_bytes());
        }
        Ok(state.stream.used_words())
    }

    /// Submit everything encoded since `request.start`
    ///
    /// Always returns a stamp; failures carry a sentinel task count and the
    /// encoded words are discarded.
    pub fn flush(&self, state: &mut EngineState, request: FlushRequest) -> CompletionStamp {
        let FlushRequest {
            start,
            signals,
            flags,
            task_level,
            throttle,
        } = request;

        if self.check_hang() {
            state.stream.rewind_to(start);
            return CompletionStamp::failed(Error::DeviceLost, task_level);
        }

        let end = state.stream.used_words();
        let task_count = self.next_task_count();
        let size = ((end - start) * WORD_SIZE) as u32;

        state.ring.update_completions(self.completed());
        if let Err(err) = state.ring.submit(RingEntry { task_count, size, flags }) {
            state.stream.rewind_to(start);
            log::warn!("{}: {} submissions in flight", self.desc.id, state.ring.pending_count());
            return CompletionStamp::failed(err, task_level);
        }

        let commands = state.stream.words(start, end).to_vec();
        state.stream.rewind_to(start);
        let batch = BatchBuffer {
            engine: self.desc.id,
            task_count,
            commands,
            signals,
            completion: Arc::clone(&self.completion),
            flags,
            throttle,
        };

        if let Err(err) = self.sink.kickoff(batch) {
            state.ring.cancel(task_count);
            if err == Error::DeviceLost {
                self.mark_hung();
            } else {
                log::warn!("{}: kickoff failed: {}", self.desc.id, err);
            }
            return CompletionStamp::failed(err, task_level);
        }

        self.submitted.store(task_count, Ordering::Release);
        let flush_stamp = self.flush_stamps.advance();

        log::trace!(
            "{}: flushed task {} ({} bytes, {:?})",
            self.desc.id,
            task_count,
            size,
            flags
        );
        CompletionStamp::new(task_count, task_level, flush_stamp)
    }
}

impl fmt::Debug for EngineTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineTarget")
            .field("id", &self.desc.id)
            .field("kind", &self.desc.kind)
            .field("submitted", &self.submitted())
            .field("completed", &self.completed())
            .field("hung", &self.is_hung())
            .finish()
    }
}

static_assertions::assert_impl_all!(EngineTarget: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use alloc::vec;

    #[derive(Default)]
    struct Hardware {
        batches: Mutex<Vec<BatchBuffer>>,
        hang: AtomicBool,
        refuse: AtomicBool,
    }

    impl SubmissionSink for Hardware {
        fn kickoff(&self, batch: BatchBuffer) -> Result<()> {
            if self.refuse.load(Ordering::Acquire) {
                return Err(Error::DeviceLost);
            }
            self.batches.lock().push(batch);
            Ok(())
        }

        fn is_gpu_hang(&self, _engine: EngineId) -> bool {
            self.hang.load(Ordering::Acquire)
        }
    }

    impl Hardware {
        fn retire_all(&self) {
            for batch in self.batches.lock().drain(..) {
                batch.retire();
            }
        }
    }

    fn engine(desc: EngineDesc) -> (Arc<EngineTarget>, Arc<Hardware>) {
        let hw = Arc::new(Hardware::default());
        let pool = Arc::new(CommandBufferPool::new(PoolConfig::command_buffer(8)));
        let engine = EngineTarget::new(desc, hw.clone(), pool).unwrap();
        (engine, hw)
    }

    #[test]
    fn test_flush_advances_counters() {
        let (engine, hw) = engine(EngineDesc::copy(EngineId(1)));
        let token = engine.allocate_token().unwrap();

        let mut state = engine.lock();
        let start = engine.acquire_space(&mut state, 64).unwrap();
        state.stream().push_single(0x0300, 0, 1).unwrap();
        let stamp = engine.flush(
            &mut state,
            FlushRequest {
                start,
                signals: vec![token.clone()],
                task_level: 2,
                ..Default::default()
            },
        );
        drop(state);

        assert_eq!(stamp.task_count, 1);
        assert_eq!(stamp.task_level, 2);
        assert_eq!(engine.submitted(), 1);
        assert_eq!(engine.outstanding(), 1);
        assert!(!token.is_signalled());

        hw.retire_all();
        assert!(engine.is_idle());
        assert!(token.is_signalled());
    }

    #[test]
    fn test_hang_fails_flush_until_recovered() {
        let (engine, hw) = engine(EngineDesc::compute(EngineId(0)));
        hw.hang.store(true, Ordering::Release);

        let mut state = engine.lock();
        let start = engine.acquire_space(&mut state, 16).unwrap();
        state.stream().push_single(0x0110, 0, 1).unwrap();
        let stamp = engine.flush(&mut state, FlushRequest { start, ..Default::default() });
        assert_eq!(stamp.status(), Err(Error::DeviceLost));
        assert!(state.stream().is_empty());
        drop(state);
        assert!(engine.is_hung());

        hw.hang.store(false, Ordering::Release);
        engine.recover();
        let mut state = engine.lock();
        let stamp = engine.flush(&mut state, FlushRequest::default());
        assert!(stamp.status().is_ok());
    }

    #[test]
    fn test_kickoff_device_lost_marks_hung() {
        let (engine, hw) = engine(EngineDesc::copy(EngineId(3)));
        hw.refuse.store(true, Ordering::Release);
        let mut state = engine.lock();
        let stamp = engine.flush(&mut state, FlushRequest::default());
        assert!(stamp.is_failure());
        assert_eq!(engine.submitted(), 0);
        drop(state);
        assert!(engine.is_hung());
    }

    #[test]
    fn test_ring_overflow_is_resource_failure() {
        let (engine, _hw) = engine(EngineDesc::copy(EngineId(1)).with_ring(RingConfig { max_pending: 1 }));
        let mut state = engine.lock();
        assert!(engine.flush(&mut state, FlushRequest::default()).status().is_ok());
        let stamp = engine.flush(&mut state, FlushRequest::default());
        assert_eq!(stamp.task_count, CompletionStamp::RING_OVERFLOW);
        assert_eq!(stamp.status(), Err(Error::RingOverflow));
        assert_eq!(engine.submitted(), 1);
        drop(state);
        assert!(!engine.is_hung());
    }

    #[test]
    fn test_refused_kickoff_frees_ring_slot() {
        let (engine, hw) = engine(EngineDesc::copy(EngineId(2)).with_ring(RingConfig { max_pending: 1 }));
        hw.refuse.store(true, Ordering::Release);
        let mut state = engine.lock();
        assert!(engine.flush(&mut state, FlushRequest::default()).is_failure());
        assert_eq!(state.ring().pending_count(), 0);
        drop(state);

        hw.refuse.store(false, Ordering::Release);
        engine.recover();
        let mut state = engine.lock();
        let stamp = engine.flush(&mut state, FlushRequest::default());
        assert_eq!(stamp.status(), Ok(()));
        assert_eq!(stamp.task_count, 1);
    }

    #[test]
    fn test_acquire_space_grows_empty_stream() {
        let (engine, _hw) = engine(EngineDesc::compute(EngineId(0)));
        let mut state = engine.lock();
        let start = engine.acquire_space(&mut state, 256 * 1024).unwrap();
        assert_eq!(start, 0);
        assert!(state.stream().available_bytes() >= 256 * 1024);
    }
}
