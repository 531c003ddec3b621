//! # Command Encoder
//!
//! Translate work descriptors and dependency sets into command words.
//!
//! The scheduler never inspects what an encoder writes. It only relies on
//! the call order: dependencies, then an optional barrier, then work, then
//! signals.

use ember_core::{EngineKind, Error, Result};

use crate::deps::DependencySet;
use crate::stream::{CommandStream, WORD_SIZE};
use crate::tag::{DependencyToken, PACKET_SIGNALLED};
use crate::work::{AuxDirection, WorkDescriptor, WorkPayload};

/// Profiling capture point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingPoint {
    /// Before the first work command
    Start,
    /// After the last work command
    End,
}

// =============================================================================
// ENCODER TRAIT
// =============================================================================

/// Trait for command encoders
pub trait CommandEncoder: Send + Sync {
    /// Program waits for every entry of `deps`
    fn encode_dependencies(&self, stream: &mut CommandStream, kind: EngineKind, deps: &DependencySet) -> Result<()>;

    /// Program the work itself
    fn encode_work(
        &self,
        stream: &mut CommandStream,
        kind: EngineKind,
        work: &WorkDescriptor,
        deps: &DependencySet,
    ) -> Result<()>;

    /// Program an execution barrier; `stalling` drains all prior work
    fn encode_barrier(&self, stream: &mut CommandStream, kind: EngineKind, stalling: bool) -> Result<()>;

    /// Program the write that signals `token` once preceding work retires
    fn encode_signal(&self, stream: &mut CommandStream, kind: EngineKind, token: &DependencyToken) -> Result<()>;

    /// Program a timestamp capture
    fn encode_profiling(&self, stream: &mut CommandStream, kind: EngineKind, point: ProfilingPoint) -> Result<()>;

    /// Upper bound of bytes `encode_dependencies` writes
    fn dependencies_size(&self, deps: &DependencySet) -> usize;

    /// Upper bound of bytes `encode_work` writes
    fn work_size(&self, work: &WorkDescriptor) -> usize;

    /// Upper bound of bytes for one barrier, signal or profiling command
    fn fixed_command_size(&self) -> usize;

    /// Get encoder name
    fn name(&self) -> &'static str;
}

// =============================================================================
// METHOD ENCODER
// =============================================================================

/// Method addresses written by [`MethodEncoder`]
pub mod methods {
    /// Bind the engine class
    pub const SET_OBJECT: u16 = 0x0000;
    /// Wait for idle
    pub const WAIT_FOR_IDLE: u16 = 0x0110;
    /// Semaphore address, high half
    pub const SEM_ADDR_HI: u16 = 0x0010;
    /// Semaphore address, low half
    pub const SEM_ADDR_LO: u16 = 0x0014;
    /// Semaphore payload
    pub const SEM_PAYLOAD: u16 = 0x0018;
    /// Acquire (wait until payload matches / reaches)
    pub const SEM_ACQUIRE: u16 = 0x001C;
    /// Release (write payload)
    pub const SEM_RELEASE: u16 = 0x0020;
    /// Timestamp capture
    pub const TIMESTAMP: u16 = 0x0024;
    /// Kernel handle
    pub const LAUNCH_KERNEL: u16 = 0x0100;
    /// Group counts
    pub const LAUNCH_GROUPS: u16 = 0x0104;
    /// Trigger launch
    pub const LAUNCH: u16 = 0x02B4;
    /// Copy source address
    pub const COPY_SRC: u16 = 0x0400;
    /// Copy destination address
    pub const COPY_DST: u16 = 0x0408;
    /// Copy length
    pub const COPY_LEN: u16 = 0x0418;
    /// Trigger copy
    pub const COPY_LAUNCH: u16 = 0x0300;
    /// Fill pattern word
    pub const FILL_PATTERN: u16 = 0x0700;
    /// Aux translation trigger
    pub const AUX_TRANSLATE: u16 = 0x0710;
    /// Cache flush
    pub const CACHE_FLUSH: u16 = 0x0720;
}

/// Semaphore acquire mode: wait for equality with the payload
const ACQUIRE_EQUAL: u32 = 1;
/// Semaphore acquire mode: wait until the value reaches the payload
const ACQUIRE_GEQ: u32 = 4;

/// Encoder emitting single method/value pairs per operation
#[derive(Debug, Clone, Copy)]
pub struct MethodEncoder {
    compute_class: u32,
    copy_class: u32,
}

impl MethodEncoder {
    /// Encoder for the default compute and copy classes
    pub const fn new() -> Self {
        Self {
            compute_class: 0xC6C0,
            copy_class: 0xC6B5,
        }
    }

    fn class(&self, kind: EngineKind) -> u32 {
        match kind {
            EngineKind::Compute => self.compute_class,
            EngineKind::Copy => self.copy_class,
        }
    }

    fn semaphore(stream: &mut CommandStream, addr: ember_core::GpuAddr, payload: u32, op: u16, mode: u32) -> Result<()> {
        stream.push_single(methods::SEM_ADDR_HI, 0, addr.high())?;
        stream.push_single(methods::SEM_ADDR_LO, 0, addr.low())?;
        stream.push_single(methods::SEM_PAYLOAD, 0, payload)?;
        stream.push_single(op, 0, mode)
    }
}

impl Default for MethodEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes of one method/value pair
const PAIR: usize = 2 * WORD_SIZE;
/// Pairs in one semaphore operation
const SEMAPHORE_PAIRS: usize = 4;

impl CommandEncoder for MethodEncoder {
    fn encode_dependencies(&self, stream: &mut CommandStream, _kind: EngineKind, deps: &DependencySet) -> Result<()> {
        for token in deps.all_tokens() {
            Self::semaphore(stream, token.gpu_addr(), PACKET_SIGNALLED, methods::SEM_ACQUIRE, ACQUIRE_EQUAL)?;
        }
        for wait in deps.task_count_waits() {
            Self::semaphore(stream, wait.tag.gpu_addr(), wait.task_count, methods::SEM_ACQUIRE, ACQUIRE_GEQ)?;
        }
        Ok(())
    }

    fn encode_work(
        &self,
        stream: &mut CommandStream,
        kind: EngineKind,
        work: &WorkDescriptor,
        _deps: &DependencySet,
    ) -> Result<()> {
        stream.push_single(methods::SET_OBJECT, 0, self.class(kind))?;
        match &work.payload {
            WorkPayload::Kernel(dispatch) => {
                if kind != EngineKind::Compute {
                    return Err(Error::NotSupported);
                }
                stream.push_single(methods::LAUNCH_KERNEL, 0, dispatch.kernel.raw() as u32)?;
                for (i, groups) in dispatch.groups.iter().enumerate() {
                    stream.push_single(methods::LAUNCH_GROUPS + 4 * i as u16, 0, *groups)?;
                }
                stream.push_single(methods::LAUNCH, 0, 1)?;
            }
            WorkPayload::Copy(region) => {
                let src = region.src.gpu_addr.offset(region.src_offset);
                let dst = region.dst.gpu_addr.offset(region.dst_offset);
                stream.push_single(methods::COPY_SRC, 0, src.high())?;
                stream.push_single(methods::COPY_SRC + 4, 0, src.low())?;
                stream.push_single(methods::COPY_DST, 0, dst.high())?;
                stream.push_single(methods::COPY_DST + 4, 0, dst.low())?;
                stream.push_single(methods::COPY_LEN, 0, (region.size >> 32) as u32)?;
                stream.push_single(methods::COPY_LEN + 4, 0, region.size as u32)?;
                stream.push_single(methods::COPY_LAUNCH, 0, 1)?;
            }
            WorkPayload::Fill(fill) => {
                let dst = fill.dst.gpu_addr.offset(fill.offset);
                let mut word = [0u8; 4];
                for (i, byte) in fill.pattern.iter().take(4).enumerate() {
                    word[i] = *byte;
                }
                stream.push_single(methods::FILL_PATTERN, 0, u32::from_le_bytes(word))?;
                stream.push_single(methods::COPY_DST, 0, dst.high())?;
                stream.push_single(methods::COPY_DST + 4, 0, dst.low())?;
                stream.push_single(methods::COPY_LEN + 4, 0, fill.size as u32)?;
                stream.push_single(methods::COPY_LAUNCH, 0, 2)?;
            }
            WorkPayload::AuxTranslation { surface, direction } => {
                let mode = match direction {
                    AuxDirection::AuxToNonAux => 0,
                    AuxDirection::NonAuxToAux => 1,
                };
                stream.push_single(methods::COPY_DST, 0, surface.gpu_addr.high())?;
                stream.push_single(methods::COPY_DST + 4, 0, surface.gpu_addr.low())?;
                stream.push_single(methods::AUX_TRANSLATE, 0, mode)?;
            }
            WorkPayload::CacheFlush => {
                stream.push_single(methods::CACHE_FLUSH, 0, 1)?;
            }
        }
        Ok(())
    }

    fn encode_barrier(&self, stream: &mut CommandStream, _kind: EngineKind, stalling: bool) -> Result<()> {
        stream.push_single(methods::WAIT_FOR_IDLE, 0, u32::from(stalling))
    }

    fn encode_signal(&self, stream: &mut CommandStream, _kind: EngineKind, token: &DependencyToken) -> Result<()> {
        Self::semaphore(stream, token.gpu_addr(), PACKET_SIGNALLED, methods::SEM_RELEASE, 0)
    }

    fn encode_profiling(&self, stream: &mut CommandStream, _kind: EngineKind, point: ProfilingPoint) -> Result<()> {
        let value = match point {
            ProfilingPoint::Start => 0,
            ProfilingPoint::End => 1,
        };
        stream.push_single(methods::TIMESTAMP, 0, value)
    }

    fn dependencies_size(&self, deps: &DependencySet) -> usize {
        deps.len() * SEMAPHORE_PAIRS * PAIR
    }

    fn work_size(&self, _work: &WorkDescriptor) -> usize {
        8 * PAIR
    }

    fn fixed_command_size(&self) -> usize {
        SEMAPHORE_PAIRS * PAIR
    }

    fn name(&self) -> &'static str {
        "method"
    }
}

/// Method addresses of every pair in `words`, in order
pub fn decode_methods(words: &[u32]) -> alloc::vec::Vec<u16> {
    words
        .chunks_exact(2)
        .map(|pair| crate::stream::header_method(pair[0]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagPool;
    use crate::work::{KernelDispatch, WorkPayload};
    use ember_core::{ByteSize, EngineId, GpuAddr, Handle};

    fn kernel() -> WorkDescriptor {
        WorkDescriptor::new(WorkPayload::Kernel(KernelDispatch {
            kernel: Handle::from_raw(3),
            groups: [4, 1, 1],
            group_size: [64, 1, 1],
        }))
    }

    #[test]
    fn test_wait_precedes_launch() {
        let encoder = MethodEncoder::new();
        let pool = TagPool::new(EngineId(1), 0, GpuAddr::new(0x1000), 2);
        let token = pool.allocate().unwrap();
        let mut deps = DependencySet::new();
        deps.add_token(&token, EngineId(0));

        let mut stream = CommandStream::new(0, GpuAddr::new(0), ByteSize::from_kib(1));
        encoder.encode_dependencies(&mut stream, EngineKind::Compute, &deps).unwrap();
        encoder.encode_work(&mut stream, EngineKind::Compute, &kernel(), &deps).unwrap();

        let decoded = decode_methods(stream.as_words());
        let acquire = decoded.iter().position(|m| *m == methods::SEM_ACQUIRE).unwrap();
        let launch = decoded.iter().position(|m| *m == methods::LAUNCH).unwrap();
        assert!(acquire < launch);
        assert!(stream.used_bytes() <= encoder.dependencies_size(&deps) + encoder.work_size(&kernel()));
    }

    #[test]
    fn test_kernel_rejected_on_copy_engine() {
        let encoder = MethodEncoder::new();
        let mut stream = CommandStream::new(0, GpuAddr::new(0), ByteSize::from_kib(1));
        let result = encoder.encode_work(&mut stream, EngineKind::Copy, &kernel(), &DependencySet::new());
        assert_eq!(result, Err(Error::NotSupported));
    }
}
