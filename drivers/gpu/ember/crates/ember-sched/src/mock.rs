//! Simulated hardware for tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use ember_cmd::{
    AlwaysResident, BatchBuffer, CommandBufferPool, EngineCaps, EngineDesc, EngineTarget, FlushFlags, FlushRequest,
    MethodEncoder, PoolConfig, SubmissionSink,
};
use ember_core::{CompletionStamp, EngineId, Result, TaskCount};
use hashbrown::HashSet;
use spin::Mutex;

use crate::device::Device;

/// What the hardware saw of one batch
#[derive(Debug, Clone)]
pub struct Submitted {
    pub engine: EngineId,
    pub task_count: TaskCount,
    pub commands: Vec<u32>,
    pub flags: FlushFlags,
    pub signals: Vec<u64>,
}

#[derive(Default)]
struct Inner {
    pending: Mutex<Vec<BatchBuffer>>,
    log: Mutex<Vec<Submitted>>,
    hung: Mutex<HashSet<EngineId>>,
    auto_retire: AtomicBool,
}

/// Backend recording batches; retires them on demand
#[derive(Clone)]
pub struct MockHardware {
    inner: Arc<Inner>,
    pool: Arc<CommandBufferPool>,
}

impl MockHardware {
    pub fn new() -> Self {
        Self::with_pool_cap(64)
    }

    /// Backend whose command buffer pool holds at most `max_buffers`
    pub fn with_pool_cap(max_buffers: u32) -> Self {
        Self {
            inner: Arc::default(),
            pool: Arc::new(CommandBufferPool::new(PoolConfig::command_buffer(max_buffers))),
        }
    }

    pub fn pool(&self) -> &Arc<CommandBufferPool> {
        &self.pool
    }

    fn engine(&self, desc: EngineDesc) -> Arc<EngineTarget> {
        EngineTarget::new(desc, Arc::new(self.clone()), self.pool.clone()).unwrap()
    }

    pub fn engine_compute(&self, id: EngineId) -> Arc<EngineTarget> {
        self.engine(EngineDesc::compute(id))
    }

    pub fn engine_copy(&self, id: EngineId) -> Arc<EngineTarget> {
        self.engine(EngineDesc::copy(id))
    }

    pub fn engine_with_caps(&self, id: EngineId, caps: EngineCaps) -> Arc<EngineTarget> {
        self.engine(EngineDesc::copy(id).with_caps(caps))
    }

    pub fn engine_on_device(&self, desc: EngineDesc) -> Arc<EngineTarget> {
        self.engine(desc)
    }

    /// Device with one compute engine (id 0) and `copies` copy engines
    pub fn device(&self, copies: u32) -> Device {
        self.device_at(0, copies)
    }

    pub fn device_at(&self, index: u32, copies: u32) -> Device {
        self.device_tuned(index, copies, |desc| desc)
    }

    /// Device whose engine descriptions pass through `tune` first
    pub fn device_tuned(&self, index: u32, copies: u32, tune: impl Fn(EngineDesc) -> EngineDesc) -> Device {
        let base = index * 16;
        let compute = self.engine(tune(EngineDesc::compute(EngineId(base)).with_device(index)));
        let copies = (1..=copies)
            .map(|i| self.engine(tune(EngineDesc::copy(EngineId(base + i)).with_device(index))))
            .collect();
        Device::new(
            index,
            compute,
            copies,
            Arc::new(MethodEncoder::new()),
            Arc::new(AlwaysResident),
            self.pool.clone(),
        )
        .unwrap()
    }

    /// Flush an empty batch on `engine`
    pub fn flush_empty(&self, engine: &EngineTarget) -> CompletionStamp {
        let mut state = engine.lock();
        let start = engine.acquire_space(&mut state, 0).unwrap();
        engine.flush(&mut state, FlushRequest { start, ..Default::default() })
    }

    pub fn set_auto_retire(&self, enabled: bool) {
        self.inner.auto_retire.store(enabled, Ordering::Release);
    }

    pub fn set_hang(&self, engine: EngineId, hung: bool) {
        let mut set = self.inner.hung.lock();
        if hung {
            set.insert(engine);
        } else {
            set.remove(&engine);
        }
    }

    /// Retire every pending batch of `engine` up to `task_count`
    pub fn retire(&self, engine: EngineId, task_count: TaskCount) {
        let ready: Vec<BatchBuffer> = {
            let mut pending = self.inner.pending.lock();
            let (ready, rest) = pending
                .drain(..)
                .partition(|b| b.engine == engine && b.task_count <= task_count);
            *pending = rest;
            ready
        };
        for batch in ready {
            batch.retire();
        }
    }

    /// Retire everything pending on `engine`
    pub fn retire_engine(&self, engine: EngineId) {
        self.retire(engine, TaskCount::MAX);
    }

    pub fn retire_all(&self) {
        let ready: Vec<BatchBuffer> = self.inner.pending.lock().drain(..).collect();
        for batch in ready {
            batch.retire();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Every batch handed over so far
    pub fn submitted(&self) -> Vec<Submitted> {
        self.inner.log.lock().clone()
    }

    /// Batches handed to `engine`
    pub fn submitted_to(&self, engine: EngineId) -> Vec<Submitted> {
        self.submitted().into_iter().filter(|b| b.engine == engine).collect()
    }
}

impl SubmissionSink for MockHardware {
    fn kickoff(&self, batch: BatchBuffer) -> Result<()> {
        self.inner.log.lock().push(Submitted {
            engine: batch.engine,
            task_count: batch.task_count,
            commands: batch.commands.clone(),
            flags: batch.flags,
            signals: batch.signals.iter().map(|t| t.gpu_addr().raw()).collect(),
        });
        if self.inner.auto_retire.load(Ordering::Acquire) {
            batch.retire();
        } else {
            self.inner.pending.lock().push(batch);
        }
        Ok(())
    }

    fn is_gpu_hang(&self, engine: EngineId) -> bool {
        self.inner.hung.lock().contains(&engine)
    }
}
