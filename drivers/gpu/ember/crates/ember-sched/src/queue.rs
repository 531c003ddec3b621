//! # Command Queue
//!
//! Client-facing submission queue bound to one device.
//!
//! ## Flow
//!
//! ```text
//!   enqueue ──► validate ──► task level ──┬── ready ──► dispatch ──► engines
//!                                         │
//!                                         └── blocked ──► chain ──► resume
//! ```
//!
//! A request is blocked while some wait-list event is still queued, and
//! stays behind every request blocked before it. Resolution of a waited
//! event resumes the chain head; resumes never run concurrently.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::vec::Vec;

use ember_cmd::{DependencyToken, EngineCaps, EngineTarget, SurfaceRef};
use ember_core::{CompletionStamp, Error, FlushStamp, Result, TaskCount};
use spin::Mutex;

use crate::blocked::{BlockedChain, BlockedCommand, Readiness};
use crate::config::QueueConfig;
use crate::device::Device;
use crate::dispatch::Pending;
use crate::event::{Event, EventKind, EventStatus, Listener, Notifier};
use crate::request::{Request, RequestKind};
use crate::resolver::obtain_task_level;
use crate::waiter::{CompletionWaiter, EngineWait, WaitStatus};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// QUEUE STATE
// =============================================================================

/// What the queue knows about one of its copy engines
#[derive(Debug, Default)]
pub(crate) struct CopyEngineState {
    /// Highest task count submitted by this queue
    pub(crate) task_count: TaskCount,
    /// Engine ran work of this queue
    pub(crate) used: bool,
    /// Barrier token the next batch must wait on
    pub(crate) last_barrier: Option<DependencyToken>,
    /// Token of the last batch, consumed by the next stall
    pub(crate) last_signalled: Option<DependencyToken>,
}

/// Lock-protected part of a queue
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// Ordering level
    pub(crate) task_level: TaskCount,
    /// Highest task count submitted to the primary engine
    pub(crate) task_count: TaskCount,
    pub(crate) flush_stamp: FlushStamp,
    /// A barrier was enqueued; the next flush stalls
    pub(crate) stall_pending: bool,
    /// Tokens of the most recent submission
    pub(crate) last_tokens: Vec<DependencyToken>,
    /// Superseded tokens kept until their signal landed
    pub(crate) deferred: Vec<DependencyToken>,
    pub(crate) copies: Vec<CopyEngineState>,
    pub(crate) blocked: BlockedChain,
    /// Free requests waiting for their event to complete
    pub(crate) pending_frees: Vec<(Arc<Event>, Vec<SurfaceRef>)>,
}

impl QueueState {
    /// Make `tokens` the latest submission
    pub(crate) fn supersede(&mut self, tokens: Vec<DependencyToken>) {
        self.deferred.retain(|token| !token.is_signalled());
        let old = core::mem::replace(&mut self.last_tokens, tokens);
        self.deferred.extend(old.into_iter().filter(|token| !token.is_signalled()));
    }
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Submission queue
pub struct CommandQueue {
    pub(crate) id: u64,
    pub(crate) config: QueueConfig,
    pub(crate) device: Device,
    /// Compute engine, or the bound engine of a copy-only queue
    pub(crate) primary: Arc<EngineTarget>,
    pub(crate) copies: Vec<Arc<EngineTarget>>,
    pub(crate) waiter: CompletionWaiter,
    pub(crate) state: Mutex<QueueState>,
    resume_lock: Mutex<()>,
    resume_again: AtomicBool,
    this: Weak<Self>,
}

impl CommandQueue {
    /// Create a queue on `device`
    pub(crate) fn new(device: &Device, config: QueueConfig) -> Result<Arc<Self>> {
        let (primary, copies) = match config.copy_only {
            Some(index) => {
                let engine = device.copy_engines().get(index).ok_or(Error::InvalidParameter)?;
                (Arc::clone(engine), Vec::new())
            }
            None => (Arc::clone(device.compute()), device.copy_engines().to_vec()),
        };

        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let waiter = CompletionWaiter::new(config.wait_style, config.spin, config.wait_timeout);
        let state = QueueState {
            copies: copies.iter().map(|_| CopyEngineState::default()).collect(),
            ..QueueState::default()
        };
        log::debug!(
            "queue {}: {:?} on {} with {} copy engines",
            id,
            config.ordering,
            primary.id(),
            copies.len()
        );

        Ok(Arc::new_cyclic(|this| Self {
            id,
            config,
            device: device.clone(),
            primary,
            copies,
            waiter,
            state: Mutex::new(state),
            resume_lock: Mutex::new(()),
            resume_again: AtomicBool::new(false),
            this: Weak::clone(this),
        }))
    }

    /// Queue identifier
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Configuration
    #[inline]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Owning device
    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Engine kernels and non-offloaded work run on
    #[inline]
    pub fn primary(&self) -> &Arc<EngineTarget> {
        &self.primary
    }

    /// Copy engines available to this queue
    #[inline]
    pub fn copy_engines(&self) -> &[Arc<EngineTarget>] {
        &self.copies
    }

    /// Current ordering level
    pub fn task_level(&self) -> TaskCount {
        self.state.lock().task_level
    }

    /// Highest task count submitted to the primary engine
    pub fn task_count(&self) -> TaskCount {
        self.state.lock().task_count
    }

    /// Check if requests are waiting in the blocked chain
    pub fn is_blocked(&self) -> bool {
        !self.state.lock().blocked.is_empty()
    }

    /// Number of blocked requests
    pub fn blocked_len(&self) -> usize {
        self.state.lock().blocked.len()
    }

    /// Check if the next flush will stall
    pub fn stall_pending(&self) -> bool {
        self.state.lock().stall_pending
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    /// Submit a request
    ///
    /// Returns the request's event when one was asked for. A request whose
    /// wait list is not ready yet is captured and submitted later; the call
    /// still returns immediately unless it is blocking.
    pub fn enqueue(&self, request: Request) -> Result<Option<Arc<Event>>> {
        request.validate()?;
        let Request {
            kind,
            wait_list,
            want_event,
            blocking,
        } = request;

        if matches!(kind, RequestKind::Dispatch(_)) && !self.primary.supports(EngineCaps::KERNEL_DISPATCH) {
            return Err(Error::NotSupported);
        }
        if wait_list.iter().any(|event| event.aborted().is_some()) {
            return Err(Error::DependencyAborted);
        }
        self.reclaim_frees();
        let blocking = blocking || self.config.make_each_enqueue_blocking;

        let mut state = self.state.lock();
        // Behind a blocked command the level is only known on resume
        let task_level = if state.blocked.is_empty() {
            obtain_task_level(&mut state.task_level, self.config.ordering, &kind, &wait_list)
        } else {
            CompletionStamp::NOT_READY
        };
        let blocked = task_level == CompletionStamp::NOT_READY;
        let event = (want_event || matches!(kind, RequestKind::Free(_)))
            .then(|| Event::for_queue(EventKind::Command, self.device.index(), self.id));

        if blocked {
            let link = event
                .clone()
                .unwrap_or_else(|| Event::for_queue(EventKind::Virtual, self.device.index(), self.id));
            let resume_now = self.capture(&mut state, kind, wait_list, task_level, link)?;
            drop(state);
            if resume_now {
                self.resume_blocked();
            }
        } else {
            self.submit(
                state,
                Pending {
                    kind,
                    wait_list,
                    task_level,
                    event: event.clone(),
                    fragment: None,
                    blocking,
                    resubmitted: false,
                },
            )?;
        }

        if blocking {
            self.finish()?;
        }
        Ok(if want_event { event } else { None })
    }

    // =========================================================================
    // Blocked chain
    // =========================================================================

    /// Append a request to the blocked chain; returns whether a waited event
    /// resolved meanwhile
    fn capture(
        &self,
        state: &mut QueueState,
        kind: RequestKind,
        wait_list: Vec<Arc<Event>>,
        task_level: TaskCount,
        event: Arc<Event>,
    ) -> Result<bool> {
        let fragment = match &kind {
            RequestKind::Dispatch(multi) => Some(self.encode_fragment(multi)?),
            _ => None,
        };

        let mut resume_now = false;
        for waited in wait_list.iter().filter(|e| e.is_queued()) {
            let queue = Weak::clone(&self.this);
            let listener: Listener = Box::new(move || {
                if let Some(queue) = queue.upgrade() {
                    queue.resume_blocked();
                }
            });
            if waited.on_resolved(listener).is_some() {
                resume_now = true;
            }
        }

        log::debug!(
            "queue {}: {} blocked behind {} commands",
            self.id,
            kind.name(),
            state.blocked.len()
        );
        state.blocked.push(BlockedCommand {
            kind,
            wait_list,
            task_level,
            event,
            previous: None,
            fragment,
        });
        Ok(resume_now)
    }

    /// Submit every ready command at the head of the chain
    ///
    /// Callers arriving while a resume runs leave a note and return; the
    /// running resume drains again before it lets go.
    pub(crate) fn resume_blocked(&self) {
        self.resume_again.store(true, Ordering::Release);
        loop {
            let Some(guard) = self.resume_lock.try_lock() else {
                return;
            };
            while self.resume_again.swap(false, Ordering::AcqRel) {
                self.drain_blocked();
            }
            drop(guard);
            if !self.resume_again.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn drain_blocked(&self) {
        loop {
            let mut state = self.state.lock();
            let readiness = match state.blocked.front() {
                Some(head) => head.readiness(),
                None => return,
            };
            match readiness {
                Readiness::Pending => return,
                Readiness::Aborted(err) => {
                    let chain = state.blocked.drain();
                    drop(state);
                    self.unwind(chain, err);
                    return;
                }
                Readiness::Ready => {
                    let Some(head) = state.blocked.pop_front() else {
                        return;
                    };
                    let BlockedCommand {
                        kind,
                        wait_list,
                        mut task_level,
                        event,
                        fragment,
                        ..
                    } = head;
                    if task_level == CompletionStamp::NOT_READY {
                        task_level = obtain_task_level(&mut state.task_level, self.config.ordering, &kind, &wait_list);
                    }
                    let pending = Pending {
                        kind,
                        wait_list,
                        task_level,
                        event: Some(event),
                        fragment,
                        blocking: false,
                        resubmitted: true,
                    };
                    if self.submit(state, pending).is_err() {
                        let rest = self.state.lock().blocked.drain();
                        self.unwind(rest, Error::DependencyAborted);
                        return;
                    }
                }
            }
        }
    }

    /// Fail every command of a dropped chain
    fn unwind(&self, chain: Vec<BlockedCommand>, err: Error) {
        if chain.is_empty() {
            return;
        }
        log::warn!("queue {}: dropping {} blocked commands: {}", self.id, chain.len(), err);
        let mut notifier = Notifier::default();
        for command in chain {
            if let Some(fragment) = command.fragment {
                self.device.pool().release(fragment);
            }
            notifier.absorb(command.event.fail(err));
        }
        notifier.fire();
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Release surfaces whose free request completed
    fn reclaim_frees(&self) {
        let mut done = Vec::new();
        {
            let mut state = self.state.lock();
            for (event, surfaces) in core::mem::take(&mut state.pending_frees) {
                match event.status() {
                    EventStatus::Complete => done.extend(surfaces),
                    EventStatus::Aborted(err) => {
                        log::warn!("queue {}: free of {} surfaces abandoned: {}", self.id, surfaces.len(), err);
                    }
                    EventStatus::Queued | EventStatus::Submitted => state.pending_frees.push((event, surfaces)),
                }
            }
        }
        for surface in &done {
            self.device.residency().release(surface);
        }
    }

    /// Block until everything submitted so far retired
    ///
    /// Blocked commands are waited for first, within the queue's timeout.
    pub fn finish(&self) -> Result<()> {
        let drained = self.waiter.wait_for(|| {
            if self.state.lock().blocked.is_empty() {
                WaitStatus::Ready
            } else {
                WaitStatus::NotReady
            }
        });
        if !drained.is_ready() {
            log::warn!("queue {}: {} commands still blocked", self.id, self.blocked_len());
            return Err(Error::Timeout);
        }

        let waits = {
            let state = self.state.lock();
            let mut waits = vec![EngineWait::new(Arc::clone(&self.primary), state.task_count)];
            for (engine, copy) in self.copies.iter().zip(&state.copies) {
                if copy.used {
                    waits.push(EngineWait::new(Arc::clone(engine), copy.task_count));
                }
            }
            waits
        };

        match self.waiter.wait(&waits) {
            WaitStatus::Ready => {
                let deferred = core::mem::take(&mut self.state.lock().deferred);
                drop(deferred);
                self.reclaim_frees();
                Ok(())
            }
            WaitStatus::GpuHang => {
                log::error!("queue {}: device lost while finishing", self.id);
                Err(Error::DeviceLost)
            }
            WaitStatus::NotReady => Err(Error::Timeout),
        }
    }

    /// Finish outstanding work and drop the queue
    pub fn release(self: Arc<Self>) -> Result<()> {
        let result = self.finish();
        if let Err(err) = result {
            log::warn!("queue {}: released with error: {}", self.id, err);
        }
        drop(self);
        result
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let chain = self.state.get_mut().blocked.drain();
        self.unwind(chain, Error::DependencyAborted);
        if !self.primary.is_idle() {
            log::debug!(
                "queue {}: dropped with work in flight on {} (completed {}, submitted {})",
                self.id,
                self.primary.id(),
                self.primary.completed(),
                self.primary.submitted()
            );
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("ordering", &self.config.ordering)
            .field("primary", &self.primary.id())
            .field("copies", &self.copies.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(CommandQueue: Send, Sync);
