//! # Events
//!
//! Client-visible handle of a request's completion.
//!
//! A command event starts `Queued` and moves to `Submitted` once every part
//! of its request has been flushed. It becomes `Complete` when all engines it
//! covers reached their task counts. User events are resolved by the client.
//!
//! Listeners registered while an event is queued run exactly once, when it
//! leaves the queued state. They are always run by the caller after every
//! queue lock was released.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use ember_cmd::{DependencyToken, EngineTarget};
use ember_core::{CompletionStamp, CompletionToken, Error, FlushStamp, Result, TaskCount};
use spin::Mutex;

use crate::waiter::{CompletionWaiter, EngineWait, WaitStatus};

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// Who drives the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Resolved by the client
    User,
    /// Produced by a request
    Command,
    /// Internal link of a blocked chain
    Virtual,
}

/// Event status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Not submitted yet
    Queued,
    /// Flushed, not retired
    Submitted,
    /// Retired
    Complete,
    /// Will never complete
    Aborted(Error),
}

impl EventStatus {
    /// Check if the event left the queued state
    #[inline]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, EventStatus::Queued)
    }
}

// =============================================================================
// COMPLETION RECORD
// =============================================================================

/// Engines and tokens an event covers
#[derive(Debug, Clone, Default)]
pub struct EventRecord {
    waits: Vec<EngineWait>,
    completion: Vec<CompletionToken>,
    tokens: Vec<DependencyToken>,
    task_level: TaskCount,
}

impl EventRecord {
    /// Empty record at `task_level`
    pub fn new(task_level: TaskCount) -> Self {
        Self {
            task_level,
            ..Self::default()
        }
    }

    /// Cover a flush on `engine`
    pub fn add_flush(&mut self, engine: &Arc<EngineTarget>, stamp: &CompletionStamp) {
        self.add_wait(engine, stamp.task_count, Some(stamp.flush_stamp));
    }

    /// Cover `task_count` on `engine`; the highest count per engine wins
    pub fn add_wait(&mut self, engine: &Arc<EngineTarget>, task_count: TaskCount, flush_stamp: Option<FlushStamp>) {
        let id = engine.id();
        if let Some(pos) = self.waits.iter().position(|w| w.engine.id() == id) {
            if self.waits[pos].task_count < task_count {
                self.waits[pos].task_count = task_count;
                self.completion[pos].task_count = task_count;
                self.completion[pos].flush_stamp = flush_stamp;
            }
            return;
        }
        self.waits.push(EngineWait::new(Arc::clone(engine), task_count));
        self.completion.push(CompletionToken {
            engine: id,
            task_count,
            task_level: self.task_level,
            flush_stamp,
        });
    }

    /// Cover a dependency token
    pub fn add_token(&mut self, token: &DependencyToken) {
        if !self.tokens.contains(token) {
            self.tokens.push(token.clone());
        }
    }

    /// Cover everything `other` covers
    pub fn merge(&mut self, other: &EventRecord) {
        for (wait, completion) in other.waits.iter().zip(&other.completion) {
            self.add_wait(&wait.engine, wait.task_count, completion.flush_stamp);
        }
        for token in &other.tokens {
            self.add_token(token);
        }
    }

    /// Engine waits
    pub fn waits(&self) -> &[EngineWait] {
        &self.waits
    }

    /// Per-engine completion tokens
    pub fn completion(&self) -> &[CompletionToken] {
        &self.completion
    }

    /// Dependency tokens signalled by the covered work
    pub fn tokens(&self) -> &[DependencyToken] {
        &self.tokens
    }

    /// Ordering level
    pub fn task_level(&self) -> TaskCount {
        self.task_level
    }

    fn is_retired(&self) -> bool {
        self.waits.iter().all(EngineWait::is_retired)
    }

    fn is_hung(&self) -> bool {
        self.waits.iter().any(|w| !w.is_retired() && w.engine.is_hung())
    }
}

// =============================================================================
// LISTENERS
// =============================================================================

/// Callback run when an event resolves
pub type Listener = Box<dyn FnOnce() + Send>;

/// Listeners taken from resolved events, to be run outside any lock
#[must_use = "listeners must be fired"]
#[derive(Default)]
pub(crate) struct Notifier(Vec<Listener>);

impl Notifier {
    pub(crate) fn absorb(&mut self, other: Notifier) {
        self.0.extend(other.0);
    }

    pub(crate) fn fire(self) {
        for listener in self.0 {
            listener();
        }
    }
}

// =============================================================================
// EVENT
// =============================================================================

struct EventInner {
    status: EventStatus,
    record: EventRecord,
    listeners: Vec<Listener>,
}

/// Completion handle of a request
pub struct Event {
    id: u64,
    kind: EventKind,
    device: u32,
    queue: Option<u64>,
    inner: Mutex<EventInner>,
}

impl Event {
    fn with(kind: EventKind, device: u32, queue: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            device,
            queue,
            inner: Mutex::new(EventInner {
                status: EventStatus::Queued,
                record: EventRecord::default(),
                listeners: Vec::new(),
            }),
        })
    }

    /// Client-controlled event on `device`
    pub fn user(device: u32) -> Arc<Self> {
        Self::with(EventKind::User, device, None)
    }

    pub(crate) fn for_queue(kind: EventKind, device: u32, queue: u64) -> Arc<Self> {
        Self::with(kind, device, Some(queue))
    }

    /// Unique id
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Kind
    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Root device the event belongs to
    #[inline]
    pub fn device(&self) -> u32 {
        self.device
    }

    /// Queue that produced the event
    #[inline]
    pub fn queue_id(&self) -> Option<u64> {
        self.queue
    }

    /// Current status, refreshed from the engines
    pub fn status(&self) -> EventStatus {
        let mut inner = self.inner.lock();
        if inner.status == EventStatus::Submitted {
            if inner.record.is_retired() {
                inner.status = EventStatus::Complete;
            } else if inner.record.is_hung() {
                inner.status = EventStatus::Aborted(Error::DeviceLost);
            }
        }
        inner.status
    }

    /// Check if not submitted yet
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.inner.lock().status == EventStatus::Queued
    }

    /// Check if retired
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.status() == EventStatus::Complete
    }

    /// Error of an aborted event
    pub fn aborted(&self) -> Option<Error> {
        match self.status() {
            EventStatus::Aborted(err) => Some(err),
            _ => None,
        }
    }

    /// Ordering level; `NOT_READY` until the event is submitted
    pub fn task_level(&self) -> TaskCount {
        let inner = self.inner.lock();
        match inner.status {
            EventStatus::Queued | EventStatus::Aborted(_) => CompletionStamp::NOT_READY,
            EventStatus::Submitted | EventStatus::Complete => inner.record.task_level,
        }
    }

    /// Per-engine completion tokens
    pub fn completion_tokens(&self) -> Vec<CompletionToken> {
        self.inner.lock().record.completion.clone()
    }

    /// Engine waits covering the event
    pub fn engine_waits(&self) -> Vec<EngineWait> {
        self.inner.lock().record.waits.clone()
    }

    /// Dependency tokens signalled by the event's work
    pub fn dependency_tokens(&self) -> Vec<DependencyToken> {
        self.inner.lock().record.tokens.clone()
    }

    /// Snapshot of the completion record
    pub fn record(&self) -> EventRecord {
        self.inner.lock().record.clone()
    }

    /// Mark a user event complete
    pub fn complete(&self) -> Result<()> {
        self.set_user_status(EventStatus::Complete)
    }

    /// Abort a user event; blocked work depending on it unwinds
    pub fn abort(&self, error: Error) -> Result<()> {
        self.set_user_status(EventStatus::Aborted(error))
    }

    fn set_user_status(&self, status: EventStatus) -> Result<()> {
        if self.kind != EventKind::User {
            return Err(Error::InvalidParameter);
        }
        let notifier = {
            let mut inner = self.inner.lock();
            if inner.status.is_resolved() {
                return Err(Error::InvalidParameter);
            }
            inner.status = status;
            Notifier(core::mem::take(&mut inner.listeners))
        };
        log::debug!("event {}: user status {:?}", self.id, status);
        notifier.fire();
        Ok(())
    }

    /// Record the submission of the event's request
    pub(crate) fn submit(&self, record: EventRecord) -> Notifier {
        let mut inner = self.inner.lock();
        if inner.status != EventStatus::Queued {
            return Notifier::default();
        }
        inner.status = EventStatus::Submitted;
        inner.record = record;
        Notifier(core::mem::take(&mut inner.listeners))
    }

    /// Abort unless already retired
    pub(crate) fn fail(&self, error: Error) -> Notifier {
        let mut inner = self.inner.lock();
        match inner.status {
            EventStatus::Complete | EventStatus::Aborted(_) => Notifier::default(),
            EventStatus::Queued | EventStatus::Submitted => {
                inner.status = EventStatus::Aborted(error);
                Notifier(core::mem::take(&mut inner.listeners))
            }
        }
    }

    /// Run `listener` when the event resolves
    ///
    /// Gives the listener back if the event is already resolved.
    pub(crate) fn on_resolved(&self, listener: Listener) -> Option<Listener> {
        let mut inner = self.inner.lock();
        if inner.status.is_resolved() {
            return Some(listener);
        }
        inner.listeners.push(listener);
        None
    }

    /// Block until the event retires
    ///
    /// A timeout leaves the event untouched. A hang aborts it.
    pub fn wait(&self, waiter: &CompletionWaiter) -> Result<()> {
        let resolved = waiter.wait_for(|| {
            if self.is_queued() {
                WaitStatus::NotReady
            } else {
                WaitStatus::Ready
            }
        });
        if !resolved.is_ready() {
            return Err(Error::Timeout);
        }
        if let Some(err) = self.aborted() {
            return Err(err);
        }

        let waits = self.engine_waits();
        match waiter.wait(&waits) {
            WaitStatus::Ready => {
                let mut inner = self.inner.lock();
                if inner.status == EventStatus::Submitted {
                    inner.status = EventStatus::Complete;
                }
                Ok(())
            }
            WaitStatus::GpuHang => {
                self.fail(Error::DeviceLost).fire();
                Err(Error::DeviceLost)
            }
            WaitStatus::NotReady => Err(Error::Timeout),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &inner.status)
            .field("completion", &inner.record.completion)
            .finish()
    }
}

static_assertions::assert_impl_all!(Event: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHardware;
    use crate::waiter::WaitTimeout;
    use ember_core::EngineId;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_user_event_listeners_fire_once() {
        let event = Event::user(0);
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        assert!(event
            .on_resolved(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .is_none());

        assert_eq!(event.task_level(), CompletionStamp::NOT_READY);
        event.complete().unwrap();
        assert_eq!(event.complete(), Err(Error::InvalidParameter));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(event.status(), EventStatus::Complete);
        assert_eq!(event.task_level(), 0);

        assert!(event.on_resolved(Box::new(|| {})).is_some());
    }

    #[test]
    fn test_command_event_cannot_be_set_by_client() {
        let event = Event::for_queue(EventKind::Command, 0, 7);
        assert_eq!(event.complete(), Err(Error::InvalidParameter));
        assert_eq!(event.queue_id(), Some(7));
    }

    #[test]
    fn test_submitted_event_completes_with_engines() {
        let hw = MockHardware::new();
        let engine = hw.engine_compute(EngineId(0));
        let stamp = hw.flush_empty(&engine);

        let event = Event::for_queue(EventKind::Command, 0, 1);
        let mut record = EventRecord::new(3);
        record.add_flush(&engine, &stamp);
        event.submit(record).fire();

        assert_eq!(event.status(), EventStatus::Submitted);
        assert_eq!(event.task_level(), 3);
        let waiter = CompletionWaiter::default().with_timeout(WaitTimeout::None);
        assert_eq!(event.wait(&waiter), Err(Error::Timeout));
        assert_eq!(event.status(), EventStatus::Submitted);

        hw.retire_all();
        event.wait(&waiter).unwrap();
        assert_eq!(event.status(), EventStatus::Complete);
        assert_eq!(event.completion_tokens()[0].task_count, stamp.task_count);
    }

    #[test]
    fn test_hang_aborts_waited_event() {
        let hw = MockHardware::new();
        let engine = hw.engine_copy(EngineId(1));
        let stamp = hw.flush_empty(&engine);
        let event = Event::for_queue(EventKind::Command, 0, 1);
        let mut record = EventRecord::new(0);
        record.add_flush(&engine, &stamp);
        event.submit(record).fire();

        hw.set_hang(engine.id(), true);
        assert_eq!(event.wait(&CompletionWaiter::default()), Err(Error::DeviceLost));
        assert_eq!(event.status(), EventStatus::Aborted(Error::DeviceLost));
    }

    #[test]
    fn test_record_keeps_highest_count_per_engine() {
        let hw = MockHardware::new();
        let engine = hw.engine_copy(EngineId(1));
        let mut record = EventRecord::new(0);
        record.add_wait(&engine, 4, None);
        record.add_wait(&engine, 2, None);
        record.add_wait(&engine, 6, Some(9));
        assert_eq!(record.waits().len(), 1);
        assert_eq!(record.waits()[0].task_count, 6);
        assert_eq!(record.completion()[0].flush_stamp, Some(9));
    }
}
