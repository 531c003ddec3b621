//! Completion Waits
//!
//! Blocking and polling waits on engine task counts.
//!
//! Every engine in a wait set is checked independently. A hang on any of
//! them ends the wait at once; the remaining engines are not waited on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_cmd::EngineTarget;
use ember_core::{Error, Result, TaskCount};

use crate::config::WaitStyle;

// ============================================================================
// Wait Status
// ============================================================================

/// Outcome of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Everything waited on has retired.
    Ready,
    /// Timeout expired; nothing was resolved.
    NotReady,
    /// An engine hung.
    GpuHang,
}

impl WaitStatus {
    /// Check if successful.
    pub fn is_ready(&self) -> bool {
        *self == WaitStatus::Ready
    }

    /// Convert into a result.
    pub fn into_result(self) -> Result<()> {
        match self {
            WaitStatus::Ready => Ok(()),
            WaitStatus::NotReady => Err(Error::Timeout),
            WaitStatus::GpuHang => Err(Error::DeviceLost),
        }
    }
}

// ============================================================================
// Wait Timeout
// ============================================================================

/// How long a wait may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitTimeout {
    /// No timeout (poll once).
    None,
    /// Wait with timeout.
    Duration(Duration),
    /// Wait indefinitely.
    #[default]
    Infinite,
}

impl WaitTimeout {
    /// Create a timeout in milliseconds.
    pub fn millis(ms: u64) -> Self {
        WaitTimeout::Duration(Duration::from_millis(ms))
    }

    /// Get duration or None for infinite.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            WaitTimeout::None => Some(Duration::ZERO),
            WaitTimeout::Duration(d) => Some(*d),
            WaitTimeout::Infinite => None,
        }
    }
}

impl From<Duration> for WaitTimeout {
    fn from(d: Duration) -> Self {
        WaitTimeout::Duration(d)
    }
}

// ============================================================================
// Spin Wait
// ============================================================================

/// Spin wait configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinWaitConfig {
    /// Initial spin iterations.
    pub spin_iterations: u32,
    /// Yield iterations.
    pub yield_iterations: u32,
    /// Sleep duration after yield.
    pub sleep_duration: Duration,
}

impl Default for SpinWaitConfig {
    fn default() -> Self {
        Self {
            spin_iterations: 64,
            yield_iterations: 256,
            sleep_duration: Duration::from_micros(50),
        }
    }
}

/// Backoff helper: spin, then yield, then sleep.
#[derive(Debug)]
pub struct SpinWait {
    config: SpinWaitConfig,
    style: WaitStyle,
    count: u32,
}

impl SpinWait {
    /// Create with configuration.
    pub fn with_config(config: SpinWaitConfig, style: WaitStyle) -> Self {
        Self {
            config,
            style,
            count: 0,
        }
    }

    /// Back off once.
    ///
    /// Low-latency waits never sleep.
    pub fn spin_once(&mut self) {
        self.count = self.count.saturating_add(1);

        if self.count <= self.config.spin_iterations {
            std::hint::spin_loop();
        } else if self.count <= self.config.spin_iterations + self.config.yield_iterations {
            std::thread::yield_now();
        } else {
            match self.style {
                WaitStyle::Adaptive => std::thread::sleep(self.config.sleep_duration),
                WaitStyle::LowLatency => std::thread::yield_now(),
            }
        }
    }

    /// Reset counter.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Get spin count.
    pub fn spin_count(&self) -> u32 {
        self.count
    }
}

// ============================================================================
// Completion Waiter
// ============================================================================

/// One engine and the task count to wait for.
#[derive(Debug, Clone)]
pub struct EngineWait {
    /// Engine to watch.
    pub engine: Arc<EngineTarget>,
    /// Task count to reach.
    pub task_count: TaskCount,
}

impl EngineWait {
    /// Create a wait.
    pub fn new(engine: Arc<EngineTarget>, task_count: TaskCount) -> Self {
        Self { engine, task_count }
    }

    /// Check if the engine reached the task count.
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.engine.completed() >= self.task_count
    }
}

/// Blocking/polling wait on a set of engines.
#[derive(Debug, Clone, Copy)]
pub struct CompletionWaiter {
    style: WaitStyle,
    spin: SpinWaitConfig,
    timeout: WaitTimeout,
}

impl CompletionWaiter {
    /// Create a waiter.
    pub fn new(style: WaitStyle, spin: SpinWaitConfig, timeout: WaitTimeout) -> Self {
        Self { style, spin, timeout }
    }

    /// Same waiter with another timeout.
    pub fn with_timeout(mut self, timeout: WaitTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured timeout.
    pub fn timeout(&self) -> WaitTimeout {
        self.timeout
    }

    /// Check every engine once.
    pub fn poll(&self, waits: &[EngineWait]) -> WaitStatus {
        let mut pending = false;
        for wait in waits {
            if wait.is_retired() {
                continue;
            }
            if wait.engine.check_hang() {
                log::error!(
                    "{}: hang while waiting for task {} (completed {})",
                    wait.engine.id(),
                    wait.task_count,
                    wait.engine.completed()
                );
                return WaitStatus::GpuHang;
            }
            pending = true;
        }
        if pending {
            WaitStatus::NotReady
        } else {
            WaitStatus::Ready
        }
    }

    /// Block until every engine reached its task count.
    pub fn wait(&self, waits: &[EngineWait]) -> WaitStatus {
        self.wait_for(|| self.poll(waits))
    }

    /// Repeat `poll` with backoff until it stops returning `NotReady` or the
    /// timeout expires.
    pub fn wait_for(&self, mut poll: impl FnMut() -> WaitStatus) -> WaitStatus {
        let deadline = self.timeout.as_duration().map(|d| Instant::now() + d);
        let mut backoff = SpinWait::with_config(self.spin, self.style);
        loop {
            match poll() {
                WaitStatus::NotReady => {}
                status => return status,
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return WaitStatus::NotReady;
            }
            backoff.spin_once();
        }
    }
}

impl Default for CompletionWaiter {
    fn default() -> Self {
        Self::new(WaitStyle::default(), SpinWaitConfig::default(), WaitTimeout::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHardware;
    use ember_core::EngineId;
    use std::thread;

    #[test]
    fn test_wait_twice_on_retired_token() {
        let hw = MockHardware::new();
        let engine = hw.engine_compute(EngineId(0));
        hw.flush_empty(&engine);
        hw.retire_all();

        let waiter = CompletionWaiter::default().with_timeout(WaitTimeout::None);
        let waits = [EngineWait::new(engine.clone(), 1)];
        assert_eq!(waiter.wait(&waits), WaitStatus::Ready);
        assert_eq!(waiter.wait(&waits), WaitStatus::Ready);
    }

    #[test]
    fn test_timeout_leaves_pending() {
        let hw = MockHardware::new();
        let engine = hw.engine_compute(EngineId(0));
        hw.flush_empty(&engine);

        let waiter = CompletionWaiter::default().with_timeout(WaitTimeout::millis(5));
        let waits = [EngineWait::new(engine.clone(), 1)];
        assert_eq!(waiter.wait(&waits), WaitStatus::NotReady);
        assert_eq!(waiter.wait(&waits).into_result(), Err(Error::Timeout));

        hw.retire_all();
        assert_eq!(waiter.wait(&waits), WaitStatus::Ready);
    }

    #[test]
    fn test_hang_short_circuits_other_engines() {
        let hw = MockHardware::new();
        let a = hw.engine_compute(EngineId(0));
        let b = hw.engine_copy(EngineId(1));
        hw.flush_empty(&a);
        hw.flush_empty(&b);
        hw.set_hang(a.id(), true);

        let waiter = CompletionWaiter::default();
        let waits = [EngineWait::new(b.clone(), 1), EngineWait::new(a.clone(), 1)];
        assert_eq!(waiter.wait(&waits), WaitStatus::GpuHang);
        assert!(!waits[0].is_retired());
        assert!(a.is_hung());
    }

    #[test]
    fn test_wait_observes_background_retirement() {
        let hw = MockHardware::new();
        let engine = hw.engine_copy(EngineId(2));
        hw.flush_empty(&engine);

        let retire = {
            let hw = hw.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                hw.retire_all();
            })
        };
        let waiter = CompletionWaiter::new(WaitStyle::LowLatency, SpinWaitConfig::default(), WaitTimeout::Infinite);
        assert_eq!(waiter.wait(&[EngineWait::new(engine, 1)]), WaitStatus::Ready);
        retire.join().unwrap();
    }
}
