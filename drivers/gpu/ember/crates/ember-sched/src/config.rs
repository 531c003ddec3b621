//! Queue Configuration

use ember_core::{ByteSize, QueuePriority, Throttle};

use crate::waiter::{SpinWaitConfig, WaitTimeout};

/// Ordering mode of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOrdering {
    /// Same-engine submissions are implicitly ordered
    #[default]
    InOrder,
    /// Ordering only through explicit wait lists
    OutOfOrder,
}

/// Override of the engine selection heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnginePreference {
    /// Let the selector decide
    #[default]
    Heuristic,
    /// Keep transfers on the compute engine
    ForceCompute,
    /// Send transfers to a copy engine when one is capable
    ForceCopy,
}

/// How blocking waits back off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStyle {
    /// Spin, yield, then sleep
    #[default]
    Adaptive,
    /// Spin and yield, never sleep
    LowLatency,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ordering mode
    pub ordering: QueueOrdering,
    /// Priority class
    pub priority: QueuePriority,
    /// Throttle hint passed with every flush
    pub throttle: Throttle,
    /// Minimum size of a split transfer; zero disables splitting
    pub split_threshold: ByteSize,
    /// Engine selection override
    pub engine_preference: EnginePreference,
    /// Wait back-off style
    pub wait_style: WaitStyle,
    /// Timeout of blocking waits
    pub wait_timeout: WaitTimeout,
    /// Back-off tuning
    pub spin: SpinWaitConfig,
    /// Bind the queue to one copy engine of the device
    pub copy_only: Option<usize>,
    /// Outstanding compute submissions that count as busy
    pub busy_threshold: u32,
    /// In-order transfers from this size go to a copy engine
    pub copy_amortize_threshold: ByteSize,
    /// Route transfers touching device-local memory to a copy engine
    pub prefer_copy_for_device_local: bool,
    /// Route writes to compressed surfaces to a copy engine
    pub prefer_copy_for_compressed: bool,
    /// Run compression translation passes on a copy engine
    pub aux_translation_on_copy: bool,
    /// Insert profiling points around submitted work
    pub profiling: bool,
    /// Wait for completion after every enqueue
    pub make_each_enqueue_blocking: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ordering: QueueOrdering::InOrder,
            priority: QueuePriority::Normal,
            throttle: Throttle::Medium,
            split_threshold: ByteSize::from_mib(16),
            engine_preference: EnginePreference::Heuristic,
            wait_style: WaitStyle::Adaptive,
            wait_timeout: WaitTimeout::Infinite,
            spin: SpinWaitConfig::default(),
            copy_only: None,
            busy_threshold: 1,
            copy_amortize_threshold: ByteSize::from_mib(4),
            prefer_copy_for_device_local: true,
            prefer_copy_for_compressed: true,
            aux_translation_on_copy: true,
            profiling: false,
            make_each_enqueue_blocking: false,
        }
    }
}

impl QueueConfig {
    /// In-order queue with defaults
    pub fn in_order() -> Self {
        Self::default()
    }

    /// Out-of-order queue with defaults
    pub fn out_of_order() -> Self {
        Self {
            ordering: QueueOrdering::OutOfOrder,
            ..Self::default()
        }
    }

    /// Check if in-order
    #[inline]
    pub fn is_in_order(&self) -> bool {
        self.ordering == QueueOrdering::InOrder
    }

    /// Set priority
    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set throttle
    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set split threshold
    pub fn with_split_threshold(mut self, threshold: ByteSize) -> Self {
        self.split_threshold = threshold;
        self
    }

    /// Set engine preference
    pub fn with_engine_preference(mut self, preference: EnginePreference) -> Self {
        self.engine_preference = preference;
        self
    }

    /// Set wait style
    pub fn with_wait_style(mut self, style: WaitStyle) -> Self {
        self.wait_style = style;
        self
    }

    /// Set wait timeout
    pub fn with_wait_timeout(mut self, timeout: WaitTimeout) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Bind to a copy engine
    pub fn with_copy_only(mut self, engine: usize) -> Self {
        self.copy_only = Some(engine);
        self
    }

    /// Set busy threshold
    pub fn with_busy_threshold(mut self, threshold: u32) -> Self {
        self.busy_threshold = threshold;
        self
    }

    /// Set in-order copy threshold
    pub fn with_copy_amortize_threshold(mut self, threshold: ByteSize) -> Self {
        self.copy_amortize_threshold = threshold;
        self
    }

    /// Enable or disable translation passes on copy engines
    pub fn with_aux_translation_on_copy(mut self, enabled: bool) -> Self {
        self.aux_translation_on_copy = enabled;
        self
    }

    /// Enable profiling
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.profiling = enabled;
        self
    }

    /// Make every enqueue blocking
    pub fn with_blocking_enqueues(mut self, enabled: bool) -> Self {
        self.make_each_enqueue_blocking = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let config = QueueConfig::out_of_order()
            .with_split_threshold(ByteSize::ZERO)
            .with_copy_only(1)
            .with_wait_style(WaitStyle::LowLatency);
        assert!(!config.is_in_order());
        assert!(config.split_threshold.is_zero());
        assert_eq!(config.copy_only, Some(1));
        assert_eq!(config.wait_style, WaitStyle::LowLatency);
        assert!(QueueConfig::default().is_in_order());
    }
}
