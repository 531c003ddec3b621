//! # Enqueue Properties
//!
//! Classification of a request that picks its submission path.

use ember_core::EngineKind;

use crate::request::RequestKind;
use crate::selector::Route;

/// Submission path of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Workload on the compute engine
    ComputeDispatch,
    /// Workload on one or more copy engines
    CopyDispatch,
    /// Flush of dependencies, barriers or cache flushes without a workload
    FlushOnly,
    /// Nothing reaches the hardware; the event inherits existing work
    NoSubmission,
}

/// Classification computed once per request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueProperties {
    operation: Operation,
    barrier: bool,
    profiled: bool,
}

impl EnqueueProperties {
    /// Classify a request
    ///
    /// `pending_dependencies` tells whether the wait list still holds work
    /// that has not signalled. `profiled` is set when the caller's event
    /// captures profiling points.
    pub fn classify(
        kind: &RequestKind,
        route: &Route,
        primary: EngineKind,
        pending_dependencies: bool,
        profiled: bool,
    ) -> Self {
        let operation = match kind {
            RequestKind::Dispatch(_) => Operation::ComputeDispatch,
            RequestKind::Copy(_) | RequestKind::CopyImage(_) | RequestKind::Fill(_) => match route {
                Route::Primary if primary == EngineKind::Compute => Operation::ComputeDispatch,
                _ => Operation::CopyDispatch,
            },
            RequestKind::Migrate(_) => Operation::FlushOnly,
            RequestKind::Barrier | RequestKind::Marker | RequestKind::Free(_) => {
                if pending_dependencies || profiled {
                    Operation::FlushOnly
                } else {
                    Operation::NoSubmission
                }
            }
        };
        Self {
            operation,
            barrier: kind.is_barrier(),
            profiled,
        }
    }

    /// Submission path
    #[inline]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Check if the request is a barrier
    #[inline]
    pub fn is_barrier(&self) -> bool {
        self.barrier
    }

    /// Check if profiling points are encoded
    #[inline]
    pub fn is_profiled(&self) -> bool {
        self.profiled
    }

    /// Check if anything is flushed
    #[inline]
    pub fn requires_flush(&self) -> bool {
        self.operation != Operation::NoSubmission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cmd::MultiWorkDescriptor;

    #[test]
    fn test_marker_classification() {
        let marker = RequestKind::Marker;
        let props = EnqueueProperties::classify(&marker, &Route::Primary, EngineKind::Compute, false, false);
        assert_eq!(props.operation(), Operation::NoSubmission);
        assert!(!props.requires_flush());

        let props = EnqueueProperties::classify(&marker, &Route::Primary, EngineKind::Compute, true, false);
        assert_eq!(props.operation(), Operation::FlushOnly);
        let props = EnqueueProperties::classify(&marker, &Route::Primary, EngineKind::Compute, false, true);
        assert_eq!(props.operation(), Operation::FlushOnly);
    }

    #[test]
    fn test_barrier_flag() {
        let props = EnqueueProperties::classify(&RequestKind::Barrier, &Route::Primary, EngineKind::Compute, false, false);
        assert!(props.is_barrier());
        assert_eq!(props.operation(), Operation::NoSubmission);
    }

    #[test]
    fn test_dispatch_paths() {
        let dispatch = RequestKind::Dispatch(MultiWorkDescriptor::default());
        let props = EnqueueProperties::classify(&dispatch, &Route::Primary, EngineKind::Compute, false, false);
        assert_eq!(props.operation(), Operation::ComputeDispatch);

        let migrate = RequestKind::Migrate(Vec::new());
        let props = EnqueueProperties::classify(&migrate, &Route::Primary, EngineKind::Compute, false, false);
        assert_eq!(props.operation(), Operation::FlushOnly);
    }
}
