//! # Dependency Resolution
//!
//! Builds the wait set of a request from its wait list and the queue's
//! ordering history.
//!
//! In-order queues get same-engine ordering from the engine's FIFO, so only
//! edges to other engines become tokens. Out-of-order queues wait on exactly
//! what the wait list names. Events of another root device turn into
//! task-count waits on that device's completion tag.

use std::sync::Arc;

use ember_cmd::{DependencySet, DependencyToken, EngineTarget, TaskCountWait};
use ember_core::{CompletionStamp, TaskCount};

use crate::config::QueueOrdering;
use crate::event::Event;
use crate::request::RequestKind;

/// Resolver over one queue's ordering history
#[derive(Debug, Clone, Copy)]
pub struct DependencyResolver<'a> {
    queue: u64,
    ordering: QueueOrdering,
    last_tokens: &'a [DependencyToken],
}

impl<'a> DependencyResolver<'a> {
    /// Resolver for queue `queue`; `last_tokens` are the tokens of its most
    /// recent submission
    pub fn new(queue: u64, ordering: QueueOrdering, last_tokens: &'a [DependencyToken]) -> Self {
        Self {
            queue,
            ordering,
            last_tokens,
        }
    }

    fn in_order(&self) -> bool {
        self.ordering == QueueOrdering::InOrder
    }

    /// Wait set for work on `target`, including implicit in-order edges
    pub fn resolve(&self, target: &EngineTarget, wait_list: &[Arc<Event>]) -> DependencySet {
        let mut deps = self.resolve_explicit(target, wait_list);
        if self.in_order() {
            for token in self.last_tokens {
                if token.engine() != target.id() {
                    deps.add_token(token, target.id());
                }
            }
        }
        deps
    }

    /// Wait set built from the wait list alone
    pub fn resolve_explicit(&self, target: &EngineTarget, wait_list: &[Arc<Event>]) -> DependencySet {
        let mut deps = DependencySet::new();
        for event in wait_list {
            if event.device() != target.device() {
                for wait in event.engine_waits() {
                    deps.add_task_count_wait(TaskCountWait {
                        engine: wait.engine.id(),
                        device: wait.engine.device(),
                        tag: Arc::clone(wait.engine.completion_tag()),
                        task_count: wait.task_count,
                    });
                }
                continue;
            }

            let own = event.queue_id() == Some(self.queue);
            for token in event.dependency_tokens() {
                if own && self.in_order() && token.engine() == target.id() {
                    continue;
                }
                deps.add_token(&token, target.id());
            }
        }
        deps
    }
}

/// Highest ordering level in the wait list, starting from `base`
///
/// `NOT_READY` if any event has not been submitted yet.
pub fn wait_list_level(base: TaskCount, wait_list: &[Arc<Event>]) -> TaskCount {
    let mut level = base;
    for event in wait_list {
        let event_level = event.task_level();
        if event_level == CompletionStamp::NOT_READY {
            return CompletionStamp::NOT_READY;
        }
        level = level.max(event_level);
    }
    level
}

/// Ordering level of a new request; advances `queue_level` when the request
/// moves ordering forward
pub fn obtain_task_level(
    queue_level: &mut TaskCount,
    ordering: QueueOrdering,
    kind: &RequestKind,
    wait_list: &[Arc<Event>],
) -> TaskCount {
    let level = wait_list_level(*queue_level, wait_list);
    if level_update_required(level, *queue_level, ordering, kind, wait_list) {
        let next = level + 1;
        *queue_level = next;
        return next;
    }
    level
}

fn level_update_required(
    level: TaskCount,
    queue_level: TaskCount,
    ordering: QueueOrdering,
    kind: &RequestKind,
    wait_list: &[Arc<Event>],
) -> bool {
    if level == CompletionStamp::NOT_READY {
        return false;
    }
    // Commands without a workload inherit the level; barriers still order
    if kind.is_kernel_less() && !kind.is_barrier() {
        return false;
    }
    if ordering == QueueOrdering::OutOfOrder {
        if wait_list.is_empty() {
            return kind.is_barrier();
        }
        if wait_list_level(0, wait_list) + 1 <= queue_level {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, EventRecord};
    use crate::mock::MockHardware;
    use ember_cmd::{DependencyClass, EngineDesc, MultiWorkDescriptor};
    use ember_core::EngineId;

    fn submitted(queue: u64, engine: &Arc<EngineTarget>, level: TaskCount) -> (Arc<Event>, DependencyToken) {
        let token = engine.allocate_token().unwrap();
        let event = Event::for_queue(EventKind::Command, engine.device(), queue);
        let mut record = EventRecord::new(level);
        record.add_wait(engine, 1, None);
        record.add_token(&token);
        event.submit(record).fire();
        (event, token)
    }

    fn dispatch() -> RequestKind {
        RequestKind::Dispatch(MultiWorkDescriptor::default())
    }

    #[test]
    fn test_in_order_same_engine_elided() {
        let hw = MockHardware::new();
        let compute = hw.engine_compute(EngineId(0));
        let copy = hw.engine_copy(EngineId(1));
        let (_, compute_token) = submitted(1, &compute, 1);
        let (_, copy_token) = submitted(1, &copy, 1);

        let last = [compute_token, copy_token.clone()];
        let resolver = DependencyResolver::new(1, QueueOrdering::InOrder, &last);
        let deps = resolver.resolve(&compute, &[]);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps.tokens(DependencyClass::CrossEngine), &[copy_token][..]);

        let deps = resolver.resolve(&copy, &[]);
        assert_eq!(deps.tokens(DependencyClass::CrossEngine).len(), 1);
    }

    #[test]
    fn test_out_of_order_uses_wait_list_only() {
        let hw = MockHardware::new();
        let compute = hw.engine_compute(EngineId(0));
        let (event, token) = submitted(1, &compute, 1);
        let last = [token.clone()];

        let resolver = DependencyResolver::new(1, QueueOrdering::OutOfOrder, &last);
        assert!(resolver.resolve(&compute, &[]).is_empty());
        let deps = resolver.resolve(&compute, &[event]);
        assert_eq!(deps.tokens(DependencyClass::SameEngine), &[token][..]);
    }

    #[test]
    fn test_foreign_queue_same_engine_kept() {
        let hw = MockHardware::new();
        let compute = hw.engine_compute(EngineId(0));
        let (event, _token) = submitted(2, &compute, 1);
        let resolver = DependencyResolver::new(1, QueueOrdering::InOrder, &[]);
        assert_eq!(resolver.resolve(&compute, &[event]).len(), 1);
    }

    #[test]
    fn test_cross_device_becomes_task_count_wait() {
        let hw = MockHardware::new();
        let local = hw.engine_compute(EngineId(0));
        let remote = hw.engine_on_device(EngineDesc::compute(EngineId(16)).with_device(1));
        let (event, _token) = submitted(9, &remote, 1);

        let resolver = DependencyResolver::new(1, QueueOrdering::OutOfOrder, &[]);
        let deps = resolver.resolve(&local, &[event]);
        assert_eq!(deps.all_tokens().count(), 0);
        assert_eq!(deps.task_count_waits().len(), 1);
        assert_eq!(deps.task_count_waits()[0].device, 1);
    }

    #[test]
    fn test_signalled_tokens_dropped() {
        let hw = MockHardware::new();
        let copy = hw.engine_copy(EngineId(1));
        let compute = hw.engine_compute(EngineId(0));
        let (event, token) = submitted(1, &copy, 1);
        token.signal();
        let resolver = DependencyResolver::new(1, QueueOrdering::OutOfOrder, &[]);
        assert!(resolver.resolve(&compute, &[event]).is_empty());
    }

    #[test]
    fn test_level_rules() {
        let mut level = 0;
        assert_eq!(obtain_task_level(&mut level, QueueOrdering::InOrder, &dispatch(), &[]), 1);
        assert_eq!(obtain_task_level(&mut level, QueueOrdering::InOrder, &RequestKind::Marker, &[]), 1);
        assert_eq!(obtain_task_level(&mut level, QueueOrdering::InOrder, &RequestKind::Barrier, &[]), 2);
        assert_eq!(level, 2);

        let mut level = 0;
        assert_eq!(obtain_task_level(&mut level, QueueOrdering::OutOfOrder, &dispatch(), &[]), 0);
        assert_eq!(obtain_task_level(&mut level, QueueOrdering::OutOfOrder, &RequestKind::Barrier, &[]), 1);
        assert_eq!(level, 1);
    }

    #[test]
    fn test_queued_event_level_not_ready() {
        let user = Event::user(0);
        let mut level = 4;
        let got = obtain_task_level(&mut level, QueueOrdering::InOrder, &dispatch(), &[user.clone()]);
        assert_eq!(got, CompletionStamp::NOT_READY);
        assert_eq!(level, 4);

        user.complete().unwrap();
        assert_eq!(obtain_task_level(&mut level, QueueOrdering::InOrder, &dispatch(), &[user]), 5);
    }

    #[test]
    fn test_out_of_order_wait_list_behind_queue() {
        let hw = MockHardware::new();
        let compute = hw.engine_compute(EngineId(0));
        let (old, _t) = submitted(1, &compute, 1);
        let mut level = 5;
        assert_eq!(obtain_task_level(&mut level, QueueOrdering::OutOfOrder, &dispatch(), &[old]), 5);
        assert_eq!(level, 5);

        let (newer, _t) = submitted(1, &compute, 7);
        assert_eq!(obtain_task_level(&mut level, QueueOrdering::OutOfOrder, &dispatch(), &[newer]), 8);
    }
}
