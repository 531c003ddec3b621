//! # Ember Scheduler
//!
//! Command queues of the Ember compute driver: dependency resolution,
//! engine selection, blocked-command capture and completion waits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ember-sched                             │
//! │                                                                  │
//! │   Request ──► CommandQueue::enqueue                              │
//! │                    │                                             │
//! │         ┌──────────┴───────────┐                                 │
//! │         ▼                      ▼                                 │
//! │   BlockedChain          EngineSelector ──► Route                 │
//! │   (wait list not             │                                   │
//! │    ready yet)                ▼                                   │
//! │         │            DependencyResolver ──► DependencySet        │
//! │         │                    │                                   │
//! │         └───── resume ──────►▼                                   │
//! │                      EngineTarget::flush (ember-cmd)             │
//! │                              │                                   │
//! │                              ▼                                   │
//! │                   Event ◄── CompletionWaiter                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let queue = device.create_queue(QueueConfig::out_of_order())?;
//! let upload = queue.enqueue(Request::copy(region).with_event())?;
//! queue.enqueue(Request::kernel(work).wait_on(upload))?;
//! queue.finish()?;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod blocked;
pub mod config;
pub mod device;
mod dispatch;
pub mod event;
pub mod properties;
pub mod queue;
pub mod request;
pub mod resolver;
pub mod selector;
pub mod split;
pub mod waiter;

#[cfg(test)]
mod mock;

// Re-exports for convenience
pub use blocked::{BlockedChain, BlockedCommand, Readiness};
pub use config::{EnginePreference, QueueConfig, QueueOrdering, WaitStyle};
pub use device::Device;
pub use event::{Event, EventKind, EventRecord, EventStatus, Listener};
pub use properties::{EnqueueProperties, Operation};
pub use queue::CommandQueue;
pub use request::{Request, RequestKind};
pub use resolver::DependencyResolver;
pub use selector::{EngineSelector, Route};
pub use split::{split_engines, Partition, SplitPlan, MAX_COPY_ENGINES};
pub use waiter::{CompletionWaiter, EngineWait, SpinWait, SpinWaitConfig, WaitStatus, WaitTimeout};
