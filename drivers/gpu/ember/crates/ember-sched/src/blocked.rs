//! # Blocked Commands
//!
//! Requests captured while a wait-list event was unresolved, kept in the
//! queue's chain until they can be submitted.
//!
//! The chain is FIFO: only its head is ever submitted, so later commands
//! go out after every earlier one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::vec::Vec;

use ember_cmd::CommandStream;
use ember_core::{Error, TaskCount};

use crate::event::{Event, EventStatus};
use crate::request::RequestKind;

/// State of a blocked command's wait list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every event resolved
    Ready,
    /// Some event still queued
    Pending,
    /// Some event aborted
    Aborted(Error),
}

/// Snapshot of a request awaiting submission
#[derive(Debug)]
pub struct BlockedCommand {
    /// What to do
    pub kind: RequestKind,
    /// Events that must resolve first
    pub wait_list: Vec<Arc<Event>>,
    /// Ordering level assigned at capture
    pub task_level: TaskCount,
    /// Event resolved on submission
    pub event: Arc<Event>,
    /// Event of the command before this one in the chain
    pub previous: Option<Arc<Event>>,
    /// Kernel commands encoded at capture
    pub fragment: Option<CommandStream>,
}

impl BlockedCommand {
    /// Check the wait list
    pub fn readiness(&self) -> Readiness {
        let mut ready = true;
        for event in &self.wait_list {
            match event.status() {
                EventStatus::Aborted(_) => return Readiness::Aborted(Error::DependencyAborted),
                EventStatus::Queued => ready = false,
                EventStatus::Submitted | EventStatus::Complete => {}
            }
        }
        if ready {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }
}

/// FIFO chain of blocked commands
#[derive(Debug, Default)]
pub struct BlockedChain {
    commands: VecDeque<BlockedCommand>,
}

impl BlockedChain {
    /// Append, linking the command to the current tail
    pub fn push(&mut self, mut command: BlockedCommand) {
        command.previous = self.commands.back().map(|c| Arc::clone(&c.event));
        self.commands.push_back(command);
    }

    /// Head of the chain
    pub fn front(&self) -> Option<&BlockedCommand> {
        self.commands.front()
    }

    /// Take the head
    pub fn pop_front(&mut self) -> Option<BlockedCommand> {
        self.commands.pop_front()
    }

    /// Take everything
    pub fn drain(&mut self) -> Vec<BlockedCommand> {
        self.commands.drain(..).collect()
    }

    /// Number of blocked commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use ember_core::CompletionStamp;

    fn blocked(wait_on: &Arc<Event>) -> BlockedCommand {
        BlockedCommand {
            kind: RequestKind::Marker,
            wait_list: vec![wait_on.clone()],
            task_level: CompletionStamp::NOT_READY,
            event: Event::for_queue(EventKind::Virtual, 0, 1),
            previous: None,
            fragment: None,
        }
    }

    #[test]
    fn test_chain_links_and_order() {
        let user = Event::user(0);
        let mut chain = BlockedChain::default();
        chain.push(blocked(&user));
        chain.push(blocked(&user));
        assert_eq!(chain.len(), 2);

        let first = chain.pop_front().unwrap();
        let second = chain.pop_front().unwrap();
        assert!(first.previous.is_none());
        assert_eq!(second.previous.as_ref().map(|e| e.id()), Some(first.event.id()));
    }

    #[test]
    fn test_readiness_follows_user_event() {
        let user = Event::user(0);
        let command = blocked(&user);
        assert_eq!(command.readiness(), Readiness::Pending);
        user.abort(Error::DeviceLost).unwrap();
        assert_eq!(command.readiness(), Readiness::Aborted(Error::DependencyAborted));

        let user = Event::user(0);
        let command = blocked(&user);
        user.complete().unwrap();
        assert_eq!(command.readiness(), Readiness::Ready);
    }
}
