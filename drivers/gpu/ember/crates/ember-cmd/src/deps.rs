//! # Dependency Sets
//!
//! Wait conditions an engine programs into its command stream before the
//! work it guards.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ember_core::{EngineId, TagCounter, TaskCount};
use hashbrown::HashSet;

use crate::tag::DependencyToken;

/// Dependency class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyClass {
    /// Token written by the engine that waits on it
    SameEngine,
    /// Token written by another engine of the same device, including barriers
    CrossEngine,
    /// Task count of an engine on another root device
    CrossDevice,
}

/// Wait for an engine on another root device to reach a task count
#[derive(Debug, Clone)]
pub struct TaskCountWait {
    /// Engine to wait on
    pub engine: EngineId,
    /// Root device of that engine
    pub device: u32,
    /// Its completion tag
    pub tag: Arc<TagCounter>,
    /// Task count to reach
    pub task_count: TaskCount,
}

impl TaskCountWait {
    /// Check if the task count already retired
    #[inline]
    pub fn is_satisfied(&self) -> bool {
        self.tag.is_retired(self.task_count)
    }
}

// =============================================================================
// DEPENDENCY SET
// =============================================================================

/// De-duplicated, class-partitioned set of waits
#[derive(Debug, Default, Clone)]
pub struct DependencySet {
    same_engine: Vec<DependencyToken>,
    cross_engine: Vec<DependencyToken>,
    cross_device: Vec<TaskCountWait>,
    seen: HashSet<DependencyToken>,
}

impl DependencySet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token for a consumer running on `target`
    ///
    /// Already-signalled and duplicate tokens are skipped. Returns whether the
    /// token was added.
    pub fn add_token(&mut self, token: &DependencyToken, target: EngineId) -> bool {
        let class = if token.engine() == target {
            DependencyClass::SameEngine
        } else {
            DependencyClass::CrossEngine
        };
        self.add_with_class(token, class)
    }

    /// Add a token under an explicit class
    pub fn add_with_class(&mut self, token: &DependencyToken, class: DependencyClass) -> bool {
        if token.is_signalled() || self.seen.contains(token) {
            return false;
        }
        self.seen.insert(token.clone());
        match class {
            DependencyClass::SameEngine => self.same_engine.push(token.clone()),
            DependencyClass::CrossEngine | DependencyClass::CrossDevice => {
                self.cross_engine.push(token.clone())
            }
        }
        true
    }

    /// Add a task-count wait on another root device
    pub fn add_task_count_wait(&mut self, wait: TaskCountWait) -> bool {
        if wait.is_satisfied() {
            return false;
        }
        let existing = self
            .cross_device
            .iter_mut()
            .find(|w| w.engine == wait.engine && w.device == wait.device);
        match existing {
            Some(w) => w.task_count = w.task_count.max(wait.task_count),
            None => self.cross_device.push(wait),
        }
        true
    }

    /// Tokens of one class
    pub fn tokens(&self, class: DependencyClass) -> &[DependencyToken] {
        match class {
            DependencyClass::SameEngine => &self.same_engine,
            DependencyClass::CrossEngine => &self.cross_engine,
            DependencyClass::CrossDevice => &[],
        }
    }

    /// Every token, same-engine first
    pub fn all_tokens(&self) -> impl Iterator<Item = &DependencyToken> + '_ {
        self.same_engine.iter().chain(self.cross_engine.iter())
    }

    /// Task-count waits on other root devices
    pub fn task_count_waits(&self) -> &[TaskCountWait] {
        &self.cross_device
    }

    /// Check if a token is part of the set
    pub fn contains(&self, token: &DependencyToken) -> bool {
        self.seen.contains(token)
    }

    /// Total number of waits
    pub fn len(&self) -> usize {
        self.same_engine.len() + self.cross_engine.len() + self.cross_device.len()
    }

    /// Check if there is nothing to wait on
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if every wait is already satisfied
    pub fn is_satisfied(&self) -> bool {
        self.all_tokens().all(|t| t.is_signalled()) && self.cross_device.iter().all(|w| w.is_satisfied())
    }
}
