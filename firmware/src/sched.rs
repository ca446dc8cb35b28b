//! The cooperative scheduler seen from the I/O core

use crate::fs::async_queue::OpQueue;

/// Provides the yield primitive of the cooperative runtime. A task that yields
/// must eventually regain control after other tasks (in particular the one
/// draining the operation queue) have run.
pub trait Scheduler {
    fn yield_now(&self);
}

/// Scheduler for a runtime with a single task: every yield drains the
/// operation queue in place
pub struct DrainingScheduler<'q> {
    queue: &'q OpQueue,
}

impl<'q> DrainingScheduler<'q> {
    pub fn new(queue: &'q OpQueue) -> Self {
        Self { queue }
    }
}

impl Scheduler for DrainingScheduler<'_> {
    fn yield_now(&self) {
        // failures stay recorded in the queue for the caller to pick up
        let _ = self.queue.drain();
    }
}
