//! External scheduler seam
//!
//! Resumables that are neither I/O actors nor function objects are not the
//! reactor's business; they go to whatever `ExecutionScheduler` the reactor
//! was built with.

use crossbeam_queue::SegQueue;

use crate::resumable::ResumablePtr;

pub trait ExecutionScheduler: Send + Sync {
    fn enqueue(&self, job: ResumablePtr);
}

/// Lock-free collector. Nothing runs the jobs; the driver pops them.
#[derive(Default)]
pub struct InjectorScheduler {
    queue: SegQueue<ResumablePtr>,
}

impl InjectorScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<ResumablePtr> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl ExecutionScheduler for InjectorScheduler {
    fn enqueue(&self, job: ResumablePtr) {
        self.queue.push(job);
    }
}
