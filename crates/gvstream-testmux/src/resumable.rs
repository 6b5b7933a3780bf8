//! Resumables: units of work the reactor queue executes

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::multiplexer::TestMultiplexer;

/// Decides whether the reactor runs a resumable itself or forwards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumableKind {
    Unspecified,
    ScheduledActor,
    IoActor,
    FunctionObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeResult {
    ResumeLater,
    AwaitingMessage,
    Done,
    ShutdownExecutionUnit,
}

pub trait Resumable: Send + Sync {
    fn subtype(&self) -> ResumableKind;

    /// Run for at most `max_throughput` steps.
    fn resume(&self, mux: &TestMultiplexer, max_throughput: usize) -> ResumeResult;
}

pub type ResumablePtr = Arc<dyn Resumable>;

type Job = Box<dyn FnOnce(&TestMultiplexer) + Send>;

/// One-shot function object.
pub struct FnResumable {
    job: Mutex<Option<Job>>,
}

impl FnResumable {
    pub fn new<F>(f: F) -> Arc<Self>
    where
        F: FnOnce(&TestMultiplexer) + Send + 'static,
    {
        Arc::new(Self {
            job: Mutex::new(Some(Box::new(f))),
        })
    }
}

impl Resumable for FnResumable {
    fn subtype(&self) -> ResumableKind {
        ResumableKind::FunctionObject
    }

    fn resume(&self, mux: &TestMultiplexer, _max_throughput: usize) -> ResumeResult {
        let job = self.job.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(job) = job {
            job(mux);
        }
        ResumeResult::Done
    }
}

impl fmt::Debug for FnResumable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnResumable")
    }
}
