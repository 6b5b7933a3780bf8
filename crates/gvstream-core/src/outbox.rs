//! Downstream messages and the outbox they are sent through
//!
//! Sending to actors is not modeled here. A manager "sends" by pushing an
//! [`Envelope`] into its [`Outbox`]; whoever owns the outbox (the actor
//! runtime, or a test) drains it and delivers.

use core::fmt;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::StreamError;
use crate::path::ActorAddr;
use crate::slot::StreamSlots;

/// A batch of stream elements. The element type is erased so that paths
/// of different sub-protocols can share one envelope type.
pub struct Batch {
    pub id: u64,
    pub size: usize,
    items: Box<dyn Any + Send>,
}

impl Batch {
    /// The batch content, if it holds `Vec<T>`.
    pub fn items<T: 'static>(&self) -> Option<&Vec<T>> {
        self.items.downcast_ref::<Vec<T>>()
    }

    pub fn into_items<T: 'static>(self) -> Option<Vec<T>> {
        self.items.downcast::<Vec<T>>().ok().map(|b| *b)
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug)]
pub enum DownstreamMsg {
    Batch(Batch),
    /// Graceful end of stream
    Close,
    /// Irregular end of stream
    ForcedClose(StreamError),
}

impl DownstreamMsg {
    pub fn batch<T: Send + 'static>(id: u64, items: Vec<T>) -> Self {
        DownstreamMsg::Batch(Batch {
            id,
            size: items.len(),
            items: Box::new(items),
        })
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, DownstreamMsg::Batch(_))
    }
}

#[derive(Debug)]
pub struct Envelope {
    pub target: ActorAddr,
    pub slots: StreamSlots,
    pub msg: DownstreamMsg,
}

/// Shared FIFO of envelopes. Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct Outbox {
    inner: Arc<Mutex<VecDeque<Envelope>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, env: Envelope) {
        self.queue().push_back(env);
    }

    /// Take everything sent so far, oldest first.
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox").field("len", &self.len()).finish()
    }
}
