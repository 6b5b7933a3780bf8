//! Broadcast downstream manager
//!
//! Every element pushed into the central buffer is copied to every open
//! path. Paths consume their per-path cache as credit arrives.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::manager::{check_with, DownstreamManager, PathAlgorithm};
use crate::outbox::Outbox;
use crate::path::OutboundPath;
use crate::slot::StreamSlot;
use crate::{kdebug, ktrace};

struct PathState<T> {
    path: Box<OutboundPath>,
    cache: VecDeque<T>,
}

pub struct BroadcastManager<T> {
    outbox: Outbox,
    max_buffer: usize,
    /// Batch size handed to paths until their target asks for another
    batch_size: usize,
    buf: VecDeque<T>,
    paths: BTreeMap<StreamSlot, PathState<T>>,
    last_send: Option<Instant>,
}

impl<T: Clone + Send + 'static> BroadcastManager<T> {
    pub fn new(outbox: Outbox, config: &StreamConfig) -> Self {
        Self {
            outbox,
            max_buffer: config.max_buffer,
            batch_size: config.batch_size.max(1),
            buf: VecDeque::new(),
            paths: BTreeMap::new(),
            last_send: None,
        }
    }

    /// Append `item` to the central buffer, ignoring capacity.
    pub fn push(&mut self, item: T) {
        self.buf.push_back(item);
    }

    /// Append `item` only if the buffer has room; hands it back otherwise.
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        if self.capacity() == 0 {
            return Err(item);
        }
        self.buf.push_back(item);
        Ok(())
    }

    /// Complete the handshake for `slot`. Returns `false` for unknown slots.
    pub fn handle_open_ack(
        &mut self,
        slot: StreamSlot,
        receiver: StreamSlot,
        initial_credit: usize,
        desired_batch_size: usize,
    ) -> bool {
        match self.paths.get_mut(&slot) {
            Some(st) => {
                st.path.handle_open_ack(receiver, initial_credit, desired_batch_size);
                true
            }
            None => false,
        }
    }

    /// Record an ack on `slot`. Returns `false` for unknown slots.
    pub fn handle_ack(
        &mut self,
        slot: StreamSlot,
        acked_batch_id: u64,
        new_credit: usize,
        desired_batch_size: usize,
    ) -> bool {
        match self.paths.get_mut(&slot) {
            Some(st) => {
                st.path.handle_ack(acked_batch_id, new_credit, desired_batch_size);
                true
            }
            None => false,
        }
    }

    /// Force underfull batches if nothing was sent for `max_delay`.
    pub fn tick(&mut self, now: Instant, max_delay: Duration) {
        let due = match self.last_send {
            Some(t) => now.saturating_duration_since(t) >= max_delay,
            None => true,
        };
        if due && self.buffered() > 0 {
            self.force_emit_batches();
            self.last_send = Some(now);
        }
    }

    /// Copy the central buffer into the cache of every open path.
    fn fan_out(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let mut receivers = self.paths.values_mut().filter(|st| !st.path.closing).peekable();
        if receivers.peek().is_none() {
            return;
        }
        for st in receivers {
            st.cache.extend(self.buf.iter().cloned());
        }
        self.buf.clear();
    }

    fn emit_batches_impl(&mut self, force_underfull: bool) {
        self.fan_out();
        let mut sent = false;
        let mut drained = Vec::new();
        for (slot, st) in self.paths.iter_mut() {
            if !st.path.pending() {
                sent |= emit_from_cache(&self.outbox, st, force_underfull);
            }
            if st.path.closing && st.cache.is_empty() && st.path.clean() {
                drained.push(*slot);
            }
        }
        for slot in drained {
            if let Some(st) = self.paths.remove(&slot) {
                kdebug!("slot {} drained, closing", slot);
                st.path.emit_regular_shutdown(&self.outbox);
            }
        }
        if sent {
            self.last_send = Some(Instant::now());
        }
    }
}

/// Emit full batches out of `st.cache` within the path's credit, plus one
/// underfull batch if `force_underfull`.
fn emit_from_cache<T: Send + 'static>(outbox: &Outbox, st: &mut PathState<T>, force_underfull: bool) -> bool {
    let batch = st.path.desired_batch_size.max(1);
    let mut sendable = st.path.open_credit.min(st.cache.len());
    let mut sent = false;
    while sendable >= batch {
        let items: Vec<T> = st.cache.drain(..batch).collect();
        st.path.emit_batch(outbox, items);
        sendable -= batch;
        sent = true;
    }
    if sendable > 0 && force_underfull {
        let items: Vec<T> = st.cache.drain(..sendable).collect();
        st.path.emit_batch(outbox, items);
        sent = true;
    }
    if sent {
        ktrace!("slot {} credit left {}", st.path.slot(), st.path.open_credit);
    }
    sent
}

impl<T: Clone + Send + 'static> DownstreamManager for BroadcastManager<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn element_type(&self) -> Option<TypeId> {
        Some(TypeId::of::<T>())
    }

    fn terminal(&self) -> bool {
        false
    }

    fn num_paths(&self) -> usize {
        self.paths.len()
    }

    fn insert_path(&mut self, mut path: Box<OutboundPath>) -> bool {
        let slot = path.slot();
        if !slot.is_valid() || self.paths.contains_key(&slot) {
            return false;
        }
        if path.pending() {
            path.desired_batch_size = self.batch_size;
        }
        kdebug!("slot {} added for {}", slot, path.target);
        self.paths.insert(
            slot,
            PathState {
                path,
                cache: VecDeque::new(),
            },
        );
        true
    }

    fn remove_path(&mut self, slot: StreamSlot, reason: Option<StreamError>, silent: bool) -> bool {
        let Some(st) = self.paths.remove(&slot) else {
            return false;
        };
        if !silent {
            match reason {
                None => st.path.emit_regular_shutdown(&self.outbox),
                Some(e) => st.path.emit_irregular_shutdown(&self.outbox, e),
            }
        }
        kdebug!("slot {} removed", slot);
        true
    }

    fn path(&self, slot: StreamSlot) -> Option<&OutboundPath> {
        self.paths.get(&slot).map(|st| &*st.path)
    }

    fn path_mut(&mut self, slot: StreamSlot) -> Option<&mut OutboundPath> {
        self.paths.get_mut(&slot).map(|st| &mut *st.path)
    }

    fn for_each_path(&mut self, f: &mut dyn FnMut(&mut OutboundPath)) {
        for st in self.paths.values_mut() {
            f(&mut st.path);
        }
    }

    fn visit_paths(&self, f: &mut dyn FnMut(&OutboundPath)) {
        for st in self.paths.values() {
            f(&st.path);
        }
    }

    fn check_paths(&self, algo: PathAlgorithm, pred: &dyn Fn(&OutboundPath) -> bool) -> bool {
        check_with(algo, self.paths.values().map(|st| &*st.path), pred)
    }

    fn clear_paths(&mut self) {
        self.paths.clear();
    }

    fn close(&mut self) {
        for st in self.paths.values() {
            st.path.emit_regular_shutdown(&self.outbox);
        }
        self.paths.clear();
    }

    fn close_slot(&mut self, slot: StreamSlot) {
        let Some(st) = self.paths.get_mut(&slot) else {
            return;
        };
        st.path.closing = true;
        if st.cache.is_empty() && st.path.clean() {
            self.remove_path(slot, None, false);
        }
    }

    fn abort(&mut self, reason: StreamError) {
        for st in self.paths.values() {
            st.path.emit_irregular_shutdown(&self.outbox, reason.clone());
        }
        self.paths.clear();
    }

    fn emit_batches(&mut self) {
        self.emit_batches_impl(false);
    }

    fn force_emit_batches(&mut self) {
        self.emit_batches_impl(true);
    }

    fn capacity(&self) -> usize {
        self.max_buffer.saturating_sub(self.buffered())
    }

    fn buffered(&self) -> usize {
        let max_cache = self.paths.values().map(|st| st.cache.len()).max().unwrap_or(0);
        self.buf.len() + max_cache
    }

    fn buffered_slot(&self, slot: StreamSlot) -> usize {
        self.paths
            .get(&slot)
            .map_or(0, |st| {
                // closing paths no longer receive the central buffer
                let shared = if st.path.closing { 0 } else { self.buf.len() };
                shared + st.cache.len()
            })
    }
}
