//! Downstream manager abstraction.
//!
//! A `DownstreamManager` owns the outbound paths of one stream (or one
//! sub-protocol of a fused stream) and does the credit bookkeeping for
//! them: buffering, batching, and closing.
//!
//! # Implementors
//!
//! - `BroadcastManager<T>`: every path receives every element.
//! - `FusedDownstreamManager`: routes paths to a fixed set of nested
//!   managers and aggregates their metrics.
//!
//! **Contract:**
//! - A manager answers `buffered_slot(s) == 0` and `path(s) == None` for any
//!   slot it does not own. The fused router relies on this to sum
//!   per-slot metrics without knowing the owner.
//! - `insert_path` returns `false` (and drops the path) on a duplicate slot.
//! - `close`, `abort`, and `clear_paths` leave the manager without paths.

use std::any::{Any, TypeId};

use crate::error::StreamError;
use crate::path::OutboundPath;
use crate::slot::StreamSlot;

/// Selects the combinator used by [`DownstreamManager::check_paths`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathAlgorithm {
    AllOf,
    AnyOf,
    NoneOf,
}

/// Apply `algo` over `paths`, short-circuiting like the iterator adapters.
pub fn check_with<'a, I>(algo: PathAlgorithm, mut paths: I, pred: &dyn Fn(&OutboundPath) -> bool) -> bool
where
    I: Iterator<Item = &'a OutboundPath>,
{
    match algo {
        PathAlgorithm::AllOf => paths.all(|p| pred(p)),
        PathAlgorithm::AnyOf => paths.any(|p| pred(p)),
        PathAlgorithm::NoneOf => !paths.any(|p| pred(p)),
    }
}

/// Credit and path bookkeeping for the outbound side of a stream.
pub trait DownstreamManager: Send {
    /// Upcast for typed lookup of nested managers.
    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Element type carried by this manager's batches, if it has one.
    fn element_type(&self) -> Option<TypeId> {
        None
    }

    /// `true` for sinks, which terminate a stream and never have paths.
    fn terminal(&self) -> bool {
        true
    }

    // -- path management ---------------------------------------------------

    fn num_paths(&self) -> usize;

    /// Take ownership of `path`. Returns `false` on a duplicate slot.
    fn insert_path(&mut self, path: Box<OutboundPath>) -> bool;

    /// Remove the path for `slot`, notifying the target unless `silent`.
    ///
    /// `reason == None` sends a regular close, `Some(e)` a forced close.
    fn remove_path(&mut self, slot: StreamSlot, reason: Option<StreamError>, silent: bool) -> bool;

    fn path(&self, slot: StreamSlot) -> Option<&OutboundPath>;

    fn path_mut(&mut self, slot: StreamSlot) -> Option<&mut OutboundPath>;

    /// Visit every path mutably.
    fn for_each_path(&mut self, f: &mut dyn FnMut(&mut OutboundPath));

    /// Visit every path.
    fn visit_paths(&self, f: &mut dyn FnMut(&OutboundPath));

    /// Evaluate `pred` over all paths with the combinator `algo`.
    fn check_paths(&self, algo: PathAlgorithm, pred: &dyn Fn(&OutboundPath) -> bool) -> bool;

    /// Silently drop all paths.
    fn clear_paths(&mut self);

    // -- shutdown ----------------------------------------------------------

    /// Remove all paths with a regular close.
    fn close(&mut self);

    /// Mark `slot` as closing; it is removed once its data is delivered.
    fn close_slot(&mut self, slot: StreamSlot);

    /// Remove all paths with a forced close carrying `reason`.
    fn abort(&mut self, reason: StreamError);

    // -- batching ----------------------------------------------------------

    /// Send full batches wherever credit allows.
    fn emit_batches(&mut self);

    /// Send batches even if they are smaller than the desired batch size.
    fn force_emit_batches(&mut self);

    // -- metrics -----------------------------------------------------------

    /// Free space in the output buffer.
    fn capacity(&self) -> usize;

    /// Size of the output buffer.
    fn buffered(&self) -> usize;

    /// Estimate of the buffered elements for `slot`; zero for unknown slots.
    fn buffered_slot(&self, slot: StreamSlot) -> usize;

    // -- derived queries ---------------------------------------------------

    fn empty(&self) -> bool {
        self.num_paths() == 0
    }

    fn all_paths(&self, pred: &dyn Fn(&OutboundPath) -> bool) -> bool {
        self.check_paths(PathAlgorithm::AllOf, pred)
    }

    fn any_path(&self, pred: &dyn Fn(&OutboundPath) -> bool) -> bool {
        self.check_paths(PathAlgorithm::AnyOf, pred)
    }

    fn no_path(&self, pred: &dyn Fn(&OutboundPath) -> bool) -> bool {
        self.check_paths(PathAlgorithm::NoneOf, pred)
    }

    /// All slots in use.
    fn path_slots(&self) -> Vec<StreamSlot> {
        let mut slots = Vec::with_capacity(self.num_paths());
        self.visit_paths(&mut |p| slots.push(p.slot()));
        slots
    }

    /// Slots of paths that are not closing.
    fn open_path_slots(&self) -> Vec<StreamSlot> {
        let mut slots = Vec::new();
        self.visit_paths(&mut |p| {
            if !p.closing {
                slots.push(p.slot());
            }
        });
        slots
    }

    /// Minimum credit over all paths, zero without paths.
    fn min_credit(&self) -> usize {
        let mut result: Option<usize> = None;
        self.visit_paths(&mut |p| {
            result = Some(result.map_or(p.open_credit, |r| r.min(p.open_credit)));
        });
        result.unwrap_or(0)
    }

    fn max_credit(&self) -> usize {
        let mut result = 0;
        self.visit_paths(&mut |p| result = result.max(p.open_credit));
        result
    }

    fn total_credit(&self) -> usize {
        let mut result = 0;
        self.visit_paths(&mut |p| result += p.open_credit);
        result
    }

    /// Nothing buffered and every batch acknowledged.
    fn clean(&self) -> bool {
        self.buffered() == 0 && self.all_paths(&|p| p.clean())
    }

    /// `true` if `slot` is unknown, or has nothing buffered and nothing unacked.
    fn clean_slot(&self, slot: StreamSlot) -> bool {
        match self.path(slot) {
            None => true,
            Some(p) => p.clean() && self.buffered_slot(slot) == 0,
        }
    }

    /// Buffer full and no path has credit left: no progress possible.
    fn stalled(&self) -> bool {
        self.capacity() == 0 && self.all_paths(&|p| p.open_credit == 0)
    }
}
