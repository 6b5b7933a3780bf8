//! Fused downstream manager
//!
//! Fans one logical output stream across a fixed set of nested managers,
//! one per sub-protocol. New paths are parked as *unassigned* until the
//! first message on them tells the owner which nested manager they belong
//! to; `assign` then moves the path into that manager.
//!
//! # Tables
//!
//! ```text
//!   unassigned: slot -> Box<OutboundPath>      (router owns the path)
//!   paths:      slot -> ManagerId              (nested manager owns it)
//! ```
//!
//! A slot appears in at most one table. Routed paths are always resolved
//! through their owner, so a `paths` entry never points at a path owned by
//! someone else.
//!
//! Manager-wide metrics aggregate over the nested managers:
//! `capacity` is the minimum, `buffered` the maximum, and
//! `buffered_slot` the sum (non-owners answer zero).

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use crate::error::{RouteError, RouteResult, StreamError};
use crate::manager::{check_with, DownstreamManager, PathAlgorithm};
use crate::path::OutboundPath;
use crate::slot::StreamSlot;
use crate::{kdebug, kerror};

/// Index of a nested manager, in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerId(pub usize);

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct FusedDownstreamManager {
    /// Fixed at construction
    nested: Box<[Box<dyn DownstreamManager>]>,
    paths: HashMap<StreamSlot, ManagerId>,
    unassigned: HashMap<StreamSlot, Box<OutboundPath>>,
}

impl FusedDownstreamManager {
    pub fn new(nested: Vec<Box<dyn DownstreamManager>>) -> Self {
        Self {
            nested: nested.into_boxed_slice(),
            paths: HashMap::new(),
            unassigned: HashMap::new(),
        }
    }

    // -- nested managers ---------------------------------------------------

    #[inline]
    pub fn num_managers(&self) -> usize {
        self.nested.len()
    }

    pub fn manager(&self, id: ManagerId) -> Option<&dyn DownstreamManager> {
        self.nested.get(id.0).map(|m| &**m)
    }

    pub fn manager_mut(&mut self, id: ManagerId) -> Option<&mut (dyn DownstreamManager + 'static)> {
        self.nested.get_mut(id.0).map(|m| &mut **m)
    }

    /// Position of the first nested manager of type `M`.
    pub fn index_of<M: DownstreamManager + 'static>(&self) -> Option<ManagerId> {
        self.nested
            .iter()
            .position(|m| m.as_any().is::<M>())
            .map(ManagerId)
    }

    pub fn get<M: DownstreamManager + 'static>(&self) -> Option<&M> {
        self.nested.iter().find_map(|m| m.as_any().downcast_ref::<M>())
    }

    pub fn get_mut<M: DownstreamManager + 'static>(&mut self) -> Option<&mut M> {
        self.nested
            .iter_mut()
            .find_map(|m| m.as_any_mut().downcast_mut::<M>())
    }

    /// First nested manager whose batches carry `element`.
    ///
    /// Used by stream owners to pick the target of `assign` from the type
    /// of the first message on a path.
    pub fn select_manager(&self, element: TypeId) -> Option<ManagerId> {
        self.nested
            .iter()
            .position(|m| m.element_type() == Some(element))
            .map(ManagerId)
    }

    /// `select_manager` for a statically known element type.
    pub fn select_for<T: 'static>(&self) -> Option<ManagerId> {
        self.select_manager(TypeId::of::<T>())
    }

    // -- routing -----------------------------------------------------------

    /// Park `path` until `assign` names its owner.
    pub fn register_path(&mut self, path: Box<OutboundPath>) -> RouteResult<()> {
        let slot = path.slot();
        if self.paths.contains_key(&slot) || self.unassigned.contains_key(&slot) {
            kerror!("cannot register path: slot {} already in use", slot);
            return Err(RouteError::SlotInUse(slot));
        }
        kdebug!("slot {} registered for {}", slot, path.target);
        self.unassigned.insert(slot, path);
        self.check_invariants();
        Ok(())
    }

    /// Move the unassigned path for `slot` into the nested manager `owner`.
    pub fn assign(&mut self, slot: StreamSlot, owner: ManagerId) -> RouteResult<()> {
        let result = self.assign_impl(slot, owner);
        self.check_invariants();
        result
    }

    /// `assign` to the first nested manager of type `M`.
    pub fn assign_to<M: DownstreamManager + 'static>(&mut self, slot: StreamSlot) -> RouteResult<()> {
        match self.index_of::<M>() {
            Some(id) => self.assign(slot, id),
            None => {
                kerror!("cannot assign slot {}: no nested {}", slot, type_name::<M>());
                Err(RouteError::UnknownManagerType(type_name::<M>()))
            }
        }
    }

    fn assign_impl(&mut self, slot: StreamSlot, owner: ManagerId) -> RouteResult<()> {
        if owner.0 >= self.nested.len() {
            kerror!("cannot assign slot {}: no nested manager {}", slot, owner);
            return Err(RouteError::UnknownManager(owner.0));
        }
        // The path leaves the unassigned table on every outcome below.
        let Some(path) = self.unassigned.remove(&slot) else {
            kerror!("cannot assign nested manager to unknown slot {}", slot);
            return Err(RouteError::UnknownSlot(slot));
        };
        let mgr = &mut self.nested[owner.0];
        if !mgr.insert_path(path) {
            kerror!("nested manager {} rejected slot {}", owner, slot);
            return Err(RouteError::OwnerRejected(slot));
        }
        if self.paths.contains_key(&slot) {
            kerror!("slot {} already mapped", slot);
            mgr.remove_path(slot, Some(StreamError::InvalidStreamState), false);
            return Err(RouteError::SlotAlreadyMapped(slot));
        }
        kdebug!("slot {} assigned to {}", slot, owner);
        self.paths.insert(slot, owner);
        Ok(())
    }

    /// Owner of a routed slot.
    pub fn owner_of(&self, slot: StreamSlot) -> Option<ManagerId> {
        self.paths.get(&slot).copied()
    }

    pub fn is_unassigned(&self, slot: StreamSlot) -> bool {
        self.unassigned.contains_key(&slot)
    }

    pub fn num_unassigned(&self) -> usize {
        self.unassigned.len()
    }

    pub fn unassigned_path(&self, slot: StreamSlot) -> Option<&OutboundPath> {
        self.unassigned.get(&slot).map(|p| &**p)
    }

    /// Drop router entries whose owner no longer has the path, e.g. after a
    /// nested manager closed a drained slot on its own.
    fn prune_routes(&mut self) {
        let nested = &self.nested;
        self.paths
            .retain(|slot, owner| nested[owner.0].path(*slot).is_some());
    }

    fn check_invariants(&self) {
        check_route_invariants(self);
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "debug-assertions"))] {
        fn check_route_invariants(m: &FusedDownstreamManager) {
            for (slot, owner) in &m.paths {
                assert!(
                    !m.unassigned.contains_key(slot),
                    "slot {} both routed and unassigned",
                    slot
                );
                assert!(
                    m.nested[owner.0].path(*slot).is_some(),
                    "slot {} routed to {} which does not own it",
                    slot,
                    owner
                );
            }
        }
    } else {
        #[inline(always)]
        fn check_route_invariants(_m: &FusedDownstreamManager) {}
    }
}

impl DownstreamManager for FusedDownstreamManager {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn terminal(&self) -> bool {
        false
    }

    fn num_paths(&self) -> usize {
        self.paths.len()
    }

    fn insert_path(&mut self, path: Box<OutboundPath>) -> bool {
        self.register_path(path).is_ok()
    }

    fn remove_path(&mut self, slot: StreamSlot, reason: Option<StreamError>, silent: bool) -> bool {
        let Some(owner) = self.paths.remove(&slot) else {
            return false;
        };
        self.nested[owner.0].remove_path(slot, reason, silent)
    }

    fn path(&self, slot: StreamSlot) -> Option<&OutboundPath> {
        let owner = self.paths.get(&slot)?;
        self.nested[owner.0].path(slot)
    }

    fn path_mut(&mut self, slot: StreamSlot) -> Option<&mut OutboundPath> {
        let owner = *self.paths.get(&slot)?;
        self.nested[owner.0].path_mut(slot)
    }

    fn for_each_path(&mut self, f: &mut dyn FnMut(&mut OutboundPath)) {
        let nested = &mut self.nested;
        for (slot, owner) in &self.paths {
            if let Some(p) = nested[owner.0].path_mut(*slot) {
                f(p);
            }
        }
    }

    fn visit_paths(&self, f: &mut dyn FnMut(&OutboundPath)) {
        for (slot, owner) in &self.paths {
            if let Some(p) = self.nested[owner.0].path(*slot) {
                f(p);
            }
        }
    }

    fn check_paths(&self, algo: PathAlgorithm, pred: &dyn Fn(&OutboundPath) -> bool) -> bool {
        let iter = self
            .paths
            .iter()
            .filter_map(|(slot, owner)| self.nested[owner.0].path(*slot));
        check_with(algo, iter, pred)
    }

    fn clear_paths(&mut self) {
        for m in self.nested.iter_mut() {
            m.clear_paths();
        }
        self.paths.clear();
    }

    fn close(&mut self) {
        for m in self.nested.iter_mut() {
            m.close();
        }
        self.paths.clear();
    }

    fn close_slot(&mut self, slot: StreamSlot) {
        let Some(owner) = self.paths.get(&slot).copied() else {
            return;
        };
        let mgr = &mut self.nested[owner.0];
        mgr.close_slot(slot);
        if mgr.path(slot).is_none() {
            self.paths.remove(&slot);
        }
    }

    fn abort(&mut self, reason: StreamError) {
        for m in self.nested.iter_mut() {
            m.abort(reason.clone());
        }
        self.paths.clear();
    }

    fn emit_batches(&mut self) {
        for m in self.nested.iter_mut() {
            m.emit_batches();
        }
        self.prune_routes();
    }

    fn force_emit_batches(&mut self) {
        for m in self.nested.iter_mut() {
            m.force_emit_batches();
        }
        self.prune_routes();
    }

    fn capacity(&self) -> usize {
        self.nested
            .iter()
            .map(|m| m.capacity())
            .min()
            .unwrap_or(usize::MAX)
    }

    fn buffered(&self) -> usize {
        self.nested.iter().map(|m| m.buffered()).max().unwrap_or(0)
    }

    fn buffered_slot(&self, slot: StreamSlot) -> usize {
        self.nested.iter().map(|m| m.buffered_slot(slot)).sum()
    }
}
