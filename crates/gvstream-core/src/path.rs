//! Outbound paths
//!
//! An `OutboundPath` is the sender-side state for one destination of a
//! stream: which slots it uses, who the target is, and how much credit the
//! target has granted. Paths are moved between owners as `Box<OutboundPath>`
//! and are owned by exactly one downstream manager at a time.

use core::fmt;

use crate::config::defaults;
use crate::error::StreamError;
use crate::outbox::{DownstreamMsg, Envelope, Outbox};
use crate::slot::{StreamSlot, StreamSlots};

/// Address of the actor on the receiving end of a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ActorAddr(pub u64);

impl fmt::Display for ActorAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

/// Sender-side state of one stream destination.
#[derive(Debug, Clone)]
pub struct OutboundPath {
    pub slots: StreamSlots,
    pub target: ActorAddr,
    /// Items the target is still willing to receive
    pub open_credit: usize,
    pub desired_batch_size: usize,
    /// ID of the next batch we emit
    pub next_batch_id: u64,
    /// ID of the next batch we expect an ack for
    pub next_ack_id: u64,
    /// Set by a graceful close; the path is dropped once drained
    pub closing: bool,
}

impl OutboundPath {
    /// A pending path: no receiver slot and no credit until the target
    /// acknowledges the handshake.
    pub fn new(sender: StreamSlot, target: ActorAddr) -> Self {
        Self {
            slots: StreamSlots::new(sender, StreamSlot::INVALID),
            target,
            open_credit: 0,
            desired_batch_size: defaults::BATCH_SIZE,
            next_batch_id: 1,
            next_ack_id: 1,
            closing: false,
        }
    }

    #[inline]
    pub fn slot(&self) -> StreamSlot {
        self.slots.sender
    }

    /// Still waiting for the target's open acknowledgement.
    #[inline]
    pub fn pending(&self) -> bool {
        !self.slots.receiver.is_valid()
    }

    /// Every emitted batch has been acknowledged.
    #[inline]
    pub fn clean(&self) -> bool {
        self.next_batch_id == self.next_ack_id
    }

    /// Complete the handshake: learn the receiver slot and the initial credit.
    pub fn handle_open_ack(
        &mut self,
        receiver: StreamSlot,
        initial_credit: usize,
        desired_batch_size: usize,
    ) {
        self.slots.receiver = receiver;
        self.open_credit += initial_credit;
        self.desired_batch_size = desired_batch_size.max(1);
    }

    /// Record an ack for `acked_batch_id` carrying `new_credit`.
    ///
    /// Acks are cumulative: acknowledging batch N also acknowledges all
    /// batches before it. Stale acks (for batches already acknowledged)
    /// still add credit.
    pub fn handle_ack(&mut self, acked_batch_id: u64, new_credit: usize, desired_batch_size: usize) {
        if acked_batch_id >= self.next_ack_id && acked_batch_id < self.next_batch_id {
            self.next_ack_id = acked_batch_id + 1;
        }
        self.open_credit += new_credit;
        self.desired_batch_size = desired_batch_size.max(1);
    }

    /// Ship `items` as one batch, consuming credit.
    ///
    /// The caller is responsible for not exceeding `open_credit`.
    pub fn emit_batch<T: Send + 'static>(&mut self, outbox: &Outbox, items: Vec<T>) {
        debug_assert!(items.len() <= self.open_credit);
        let size = items.len();
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        self.open_credit -= size;
        outbox.push(self.envelope(DownstreamMsg::batch(id, items)));
    }

    pub fn emit_regular_shutdown(&self, outbox: &Outbox) {
        outbox.push(self.envelope(DownstreamMsg::Close));
    }

    pub fn emit_irregular_shutdown(&self, outbox: &Outbox, reason: StreamError) {
        outbox.push(self.envelope(DownstreamMsg::ForcedClose(reason)));
    }

    fn envelope(&self, msg: DownstreamMsg) -> Envelope {
        Envelope {
            target: self.target,
            slots: self.slots,
            msg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_path(credit: usize) -> OutboundPath {
        let mut p = OutboundPath::new(StreamSlot::new(1), ActorAddr(10));
        p.handle_open_ack(StreamSlot::new(2), credit, 4);
        p
    }

    #[test]
    fn test_new_path_is_pending_and_clean() {
        let p = OutboundPath::new(StreamSlot::new(1), ActorAddr(10));
        assert!(p.pending());
        assert!(p.clean());
        assert_eq!(p.open_credit, 0);
    }

    #[test]
    fn test_emit_consumes_credit_and_dirties() {
        let outbox = Outbox::new();
        let mut p = open_path(5);
        assert!(!p.pending());
        p.emit_batch(&outbox, vec![1u32, 2, 3]);
        assert_eq!(p.open_credit, 2);
        assert!(!p.clean());

        let sent = outbox.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, ActorAddr(10));
        assert_eq!(sent[0].slots.receiver, StreamSlot::new(2));
        match &sent[0].msg {
            DownstreamMsg::Batch(b) => {
                assert_eq!(b.id, 1);
                assert_eq!(b.items::<u32>(), Some(&vec![1, 2, 3]));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_cumulative_ack() {
        let outbox = Outbox::new();
        let mut p = open_path(10);
        p.emit_batch(&outbox, vec![1u8]);
        p.emit_batch(&outbox, vec![2u8]);
        p.handle_ack(2, 3, 4);
        assert!(p.clean());
        assert_eq!(p.open_credit, 8 + 3);

        // stale ack only adds credit
        p.handle_ack(1, 1, 4);
        assert!(p.clean());
        assert_eq!(p.open_credit, 12);
    }
}
