use std::any::Any;

use crate::packet::{Packet, PacketList};

pub mod priority;

pub use priority::PriorityQueue;

/// Outcome of handing a packet to a discipline for admission.
#[derive(Debug)]
pub enum Admission<P> {
    /// Appended to its queue.
    Queued,
    /// Admitted after evicting a lower-priority resident, handed back to
    /// be dropped by the caller.
    Evicted(P),
    /// Queue full and no eligible victim; the packet itself is handed
    /// back.
    Rejected(P),
}

/// Ties a `deq_begin`/`deq_commit` pair together by recording which
/// internal list the selected packet came from.
#[derive(Debug)]
pub struct DeqCookie {
    slot: usize,
}

impl DeqCookie {
    pub fn new(slot: usize) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// A queueing discipline: the pluggable algorithm deciding admission and
/// dequeue order for one transmit queue. Implementations are driven only
/// under the owning queue's lock and must never block.
pub trait Discipline<P>: Send + 'static
where
    P: Packet,
{
    /// Select one of `nqueues` transmit queues for a packet on
    /// multi-queue hardware.
    fn queue_index(&self, nqueues: usize, packet: &P) -> usize;

    /// Admit, replace, or reject a packet. `maxlen` is the owning
    /// queue's admission threshold.
    fn enqueue(&mut self, packet: P, maxlen: usize) -> Admission<P>;

    /// Select the next packet to hand to the driver without removing it,
    /// or `None` if nothing is queued.
    fn deq_begin(&mut self) -> Option<DeqCookie>;

    /// The packet selected by the paired `deq_begin`.
    fn peek(&self, cookie: &DeqCookie) -> Option<&P>;

    /// Remove the packet selected by the paired `deq_begin`.
    ///
    /// Panics if the selection is gone; a commit without a matching begin
    /// is a caller bug, not a recoverable condition.
    fn deq_commit(&mut self, cookie: DeqCookie) -> P;

    /// Drain every resident packet into `out` and return how many moved.
    fn purge(&mut self, out: &mut PacketList<P>) -> usize;

    /// Number of resident packets.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concrete-type access for drivers that keep a reference to the
    /// discipline they installed.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
