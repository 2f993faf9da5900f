use std::any::Any;

use tracing::trace;

use super::{Admission, DeqCookie, Discipline};
use crate::packet::{Packet, PacketList, MAX_PRIORITY, NUM_PRIORITIES};

/// Strict-priority discipline: sixteen FIFO lists indexed by packet
/// priority, served highest first. The default discipline of every
/// transmit queue.
#[derive(Debug)]
pub struct PriorityQueue<P> {
    lists: [PacketList<P>; NUM_PRIORITIES],
    len: usize,
}

impl<P: Packet> PriorityQueue<P> {
    pub fn new() -> Self {
        Self {
            lists: std::array::from_fn(|_| PacketList::new()),
            len: 0,
        }
    }
}

impl<P: Packet> Default for PriorityQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Discipline<P> for PriorityQueue<P>
where
    P: Packet,
{
    fn queue_index(&self, nqueues: usize, packet: &P) -> usize {
        match packet.flow_id() {
            Some(flow) if nqueues > 0 => flow as usize % nqueues,
            _ => 0,
        }
    }

    fn enqueue(&mut self, packet: P, maxlen: usize) -> Admission<P> {
        let priority = packet.priority() as usize;
        assert!(
            priority <= MAX_PRIORITY as usize,
            "packet priority {priority} out of range"
        );

        if self.len >= maxlen {
            // Full queue: the newcomer may claim the slot of the head of
            // the lowest non-empty list strictly below its own priority.
            return match (0..priority).find(|&p| !self.lists[p].is_empty()) {
                Some(victim_slot) => {
                    let victim = self.lists[victim_slot].dequeue().unwrap();
                    self.lists[priority].enqueue(packet);
                    trace!(
                        priority,
                        victim_priority = victim_slot,
                        "evict lower-priority packet from full queue"
                    );
                    Admission::Evicted(victim)
                }
                None => {
                    trace!(priority, "reject packet, no lower-priority victim");
                    Admission::Rejected(packet)
                }
            };
        }

        self.lists[priority].enqueue(packet);
        self.len += 1;
        Admission::Queued
    }

    fn deq_begin(&mut self) -> Option<DeqCookie> {
        (0..NUM_PRIORITIES)
            .rev()
            .find(|&p| !self.lists[p].is_empty())
            .map(DeqCookie::new)
    }

    fn peek(&self, cookie: &DeqCookie) -> Option<&P> {
        self.lists[cookie.slot()].front()
    }

    fn deq_commit(&mut self, cookie: DeqCookie) -> P {
        let packet = self.lists[cookie.slot()]
            .dequeue()
            .expect("dequeue commit without a pending selection");
        self.len -= 1;
        packet
    }

    fn purge(&mut self, out: &mut PacketList<P>) -> usize {
        for priority in (0..NUM_PRIORITIES).rev() {
            out.concat(&mut self.lists[priority]);
        }
        std::mem::take(&mut self.len)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
