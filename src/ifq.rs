//! The interface send queue: one pluggable discipline instance, counters,
//! an admission threshold, and an optional rate regulator, all behind one
//! mutex held only for discipline operations and counter updates. Packet
//! destructors never run under the lock.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketList};
use crate::queue::{Admission, DeqCookie, Discipline, PriorityQueue};
use crate::stats::InterfaceStats;
use crate::task::{Serializer, Task};
use crate::tbr::{GatedQueue, TbrContext, TbrProfile, TokenBucketRegulator};

/// Admission threshold of a freshly initialized transmit queue.
pub const DEFAULT_MAXLEN: usize = 256;

/// Driver side of a transmit queue. `start` is called with the queue
/// serialized: at most one invocation per queue is ever in flight.
pub trait TransmitStart<P: Packet>: Send + Sync + 'static {
    fn start(&self, ifq: &IfQueue<P>);
}

struct Inner<P: Packet> {
    disc: Box<dyn Discipline<P>>,
    len: usize,
    maxlen: usize,
    packets: u64,
    bytes: u64,
    qdrops: u64,
    errors: u64,
    mcasts: u64,
    /// Packets waiting to be dropped once the lock is released.
    free: PacketList<P>,
    tbr: Option<TokenBucketRegulator>,
}

pub struct IfQueue<P: Packet> {
    idx: usize,
    driver: Arc<dyn TransmitStart<P>>,
    serializer: Serializer,
    start_task: Arc<Task>,
    restart_task: Arc<Task>,
    oactive: AtomicBool,
    inner: Mutex<Inner<P>>,
}

impl<P: Packet> IfQueue<P> {
    /// Create transmit queue `idx` of an interface, with the priority
    /// discipline installed.
    pub fn new(idx: usize, driver: Arc<dyn TransmitStart<P>>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let start_weak = weak.clone();
            let start_task = Task::new(move || {
                if let Some(ifq) = start_weak.upgrade() {
                    ifq.driver.start(&ifq);
                }
            });
            let restart_weak = weak.clone();
            let restart_task = Task::new(move || {
                if let Some(ifq) = restart_weak.upgrade() {
                    ifq.clr_oactive();
                    ifq.driver.start(&ifq);
                }
            });
            Self {
                idx,
                driver,
                serializer: Serializer::new(),
                start_task,
                restart_task,
                oactive: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    disc: Box::new(PriorityQueue::new()),
                    len: 0,
                    maxlen: DEFAULT_MAXLEN,
                    packets: 0,
                    bytes: 0,
                    qdrops: 0,
                    errors: 0,
                    mcasts: 0,
                    free: PacketList::new(),
                    tbr: None,
                }),
            }
        })
    }

    /// Release the queue mutex, then drop whatever was parked on the free
    /// list while it was held.
    fn unlock(mut guard: MutexGuard<'_, Inner<P>>) {
        let pending = guard.free.take();
        drop(guard);
        drop(pending);
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn maxlen(&self) -> usize {
        self.inner.lock().maxlen
    }

    pub fn set_maxlen(&self, maxlen: usize) {
        self.inner.lock().maxlen = maxlen;
    }

    /// Attribute driver-observed transmit errors to this queue.
    pub fn add_errors(&self, n: u64) {
        self.inner.lock().errors += n;
    }

    /// Select one of `nqueues` queues for a packet, the way the installed
    /// discipline spreads flows.
    pub fn queue_index(&self, nqueues: usize, packet: &P) -> usize {
        self.inner.lock().disc.queue_index(nqueues, packet)
    }

    /// Hand a packet to the discipline. Counters reflect admitted packets
    /// only; an evicted victim or a rejected packet is counted as a drop
    /// and freed after the lock is released.
    pub fn enqueue(&self, packet: P) -> Result<()> {
        let length = packet.length() as u64;
        let mcast = packet.is_multicast();
        let mut guard = self.inner.lock();
        let maxlen = guard.maxlen;
        let result = match guard.disc.enqueue(packet, maxlen) {
            Admission::Queued => {
                guard.len += 1;
                guard.packets += 1;
                guard.bytes += length;
                if mcast {
                    guard.mcasts += 1;
                }
                Ok(())
            }
            Admission::Evicted(victim) => {
                guard.packets += 1;
                guard.bytes += length;
                if mcast {
                    guard.mcasts += 1;
                }
                guard.qdrops += 1;
                guard.free.enqueue(victim);
                Ok(())
            }
            Admission::Rejected(packet) => {
                guard.qdrops += 1;
                guard.free.enqueue(packet);
                Err(Error::QueueFull)
            }
        };
        Self::unlock(guard);
        result
    }

    /// Reserve the next packet for the driver. The reservation holds the
    /// queue lock until it is committed or rolled back; dropping it rolls
    /// back. When a regulator is attached the reservation is refused
    /// while the token balance is exhausted.
    pub fn deq_begin(&self) -> Option<DequeueRef<'_, P>> {
        let mut guard = self.inner.lock();
        if guard.len == 0 {
            Self::unlock(guard);
            return None;
        }
        if let Some(tbr) = guard.tbr.as_mut() {
            if !tbr.admit() {
                Self::unlock(guard);
                return None;
            }
        }
        match guard.disc.deq_begin() {
            Some(cookie) => Some(DequeueRef {
                guard: Some(guard),
                cookie: Some(cookie),
            }),
            None => {
                Self::unlock(guard);
                None
            }
        }
    }

    /// Reserve and immediately commit.
    pub fn dequeue(&self) -> Option<P> {
        self.deq_begin().map(DequeueRef::commit)
    }

    /// Drain the discipline entirely. Every drained packet counts as a
    /// drop and is freed outside the lock. Returns how many were purged.
    pub fn purge(&self) -> usize {
        let mut guard = self.inner.lock();
        let mut drained = PacketList::new();
        let n = guard.disc.purge(&mut drained);
        guard.len = 0;
        guard.qdrops += n as u64;
        Self::unlock(guard);
        drop(drained);
        n
    }

    /// Swap in a new discipline. The old instance's contents are drained
    /// and re-offered to the new one; refusals are counted as drops. The
    /// old instance and any refused packets are freed after the swap
    /// point, outside the lock.
    pub fn attach(&self, disc: Box<dyn Discipline<P>>) {
        let mut guard = self.inner.lock();
        let mut drained = PacketList::new();
        guard.disc.purge(&mut drained);
        let old = mem::replace(&mut guard.disc, disc);
        guard.len = 0;
        let maxlen = guard.maxlen;
        for packet in drained {
            match guard.disc.enqueue(packet, maxlen) {
                Admission::Queued => guard.len += 1,
                Admission::Evicted(victim) => {
                    guard.qdrops += 1;
                    guard.free.enqueue(victim);
                }
                Admission::Rejected(packet) => {
                    guard.qdrops += 1;
                    guard.free.enqueue(packet);
                }
            }
        }
        debug!(requeued = guard.len, "swap transmit discipline");
        Self::unlock(guard);
        drop(old);
    }

    /// Access the installed discipline as its concrete type, under the
    /// queue lock. Fails closed: returns `None` if a different discipline
    /// has since been installed. Packets the closure pulls out of
    /// discipline-private state go through the [`DeferredFree`] handle so
    /// the length and drop counter stay consistent and the packets are
    /// freed outside the lock.
    pub fn with_discipline<D, R, F>(&self, f: F) -> Option<R>
    where
        D: Discipline<P>,
        F: FnOnce(&mut D, &mut DeferredFree<'_, P>) -> R,
    {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Inner {
            disc,
            len,
            qdrops,
            free,
            ..
        } = inner;
        let result = disc
            .as_any_mut()
            .downcast_mut::<D>()
            .map(|disc| f(disc, &mut DeferredFree { len, qdrops, free }));
        Self::unlock(guard);
        result
    }

    /// Accumulate this queue's counters into `data`.
    pub fn add_data(&self, data: &mut InterfaceStats) {
        let guard = self.inner.lock();
        data.opackets += guard.packets;
        data.obytes += guard.bytes;
        data.oqdrops += guard.qdrops;
        data.oerrors += guard.errors;
        data.omcasts += guard.mcasts;
        Self::unlock(guard);
    }

    /// Run the driver's start routine, serialized against every other
    /// start/restart of this queue.
    pub fn start(&self) {
        self.serializer.run(&self.start_task);
    }

    /// Clear the output-active flag, then start.
    pub fn restart(&self) {
        self.serializer.run(&self.restart_task);
    }

    /// Block until all previously submitted start/restart work finished.
    /// Callers must tolerate sleeping.
    pub fn barrier(&self) {
        self.serializer.barrier();
    }

    pub fn set_oactive(&self) {
        self.oactive.store(true, Ordering::Release);
    }

    pub fn clr_oactive(&self) {
        self.oactive.store(false, Ordering::Release);
    }

    pub fn is_oactive(&self) -> bool {
        self.oactive.load(Ordering::Acquire)
    }

    /// Install, replace, or (with `None` or a zero rate) remove the rate
    /// regulator gating this queue. Installing registers the queue with
    /// `ctx` so the periodic tick retries gated dequeues.
    pub fn tbr_set(self: &Arc<Self>, ctx: &Arc<TbrContext>, profile: Option<TbrProfile>) -> Result<()> {
        let profile = profile.filter(|p| p.rate.as_bps() != 0);
        let new = match &profile {
            Some(profile) => Some(TokenBucketRegulator::new(profile, ctx.clock())?),
            None => None,
        };
        let attach = new.is_some();
        let mut guard = self.inner.lock();
        let old = mem::replace(&mut guard.tbr, new);
        Self::unlock(guard);
        drop(old);

        let me: Weak<dyn GatedQueue> = Arc::downgrade(&(self.clone() as Arc<dyn GatedQueue>));
        if attach {
            debug!(idx = self.idx, ?profile, "attach rate regulator");
            ctx.attach(me)?;
        } else {
            debug!(idx = self.idx, "detach rate regulator");
            ctx.detach(&me);
        }
        Ok(())
    }

    /// The attached regulator's profile, reverse-converted to bits/sec
    /// and bytes. `None` when the queue is unregulated.
    pub fn tbr_get(&self) -> Option<TbrProfile> {
        let guard = self.inner.lock();
        let profile = guard.tbr.as_ref().map(TokenBucketRegulator::profile);
        Self::unlock(guard);
        profile
    }
}

impl<P: Packet> GatedQueue for IfQueue<P> {
    fn has_pending(&self) -> bool {
        !self.is_empty()
    }

    fn kick(&self) {
        self.start();
    }
}

impl<P: Packet> std::fmt::Debug for IfQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("IfQueue")
            .field("idx", &self.idx)
            .field("len", &guard.len)
            .field("maxlen", &guard.maxlen)
            .field("regulated", &guard.tbr.is_some())
            .finish_non_exhaustive()
    }
}

/// A pending dequeue: the packet picked by the discipline, not yet
/// removed. Holds the queue lock, so exactly one reservation exists at a
/// time; dropping it without committing is the rollback.
pub struct DequeueRef<'a, P: Packet> {
    guard: Option<MutexGuard<'a, Inner<P>>>,
    cookie: Option<DeqCookie>,
}

impl<P: Packet> DequeueRef<'_, P> {
    /// Look at the reserved packet, e.g. for encapsulation look-ahead.
    pub fn packet(&self) -> &P {
        let guard = self.guard.as_ref().unwrap();
        guard
            .disc
            .peek(self.cookie.as_ref().unwrap())
            .expect("reservation lost its packet")
    }

    /// Take the reserved packet out of the queue. Any attached regulator
    /// is debited here, and only here.
    pub fn commit(mut self) -> P {
        let mut guard = self.guard.take().unwrap();
        let cookie = self.cookie.take().unwrap();
        let packet = guard.disc.deq_commit(cookie);
        guard.len -= 1;
        if let Some(tbr) = guard.tbr.as_mut() {
            tbr.debit(packet.length());
        }
        IfQueue::unlock(guard);
        packet
    }

    /// Abandon the reservation, leaving the queue untouched.
    pub fn rollback(self) {}
}

impl<P: Packet> Drop for DequeueRef<'_, P> {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            IfQueue::unlock(guard);
        }
    }
}

/// Lets `with_discipline` closures hand back packets removed from
/// discipline-private state: the queue length and drop counter stay
/// consistent and the packets are dropped after the lock is released.
#[derive(Debug)]
pub struct DeferredFree<'a, P: Packet> {
    len: &'a mut usize,
    qdrops: &'a mut u64,
    free: &'a mut PacketList<P>,
}

impl<P: Packet> DeferredFree<'_, P> {
    pub fn free(&mut self, packet: P) {
        *self.len -= 1;
        *self.qdrops += 1;
        self.free.enqueue(packet);
    }

    pub fn free_list(&mut self, mut list: PacketList<P>) {
        *self.len -= list.len();
        *self.qdrops += list.len() as u64;
        self.free.concat(&mut list);
    }
}
