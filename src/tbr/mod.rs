//! Token-bucket rate regulation layered above the transmit disciplines.
//! A regulator gates how fast packets leave a queue; it never reorders
//! them.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bandwidth::Bandwidth;
use bytesize::ByteSize;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};

mod bucket;

use bucket::Bucket;

/// Interval of the refill re-poll driving gated interfaces.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Monotonic tick source the regulator charges time against.
pub trait Clock: Send + Sync + 'static {
    /// Current tick count.
    fn ticks(&self) -> u64;

    /// Ticks per second; zero when the clock cannot be measured.
    fn frequency(&self) -> u64;
}

/// Wall-clock tick source with nanosecond resolution.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn frequency(&self) -> u64 {
        1_000_000_000
    }
}

/// Hand-advanced tick source for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    ticks: std::sync::atomic::AtomicU64,
    freq: u64,
}

impl ManualClock {
    pub fn new(freq: u64) -> Self {
        Self {
            ticks: std::sync::atomic::AtomicU64::new(0),
            freq,
        }
    }

    pub fn advance(&self, ticks: u64) {
        self.ticks
            .fetch_add(ticks, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn ticks(&self) -> u64 {
        self.ticks.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn frequency(&self) -> u64 {
        self.freq
    }
}

/// Regulator configuration: sustained rate and burst depth.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct TbrProfile {
    /// Sustained rate in bits per second. Zero detaches.
    pub rate: Bandwidth,
    /// Maximum burst in bytes; also the initial balance.
    pub depth: ByteSize,
}

/// Per-queue rate regulator. Lives under the owning queue's mutex; the
/// gate runs inside the dequeue path that already holds it.
pub struct TokenBucketRegulator {
    bucket: Bucket,
    clock: Arc<dyn Clock>,
    freq: u64,
}

impl TokenBucketRegulator {
    pub(crate) fn new(profile: &TbrProfile, clock: Arc<dyn Clock>) -> Result<Self> {
        let freq = clock.frequency();
        if freq == 0 {
            return Err(Error::ClockUnavailable);
        }
        if profile.depth.as_u64() == 0 {
            return Err(Error::ConfigError(
                "regulator depth must be greater than 0".to_string(),
            ));
        }
        let bytes_per_sec = (profile.rate.as_bps() / 8) as u64;
        let bucket = Bucket::new(bytes_per_sec, profile.depth.as_u64(), freq, clock.ticks());
        Ok(Self {
            bucket,
            clock,
            freq,
        })
    }

    /// Gate a dequeue transaction. Runs once per reservation, at begin
    /// time.
    pub(crate) fn admit(&mut self) -> bool {
        let admitted = self.bucket.admit(self.clock.ticks());
        if !admitted {
            trace!("dequeue gated, token balance exhausted");
        }
        admitted
    }

    /// Charge a committed removal against the balance.
    pub(crate) fn debit(&mut self, bytes: usize) {
        self.bucket.debit(bytes);
    }

    /// Reverse-convert the scaled internals for reporting.
    pub(crate) fn profile(&self) -> TbrProfile {
        TbrProfile {
            rate: Bandwidth::from_bps(self.bucket.bytes_per_sec(self.freq) * 8),
            depth: ByteSize::b(self.bucket.depth_bytes()),
        }
    }
}

impl fmt::Debug for TokenBucketRegulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketRegulator")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

/// Kick target of the refill tick: a transmit queue whose packets may be
/// gated behind its regulator.
pub trait GatedQueue: Send + Sync {
    /// True while the queue holds packets.
    fn has_pending(&self) -> bool;

    /// Re-run the interface's start routine to retry a gated dequeue.
    fn kick(&self);
}

fn queue_id(queue: &Weak<dyn GatedQueue>) -> *const () {
    Weak::as_ptr(queue).cast::<()>()
}

struct ContextInner {
    queues: Vec<Weak<dyn GatedQueue>>,
    ticker: bool,
}

/// Process-wide regulator bookkeeping: the shared clock plus the periodic
/// tick that retries interfaces gated on empty buckets. The tick is armed
/// by the first attach and disarms itself once no regulator remains.
pub struct TbrContext {
    clock: Arc<dyn Clock>,
    tick: Duration,
    inner: Mutex<ContextInner>,
}

static GLOBAL: Lazy<Arc<TbrContext>> =
    Lazy::new(|| TbrContext::new(Arc::new(MonotonicClock::new()), DEFAULT_TICK));

impl TbrContext {
    pub fn new(clock: Arc<dyn Clock>, tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            clock,
            tick,
            inner: Mutex::new(ContextInner {
                queues: Vec::new(),
                ticker: false,
            }),
        })
    }

    /// The process-wide context backed by the monotonic clock.
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Track a queue whose regulator was just installed, arming the
    /// periodic tick if it is the first one.
    pub(crate) fn attach(self: &Arc<Self>, queue: Weak<dyn GatedQueue>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.queues.retain(|q| q.strong_count() > 0);
        let id = queue_id(&queue);
        if !inner.queues.iter().any(|q| queue_id(q) == id) {
            inner.queues.push(queue);
        }
        if !inner.ticker {
            inner.ticker = true;
            drop(inner);
            if let Err(e) = self.spawn_ticker() {
                self.inner.lock().ticker = false;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Forget a queue whose regulator was removed. The tick notices an
    /// empty registry on its next pass and stops.
    pub(crate) fn detach(&self, queue: &Weak<dyn GatedQueue>) {
        let id = queue_id(queue);
        let mut inner = self.inner.lock();
        inner.queues.retain(|q| queue_id(q) != id && q.strong_count() > 0);
    }

    fn spawn_ticker(self: &Arc<Self>) -> Result<()> {
        debug!(tick = ?self.tick, "arm token bucket refill tick");
        let ctx = Arc::downgrade(self);
        let tick = self.tick;
        thread::Builder::new()
            .name("tbr-tick".to_string())
            .spawn(move || loop {
                thread::sleep(tick);
                let Some(ctx) = ctx.upgrade() else { break };
                let mut inner = ctx.inner.lock();
                inner.queues.retain(|q| q.strong_count() > 0);
                if inner.queues.is_empty() {
                    // No regulator left anywhere; disarm until the next
                    // attach.
                    inner.ticker = false;
                    debug!("token bucket refill tick disarmed");
                    break;
                }
                let queues: Vec<_> = inner.queues.iter().filter_map(Weak::upgrade).collect();
                drop(inner);
                for queue in queues {
                    if queue.has_pending() {
                        queue.kick();
                    }
                }
            })?;
        Ok(())
    }
}

impl fmt::Debug for TbrContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TbrContext")
            .field("tick", &self.tick)
            .field("queues", &inner.queues.len())
            .field("ticker", &inner.ticker)
            .finish()
    }
}
