//! Fixed-point token accounting for the rate regulator, driven tick by
//! tick against a machine clock.

/// Token balances are byte counts scaled by 2^32 so that per-tick rate
/// arithmetic keeps sub-byte precision without floating point.
pub(crate) const TOKEN_SHIFT: u32 = 32;

/// A scaled byte credit. Signed: the balance may overdraw by up to one
/// packet after a send, which bounds the wait for packets larger than the
/// configured depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Tokens(i64);

impl Tokens {
    pub(crate) const ZERO: Tokens = Tokens(0);

    pub(crate) fn from_bytes(bytes: u64) -> Tokens {
        // Widen before shifting: byte counts near 2^32 must saturate, not
        // wrap.
        Tokens(((bytes as i128) << TOKEN_SHIFT).min(i64::MAX as i128) as i64)
    }

    pub(crate) fn raw(self) -> i64 {
        self.0
    }

    pub(crate) fn saturating_bytes(self) -> u64 {
        (self.0 >> TOKEN_SHIFT).max(0) as u64
    }
}

impl std::ops::Add<i64> for Tokens {
    type Output = Tokens;

    fn add(self, raw: i64) -> Tokens {
        Tokens(self.0 + raw)
    }
}

impl std::ops::SubAssign<Tokens> for Tokens {
    fn sub_assign(&mut self, other: Tokens) {
        self.0 -= other.0;
    }
}

/// Token balance refilled at a fixed rate, debited per transmitted byte.
/// Pure arithmetic over an abstract tick count so tests can advance the
/// timeline by hand.
#[derive(Debug)]
pub(crate) struct Bucket {
    /// Scaled bytes credited per clock tick.
    rate: i64,
    depth: Tokens,
    token: Tokens,
    /// Ticks from empty to full, `u64::MAX` when the rate rounds to zero.
    filluptime: u64,
    /// Tick of the last refill.
    last: u64,
}

impl Bucket {
    pub(crate) fn new(bytes_per_sec: u64, depth_bytes: u64, freq: u64, now: u64) -> Self {
        let rate = (((bytes_per_sec as i128) << TOKEN_SHIFT) / freq as i128)
            .min(i64::MAX as i128) as i64;
        let depth = Tokens::from_bytes(depth_bytes);
        let filluptime = if rate > 0 {
            (depth.raw() / rate) as u64
        } else {
            u64::MAX
        };
        Self {
            rate,
            depth,
            // A full bucket at init.
            token: depth,
            filluptime,
            last: now,
        }
    }

    /// Refill if the balance is exhausted, then report whether a dequeue
    /// may proceed. A balance that stays at or below zero refuses; a
    /// positive balance admits even when smaller than the next packet.
    pub(crate) fn admit(&mut self, now: u64) -> bool {
        if self.token <= Tokens::ZERO {
            let interval = now.saturating_sub(self.last);
            if interval >= self.filluptime {
                // A full fill period or more has passed; jump straight to
                // depth rather than multiplying over a long idle gap.
                self.token = self.depth;
            } else {
                self.token = (self.token + interval as i64 * self.rate).min(self.depth);
            }
            self.last = now;
        }
        self.token > Tokens::ZERO
    }

    /// Charge a transmitted packet against the balance.
    pub(crate) fn debit(&mut self, bytes: usize) {
        self.token -= Tokens::from_bytes(bytes as u64);
    }

    pub(crate) fn bytes_per_sec(&self, freq: u64) -> u64 {
        ((self.rate as i128 * freq as i128) >> TOKEN_SHIFT) as u64
    }

    pub(crate) fn depth_bytes(&self) -> u64 {
        self.depth.saturating_bytes()
    }

    #[cfg(test)]
    pub(crate) fn token(&self) -> Tokens {
        self.token
    }

    #[cfg(test)]
    pub(crate) fn filluptime(&self) -> u64 {
        self.filluptime
    }
}
