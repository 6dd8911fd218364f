//! Token bucket limiter with allow/drop accounting
//!
//! # Algorithm: Token Bucket
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  TOKEN BUCKET                                                     │
//! │                                                                   │
//! │  ┌─────────────┐                                                 │
//! │  │   Bucket    │ ← Holds tokens (max = burst)                    │
//! │  │  ● ● ● ●    │                                                 │
//! │  │  ● ● ●      │ ← Tokens refill at `rate` per second            │
//! │  └─────────────┘                                                 │
//! │        │                                                         │
//! │        ▼                                                         │
//! │  Rule match arrives:                                             │
//! │    - token available → consume 1 token, ALLOW (allowed += 1)     │
//! │    - bucket empty    → DROP (dropped += 1)                       │
//! │                                                                   │
//! │  rate = ∞ → never drops, whatever the burst                      │
//! │  burst = 0 with a finite rate → always drops                     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

// Scale factor for token precision
// We store tokens * 1000 to handle fractional tokens without floats
const SCALE: u64 = 1000;

/// Counters accumulated by a limiter since the last reset
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub allowed: u64,
    pub dropped: u64,
}

impl LimiterStats {
    pub(crate) fn merge(&mut self, other: LimiterStats) {
        self.allowed += other.allowed;
        self.dropped += other.dropped;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TokenBucket
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   A thread-safe token bucket. Token count is an atomic, the refill
//   timestamp sits behind a mutex because Instant isn't atomic.
//   rate/burst are atomics too so a registry can rewrite them in place
//   while other threads keep calling allow().
// ═══════════════════════════════════════════════════════════════════════════

pub struct TokenBucket {
    /// Tokens added per second, stored as f64 bits
    rate_bits: AtomicU64,

    /// Maximum tokens in bucket
    burst: AtomicU64,

    /// Current token count (scaled by SCALE)
    tokens_scaled: AtomicU64,

    /// Last time we refilled tokens
    last_refill: Mutex<Instant>,

    allowed: AtomicU64,
    dropped: AtomicU64,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    ///
    /// `rate` may be `f64::INFINITY`, in which case `burst` is irrelevant.
    pub fn new(rate: f64, burst: u64) -> Self {
        Self {
            rate_bits: AtomicU64::new(rate.to_bits()),
            burst: AtomicU64::new(burst),
            tokens_scaled: AtomicU64::new(burst.saturating_mul(SCALE)),
            last_refill: Mutex::new(Instant::now()),
            allowed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// A limiter that never drops
    pub fn unlimited() -> Self {
        Self::new(f64::INFINITY, 0)
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    pub fn burst(&self) -> u64 {
        self.burst.load(Ordering::Acquire)
    }

    /// Consume one token if available.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub(crate) fn allow_at(&self, now: Instant) -> bool {
        let permitted = self.try_consume(now);
        if permitted {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        permitted
    }

    fn try_consume(&self, now: Instant) -> bool {
        if self.rate().is_infinite() {
            return true;
        }

        self.refill(now);

        loop {
            let current = self.tokens_scaled.load(Ordering::Relaxed);
            if current < SCALE {
                return false;
            }

            // compare_exchange so concurrent callers never double-spend a token
            match self.tokens_scaled.compare_exchange(
                current,
                current - SCALE,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    // tokens_to_add = elapsed_seconds * rate, capped at burst
    fn refill(&self, now: Instant) {
        let mut last = self.last_refill.lock();
        let elapsed = now.saturating_duration_since(*last);

        let tokens_to_add = (elapsed.as_secs_f64() * self.rate() * SCALE as f64) as u64;
        if tokens_to_add == 0 {
            return;
        }
        *last = now;

        let max_scaled = self.burst().saturating_mul(SCALE);
        loop {
            let current = self.tokens_scaled.load(Ordering::Relaxed);
            let new = current.saturating_add(tokens_to_add).min(max_scaled);

            if self
                .tokens_scaled
                .compare_exchange(current, new, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Rewrite rate and burst in place. Tokens above the new burst are discarded.
    pub fn set_limit(&self, rate: f64, burst: u64) {
        // Holding the refill lock keeps refill() from mixing old and new limits
        let mut last = self.last_refill.lock();
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
        self.burst.store(burst, Ordering::Release);

        let max_scaled = burst.saturating_mul(SCALE);
        let _ = self
            .tokens_scaled
            .fetch_update(Ordering::SeqCst, Ordering::Relaxed, |t| Some(t.min(max_scaled)));
        *last = Instant::now();
    }

    /// Read the counters, zeroing each one in the same atomic step when `reset` is set.
    pub fn stats(&self, reset: bool) -> LimiterStats {
        if reset {
            LimiterStats {
                allowed: self.allowed.swap(0, Ordering::AcqRel),
                dropped: self.dropped.swap(0, Ordering::AcqRel),
            }
        } else {
            LimiterStats {
                allowed: self.allowed.load(Ordering::Acquire),
                dropped: self.dropped.load(Ordering::Acquire),
            }
        }
    }

    /// Get current token count (for monitoring)
    pub fn available_tokens(&self) -> u64 {
        self.tokens_scaled.load(Ordering::Relaxed) / SCALE
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate())
            .field("burst", &self.burst())
            .field("available", &self.available_tokens())
            .finish()
    }
}
