//! Aggregate request pacing.
//!
//! One limiter instance is shared by every worker in a run and bounds the
//! combined operations/second. GCRA (via `governor`) gives leaky-bucket
//! smoothing: sustained throughput never exceeds the target while short
//! bursts may catch up after idle periods.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

pub enum Limiter {
    /// No pacing; `acquire` returns immediately.
    Unlimited,
    Paced(RateLimiter<NotKeyed, InMemoryState, DefaultClock>),
}

impl Limiter {
    /// A limiter targeting `rps` operations per second; `0` means unlimited.
    pub fn new(rps: u32) -> Limiter {
        match NonZeroU32::new(rps) {
            Some(rate) => Limiter::Paced(RateLimiter::direct(Quota::per_second(rate))),
            None => Limiter::Unlimited,
        }
    }

    /// Wait until the caller may issue one operation.
    pub async fn acquire(&self) {
        if let Limiter::Paced(rl) = self {
            rl.until_ready().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = Limiter::new(0);
        let start = Instant::now();
        for _ in 0..10_000 {
            limiter.acquire().await;
        }
        assert!(start.elapsed().as_millis() < 500);
    }

    #[tokio::test]
    async fn paced_acquires_respect_the_target_rate() {
        // 1000 rps with a full-second burst allowance: 1500 acquires must
        // take at least the ~500ms the post-burst half is paced over.
        let limiter = Limiter::new(1000);
        let start = Instant::now();
        for _ in 0..1500 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed.as_millis() >= 350, "finished too fast: {elapsed:?}");
    }
}
