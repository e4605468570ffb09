//! Bandwidth limiting for `--limit-rate`.
//!
//! A token bucket holds one token per KiB; a transfer of `n` bytes waits for
//! `ceil(n / 1024)` tokens, in bursts of at most one second's worth.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::sync::stats::format_size;

const TOKEN_BYTES: u64 = 1024;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared byte-rate limiter. Cloning shares the bucket.
#[derive(Clone, Default)]
pub struct BandwidthLimiter {
    limiter: Option<Arc<DirectLimiter>>,
    tokens_per_second: u32,
}

impl BandwidthLimiter {
    /// Limit to `bytes_per_second`; `None` or zero means unlimited.
    pub fn new(bytes_per_second: Option<u64>) -> Self {
        let tokens = bytes_per_second
            .map(|bps| (bps / TOKEN_BYTES).clamp(1, u32::MAX as u64) as u32)
            .unwrap_or(0);
        match (bytes_per_second.filter(|bps| *bps > 0), NonZeroU32::new(tokens)) {
            (Some(_), Some(rate)) => Self {
                limiter: Some(Arc::new(RateLimiter::direct(Quota::per_second(rate)))),
                tokens_per_second: rate.get(),
            },
            _ => Self::unlimited(),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_limited(&self) -> bool {
        self.limiter.is_some()
    }

    /// Wait until `bytes` may be considered sent. No-op when unlimited.
    pub async fn acquire(&self, bytes: u64) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let mut remaining = bytes.div_ceil(TOKEN_BYTES).max(1);
        while remaining > 0 {
            let batch = remaining.min(self.tokens_per_second as u64) as u32;
            let Some(n) = NonZeroU32::new(batch) else {
                break;
            };
            // `n` never exceeds the burst size, so capacity is always sufficient.
            if limiter.until_n_ready(n).await.is_err() {
                break;
            }
            remaining -= batch as u64;
        }
    }

    /// Check whether `bytes` could be sent right now without waiting.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };
        let tokens = bytes.div_ceil(TOKEN_BYTES).max(1);
        match u32::try_from(tokens).ok().and_then(NonZeroU32::new) {
            Some(n) => matches!(limiter.check_n(n), Ok(Ok(()))),
            None => false,
        }
    }

    /// Human form of the configured rate.
    pub fn display(&self) -> String {
        if !self.is_limited() {
            return "unlimited".to_string();
        }
        format!("{}/s", format_size(self.tokens_per_second as u64 * TOKEN_BYTES))
    }
}
