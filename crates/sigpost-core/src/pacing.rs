//! Token-bucket pacing for outbound command frames.
//!
//! Each client gets its own bucket. Callers ask for a delay under a short
//! lock and then sleep on the runtime, so a paced connection never stalls a
//! worker thread or any other connection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sigpost_config::PacingConfig;
use tracing::trace;

use crate::wire::StreamId;

/// Per-client token bucket state.
struct Bucket {
    tokens: u32,
    /// Point in time the last token was credited (or reserved, if ahead of now).
    last_refill: Instant,
}

/// Shared pacer keyed by client id.
pub struct Pacer {
    max_burst: u32,
    interval: Duration,
    buckets: Mutex<HashMap<StreamId, Bucket>>,
}

impl Pacer {
    /// `max_burst` frames may go out back-to-back; afterwards one frame per
    /// `interval`. A zero interval disables pacing.
    pub fn new(max_burst: u32, interval: Duration) -> Self {
        Self {
            max_burst: max_burst.max(1),
            interval,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &PacingConfig) -> Self {
        Self::new(config.max_burst, Duration::from_millis(config.interval_ms))
    }

    /// A pacer that never delays.
    pub fn unlimited() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Consume one token for `id` and return how long to wait before sending.
    pub fn reserve(&self, id: StreamId) -> Duration {
        self.reserve_at(id, Instant::now())
    }

    /// [`Pacer::reserve`] against an explicit clock.
    pub fn reserve_at(&self, id: StreamId, now: Instant) -> Duration {
        if self.interval.is_zero() {
            return Duration::ZERO;
        }
        let Ok(mut buckets) = self.buckets.lock() else {
            return Duration::ZERO;
        };
        let bucket = buckets.entry(id).or_insert(Bucket {
            tokens: self.max_burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refills = u32::try_from(elapsed.as_nanos() / self.interval.as_nanos())
            .unwrap_or(u32::MAX);
        if refills > 0 {
            bucket.tokens = bucket.tokens.saturating_add(refills).min(self.max_burst);
            bucket.last_refill = if bucket.tokens == self.max_burst {
                now
            } else {
                bucket.last_refill + self.interval * refills
            };
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            Duration::ZERO
        } else {
            // Reserve the next token that will be credited.
            bucket.last_refill += self.interval;
            bucket.last_refill.saturating_duration_since(now)
        }
    }

    /// Wait until the next frame for `id` may be sent.
    pub async fn wait(&self, id: StreamId) {
        let delay = self.reserve(id);
        if !delay.is_zero() {
            trace!(stream_id = id, delay_ms = delay.as_millis() as u64, "Pacing");
            tokio::time::sleep(delay).await;
        }
    }

    /// Tokens left for `id` right now.
    pub fn remaining(&self, id: StreamId) -> u32 {
        self.buckets
            .lock()
            .ok()
            .and_then(|buckets| buckets.get(&id).map(|b| b.tokens))
            .unwrap_or(self.max_burst)
    }

    /// Drop buckets that have been idle long enough to be full again.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let horizon = self.interval * self.max_burst;
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < horizon);
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::from_config(&PacingConfig::default())
    }
}
