// Token-bucket rate limiter gating a location's processing loop
//
// The bucket holds up to `capacity` tokens and refills continuously at `rate`
// tokens per second. Each processed event consumes one token, so after an
// idle period up to `capacity` events run back to back, after which
// throughput settles at `rate` events per second.
//
// Time comes from `tokio::time::Instant`, which is monotonic and can be
// paused in tests.

use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::domain::config::RateLimitOptions;

/// Longest single sleep while waiting for a token
const MAX_POLL: Duration = Duration::from_millis(100);

/// Absorbs float rounding in the refill arithmetic
const EPSILON: f64 = 1e-9;

/// Bucket state without any locking. All methods take the current instant so
/// they can be driven deterministically.
#[derive(Debug, Clone)]
pub struct TokenBucket {
  rate: f64,
  capacity: f64,
  tokens: f64,
  last_refill: Instant,
}

impl TokenBucket {
  /// Create a full bucket
  pub fn new(options: RateLimitOptions) -> Self {
    let capacity = f64::from(options.max_burst_size.max(1));
    Self {
      rate: options.events_per_second,
      capacity,
      tokens: capacity,
      last_refill: Instant::now(),
    }
  }

  fn refill(&mut self, now: Instant) {
    let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
    if elapsed > 0.0 {
      self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
      self.last_refill = now;
    }
  }

  /// Take one token if available, otherwise return how long until one is.
  pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
    self.refill(now);

    if self.tokens >= 1.0 - EPSILON {
      self.tokens -= 1.0;
      Ok(())
    } else {
      let missing = 1.0 - self.tokens;
      // Callers sleep at most MAX_POLL anyway; a wait too long for Duration is just long
      Err(Duration::try_from_secs_f64(missing / self.rate).unwrap_or(MAX_POLL))
    }
  }
}

/// Shared, async token bucket
#[derive(Debug)]
pub struct RateLimiter {
  bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
  pub fn new(options: RateLimitOptions) -> Self {
    Self {
      bucket: Mutex::new(TokenBucket::new(options)),
    }
  }

  /// Wait for a token. Returns `false` if `cancel` fired first.
  pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
    loop {
      let wait = match self.bucket.lock().await.try_take(Instant::now()) {
        Ok(()) => return true,
        Err(wait) => wait.clamp(Duration::from_millis(1), MAX_POLL),
      };

      trace!(wait_ms = wait.as_millis(), "Rate limit reached, waiting for token");

      tokio::select! {
        biased;
        _ = cancel.cancelled() => return false,
        _ = tokio::time::sleep(wait) => {}
      }
    }
  }
}
