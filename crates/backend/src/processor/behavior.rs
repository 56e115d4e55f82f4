// Cross-cutting behaviours wrapped around a processor
//
// A behaviour sees the context before each attempt of the layer it wraps and
// the outcome after it. `after` may rewrite the outcome or ask for the wrapped
// layer to run again after a delay, which is how retries are expressed.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Invocation, ProcessingContext, ProcessorError};
use crate::domain::config::RetryOptions;

/// What the chain should do once a behaviour has seen an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterAction {
  /// Hand the outcome to the next layer out
  Continue,
  /// Run the wrapped layer again after the delay
  Retry(Duration),
}

#[async_trait::async_trait]
pub trait Behavior: Send + Sync {
  fn name(&self) -> &str;

  /// Runs before each attempt. An error skips the attempt and becomes the outcome.
  async fn before(&self, _processor: &str, _ctx: &mut ProcessingContext, _attempt: u32) -> Result<(), ProcessorError> {
    Ok(())
  }

  async fn after(
    &self,
    _processor: &str,
    _ctx: &mut ProcessingContext,
    _outcome: &mut Invocation,
    _attempt: u32,
  ) -> AfterAction {
    AfterAction::Continue
  }
}

// ============================================================================
// Retry
// ============================================================================

/// Re-runs failed attempts with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryBehavior {
  options: RetryOptions,
}

impl RetryBehavior {
  pub fn new(options: RetryOptions) -> Self {
    Self { options }
  }

  /// Delay before retrying `event` after its `attempt`-th failure. Jitter is
  /// derived from the event id, so one event always waits the same amount
  /// while events failing together spread out.
  pub fn retry_delay(&self, event: Uuid, attempt: u32) -> Duration {
    let cap = Duration::from_millis(self.options.max_backoff_ms);
    let first = Duration::from_millis(self.options.initial_backoff_ms);
    let grown = first.as_secs_f64() * self.options.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let delay = Duration::try_from_secs_f64(grown.min(cap.as_secs_f64())).unwrap_or(cap);

    if !self.options.jitter {
      return delay;
    }
    // Stretch by up to a quarter, never past the cap
    delay.mul_f64(1.0 + jitter_fraction(event, attempt) * 0.25).min(cap)
  }

  fn should_retry(outcome: &Invocation) -> bool {
    match outcome {
      Ok(outcome) => !outcome.success,
      Err(e) => e.is_retryable(),
    }
  }
}

/// Fraction in `[0, 1)` taken from the random bits of an event id
fn jitter_fraction(event: Uuid, attempt: u32) -> f64 {
  let (_, low) = event.as_u64_pair();
  let bits = low.rotate_left(attempt.wrapping_mul(13) % 64);
  (bits % 10_000) as f64 / 10_000.0
}

#[async_trait::async_trait]
impl Behavior for RetryBehavior {
  fn name(&self) -> &str {
    "retry"
  }

  async fn after(
    &self,
    processor: &str,
    ctx: &mut ProcessingContext,
    outcome: &mut Invocation,
    attempt: u32,
  ) -> AfterAction {
    if !Self::should_retry(outcome) {
      if attempt > 0 && matches!(outcome, Ok(o) if o.success) {
        info!(processor, path = %ctx.path(), attempt, "Processor succeeded after retry");
      }
      return AfterAction::Continue;
    }

    if attempt >= self.options.max_retries {
      warn!(
        processor,
        path = %ctx.path(),
        max_retries = self.options.max_retries,
        "All retries exhausted"
      );
      return AfterAction::Continue;
    }

    let backoff = self.retry_delay(ctx.event.id, attempt);
    debug!(
      processor,
      path = %ctx.path(),
      attempt = attempt + 1,
      max_retries = self.options.max_retries,
      backoff_ms = backoff.as_millis(),
      "Retryable failure, will retry"
    );
    AfterAction::Retry(backoff)
  }
}

// ============================================================================
// Logging
// ============================================================================

/// Start time of the current attempt, kept in the context's extensions
struct AttemptStarted(Instant);

/// Logs each attempt with its duration
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBehavior;

#[async_trait::async_trait]
impl Behavior for LoggingBehavior {
  fn name(&self) -> &str {
    "logging"
  }

  async fn before(&self, processor: &str, ctx: &mut ProcessingContext, attempt: u32) -> Result<(), ProcessorError> {
    debug!(
      processor,
      location = %ctx.location(),
      path = %ctx.path(),
      event_type = %ctx.event.event_type,
      attempt,
      "Processing event"
    );
    ctx.extensions.insert(AttemptStarted(Instant::now()));
    Ok(())
  }

  async fn after(
    &self,
    processor: &str,
    ctx: &mut ProcessingContext,
    outcome: &mut Invocation,
    attempt: u32,
  ) -> AfterAction {
    let duration_ms = ctx
      .extensions
      .remove::<AttemptStarted>()
      .map(|AttemptStarted(started)| started.elapsed().as_millis())
      .unwrap_or_default();

    match outcome {
      Ok(o) if o.success => {
        info!(processor, path = %ctx.path(), attempt, duration_ms, message = %o.message, "Processed event")
      }
      Ok(o) => {
        warn!(processor, path = %ctx.path(), attempt, duration_ms, message = %o.message, "Processor reported failure")
      }
      Err(e) => warn!(processor, path = %ctx.path(), attempt, duration_ms, error = %e, "Processor errored"),
    }

    AfterAction::Continue
  }
}
