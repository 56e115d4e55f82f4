//! Processor chain - pluggable handlers applied to every dequeued event
//!
//! Each location owns one `ProcessorChain`, built once from its
//! `ProcessorOptions` and the processors supplied at construction. A chain
//! entry pairs a processor with the behaviours attached to it and a runtime
//! enabled flag.
//!
//! # Isolation
//!
//! One processor failing, timing out or panicking never stops the chain: the
//! failure becomes an unsuccessful `ProcessingResult` and the next processor
//! runs against the same event.
//!
//! # Data sharing
//!
//! Processors pass data forward through `ProcessingContext::extensions`, a
//! typed map keyed by the value's type.

pub mod behavior;

use std::{
  any::{Any, TypeId},
  collections::HashMap,
  panic::AssertUnwindSafe,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::{Duration, Instant},
};

use futures::{FutureExt, future::BoxFuture};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use self::behavior::{AfterAction, Behavior, LoggingBehavior, RetryBehavior};
use crate::{
  domain::{
    config::{BehaviorOptions, ConfigError, ProcessorOptions},
    event::{FileEvent, ProcessingResult},
  },
  storage::{StorageError, StorageProvider},
};

// ============================================================================
// Errors & outcomes
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
  #[error("{0}")]
  Failed(String),
  #[error("Storage error: {0}")]
  Storage(#[from] StorageError),
  #[error("Timed out after {0:?}")]
  Timeout(Duration),
  #[error("Panicked: {0}")]
  Panicked(String),
  #[error("Cancelled")]
  Cancelled,
}

impl ProcessorError {
  /// Whether another attempt could plausibly succeed
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Failed(_) | Self::Storage(_) | Self::Timeout(_))
  }
}

/// What a processor reports back for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
  pub success: bool,
  pub message: String,
}

impl ProcessOutcome {
  pub fn ok(message: impl Into<String>) -> Self {
    Self {
      success: true,
      message: message.into(),
    }
  }

  pub fn failed(message: impl Into<String>) -> Self {
    Self {
      success: false,
      message: message.into(),
    }
  }
}

/// Result of one processor invocation, behaviours included
pub type Invocation = Result<ProcessOutcome, ProcessorError>;

/// Whether a processor wants an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleDecision {
  pub accepted: bool,
  pub reason: String,
}

impl HandleDecision {
  pub fn accept() -> Self {
    Self {
      accepted: true,
      reason: String::new(),
    }
  }

  pub fn decline(reason: impl Into<String>) -> Self {
    Self {
      accepted: false,
      reason: reason.into(),
    }
  }
}

// ============================================================================
// Context
// ============================================================================

/// Typed values shared between processors working on the same event
#[derive(Default)]
pub struct Extensions {
  map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
  /// Insert a value, returning the previous one of the same type
  pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
    self
      .map
      .insert(TypeId::of::<T>(), Box::new(value))
      .and_then(|old| old.downcast::<T>().ok().map(|boxed| *boxed))
  }

  pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
    self.map.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref::<T>())
  }

  pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
    self.map.get_mut(&TypeId::of::<T>()).and_then(|v| v.downcast_mut::<T>())
  }

  pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
    self
      .map
      .remove(&TypeId::of::<T>())
      .and_then(|old| old.downcast::<T>().ok().map(|boxed| *boxed))
  }

  pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
    self.map.contains_key(&TypeId::of::<T>())
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }
}

impl std::fmt::Debug for Extensions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Extensions").field("len", &self.map.len()).finish()
  }
}

/// Everything a processor sees while handling one event
pub struct ProcessingContext {
  pub event: FileEvent,
  pub provider: Arc<dyn StorageProvider>,
  pub extensions: Extensions,
  /// Fires when the owning location stops
  pub cancel: CancellationToken,
}

impl ProcessingContext {
  pub fn new(event: FileEvent, provider: Arc<dyn StorageProvider>, cancel: CancellationToken) -> Self {
    Self {
      event,
      provider,
      extensions: Extensions::default(),
      cancel,
    }
  }

  pub fn location(&self) -> &str {
    &self.event.location_name
  }

  pub fn path(&self) -> &str {
    &self.event.file_path
  }
}

impl std::fmt::Debug for ProcessingContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProcessingContext")
      .field("event", &self.event.id)
      .field("path", &self.event.file_path)
      .field("provider", &self.provider.name())
      .field("extensions", &self.extensions)
      .finish()
  }
}

// ============================================================================
// Processor trait
// ============================================================================

#[async_trait::async_trait]
pub trait Processor: Send + Sync {
  fn name(&self) -> &str;

  /// Processor-level switch, combined with the chain's runtime flag
  fn is_enabled(&self) -> bool {
    true
  }

  fn can_handle(&self, _ctx: &ProcessingContext) -> HandleDecision {
    HandleDecision::accept()
  }

  async fn process(&self, ctx: &mut ProcessingContext) -> Invocation;
}

// ============================================================================
// Chain
// ============================================================================

/// One processor with its behaviours, innermost first
pub struct ChainEntry {
  processor: Arc<dyn Processor>,
  behaviors: Vec<Arc<dyn Behavior>>,
  timeout: Option<Duration>,
  enabled: AtomicBool,
}

impl ChainEntry {
  pub fn new(processor: Arc<dyn Processor>) -> Self {
    Self {
      processor,
      behaviors: Vec::new(),
      timeout: None,
      enabled: AtomicBool::new(true),
    }
  }

  /// Attach a behaviour. Later attachments wrap earlier ones.
  pub fn with_behavior(mut self, behavior: Arc<dyn Behavior>) -> Self {
    self.behaviors.push(behavior);
    self
  }

  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn enabled(self, enabled: bool) -> Self {
    self.enabled.store(enabled, Ordering::SeqCst);
    self
  }

  pub fn name(&self) -> &str {
    self.processor.name()
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst) && self.processor.is_enabled()
  }

  /// Run the processor itself: timeout and panic capture, no behaviours
  async fn invoke_processor(&self, ctx: &mut ProcessingContext) -> Invocation {
    let attempt = AssertUnwindSafe(self.processor.process(ctx)).catch_unwind();

    let caught = match self.timeout {
      Some(limit) => match tokio::time::timeout(limit, attempt).await {
        Ok(caught) => caught,
        Err(_) => return Err(ProcessorError::Timeout(limit)),
      },
      None => attempt.await,
    };

    caught.unwrap_or_else(|panic| Err(ProcessorError::Panicked(panic_message(panic.as_ref()))))
  }

  /// Run the behaviour at `depth` around everything below it. Depth 0 is the
  /// bare processor; depth `behaviors.len()` is the outermost layer.
  fn run_layer<'a>(&'a self, depth: usize, ctx: &'a mut ProcessingContext) -> BoxFuture<'a, Invocation> {
    Box::pin(async move {
      let Some(behavior) = depth.checked_sub(1).and_then(|i| self.behaviors.get(i)) else {
        return self.invoke_processor(ctx).await;
      };

      let name = self.name();
      let mut attempt = 0u32;
      loop {
        behavior.before(name, ctx, attempt).await?;

        let mut outcome = self.run_layer(depth - 1, ctx).await;

        match behavior.after(name, ctx, &mut outcome, attempt).await {
          AfterAction::Continue => return outcome,
          AfterAction::Retry(delay) => {
            attempt += 1;
            trace!(processor = name, behavior = behavior.name(), attempt, delay_ms = delay.as_millis(), "Retrying");
            tokio::select! {
              biased;
              _ = ctx.cancel.cancelled() => return outcome,
              _ = tokio::time::sleep(delay) => {}
            }
          }
        }
      }
    })
  }

  /// Run the full decorated invocation
  pub async fn invoke(&self, ctx: &mut ProcessingContext) -> Invocation {
    let layered = AssertUnwindSafe(self.run_layer(self.behaviors.len(), ctx)).catch_unwind();
    layered
      .await
      .unwrap_or_else(|panic| Err(ProcessorError::Panicked(panic_message(panic.as_ref()))))
  }
}

impl std::fmt::Debug for ChainEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ChainEntry")
      .field("processor", &self.name())
      .field("behaviors", &self.behaviors.iter().map(|b| b.name()).collect::<Vec<_>>())
      .field("timeout", &self.timeout)
      .field("enabled", &self.is_enabled())
      .finish()
  }
}

/// Ordered processors applied to every event of a location
#[derive(Debug, Default)]
pub struct ProcessorChain {
  entries: Vec<ChainEntry>,
}

impl ProcessorChain {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&mut self, entry: ChainEntry) {
    self.entries.push(entry);
  }

  pub fn with(mut self, entry: ChainEntry) -> Self {
    self.push(entry);
    self
  }

  /// Build a location's chain from configuration.
  ///
  /// With no processor options every supplied processor runs, in the order
  /// supplied. Otherwise the options pick processors by name and order them.
  pub fn from_options(
    location: &str,
    options: &[ProcessorOptions],
    processors: &[Arc<dyn Processor>],
    custom_behaviors: &HashMap<String, Arc<dyn Behavior>>,
  ) -> Result<Self, ConfigError> {
    if options.is_empty() {
      let entries = processors.iter().cloned().map(ChainEntry::new).collect();
      return Ok(Self { entries });
    }

    let mut chain = Self::new();
    for option in options {
      let processor = processors
        .iter()
        .find(|p| p.name() == option.name)
        .cloned()
        .ok_or_else(|| ConfigError::UnknownProcessor {
          location: location.to_string(),
          processor: option.name.clone(),
        })?;

      let mut entry = ChainEntry::new(processor)
        .with_timeout(option.timeout())
        .enabled(option.enabled);

      for behavior in &option.behaviors {
        let behavior: Arc<dyn Behavior> = match behavior {
          BehaviorOptions::Logging => Arc::new(LoggingBehavior),
          BehaviorOptions::Retry(retry) => Arc::new(RetryBehavior::new(retry.clone())),
          BehaviorOptions::Custom { name } => {
            custom_behaviors
              .get(name)
              .cloned()
              .ok_or_else(|| ConfigError::UnknownBehavior {
                processor: option.name.clone(),
                behavior: name.clone(),
              })?
          }
        };
        entry = entry.with_behavior(behavior);
      }

      chain.push(entry);
    }

    Ok(chain)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn names(&self) -> Vec<String> {
    self.entries.iter().map(|e| e.name().to_string()).collect()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.entries.iter().any(|e| e.name() == name)
  }

  /// Toggle a processor at runtime. Returns false if no such processor.
  pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
    match self.entries.iter().find(|e| e.name() == name) {
      Some(entry) => {
        entry.enabled.store(enabled, Ordering::SeqCst);
        true
      }
      None => false,
    }
  }

  pub fn is_enabled(&self, name: &str) -> Option<bool> {
    self.entries.iter().find(|e| e.name() == name).map(ChainEntry::is_enabled)
  }

  /// Run every enabled processor that accepts the event, in order.
  ///
  /// Returns one result per processor that ran; failures are recorded, never
  /// propagated.
  pub async fn run(&self, ctx: &mut ProcessingContext) -> Vec<ProcessingResult> {
    let mut results = Vec::with_capacity(self.entries.len());

    for entry in &self.entries {
      let name = entry.name();

      if !entry.is_enabled() {
        trace!(processor = name, "Processor disabled, skipping");
        continue;
      }

      let view: &ProcessingContext = ctx;
      let decision = match std::panic::catch_unwind(AssertUnwindSafe(|| entry.processor.can_handle(view))) {
        Ok(decision) => decision,
        Err(panic) => {
          let error = ProcessorError::Panicked(format!("can_handle: {}", panic_message(panic.as_ref())));
          warn!(
            processor = name,
            location = %ctx.location(),
            path = %ctx.path(),
            error = %error,
            "Processor panicked while deciding"
          );
          results.push(ProcessingResult::new(ctx.event.id, name, false, error.to_string()));
          continue;
        }
      };
      if !decision.accepted {
        trace!(processor = name, path = %ctx.path(), reason = %decision.reason, "Processor declined event");
        continue;
      }

      let started = Instant::now();
      let result = match entry.invoke(ctx).await {
        Ok(outcome) => ProcessingResult::new(ctx.event.id, name, outcome.success, outcome.message),
        Err(e) => ProcessingResult::new(ctx.event.id, name, false, e.to_string()),
      };

      if result.success {
        debug!(
          processor = name,
          path = %ctx.path(),
          duration_ms = started.elapsed().as_millis(),
          "Processor succeeded"
        );
      } else {
        warn!(
          processor = name,
          location = %ctx.location(),
          path = %ctx.path(),
          message = %result.message,
          "Processor failed"
        );
      }

      results.push(result);
    }

    results
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
