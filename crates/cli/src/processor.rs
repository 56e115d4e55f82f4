//! Processors the CLI registers with every location

use std::sync::Arc;

use filepulse::processor::{Invocation, ProcessOutcome, ProcessingContext, Processor};
use tracing::info;

/// Records every event it sees through tracing
pub struct LogProcessor;

#[async_trait::async_trait]
impl Processor for LogProcessor {
  fn name(&self) -> &str {
    "log"
  }

  async fn process(&self, ctx: &mut ProcessingContext) -> Invocation {
    let event = &ctx.event;
    info!(
      location = %event.location_name,
      path = %event.file_path,
      event_type = %event.event_type,
      source = ?event.source,
      size = event.file_size,
      "File event"
    );
    Ok(ProcessOutcome::ok(format!("logged {} {}", event.event_type, event.file_path)))
  }
}

pub fn builtin_processors() -> Vec<Arc<dyn Processor>> {
  vec![Arc::new(LogProcessor)]
}
