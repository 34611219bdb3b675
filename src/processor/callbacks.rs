//! The user-facing callback surface.
//!
//! Implement [`PartitionProcessor`] directly, or hand closures to the
//! builder; both go through the same dispatch path. The processor creates
//! one instance per pump through a [`PartitionProcessorFactory`], so an
//! instance only ever sees a single partition and may keep per-partition
//! state in `&mut self`.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::warn;

use super::context::{CloseContext, InitializationContext, ProcessorErrorContext, ProcessorEvent};
use super::metrics;
use crate::error::CallbackError;

pub type CallbackResult = Result<(), CallbackError>;

#[async_trait]
pub trait PartitionProcessor: Send {
    /// Runs before the first event. May move the start position.
    async fn initialize(&mut self, _context: &mut InitializationContext) -> CallbackResult {
        Ok(())
    }

    async fn process_event(&mut self, event: ProcessorEvent) -> CallbackResult;

    async fn process_error(&mut self, context: ProcessorErrorContext) -> CallbackResult;

    async fn close(&mut self, _context: CloseContext) -> CallbackResult {
        Ok(())
    }
}

/// Creates a fresh [`PartitionProcessor`] for every pump.
pub trait PartitionProcessorFactory: Send + Sync {
    fn create_processor(&self) -> Box<dyn PartitionProcessor>;
}

impl<F> PartitionProcessorFactory for F
where
    F: Fn() -> Box<dyn PartitionProcessor> + Send + Sync,
{
    fn create_processor(&self) -> Box<dyn PartitionProcessor> {
        self()
    }
}

// =============================================================================
// Closure Adapter
// =============================================================================

pub type EventHandler =
    Arc<dyn Fn(ProcessorEvent) -> BoxFuture<'static, CallbackResult> + Send + Sync>;
pub type ErrorHandler =
    Arc<dyn Fn(ProcessorErrorContext) -> BoxFuture<'static, CallbackResult> + Send + Sync>;
pub type InitializationHandler = Arc<dyn Fn(&mut InitializationContext) + Send + Sync>;
pub type CloseHandler =
    Arc<dyn Fn(CloseContext) -> BoxFuture<'static, CallbackResult> + Send + Sync>;

/// Closure set collected by the builder.
#[derive(Clone)]
pub struct ClosureHandlers {
    pub process_event: EventHandler,
    pub process_error: ErrorHandler,
    pub initialize: Option<InitializationHandler>,
    pub close: Option<CloseHandler>,
}

impl PartitionProcessorFactory for ClosureHandlers {
    fn create_processor(&self) -> Box<dyn PartitionProcessor> {
        Box::new(ClosureProcessor {
            handlers: self.clone(),
        })
    }
}

/// [`PartitionProcessor`] backed by shared closures.
pub struct ClosureProcessor {
    handlers: ClosureHandlers,
}

#[async_trait]
impl PartitionProcessor for ClosureProcessor {
    async fn initialize(&mut self, context: &mut InitializationContext) -> CallbackResult {
        if let Some(initialize) = &self.handlers.initialize {
            initialize(context);
        }
        Ok(())
    }

    async fn process_event(&mut self, event: ProcessorEvent) -> CallbackResult {
        (self.handlers.process_event)(event).await
    }

    async fn process_error(&mut self, context: ProcessorErrorContext) -> CallbackResult {
        (self.handlers.process_error)(context).await
    }

    async fn close(&mut self, context: CloseContext) -> CallbackResult {
        match &self.handlers.close {
            Some(close) => close(context).await,
            None => Ok(()),
        }
    }
}

// =============================================================================
// Guarded Dispatch
// =============================================================================

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("callback panicked: {}", s)
    } else {
        "callback panicked".to_string()
    }
}

/// Await a callback, turning a panic into an ordinary callback error.
pub(crate) async fn guarded<F>(callback: F) -> CallbackResult
where
    F: Future<Output = CallbackResult>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic.as_ref()).into()),
    }
}

/// Hand an error to `process_error`. Failures of the handler itself are logged.
pub(crate) async fn report_error(
    processor: &mut dyn PartitionProcessor,
    context: ProcessorErrorContext,
) {
    let partition_id = context.partition_context.partition_id.clone();
    let operation = context.operation;
    metrics::record_callback_error(operation);

    if let Err(e) = guarded(processor.process_error(context)).await {
        warn!(
            partition_id = %partition_id,
            operation,
            error = %e,
            "process_error callback failed"
        );
    }
}

/// Call `close`. Failures are logged.
pub(crate) async fn close_processor(processor: &mut dyn PartitionProcessor, context: CloseContext) {
    let partition_id = context.partition_context.partition_id.clone();
    let reason = context.reason;

    if let Err(e) = guarded(processor.close(context)).await {
        warn!(
            partition_id = %partition_id,
            reason = %reason,
            error = %e,
            "close callback failed"
        );
    }
}
