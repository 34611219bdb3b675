//! Builder for [`EventProcessor`].

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tracing::info;

use super::callbacks::{
    CallbackResult, ClosureHandlers, CloseHandler, ErrorHandler, EventHandler,
    InitializationHandler, PartitionProcessorFactory,
};
use super::checkpoint_store::CheckpointStore;
use super::config::ProcessorConfig;
use super::context::{CloseContext, InitializationContext, ProcessorErrorContext, ProcessorEvent};
use super::event_processor::EventProcessor;
use super::transport::ConnectionFactory;
use crate::error::{ProcessorError, ProcessorResult};

/// Collects everything an [`EventProcessor`] needs.
///
/// Callbacks come either from a [`PartitionProcessorFactory`] or from
/// closures (`process_event` and `process_error` are then required), not both.
///
/// ```rust,ignore
/// let processor = EventProcessorBuilder::new()
///     .fully_qualified_namespace("myns.servicebus.windows.net")
///     .event_hub_name("telemetry")
///     .consumer_group("$Default")
///     .checkpoint_store(store)
///     .connection_factory(factory)
///     .process_event(|event| async move {
///         println!("{:?}", event.data().body_as_str());
///         event.update_checkpoint().await?;
///         Ok(())
///     })
///     .process_error(|ctx| async move {
///         eprintln!("{} failed: {}", ctx.operation, ctx.error);
///         Ok(())
///     })
///     .build()?;
/// ```
#[derive(Default)]
pub struct EventProcessorBuilder {
    fully_qualified_namespace: Option<String>,
    event_hub_name: Option<String>,
    consumer_group: Option<String>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    connection_factory: Option<Arc<dyn ConnectionFactory>>,
    owner_id: Option<String>,
    config: ProcessorConfig,
    processor_factory: Option<Arc<dyn PartitionProcessorFactory>>,
    process_event: Option<EventHandler>,
    process_error: Option<ErrorHandler>,
    initialize: Option<InitializationHandler>,
    close: Option<CloseHandler>,
}

impl EventProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fully_qualified_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.fully_qualified_namespace = Some(namespace.into());
        self
    }

    pub fn event_hub_name(mut self, name: impl Into<String>) -> Self {
        self.event_hub_name = Some(name.into());
        self
    }

    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    /// Defaults to a random UUID.
    pub fn owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn processor_factory(mut self, factory: Arc<dyn PartitionProcessorFactory>) -> Self {
        self.processor_factory = Some(factory);
        self
    }

    pub fn process_event<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ProcessorEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.process_event = Some(Arc::new(move |event| handler(event).boxed()));
        self
    }

    pub fn process_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ProcessorErrorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.process_error = Some(Arc::new(move |context| handler(context).boxed()));
        self
    }

    /// Runs before a pump opens its receiver; may change the start position
    /// used when the partition has no checkpoint.
    pub fn process_partition_initialization<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut InitializationContext) + Send + Sync + 'static,
    {
        self.initialize = Some(Arc::new(handler));
        self
    }

    pub fn process_partition_close<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(CloseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        self.close = Some(Arc::new(move |context| handler(context).boxed()));
        self
    }

    fn callback_source(
        &mut self,
        errors: &mut Vec<String>,
    ) -> Option<Arc<dyn PartitionProcessorFactory>> {
        let has_closures = self.process_event.is_some()
            || self.process_error.is_some()
            || self.initialize.is_some()
            || self.close.is_some();

        match (self.processor_factory.take(), has_closures) {
            (Some(_), true) => {
                errors.push(
                    "set either processor_factory or closure callbacks, not both".to_string(),
                );
                None
            }
            (Some(factory), false) => Some(factory),
            (None, _) => {
                let process_event = self.process_event.take();
                let process_error = self.process_error.take();
                if process_event.is_none() {
                    errors.push("process_event callback is required".to_string());
                }
                if process_error.is_none() {
                    errors.push("process_error callback is required".to_string());
                }
                Some(Arc::new(ClosureHandlers {
                    process_event: process_event?,
                    process_error: process_error?,
                    initialize: self.initialize.take(),
                    close: self.close.take(),
                }))
            }
        }
    }

    /// Check every field and build the processor.
    ///
    /// All problems are reported at once in a single `Config` error.
    pub fn build(mut self) -> ProcessorResult<EventProcessor> {
        let mut errors = Vec::new();

        fn required<T>(value: Option<T>, name: &str, errors: &mut Vec<String>) -> Option<T> {
            if value.is_none() {
                errors.push(format!("{} is required", name));
            }
            value
        }

        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        let namespace = required(
            non_empty(self.fully_qualified_namespace.take()),
            "fully_qualified_namespace",
            &mut errors,
        );
        let event_hub_name =
            required(non_empty(self.event_hub_name.take()), "event_hub_name", &mut errors);
        let consumer_group =
            required(non_empty(self.consumer_group.take()), "consumer_group", &mut errors);
        let checkpoint_store =
            required(self.checkpoint_store.take(), "checkpoint_store", &mut errors);
        let connection_factory =
            required(self.connection_factory.take(), "connection_factory", &mut errors);
        let factory = self.callback_source(&mut errors);

        if let Err(config_errors) = self.config.validate() {
            errors.extend(config_errors);
        }

        let (
            Some(namespace),
            Some(event_hub_name),
            Some(consumer_group),
            Some(checkpoint_store),
            Some(connection_factory),
            Some(factory),
        ) = (
            namespace,
            event_hub_name,
            consumer_group,
            checkpoint_store,
            connection_factory,
            factory,
        )
        else {
            return Err(ProcessorError::Config(errors.join("; ")));
        };
        if !errors.is_empty() {
            return Err(ProcessorError::Config(errors.join("; ")));
        }

        let identifier = self
            .owner_id
            .take()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        info!(
            owner_id = %identifier,
            event_hub = %event_hub_name,
            consumer_group = %consumer_group,
            "Building event processor"
        );

        Ok(EventProcessor::new(
            identifier,
            namespace,
            event_hub_name,
            consumer_group,
            self.config,
            checkpoint_store,
            connection_factory,
            factory,
        ))
    }
}
