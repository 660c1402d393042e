//! Build containers from `lh-config` listener definitions

use std::sync::Arc;

use lh_common::QueueProperties;
use lh_config::{ContainerKind, ListenerConfig};
use lh_queue::QueueClient;
use tracing::info;

use super::presets::{
    BatchingContainerProperties, BatchingMessageListenerContainer, FifoContainerProperties,
    FifoMessageListenerContainer, ListenerDefinition, PrefetchingContainerProperties,
    PrefetchingMessageListenerContainer,
};
use super::{ContainerProperties, MessageListenerContainer};
use crate::broker::{ConcurrentBrokerProperties, GroupingBrokerProperties};
use crate::decorator::{AutoVisibilityExtender, AutoVisibilityExtenderProperties, MessageProcessingDecorator};
use crate::processor::MessageHandler;
use crate::resolver::BatchingResolverProperties;
use crate::retriever::{BatchingRetrieverProperties, PrefetchingRetrieverProperties};
use crate::Result;

/// Build the container preset a listener config asks for.
///
/// A configured visibility extender is installed ahead of `decorators`.
pub fn from_config(
    config: &ListenerConfig,
    client: Arc<dyn QueueClient>,
    handler: MessageHandler,
    decorators: Vec<Arc<dyn MessageProcessingDecorator>>,
) -> Result<Box<dyn MessageListenerContainer>> {
    config.validate()?;

    let queue = QueueProperties::new(config.queue_url.clone());
    let mut definition = ListenerDefinition::new(config.identifier.clone(), queue.clone(), client.clone(), handler);

    if let Some(extender) = &config.visibility_extender {
        let decorator = AutoVisibilityExtender::new(
            queue,
            client,
            AutoVisibilityExtenderProperties::new(
                extender.visibility_timeout(),
                extender.buffer(),
                extender.max_duration(),
            ),
        )?;
        definition = definition.with_decorator(Arc::new(decorator));
    }
    definition.decorators.extend(decorators);

    let broker = ConcurrentBrokerProperties {
        concurrency: config.concurrency.into(),
        concurrency_polling_rate: config.concurrency_polling_rate().into(),
        error_backoff: config.error_backoff().into(),
    };
    let resolver = BatchingResolverProperties {
        buffering_size_limit: config.resolver_buffer_size().into(),
        buffering_time: config.resolver_buffering_time().into(),
    };
    let batching_retriever = || BatchingRetrieverProperties {
        batch_size: config.batch_size.into(),
        batching_period: config.batching_period().into(),
        visibility_timeout: config.visibility_timeout().into(),
        wait_time: config.wait_time().into(),
        error_backoff: config.error_backoff().into(),
    };
    let container = |process_extra_by_default: bool| ContainerProperties {
        process_extra_messages_on_shutdown: config
            .shutdown
            .process_extra_messages
            .unwrap_or(process_extra_by_default),
        interrupt_message_processing_on_shutdown: config.shutdown.interrupt_message_processing,
        ..ContainerProperties::default().with_component_timeout(config.shutdown.component_timeout())
    };

    info!(
        listener = %config.identifier,
        kind = ?config.kind,
        concurrency = config.concurrency,
        "Building message listener container"
    );

    let built: Box<dyn MessageListenerContainer> = match config.kind {
        ContainerKind::Batching => Box::new(BatchingMessageListenerContainer::new(
            definition,
            BatchingContainerProperties {
                broker,
                retriever: batching_retriever(),
                resolver,
                container: container(true),
            },
        )?),
        ContainerKind::Prefetching => Box::new(PrefetchingMessageListenerContainer::new(
            definition,
            PrefetchingContainerProperties {
                broker,
                retriever: PrefetchingRetrieverProperties {
                    desired_min_prefetched_messages: config.desired_min_prefetched_messages,
                    max_prefetched_messages: config.max_prefetched_messages,
                    visibility_timeout: config.visibility_timeout().into(),
                    wait_time: config.wait_time().into(),
                    error_backoff: config.error_backoff().into(),
                },
                resolver,
                container: container(true),
            },
        )?),
        ContainerKind::Fifo => Box::new(FifoMessageListenerContainer::new(
            definition,
            FifoContainerProperties {
                broker,
                grouping: GroupingBrokerProperties {
                    max_cached_message_groups: Some(config.max_cached_message_groups().into()),
                    purge_extra_messages_in_group_on_error: config.purge_group_on_error,
                    process_cached_messages_on_shutdown: config.shutdown.process_cached_messages,
                },
                retriever: batching_retriever(),
                resolver,
                container: container(false),
            },
        )?),
    };
    Ok(built)
}
