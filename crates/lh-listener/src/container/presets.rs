//! Ready-made containers for the common queue setups
//!
//! - Batching: concurrent broker, batching retriever, batching resolver
//! - Prefetching: concurrent broker, prefetching retriever, batching resolver
//! - Fifo: grouping broker on `MessageGroupId`, batching retriever, resolver
//!   that deletes each message as soon as it is acknowledged

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lh_common::QueueProperties;
use lh_queue::QueueClient;
use tracing::warn;

use super::{
    ContainerCompletion, ContainerFactories, ContainerProperties, CoreMessageListenerContainer,
    MessageListenerContainer,
};
use crate::broker::{
    ConcurrentBrokerProperties, ConcurrentMessageBroker, GroupingBrokerProperties, GroupingMessageBroker,
    MessageBroker,
};
use crate::decorator::MessageProcessingDecorator;
use crate::processor::{DecoratingMessageProcessor, MessageHandler, MessageProcessor};
use crate::resolver::{BatchingMessageResolver, BatchingResolverProperties, MessageResolver};
use crate::retriever::{
    BatchingMessageRetriever, BatchingRetrieverProperties, MessageRetriever, PrefetchingMessageRetriever,
    PrefetchingRetrieverProperties,
};
use crate::Result;

/// What every preset needs: where to listen, what to run, and how to observe it
#[derive(Clone)]
pub struct ListenerDefinition {
    pub identifier: String,
    pub queue: QueueProperties,
    pub client: Arc<dyn QueueClient>,
    pub handler: MessageHandler,
    pub decorators: Vec<Arc<dyn MessageProcessingDecorator>>,
}

impl ListenerDefinition {
    pub fn new(
        identifier: impl Into<String>,
        queue: QueueProperties,
        client: Arc<dyn QueueClient>,
        handler: MessageHandler,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            queue,
            client,
            handler,
            decorators: Vec::new(),
        }
    }

    pub fn with_decorator(mut self, decorator: Arc<dyn MessageProcessingDecorator>) -> Self {
        self.decorators.push(decorator);
        self
    }

    fn processor_factory(&self) -> super::ProcessorFactory {
        let definition = self.clone();
        Arc::new(move |resolver: Arc<dyn MessageResolver>| {
            let processor: Arc<dyn MessageProcessor> = Arc::new(DecoratingMessageProcessor::new(
                definition.identifier.clone(),
                definition.queue.clone(),
                definition.client.clone(),
                definition.handler.clone(),
                resolver,
                definition.decorators.clone(),
            ));
            Ok(processor)
        })
    }

    fn resolver_factory(&self, properties: BatchingResolverProperties) -> super::ResolverFactory {
        let queue = self.queue.clone();
        let client = self.client.clone();
        Arc::new(move || {
            let resolver: Arc<dyn MessageResolver> = Arc::new(BatchingMessageResolver::new(
                queue.clone(),
                client.clone(),
                properties.clone(),
            ));
            Ok(resolver)
        })
    }

    fn batching_retriever_factory(&self, properties: BatchingRetrieverProperties) -> super::RetrieverFactory {
        let queue = self.queue.clone();
        let client = self.client.clone();
        Arc::new(move || {
            let retriever: Arc<dyn MessageRetriever> = Arc::new(BatchingMessageRetriever::new(
                queue.clone(),
                client.clone(),
                properties.clone(),
            ));
            Ok(retriever)
        })
    }
}

/// Forward the container trait to the wrapped core container
macro_rules! delegate_to_core {
    ($container:ty) => {
        impl $container {
            pub fn core(&self) -> &CoreMessageListenerContainer {
                &self.core
            }
        }

        #[async_trait]
        impl MessageListenerContainer for $container {
            fn identifier(&self) -> &str {
                self.core.identifier()
            }

            fn start(&self) -> Result<ContainerCompletion> {
                self.core.start()
            }

            async fn stop_with_timeout(&self, timeout: Duration) -> bool {
                self.core.stop_with_timeout(timeout).await
            }
        }
    };
}

// ============================================================================
// Batching
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct BatchingContainerProperties {
    pub broker: ConcurrentBrokerProperties,
    pub retriever: BatchingRetrieverProperties,
    pub resolver: BatchingResolverProperties,
    pub container: ContainerProperties,
}

pub struct BatchingMessageListenerContainer {
    core: CoreMessageListenerContainer,
}

impl BatchingMessageListenerContainer {
    pub fn new(definition: ListenerDefinition, properties: BatchingContainerProperties) -> Result<Self> {
        let broker_properties = properties.broker;
        let factories = ContainerFactories {
            broker: Arc::new(move || {
                let broker: Arc<dyn MessageBroker> = Arc::new(ConcurrentMessageBroker::new(broker_properties.clone()));
                Ok(broker)
            }),
            retriever: definition.batching_retriever_factory(properties.retriever),
            resolver: definition.resolver_factory(properties.resolver),
            processor: definition.processor_factory(),
        };
        Ok(Self {
            core: CoreMessageListenerContainer::new(definition.identifier, factories, properties.container)?,
        })
    }
}

delegate_to_core!(BatchingMessageListenerContainer);

// ============================================================================
// Prefetching
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PrefetchingContainerProperties {
    pub broker: ConcurrentBrokerProperties,
    pub retriever: PrefetchingRetrieverProperties,
    pub resolver: BatchingResolverProperties,
    pub container: ContainerProperties,
}

pub struct PrefetchingMessageListenerContainer {
    core: CoreMessageListenerContainer,
}

impl PrefetchingMessageListenerContainer {
    pub fn new(definition: ListenerDefinition, properties: PrefetchingContainerProperties) -> Result<Self> {
        // Fail fast on bad prefetch limits rather than at start
        PrefetchingMessageRetriever::new(
            definition.queue.clone(),
            definition.client.clone(),
            properties.retriever.clone(),
        )?;

        let broker_properties = properties.broker;
        let retriever_properties = properties.retriever;
        let queue = definition.queue.clone();
        let client = definition.client.clone();
        let factories = ContainerFactories {
            broker: Arc::new(move || {
                let broker: Arc<dyn MessageBroker> = Arc::new(ConcurrentMessageBroker::new(broker_properties.clone()));
                Ok(broker)
            }),
            retriever: Arc::new(move || {
                let retriever: Arc<dyn MessageRetriever> = Arc::new(PrefetchingMessageRetriever::new(
                    queue.clone(),
                    client.clone(),
                    retriever_properties.clone(),
                )?);
                Ok(retriever)
            }),
            resolver: definition.resolver_factory(properties.resolver),
            processor: definition.processor_factory(),
        };
        Ok(Self {
            core: CoreMessageListenerContainer::new(definition.identifier, factories, properties.container)?,
        })
    }
}

delegate_to_core!(PrefetchingMessageListenerContainer);

// ============================================================================
// FIFO
// ============================================================================

#[derive(Debug, Clone)]
pub struct FifoContainerProperties {
    pub broker: ConcurrentBrokerProperties,
    pub grouping: GroupingBrokerProperties,
    pub retriever: BatchingRetrieverProperties,
    pub resolver: BatchingResolverProperties,
    pub container: ContainerProperties,
}

impl Default for FifoContainerProperties {
    fn default() -> Self {
        Self {
            broker: ConcurrentBrokerProperties::default(),
            grouping: GroupingBrokerProperties::default(),
            retriever: BatchingRetrieverProperties::default(),
            resolver: BatchingResolverProperties {
                buffering_size_limit: 1.into(),
                ..Default::default()
            },
            container: ContainerProperties {
                process_extra_messages_on_shutdown: false,
                ..Default::default()
            },
        }
    }
}

pub struct FifoMessageListenerContainer {
    core: CoreMessageListenerContainer,
}

impl FifoMessageListenerContainer {
    /// Extra messages are never processed on shutdown: a second broker run would
    /// not know which groups are still in flight.
    pub fn new(definition: ListenerDefinition, properties: FifoContainerProperties) -> Result<Self> {
        let mut container_properties = properties.container;
        if container_properties.process_extra_messages_on_shutdown {
            warn!(
                listener = %definition.identifier,
                "Ignoring process_extra_messages_on_shutdown for FIFO listener"
            );
            container_properties.process_extra_messages_on_shutdown = false;
        }
        let broker_properties = properties.broker;
        let grouping_properties = properties.grouping;
        let factories = ContainerFactories {
            broker: Arc::new(move || {
                let broker: Arc<dyn MessageBroker> = Arc::new(GroupingMessageBroker::by_message_group_id(
                    ConcurrentMessageBroker::new(broker_properties.clone()),
                    grouping_properties.clone(),
                ));
                Ok(broker)
            }),
            retriever: definition.batching_retriever_factory(properties.retriever),
            resolver: definition.resolver_factory(properties.resolver),
            processor: definition.processor_factory(),
        };
        Ok(Self {
            core: CoreMessageListenerContainer::new(definition.identifier, factories, container_properties)?,
        })
    }
}

delegate_to_core!(FifoMessageListenerContainer);

#[cfg(test)]
mod tests {
    use lh_queue::InMemoryQueue;

    use super::*;

    fn definition() -> ListenerDefinition {
        ListenerDefinition::new(
            "orders",
            QueueProperties::new("memory://orders.fifo"),
            Arc::new(InMemoryQueue::new()),
            MessageHandler::blocking(|_, _| Ok(())),
        )
    }

    #[test]
    fn test_fifo_never_processes_extra_messages() {
        let properties = FifoContainerProperties {
            container: ContainerProperties {
                process_extra_messages_on_shutdown: true,
                interrupt_message_processing_on_shutdown: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let container = FifoMessageListenerContainer::new(definition(), properties).unwrap();
        assert!(!container.core().properties().process_extra_messages_on_shutdown);
        assert!(container.core().properties().interrupt_message_processing_on_shutdown);
    }

    #[test]
    fn test_batching_processes_extra_messages_by_default() {
        let container = BatchingMessageListenerContainer::new(definition(), Default::default()).unwrap();
        assert!(container.core().properties().process_extra_messages_on_shutdown);
    }
}
