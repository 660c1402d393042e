//! Leasehold listener runtime
//!
//! Pull-based message consumption for SQS-style queues:
//! - Brokers admit messages up to a (runtime adjustable) concurrency limit,
//!   optionally keeping messages of one group strictly in order
//! - Retrievers coalesce single-message requests into batched receives
//! - Resolvers coalesce acknowledgements into batched deletes
//! - Processors run user handlers inside a decorator lifecycle
//! - Containers wire the components together and own graceful shutdown
//!
//! ```ignore
//! let definition = ListenerDefinition::new("orders", queue, client, MessageHandler::blocking(|message, _| {
//!     println!("{}", message.body);
//!     Ok(())
//! }));
//! let container = BatchingMessageListenerContainer::new(definition, Default::default())?;
//! container.start()?;
//! // ...
//! container.stop().await;
//! ```

pub mod broker;
pub mod container;
pub mod decorator;
pub mod error;
pub mod executor;
pub mod processor;
pub mod resolver;
pub mod retriever;
pub mod semaphore;

pub use broker::{
    ConcurrentBrokerProperties, ConcurrentMessageBroker, GroupingBrokerProperties, GroupingMessageBroker,
    MessageBroker,
};
pub use container::{
    from_config, BatchingContainerProperties, BatchingMessageListenerContainer, ContainerCompletion,
    ContainerFactories, ContainerProperties, CoreMessageListenerContainer, FifoContainerProperties,
    FifoMessageListenerContainer, ListenerDefinition, MessageListenerContainer, PrefetchingContainerProperties,
    PrefetchingMessageListenerContainer,
};
pub use decorator::{
    AutoVisibilityExtender, AutoVisibilityExtenderProperties, ExtensionState, MessageProcessingDecorator,
    ProcessingContext,
};
pub use error::{ListenerError, ProcessingError, ResolutionError, RetrievalError, VisibilityError};
pub use executor::ProcessingExecutor;
pub use processor::{
    Acknowledge, DecoratingMessageProcessor, HandlerContext, MessageHandler, MessageProcessor, VisibilityExtender,
};
pub use resolver::{BatchingMessageResolver, BatchingResolverProperties, MessageResolver};
pub use retriever::{
    BatchingMessageRetriever, BatchingRetrieverProperties, MessageRetriever, PrefetchingMessageRetriever,
    PrefetchingRetrieverProperties,
};
pub use semaphore::ResizableSemaphore;

pub use lh_common::{DynamicValue, Message, QueueProperties};

pub type Result<T> = std::result::Result<T, ListenerError>;
