//! Message listener containers - wire a broker, retriever, processor and
//! resolver into one start/stop unit
//!
//! Startup order: resolver, retriever, broker. Shutdown runs in reverse so
//! every message that finishes processing still gets its delete flushed:
//! 1. Broker stops requesting messages
//! 2. Retriever stops; messages it received but never handed out are either
//!    processed or left to be redelivered
//! 3. Executor drains in-flight processing, optionally interrupting handlers
//! 4. Resolver flushes pending deletes and stops

mod config;
mod presets;

pub use config::from_config;
pub use presets::{
    BatchingContainerProperties, BatchingMessageListenerContainer, FifoContainerProperties,
    FifoMessageListenerContainer, ListenerDefinition, PrefetchingContainerProperties,
    PrefetchingMessageListenerContainer,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use lh_common::Message;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{KeepProcessing, MessageBroker, MessageDispatcher, MessageSupplier};
use crate::error::{ListenerError, RetrievalError};
use crate::executor::ProcessingExecutor;
use crate::processor::MessageProcessor;
use crate::resolver::MessageResolver;
use crate::retriever::{MessageRetrieval, MessageRetriever};
use crate::Result;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_COMPONENT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Resolves once a container run has fully shut down
pub type ContainerCompletion = Shared<BoxFuture<'static, ()>>;

#[async_trait]
pub trait MessageListenerContainer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Start the container. Calling it while a run is active returns that run's
    /// completion; calling it after a run finished starts a fresh run.
    fn start(&self) -> Result<ContainerCompletion>;

    /// Stop and wait up to the default timeout
    async fn stop(&self) -> bool {
        self.stop_with_timeout(DEFAULT_STOP_TIMEOUT).await
    }

    /// Stop and wait up to `timeout`. Returns false if the run was still
    /// shutting down when the timeout elapsed.
    async fn stop_with_timeout(&self, timeout: Duration) -> bool;
}

pub type BrokerFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageBroker>> + Send + Sync>;
pub type RetrieverFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageRetriever>> + Send + Sync>;
pub type ResolverFactory = Arc<dyn Fn() -> Result<Arc<dyn MessageResolver>> + Send + Sync>;
/// Builds the processor around the resolver of the same run
pub type ProcessorFactory =
    Arc<dyn Fn(Arc<dyn MessageResolver>) -> Result<Arc<dyn MessageProcessor>> + Send + Sync>;

/// Component factories, invoked once per container run
#[derive(Clone)]
pub struct ContainerFactories {
    pub broker: BrokerFactory,
    pub retriever: RetrieverFactory,
    pub resolver: ResolverFactory,
    pub processor: ProcessorFactory,
}

#[derive(Debug, Clone)]
pub struct ContainerProperties {
    /// Process messages the retriever received but never handed out
    pub process_extra_messages_on_shutdown: bool,
    /// Cancel running handlers once the broker has stopped
    pub interrupt_message_processing_on_shutdown: bool,
    pub broker_shutdown_timeout: Duration,
    pub retriever_shutdown_timeout: Duration,
    pub processing_shutdown_timeout: Duration,
    pub resolver_shutdown_timeout: Duration,
}

impl Default for ContainerProperties {
    fn default() -> Self {
        Self {
            process_extra_messages_on_shutdown: true,
            interrupt_message_processing_on_shutdown: false,
            broker_shutdown_timeout: DEFAULT_COMPONENT_SHUTDOWN_TIMEOUT,
            retriever_shutdown_timeout: DEFAULT_COMPONENT_SHUTDOWN_TIMEOUT,
            processing_shutdown_timeout: DEFAULT_COMPONENT_SHUTDOWN_TIMEOUT,
            resolver_shutdown_timeout: DEFAULT_COMPONENT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ContainerProperties {
    /// Same timeout for every component
    pub fn with_component_timeout(mut self, timeout: Duration) -> Self {
        self.broker_shutdown_timeout = timeout;
        self.retriever_shutdown_timeout = timeout;
        self.processing_shutdown_timeout = timeout;
        self.resolver_shutdown_timeout = timeout;
        self
    }
}

struct ActiveRun {
    shutdown: CancellationToken,
    completion: ContainerCompletion,
}

pub struct CoreMessageListenerContainer {
    identifier: String,
    factories: ContainerFactories,
    properties: ContainerProperties,
    active: Mutex<Option<ActiveRun>>,
}

impl CoreMessageListenerContainer {
    pub fn new(
        identifier: impl Into<String>,
        factories: ContainerFactories,
        properties: ContainerProperties,
    ) -> Result<Self> {
        let identifier = identifier.into();
        if identifier.trim().is_empty() {
            return Err(ListenerError::InvalidConfiguration(
                "container identifier must not be blank".to_string(),
            ));
        }
        Ok(Self {
            identifier,
            factories,
            properties,
            active: Mutex::new(None),
        })
    }

    pub fn properties(&self) -> &ContainerProperties {
        &self.properties
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|run| run.completion.peek().is_none())
    }
}

#[async_trait]
impl MessageListenerContainer for CoreMessageListenerContainer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn start(&self) -> Result<ContainerCompletion> {
        let mut active = self.active.lock();
        if let Some(run) = active.as_ref() {
            if run.completion.peek().is_none() {
                return Ok(run.completion.clone());
            }
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ListenerError::NoRuntime)?;
        let resolver = (self.factories.resolver)()?;
        let components = Components {
            broker: (self.factories.broker)()?,
            retriever: (self.factories.retriever)()?,
            processor: (self.factories.processor)(resolver.clone())?,
            resolver,
        };

        let shutdown = CancellationToken::new();
        let run = ContainerRun {
            identifier: self.identifier.clone(),
            properties: self.properties.clone(),
            components,
            shutdown: shutdown.clone(),
        };

        info!(listener = %self.identifier, "Starting message listener container");
        let handle = runtime.spawn(run.execute());
        let identifier = self.identifier.clone();
        let completion = async move {
            if let Err(e) = handle.await {
                error!(listener = %identifier, error = %e, "Message listener container task failed");
            }
        }
        .boxed()
        .shared();

        // Drive completion eagerly so `peek` reflects the run's state
        runtime.spawn(completion.clone());

        *active = Some(ActiveRun {
            shutdown,
            completion: completion.clone(),
        });
        Ok(completion)
    }

    async fn stop_with_timeout(&self, timeout: Duration) -> bool {
        let run = self
            .active
            .lock()
            .as_ref()
            .map(|run| (run.shutdown.clone(), run.completion.clone()));
        let Some((shutdown, completion)) = run else {
            return true;
        };

        info!(listener = %self.identifier, "Stopping message listener container");
        shutdown.cancel();

        if tokio::time::timeout(timeout, completion).await.is_err() {
            warn!(
                listener = %self.identifier,
                timeout_secs = timeout.as_secs(),
                "Message listener container did not stop within timeout"
            );
            return false;
        }
        true
    }
}

struct Components {
    broker: Arc<dyn MessageBroker>,
    retriever: Arc<dyn MessageRetriever>,
    resolver: Arc<dyn MessageResolver>,
    processor: Arc<dyn MessageProcessor>,
}

struct ContainerRun {
    identifier: String,
    properties: ContainerProperties,
    components: Components,
    shutdown: CancellationToken,
}

impl ContainerRun {
    async fn execute(self) {
        let Components {
            broker,
            retriever,
            resolver,
            processor,
        } = &self.components;
        let executor = ProcessingExecutor::new();

        let resolver_stop = CancellationToken::new();
        let resolver_task = {
            let resolver = resolver.clone();
            let stop = resolver_stop.clone();
            tokio::spawn(async move { resolver.run(stop).await })
        };

        let retriever_stop = CancellationToken::new();
        let retriever_task = {
            let retriever = retriever.clone();
            let stop = retriever_stop.clone();
            tokio::spawn(async move { retriever.run(stop).await })
        };

        let supplier: MessageSupplier = {
            let retriever = retriever.clone();
            Arc::new(move || retriever.retrieve_message())
        };
        let dispatcher = dispatcher(&executor, processor);

        let mut broker_task = {
            let broker = broker.clone();
            let executor = executor.clone();
            let dispatcher = dispatcher.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                broker
                    .process_messages(&executor, Arc::new(|| true), supplier, dispatcher, shutdown)
                    .await
            })
        };
        info!(listener = %self.identifier, "Message listener container started");

        let broker_task = tokio::select! {
            _ = self.shutdown.cancelled() => Some(broker_task),
            result = &mut broker_task => {
                warn!(
                    listener = %self.identifier,
                    failed = result.is_err(),
                    "Message broker exited before shutdown was requested"
                );
                self.shutdown.cancel();
                None
            }
        };

        info!(listener = %self.identifier, "Shutting down message listener container");
        if let Some(task) = broker_task {
            self.await_component("message broker", task, self.properties.broker_shutdown_timeout)
                .await;
        }

        retriever_stop.cancel();
        let extra_messages = self
            .await_component("message retriever", retriever_task, self.properties.retriever_shutdown_timeout)
            .await
            .unwrap_or_default();
        self.handle_extra_messages(broker.as_ref(), &executor, dispatcher, extra_messages)
            .await;

        executor.close();
        if self.properties.interrupt_message_processing_on_shutdown {
            info!(listener = %self.identifier, "Interrupting in-flight message processing");
            executor.interrupt();
        }
        if !executor.wait(self.properties.processing_shutdown_timeout).await {
            warn!(
                listener = %self.identifier,
                active = executor.active_tasks(),
                "Message processing did not finish within timeout, interrupting"
            );
            executor.interrupt();
        }

        resolver_stop.cancel();
        self.await_component("message resolver", resolver_task, self.properties.resolver_shutdown_timeout)
            .await;

        info!(listener = %self.identifier, "Message listener container stopped");
    }

    async fn handle_extra_messages(
        &self,
        broker: &dyn MessageBroker,
        executor: &ProcessingExecutor,
        dispatcher: MessageDispatcher,
        extra_messages: Vec<Message>,
    ) {
        if extra_messages.is_empty() {
            return;
        }
        let count = extra_messages.len();

        if !self.properties.process_extra_messages_on_shutdown {
            info!(
                listener = %self.identifier,
                count,
                "Extra messages left unprocessed, they will be redelivered once visible"
            );
            return;
        }

        info!(listener = %self.identifier, count, "Processing extra messages before shutdown");
        let remaining = Arc::new(Mutex::new(VecDeque::from(extra_messages)));
        let keep_processing: KeepProcessing = {
            let remaining = remaining.clone();
            Arc::new(move || !remaining.lock().is_empty())
        };
        let supplier: MessageSupplier = Arc::new(move || match remaining.lock().pop_front() {
            Some(message) => Ok(MessageRetrieval::ready(Ok(Some(message)))),
            None => Err(RetrievalError::Stopped),
        });

        let drain = broker.process_messages(
            executor,
            keep_processing,
            supplier,
            dispatcher,
            CancellationToken::new(),
        );
        if tokio::time::timeout(self.properties.broker_shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(listener = %self.identifier, "Extra messages were not all dispatched within timeout");
        }
    }

    async fn await_component<T>(&self, component: &'static str, task: JoinHandle<T>, timeout: Duration) -> Option<T> {
        let abort = task.abort_handle();
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                let error = ListenerError::TaskFailed(format!("{}: {}", component, e));
                error!(listener = %self.identifier, error = %error, "Component failed during shutdown");
                None
            }
            Err(_) => {
                abort.abort();
                let error = ListenerError::ShutdownTimeout { component, timeout };
                error!(listener = %self.identifier, error = %error, "Component shutdown timed out");
                None
            }
        }
    }
}

fn dispatcher(executor: &ProcessingExecutor, processor: &Arc<dyn MessageProcessor>) -> MessageDispatcher {
    let executor = executor.clone();
    let processor = processor.clone();
    Arc::new(move |message: Message| {
        let executor = executor.clone();
        let processor = processor.clone();
        async move { executor.process(processor, message).await }.boxed()
    })
}
