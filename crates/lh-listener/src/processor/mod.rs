//! Message processing - user handlers and the pipeline that invokes them
//!
//! Four handler shapes are supported:
//! - blocking: returns when done, runs on the blocking thread pool
//! - async: returns a future that is awaited on the runtime
//! - blocking/async with `Acknowledge`: success is signalled by calling
//!   `acknowledge()` rather than by returning `Ok`
//!
//! Handlers are expected to check their cancellation token at reasonable
//! intervals; it is cancelled on interrupted shutdown and when a message runs
//! past its maximum processing time.

mod decorating;

pub use decorating::DecoratingMessageProcessor;

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use lh_common::{Message, QueueProperties};
use lh_queue::{QueueClient, VisibilityEntry};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::decorator::{DecoratorChain, ProcessingContext};
use crate::error::{ProcessingError, VisibilityError};
use crate::resolver::{MessageResolver, ResolutionResult};

pub type ProcessingResult = Result<(), ProcessingError>;

/// Logical result of processing one message
pub type ProcessingFuture = BoxFuture<'static, ProcessingResult>;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

pub trait MessageProcessor: Send + Sync {
    /// Run the supply phase (pre-supply hooks, handler invocation, supply hooks)
    /// on the calling thread and return the logical result.
    ///
    /// Blocking handlers run to completion inside this call, so it must be made
    /// from a thread that may block.
    fn process_message(&self, message: Message, cancellation: CancellationToken) -> ProcessingFuture;
}

type BlockingHandler = dyn Fn(Message, HandlerContext) -> anyhow::Result<()> + Send + Sync;
type AsyncHandler = dyn Fn(Message, HandlerContext) -> HandlerFuture + Send + Sync;
type BlockingAckHandler = dyn Fn(Message, HandlerContext, Acknowledge) -> anyhow::Result<()> + Send + Sync;
type AsyncAckHandler = dyn Fn(Message, HandlerContext, Acknowledge) -> HandlerFuture + Send + Sync;

#[derive(Clone)]
pub enum MessageHandler {
    Blocking(Arc<BlockingHandler>),
    Async(Arc<AsyncHandler>),
    BlockingWithAck(Arc<BlockingAckHandler>),
    AsyncWithAck(Arc<AsyncAckHandler>),
}

impl MessageHandler {
    pub fn blocking<F>(handler: F) -> Self
    where
        F: Fn(Message, HandlerContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        MessageHandler::Blocking(Arc::new(handler))
    }

    pub fn from_async<F, Fut>(handler: F) -> Self
    where
        F: Fn(Message, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        MessageHandler::Async(Arc::new(move |message, context| handler(message, context).boxed()))
    }

    pub fn blocking_with_ack<F>(handler: F) -> Self
    where
        F: Fn(Message, HandlerContext, Acknowledge) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        MessageHandler::BlockingWithAck(Arc::new(handler))
    }

    pub fn async_with_ack<F, Fut>(handler: F) -> Self
    where
        F: Fn(Message, HandlerContext, Acknowledge) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        MessageHandler::AsyncWithAck(Arc::new(move |message, context, acknowledge| {
            handler(message, context, acknowledge).boxed()
        }))
    }

    /// Whether a successful result resolves the message without an explicit acknowledge
    pub fn acknowledges_automatically(&self) -> bool {
        matches!(self, MessageHandler::Blocking(_) | MessageHandler::Async(_))
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            MessageHandler::Blocking(_) => "Blocking",
            MessageHandler::Async(_) => "Async",
            MessageHandler::BlockingWithAck(_) => "BlockingWithAck",
            MessageHandler::AsyncWithAck(_) => "AsyncWithAck",
        };
        f.write_str(kind)
    }
}

/// What a handler gets besides the message itself
#[derive(Clone)]
pub struct HandlerContext {
    processing: Arc<ProcessingContext>,
    visibility: VisibilityExtender,
}

impl HandlerContext {
    pub(crate) fn new(processing: Arc<ProcessingContext>, visibility: VisibilityExtender) -> Self {
        Self { processing, visibility }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.processing.cancellation()
    }

    pub fn is_cancelled(&self) -> bool {
        self.processing.cancellation().is_cancelled()
    }

    pub fn processing(&self) -> &ProcessingContext {
        &self.processing
    }

    pub fn visibility(&self) -> &VisibilityExtender {
        &self.visibility
    }
}

/// Manual lease extension for the message being handled
#[derive(Clone)]
pub struct VisibilityExtender {
    queue: QueueProperties,
    client: Arc<dyn QueueClient>,
    message_id: String,
    receipt_handle: String,
}

impl VisibilityExtender {
    pub(crate) fn new(queue: QueueProperties, client: Arc<dyn QueueClient>, message: &Message) -> Self {
        Self {
            queue,
            client,
            message_id: message.id.clone(),
            receipt_handle: message.receipt_handle.clone(),
        }
    }

    /// Set the remaining lease of the message to `visibility_timeout`
    pub async fn extend(&self, visibility_timeout: Duration) -> Result<(), VisibilityError> {
        let entry = VisibilityEntry {
            id: self.message_id.clone(),
            receipt_handle: self.receipt_handle.clone(),
            visibility_timeout,
        };
        let result = self.client.change_message_visibility(&self.queue, vec![entry]).await?;

        if result.is_successful(&self.message_id) {
            return Ok(());
        }
        Err(VisibilityError::Rejected {
            id: self.message_id.clone(),
            code: result
                .failure(&self.message_id)
                .map(|failure| failure.code.clone())
                .unwrap_or_else(|| "NotHandled".to_string()),
        })
    }

    /// Blocking form of [`extend`](Self::extend) for blocking handlers. Must not
    /// be called from async code.
    pub fn extend_blocking(&self, visibility_timeout: Duration) -> Result<(), VisibilityError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| VisibilityError::NoRuntime)?;
        runtime.block_on(self.extend(visibility_timeout))
    }
}

/// Outcome of an acknowledgement, shared by every caller
pub type AcknowledgeFuture = Shared<BoxFuture<'static, ResolutionResult>>;

/// Resolves the message being handled. Only the first call has an effect;
/// later calls return the outcome of the first.
#[derive(Clone)]
pub struct Acknowledge {
    inner: Arc<AcknowledgeInner>,
}

struct AcknowledgeInner {
    message: Message,
    context: Arc<ProcessingContext>,
    resolver: Arc<dyn MessageResolver>,
    decorators: DecoratorChain,
    outcome: OnceLock<AcknowledgeFuture>,
}

impl Acknowledge {
    pub(crate) fn new(
        message: Message,
        context: Arc<ProcessingContext>,
        resolver: Arc<dyn MessageResolver>,
        decorators: DecoratorChain,
    ) -> Self {
        Self {
            inner: Arc::new(AcknowledgeInner {
                message,
                context,
                resolver,
                decorators,
                outcome: OnceLock::new(),
            }),
        }
    }

    /// Request deletion of the message. Awaiting the returned future is optional.
    pub fn acknowledge(&self) -> AcknowledgeFuture {
        self.inner
            .outcome
            .get_or_init(|| Self::start(&self.inner))
            .clone()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    fn start(inner: &Arc<AcknowledgeInner>) -> AcknowledgeFuture {
        let context = &inner.context;
        let message = &inner.message;
        inner.decorators.fire("resolve", context, |d| d.on_resolve(context, message));

        let resolution = inner.resolver.resolve_message(message);
        let inner = inner.clone();
        let outcome = async move {
            let result = resolution.await;
            let context = &inner.context;
            let message = &inner.message;
            match &result {
                Ok(()) => inner
                    .decorators
                    .fire("resolve_success", context, |d| d.on_resolve_success(context, message)),
                Err(error) => {
                    warn!(
                        listener = %context.listener_identifier(),
                        message_id = %message.id,
                        error = %error,
                        "Failed to resolve message"
                    );
                    inner
                        .decorators
                        .fire("resolve_failure", context, |d| d.on_resolve_failure(context, message, error));
                }
            }
            result
        }
        .boxed()
        .shared();

        // Drive the outcome even if nobody awaits it so the resolve hooks fire
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(outcome.clone());
            }
            Err(_) => warn!(
                message_id = %message.id,
                "No Tokio runtime, resolve hooks only run if the acknowledgement is awaited"
            ),
        }
        outcome
    }
}
