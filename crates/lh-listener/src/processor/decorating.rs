//! DecoratingMessageProcessor - runs a handler inside the decorator lifecycle

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::{self, FutureExt};
use lh_common::{Message, QueueProperties};
use lh_queue::QueueClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    Acknowledge, HandlerContext, HandlerFuture, MessageHandler, MessageProcessor, ProcessingFuture,
    VisibilityExtender,
};
use crate::decorator::{DecoratorChain, MessageProcessingDecorator, ProcessingContext};
use crate::error::ProcessingError;
use crate::resolver::MessageResolver;

/// What the handler invocation left to wait for
enum Supplied {
    Completed,
    Pending(HandlerFuture),
}

pub struct DecoratingMessageProcessor {
    listener_identifier: String,
    queue: QueueProperties,
    client: Arc<dyn QueueClient>,
    handler: MessageHandler,
    resolver: Arc<dyn MessageResolver>,
    decorators: DecoratorChain,
}

impl DecoratingMessageProcessor {
    pub fn new(
        listener_identifier: impl Into<String>,
        queue: QueueProperties,
        client: Arc<dyn QueueClient>,
        handler: MessageHandler,
        resolver: Arc<dyn MessageResolver>,
        decorators: Vec<Arc<dyn MessageProcessingDecorator>>,
    ) -> Self {
        Self {
            listener_identifier: listener_identifier.into(),
            queue,
            client,
            handler,
            resolver,
            decorators: DecoratorChain::new(decorators),
        }
    }

    fn invoke(
        &self,
        message: Message,
        context: HandlerContext,
        acknowledge: Acknowledge,
    ) -> Result<Supplied, ProcessingError> {
        match &self.handler {
            MessageHandler::Blocking(handler) => handler(message, context)
                .map(|()| Supplied::Completed)
                .map_err(ProcessingError::Handler),
            MessageHandler::Async(handler) => Ok(Supplied::Pending(handler(message, context))),
            MessageHandler::BlockingWithAck(handler) => handler(message, context, acknowledge)
                .map(|()| Supplied::Completed)
                .map_err(ProcessingError::Handler),
            MessageHandler::AsyncWithAck(handler) => {
                Ok(Supplied::Pending(handler(message, context, acknowledge)))
            }
        }
    }
}

impl MessageProcessor for DecoratingMessageProcessor {
    fn process_message(&self, message: Message, cancellation: CancellationToken) -> ProcessingFuture {
        let context = Arc::new(ProcessingContext::new(
            self.listener_identifier.clone(),
            self.queue.clone(),
            cancellation,
        ));

        if let Err(error) = self.decorators.pre_supply(&context, &message) {
            return future::ready(Err(error)).boxed();
        }

        let acknowledge = Acknowledge::new(
            message.clone(),
            context.clone(),
            self.resolver.clone(),
            self.decorators.clone(),
        );
        let handler_context = HandlerContext::new(
            context.clone(),
            VisibilityExtender::new(self.queue.clone(), self.client.clone(), &message),
        );

        let supplied = catch_unwind(AssertUnwindSafe(|| {
            self.invoke(message.clone(), handler_context, acknowledge.clone())
        }))
        .unwrap_or_else(|payload| Err(ProcessingError::from_panic(payload)));

        match &supplied {
            Ok(_) => self
                .decorators
                .fire("supply_success", &context, |d| d.on_supply_success(&context, &message)),
            Err(error) => self
                .decorators
                .fire("supply_failure", &context, |d| d.on_supply_failure(&context, &message, error)),
        }
        self.decorators
            .fire("supply_finished", &context, |d| d.on_supply_finished(&context, &message));

        let decorators = self.decorators.clone();
        let auto_acknowledge = self.handler.acknowledges_automatically();

        async move {
            let result = match supplied {
                Ok(Supplied::Completed) => Ok(()),
                Ok(Supplied::Pending(pending)) => match AssertUnwindSafe(pending).catch_unwind().await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(ProcessingError::Handler(error)),
                    Err(payload) => Err(ProcessingError::from_panic(payload)),
                },
                Err(error) => Err(error),
            };

            let listener = context.listener_identifier().to_string();
            match &result {
                Ok(()) => {
                    debug!(listener = %listener, message_id = %message.id, "Message processed");
                    metrics::counter!("leasehold_messages_processed_total", "listener" => listener.clone())
                        .increment(1);
                    decorators.fire("processing_success", &context, |d| {
                        d.on_processing_success(&context, &message)
                    });
                }
                Err(error) => {
                    warn!(
                        listener = %listener,
                        message_id = %message.id,
                        error = %error,
                        "Message processing failed, message will become visible again"
                    );
                    metrics::counter!("leasehold_messages_failed_total", "listener" => listener.clone())
                        .increment(1);
                    decorators.fire("processing_failure", &context, |d| {
                        d.on_processing_failure(&context, &message, error)
                    });
                }
            }
            decorators.fire("processing_finished", &context, |d| {
                d.on_processing_finished(&context, &message)
            });

            if result.is_ok() && auto_acknowledge {
                // Resolution completes in the background; the permit is not held for the delete
                drop(acknowledge.acknowledge());
            }
            result
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use lh_queue::InMemoryQueue;
    use parking_lot::Mutex;

    use super::*;
    use crate::decorator::testing::RecordingDecorator;
    use crate::error::ResolutionError;
    use crate::resolver::{MessageResolution, ResolutionResult};

    struct RecordingResolver {
        resolved: Mutex<Vec<String>>,
        outcome: ResolutionResult,
    }

    impl RecordingResolver {
        fn new(outcome: ResolutionResult) -> Arc<Self> {
            Arc::new(Self {
                resolved: Mutex::new(Vec::new()),
                outcome,
            })
        }
    }

    #[async_trait]
    impl MessageResolver for RecordingResolver {
        fn resolve_message(&self, message: &Message) -> MessageResolution {
            self.resolved.lock().push(message.id.clone());
            MessageResolution::ready(self.outcome.clone())
        }

        async fn run(&self, _shutdown: CancellationToken) {}
    }

    fn processor(
        handler: MessageHandler,
        resolver: Arc<RecordingResolver>,
        decorators: Vec<Arc<dyn MessageProcessingDecorator>>,
    ) -> DecoratingMessageProcessor {
        DecoratingMessageProcessor::new(
            "test-listener",
            QueueProperties::new("memory://orders"),
            Arc::new(InMemoryQueue::new()),
            handler,
            resolver,
            decorators,
        )
    }

    fn events() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_blocking_success_fires_hooks_in_order_and_resolves() {
        let events = events();
        let resolver = RecordingResolver::new(Ok(()));
        let processor = processor(
            MessageHandler::blocking(|_, _| Ok(())),
            resolver.clone(),
            vec![Arc::new(RecordingDecorator::new("a", &events))],
        );

        let result = processor
            .process_message(Message::new("m1", "h1", "body"), CancellationToken::new())
            .await;
        settle().await;

        assert!(result.is_ok());
        assert_eq!(*resolver.resolved.lock(), vec!["m1"]);
        assert_eq!(
            *events.lock(),
            vec![
                "a:pre_supply",
                "a:supply_success",
                "a:supply_finished",
                "a:processing_success",
                "a:processing_finished",
                "a:resolve",
                "a:resolve_success",
            ]
        );
    }

    #[tokio::test]
    async fn test_blocking_failure_leaves_message_unresolved() {
        let events = events();
        let resolver = RecordingResolver::new(Ok(()));
        let processor = processor(
            MessageHandler::blocking(|_, _| anyhow::bail!("boom")),
            resolver.clone(),
            vec![Arc::new(RecordingDecorator::new("a", &events))],
        );

        let result = processor
            .process_message(Message::new("m1", "h1", ""), CancellationToken::new())
            .await;
        settle().await;

        assert!(matches!(result, Err(ProcessingError::Handler(_))));
        assert!(resolver.resolved.lock().is_empty());
        assert_eq!(
            *events.lock(),
            vec![
                "a:pre_supply",
                "a:supply_failure",
                "a:supply_finished",
                "a:processing_failure",
                "a:processing_finished",
            ]
        );
    }

    #[tokio::test]
    async fn test_async_failure_is_a_supply_success() {
        let events = events();
        let processor = processor(
            MessageHandler::from_async(|_, _| async { anyhow::bail!("later") }),
            RecordingResolver::new(Ok(())),
            vec![Arc::new(RecordingDecorator::new("a", &events))],
        );

        let result = processor
            .process_message(Message::new("m1", "h1", ""), CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(
            *events.lock(),
            vec![
                "a:pre_supply",
                "a:supply_success",
                "a:supply_finished",
                "a:processing_failure",
                "a:processing_finished",
            ]
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_processing_failure() {
        let resolver = RecordingResolver::new(Ok(()));
        let processor = processor(
            MessageHandler::blocking(|_, _| panic!("handler bug")),
            resolver.clone(),
            Vec::new(),
        );

        let result = processor
            .process_message(Message::new("m1", "h1", ""), CancellationToken::new())
            .await;

        match result {
            Err(ProcessingError::Panicked(message)) => assert_eq!(message, "handler bug"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(resolver.resolved.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pre_supply_rejection_skips_handler() {
        let events = events();
        let invoked = Arc::new(Mutex::new(false));
        let flag = invoked.clone();
        let mut rejecting = RecordingDecorator::new("a", &events);
        rejecting.fail_pre_supply = true;
        let processor = processor(
            MessageHandler::blocking(move |_, _| {
                *flag.lock() = true;
                Ok(())
            }),
            RecordingResolver::new(Ok(())),
            vec![Arc::new(rejecting)],
        );

        let result = processor
            .process_message(Message::new("m1", "h1", ""), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ProcessingError::PreSupply { .. })));
        assert!(!*invoked.lock());
        assert_eq!(*events.lock(), vec!["a:pre_supply"]);
    }

    #[tokio::test]
    async fn test_manual_ack_resolves_only_when_acknowledged() {
        let resolver = RecordingResolver::new(Ok(()));
        let processor = processor(
            MessageHandler::blocking_with_ack(|message, _, acknowledge| {
                if message.body == "ack" {
                    drop(acknowledge.acknowledge());
                    drop(acknowledge.acknowledge());
                }
                Ok(())
            }),
            resolver.clone(),
            Vec::new(),
        );

        processor
            .process_message(Message::new("m1", "h1", "ack"), CancellationToken::new())
            .await
            .unwrap();
        processor
            .process_message(Message::new("m2", "h2", "skip"), CancellationToken::new())
            .await
            .unwrap();
        settle().await;

        assert_eq!(*resolver.resolved.lock(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_async_ack_outcome_is_shared() {
        let events = events();
        let resolver = RecordingResolver::new(Err(ResolutionError::Failed {
            id: "m1".into(),
            code: "ReceiptHandleIsInvalid".into(),
            reason: None,
        }));
        let processor = processor(
            MessageHandler::async_with_ack(|_, _, acknowledge| async move {
                let first = acknowledge.acknowledge().await;
                let second = acknowledge.acknowledge().await;
                assert_eq!(first, second);
                assert!(first.is_err());
                Ok(())
            }),
            resolver.clone(),
            vec![Arc::new(RecordingDecorator::new("a", &events))],
        );

        processor
            .process_message(Message::new("m1", "h1", ""), CancellationToken::new())
            .await
            .unwrap();
        settle().await;

        assert_eq!(resolver.resolved.lock().len(), 1);
        let events = events.lock();
        assert_eq!(events.iter().filter(|e| *e == "a:resolve").count(), 1);
        assert_eq!(events.iter().filter(|e| *e == "a:resolve_failure").count(), 1);
    }

    #[tokio::test]
    async fn test_handler_sees_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let processor = processor(
            MessageHandler::blocking(|_, context| {
                anyhow::ensure!(context.is_cancelled(), "expected cancellation");
                Ok(())
            }),
            RecordingResolver::new(Ok(())),
            Vec::new(),
        );

        assert!(processor
            .process_message(Message::new("m1", "h1", ""), token)
            .await
            .is_ok());
    }
}
