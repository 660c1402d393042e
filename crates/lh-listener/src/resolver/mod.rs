//! Message resolvers - acknowledge processed messages by deleting them from the queue

mod batching;

pub use batching::{BatchingMessageResolver, BatchingResolverProperties};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use lh_common::Message;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ResolutionError;

pub type ResolutionResult = Result<(), ResolutionError>;

/// Completes once the delete for a message has succeeded or failed
#[derive(Debug)]
pub struct MessageResolution {
    receiver: oneshot::Receiver<ResolutionResult>,
}

impl MessageResolution {
    pub(crate) fn pending() -> (oneshot::Sender<ResolutionResult>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    pub fn ready(result: ResolutionResult) -> Self {
        let (sender, resolution) = Self::pending();
        let _ = sender.send(result);
        resolution
    }
}

impl Future for MessageResolution {
    type Output = ResolutionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ResolutionError::Stopped)))
    }
}

#[async_trait]
pub trait MessageResolver: Send + Sync {
    /// Request deletion of `message`. Safe to call from any task or thread.
    fn resolve_message(&self, message: &Message) -> MessageResolution;

    /// Run the background loop until `shutdown` is cancelled. Every resolution
    /// requested before shutdown is attempted before this returns.
    async fn run(&self, shutdown: CancellationToken);
}
