//! Message retrievers - supply messages to the broker one request at a time
//!
//! - BatchingMessageRetriever: coalesces concurrent requests into one receive call
//! - PrefetchingMessageRetriever: keeps a local buffer of received messages topped up

mod batching;
mod prefetch;

pub use batching::{BatchingMessageRetriever, BatchingRetrieverProperties};
pub use prefetch::{PrefetchingMessageRetriever, PrefetchingRetrieverProperties};

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use lh_common::Message;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::RetrievalError;

/// Outcome of one request: a message, no message this round, or an error
pub type RetrievalResult = Result<Option<Message>, RetrievalError>;

pub(crate) type RetrievalSlot = oneshot::Sender<RetrievalResult>;

/// A pending request for a single message.
///
/// Dropping it withdraws the request; a retriever skips withdrawn requests when
/// it hands out messages.
#[derive(Debug)]
pub struct MessageRetrieval {
    receiver: oneshot::Receiver<RetrievalResult>,
}

impl MessageRetrieval {
    pub(crate) fn pending() -> (RetrievalSlot, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    /// A retrieval that is already complete
    pub fn ready(result: RetrievalResult) -> Self {
        let (sender, retrieval) = Self::pending();
        let _ = sender.send(result);
        retrieval
    }
}

impl Future for MessageRetrieval {
    type Output = RetrievalResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RetrievalError::Stopped)))
    }
}

#[async_trait]
pub trait MessageRetriever: Send + Sync {
    /// Register a request for one message. Safe to call from any task or thread.
    fn retrieve_message(&self) -> Result<MessageRetrieval, RetrievalError>;

    /// Run the background loop until `shutdown` is cancelled.
    ///
    /// Returns messages that were received but never handed out so the caller
    /// can decide whether to process them.
    async fn run(&self, shutdown: CancellationToken) -> Vec<Message>;
}

/// Hand messages to slots in registration order, skipping withdrawn slots.
/// Returns the messages nobody took.
pub(crate) fn distribute<I>(slots: I, messages: Vec<Message>) -> Vec<Message>
where
    I: IntoIterator<Item = RetrievalSlot>,
{
    let mut messages: std::collections::VecDeque<Message> = messages.into();
    for slot in slots {
        match messages.pop_front() {
            Some(message) => {
                if let Err(Ok(Some(message))) = slot.send(Ok(Some(message))) {
                    messages.push_front(message);
                }
            }
            None => {
                let _ = slot.send(Ok(None));
            }
        }
    }
    messages.into()
}
