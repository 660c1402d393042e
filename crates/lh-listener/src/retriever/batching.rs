//! BatchingMessageRetriever - coalesces message requests into batched receives
//!
//! Requests are collected until either `batch_size` requests are waiting or the
//! `batching_period` has elapsed since the first one, then a single receive call
//! sized to the waiting requests is made. Messages are handed to requests in the
//! order they were registered; requests left over are completed with no message.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lh_common::{DynamicValue, Message, QueueProperties};
use lh_queue::{QueueClient, ReceiveRequest, MAX_MESSAGES_PER_RECEIVE, MAX_WAIT_TIME};

use super::{distribute, MessageRetrieval, MessageRetriever, RetrievalSlot};
use crate::error::RetrievalError;

const DEFAULT_BATCHING_PERIOD: Duration = Duration::from_secs(2);
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct BatchingRetrieverProperties {
    /// Waiting requests that trigger a receive before the batching period ends.
    /// Clamped to the transport maximum of 10.
    pub batch_size: DynamicValue<usize>,
    /// Longest time to wait for more requests once one is waiting
    pub batching_period: DynamicValue<Duration>,
    /// Lease to take on received messages; queue default when `None`
    pub visibility_timeout: DynamicValue<Option<Duration>>,
    /// Long-poll wait for each receive
    pub wait_time: DynamicValue<Duration>,
    /// Pause after a failed receive before failing the waiting requests
    pub error_backoff: DynamicValue<Duration>,
}

impl Default for BatchingRetrieverProperties {
    fn default() -> Self {
        Self {
            batch_size: DynamicValue::fixed(MAX_MESSAGES_PER_RECEIVE),
            batching_period: DynamicValue::fixed(DEFAULT_BATCHING_PERIOD),
            visibility_timeout: DynamicValue::fixed(None),
            wait_time: DynamicValue::fixed(MAX_WAIT_TIME),
            error_backoff: DynamicValue::fixed(DEFAULT_ERROR_BACKOFF),
        }
    }
}

pub struct BatchingMessageRetriever {
    queue: QueueProperties,
    client: Arc<dyn QueueClient>,
    properties: BatchingRetrieverProperties,
    request_tx: mpsc::UnboundedSender<RetrievalSlot>,
    request_rx: Mutex<Option<mpsc::UnboundedReceiver<RetrievalSlot>>>,
}

impl BatchingMessageRetriever {
    pub fn new(
        queue: QueueProperties,
        client: Arc<dyn QueueClient>,
        properties: BatchingRetrieverProperties,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        Self {
            queue,
            client,
            properties,
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
        }
    }

    fn batch_size(&self) -> usize {
        self.properties
            .batch_size
            .get_where("batch_size", MAX_MESSAGES_PER_RECEIVE, |size| *size > 0)
            .min(MAX_MESSAGES_PER_RECEIVE)
    }

    fn batching_period(&self) -> Duration {
        self.properties
            .batching_period
            .get_or("batching_period", DEFAULT_BATCHING_PERIOD)
    }

    fn receive_request(&self, count: usize, wait_time: Duration) -> ReceiveRequest {
        ReceiveRequest::new(count)
            .with_visibility_timeout(self.properties.visibility_timeout.get_or("visibility_timeout", None))
            .with_wait_time(wait_time)
    }

    /// Collect requests until the batch is full, the window closes or shutdown.
    /// Returns true if shutdown interrupted the window.
    async fn fill_batch(
        &self,
        request_rx: &mut mpsc::UnboundedReceiver<RetrievalSlot>,
        slots: &mut Vec<RetrievalSlot>,
        shutdown: &CancellationToken,
    ) -> bool {
        let batch_size = self.batch_size();
        let window = tokio::time::sleep(self.batching_period());
        tokio::pin!(window);

        loop {
            slots.retain(|slot| !slot.is_closed());
            if slots.len() >= batch_size {
                return false;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return true,
                _ = &mut window => return false,
                slot = request_rx.recv() => match slot {
                    Some(slot) => slots.push(slot),
                    None => return true,
                },
            }
        }
    }

    /// Receive messages for `slots`, abandoning a long poll on shutdown in favour
    /// of an immediate receive so waiting requests are still served
    async fn receive_for(
        &self,
        slots: Vec<RetrievalSlot>,
        interrupted: bool,
        shutdown: &CancellationToken,
    ) -> Vec<Message> {
        let count = slots.len();
        let wait_time = if interrupted {
            Duration::ZERO
        } else {
            self.properties.wait_time.get_or("wait_time", MAX_WAIT_TIME)
        };

        let result = if interrupted {
            self.client
                .receive_messages(&self.queue, self.receive_request(count, wait_time))
                .await
        } else {
            tokio::select! {
                result = self.client.receive_messages(&self.queue, self.receive_request(count, wait_time)) => result,
                _ = shutdown.cancelled() => {
                    debug!(queue = %self.queue, "Long poll abandoned for shutdown");
                    self.client
                        .receive_messages(&self.queue, self.receive_request(count, Duration::ZERO))
                        .await
                }
            }
        };

        match result {
            Ok(messages) => {
                debug!(
                    queue = %self.queue,
                    requested = count,
                    received = messages.len(),
                    "Received batch"
                );
                metrics::counter!("leasehold_messages_received_total", "queue" => self.queue.queue_url.clone())
                    .increment(messages.len() as u64);
                distribute(slots, messages)
            }
            Err(e) => {
                error!(queue = %self.queue, error = %e, "Failed to receive messages");
                metrics::counter!("leasehold_receive_errors_total", "queue" => self.queue.queue_url.clone())
                    .increment(1);

                if !shutdown.is_cancelled() {
                    let backoff = self.properties.error_backoff.get_or("error_backoff", DEFAULT_ERROR_BACKOFF);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.cancelled() => {}
                    }
                }

                let error = RetrievalError::Transport(e);
                for slot in slots {
                    let _ = slot.send(Err(error.clone()));
                }
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl MessageRetriever for BatchingMessageRetriever {
    fn retrieve_message(&self) -> Result<MessageRetrieval, RetrievalError> {
        let (slot, retrieval) = MessageRetrieval::pending();
        self.request_tx
            .send(slot)
            .map_err(|_| RetrievalError::Stopped)?;
        Ok(retrieval)
    }

    async fn run(&self, shutdown: CancellationToken) -> Vec<Message> {
        let Some(mut request_rx) = self.request_rx.lock().take() else {
            warn!(queue = %self.queue, "Batching retriever already ran, ignoring start");
            return Vec::new();
        };

        info!(queue = %self.queue, "Batching message retriever started");
        let mut extra: VecDeque<Message> = VecDeque::new();

        loop {
            let first = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                slot = request_rx.recv() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
            };

            let mut slots = vec![first];
            let interrupted = self.fill_batch(&mut request_rx, &mut slots, &shutdown).await;
            slots.retain(|slot| !slot.is_closed());

            // Messages received earlier but never taken are handed out first
            let mut remaining = Vec::with_capacity(slots.len());
            for slot in slots {
                match extra.pop_front() {
                    Some(message) => {
                        if let Err(Ok(Some(message))) = slot.send(Ok(Some(message))) {
                            extra.push_front(message);
                        }
                    }
                    None => remaining.push(slot),
                }
            }

            if !remaining.is_empty() {
                extra.extend(self.receive_for(remaining, interrupted, &shutdown).await);
            }

            if interrupted {
                break;
            }
        }

        request_rx.close();
        while let Ok(slot) = request_rx.try_recv() {
            let _ = slot.send(Err(RetrievalError::Stopped));
        }

        info!(
            queue = %self.queue,
            extra_messages = extra.len(),
            "Batching message retriever stopped"
        );
        extra.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lh_queue::InMemoryQueue;

    fn retriever(
        queue: &Arc<InMemoryQueue>,
        properties: &QueueProperties,
        batch_size: usize,
        batching_period: Duration,
    ) -> Arc<BatchingMessageRetriever> {
        Arc::new(BatchingMessageRetriever::new(
            properties.clone(),
            queue.clone(),
            BatchingRetrieverProperties {
                batch_size: batch_size.into(),
                batching_period: batching_period.into(),
                wait_time: Duration::ZERO.into(),
                error_backoff: Duration::from_millis(100).into(),
                ..Default::default()
            },
        ))
    }

    fn start(retriever: &Arc<BatchingMessageRetriever>) -> (CancellationToken, tokio::task::JoinHandle<Vec<Message>>) {
        let shutdown = CancellationToken::new();
        let handle = {
            let retriever = retriever.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { retriever.run(shutdown).await })
        };
        (shutdown, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_triggers_single_receive_without_waiting() {
        let queue = Arc::new(InMemoryQueue::new());
        let properties = queue.create_queue("memory://batching");
        for i in 0..3 {
            queue.send_message(&properties, format!("message-{}", i));
        }
        let retriever = retriever(&queue, &properties, 3, Duration::from_secs(60));
        let (shutdown, handle) = start(&retriever);

        let started = tokio::time::Instant::now();
        let retrievals: Vec<_> = (0..3).map(|_| retriever.retrieve_message().unwrap()).collect();
        let results = futures::future::join_all(retrievals).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(results.iter().all(|result| matches!(result, Ok(Some(_)))));
        let calls = queue.calls();
        assert_eq!(calls.receive_calls.len(), 1);
        assert_eq!(calls.receive_calls[0].max_messages, 3);

        shutdown.cancel();
        assert!(handle.await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_request_waits_for_batching_period() {
        let queue = Arc::new(InMemoryQueue::new());
        let properties = queue.create_queue("memory://batching");
        queue.send_message(&properties, "only");
        let retriever = retriever(&queue, &properties, 5, Duration::from_secs(2));
        let (shutdown, handle) = start(&retriever);

        let started = tokio::time::Instant::now();
        let message = retriever.retrieve_message().unwrap().await.unwrap().unwrap();

        assert_eq!(message.body, "only");
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(queue.calls().receive_calls.len(), 1);
        assert_eq!(queue.calls().receive_calls[0].max_messages, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfilled_requests_complete_without_message() {
        let queue = Arc::new(InMemoryQueue::new());
        let properties = queue.create_queue("memory://batching");
        queue.send_message(&properties, "only");
        let retriever = retriever(&queue, &properties, 2, Duration::from_secs(1));
        let (shutdown, handle) = start(&retriever);

        let first = retriever.retrieve_message().unwrap();
        let second = retriever.retrieve_message().unwrap();

        assert!(matches!(first.await, Ok(Some(_))));
        assert_eq!(second.await, Ok(None));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdrawn_request_does_not_lose_message() {
        let queue = Arc::new(InMemoryQueue::new());
        let properties = queue.create_queue("memory://batching");
        queue.send_message(&properties, "kept");
        let retriever = retriever(&queue, &properties, 2, Duration::from_secs(1));
        let (shutdown, handle) = start(&retriever);

        let withdrawn = retriever.retrieve_message().unwrap();
        let kept = retriever.retrieve_message().unwrap();
        drop(withdrawn);

        let message = kept.await.unwrap().unwrap();
        assert_eq!(message.body, "kept");
        assert_eq!(queue.calls().receive_calls[0].max_messages, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_fails_batch_after_backoff() {
        let queue = Arc::new(InMemoryQueue::new());
        let properties = queue.create_queue("memory://batching");
        queue.fail_next_receives(1);
        let retriever = retriever(&queue, &properties, 1, Duration::from_secs(1));
        let (shutdown, handle) = start(&retriever);

        let started = tokio::time::Instant::now();
        let result = retriever.retrieve_message().unwrap().await;

        assert!(matches!(result, Err(RetrievalError::Transport(_))));
        assert!(started.elapsed() >= Duration::from_millis(100));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_requests() {
        let queue = Arc::new(InMemoryQueue::new());
        let properties = queue.create_queue("memory://batching");
        queue.send_message(&properties, "flushed");
        let retriever = retriever(&queue, &properties, 5, Duration::from_secs(60));
        let (shutdown, handle) = start(&retriever);

        let retrieval = retriever.retrieve_message().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();

        let message = retrieval.await.unwrap().unwrap();
        assert_eq!(message.body, "flushed");
        assert!(handle.await.unwrap().is_empty());
        assert!(matches!(retriever.retrieve_message(), Err(RetrievalError::Stopped)));
    }
}
