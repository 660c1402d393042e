//! PrefetchingMessageRetriever - keeps received messages buffered ahead of demand
//!
//! The background loop receives whenever fewer than `desired_min_prefetched_messages`
//! are buffered, never holding more than `max_prefetched_messages`. Requests are
//! served straight from the buffer, or wait for the next receive when it is empty.
//! Suited to handlers that are fast relative to the receive round trip.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lh_common::{DynamicValue, Message, QueueProperties};
use lh_queue::{QueueClient, ReceiveRequest, MAX_MESSAGES_PER_RECEIVE, MAX_WAIT_TIME};

use super::{MessageRetrieval, MessageRetriever, RetrievalSlot};
use crate::error::{ListenerError, RetrievalError};

const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PrefetchingRetrieverProperties {
    /// Buffer level below which more messages are received
    pub desired_min_prefetched_messages: usize,
    /// Upper bound on buffered messages
    pub max_prefetched_messages: usize,
    pub visibility_timeout: DynamicValue<Option<Duration>>,
    pub wait_time: DynamicValue<Duration>,
    pub error_backoff: DynamicValue<Duration>,
}

impl Default for PrefetchingRetrieverProperties {
    fn default() -> Self {
        Self {
            desired_min_prefetched_messages: 1,
            max_prefetched_messages: MAX_MESSAGES_PER_RECEIVE,
            visibility_timeout: DynamicValue::fixed(None),
            wait_time: DynamicValue::fixed(MAX_WAIT_TIME),
            error_backoff: DynamicValue::fixed(DEFAULT_ERROR_BACKOFF),
        }
    }
}

#[derive(Default)]
struct PrefetchState {
    buffered: VecDeque<Message>,
    waiting: VecDeque<RetrievalSlot>,
}

impl PrefetchState {
    /// Give a message to the oldest live waiter, or return it if nobody is waiting
    fn hand_to_waiter(&mut self, mut message: Message) -> Option<Message> {
        while let Some(slot) = self.waiting.pop_front() {
            match slot.send(Ok(Some(message))) {
                Ok(()) => return None,
                Err(Ok(Some(returned))) => message = returned,
                Err(_) => return None,
            }
        }
        Some(message)
    }
}

pub struct PrefetchingMessageRetriever {
    queue: QueueProperties,
    client: Arc<dyn QueueClient>,
    properties: PrefetchingRetrieverProperties,
    state: Mutex<PrefetchState>,
    drained: Notify,
    stopped: AtomicBool,
}

impl PrefetchingMessageRetriever {
    pub fn new(
        queue: QueueProperties,
        client: Arc<dyn QueueClient>,
        properties: PrefetchingRetrieverProperties,
    ) -> Result<Self, ListenerError> {
        if properties.desired_min_prefetched_messages == 0 {
            return Err(ListenerError::InvalidConfiguration(
                "desired_min_prefetched_messages must be positive".to_string(),
            ));
        }
        if properties.max_prefetched_messages < properties.desired_min_prefetched_messages {
            return Err(ListenerError::InvalidConfiguration(format!(
                "max_prefetched_messages ({}) must not be less than desired_min_prefetched_messages ({})",
                properties.max_prefetched_messages, properties.desired_min_prefetched_messages
            )));
        }

        Ok(Self {
            queue,
            client,
            properties,
            state: Mutex::new(PrefetchState::default()),
            drained: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn buffered_count(&self) -> usize {
        self.state.lock().buffered.len()
    }

    /// Wait until the buffer drops below the desired minimum. False on shutdown.
    async fn wait_for_demand(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.state.lock().buffered.len() < self.properties.desired_min_prefetched_messages {
                return true;
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = drained => {}
            }
        }
    }
}

#[async_trait]
impl MessageRetriever for PrefetchingMessageRetriever {
    fn retrieve_message(&self) -> Result<MessageRetrieval, RetrievalError> {
        let mut state = self.state.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RetrievalError::Stopped);
        }

        if let Some(message) = state.buffered.pop_front() {
            drop(state);
            self.drained.notify_one();
            return Ok(MessageRetrieval::ready(Ok(Some(message))));
        }

        let (slot, retrieval) = MessageRetrieval::pending();
        state.waiting.retain(|waiting| !waiting.is_closed());
        state.waiting.push_back(slot);
        Ok(retrieval)
    }

    async fn run(&self, shutdown: CancellationToken) -> Vec<Message> {
        info!(
            queue = %self.queue,
            desired_min = self.properties.desired_min_prefetched_messages,
            max = self.properties.max_prefetched_messages,
            "Prefetching message retriever started"
        );

        while self.wait_for_demand(&shutdown).await {
            let buffered = self.state.lock().buffered.len();
            let count = self
                .properties
                .max_prefetched_messages
                .saturating_sub(buffered)
                .clamp(1, MAX_MESSAGES_PER_RECEIVE);

            let request = ReceiveRequest::new(count)
                .with_visibility_timeout(self.properties.visibility_timeout.get_or("visibility_timeout", None))
                .with_wait_time(self.properties.wait_time.get_or("wait_time", MAX_WAIT_TIME));

            let result = tokio::select! {
                result = self.client.receive_messages(&self.queue, request) => result,
                _ = shutdown.cancelled() => break,
            };

            match result {
                Ok(messages) => {
                    debug!(queue = %self.queue, received = messages.len(), "Prefetched messages");
                    metrics::counter!("leasehold_messages_received_total", "queue" => self.queue.queue_url.clone())
                        .increment(messages.len() as u64);
                    let mut state = self.state.lock();
                    for message in messages {
                        if let Some(message) = state.hand_to_waiter(message) {
                            state.buffered.push_back(message);
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, error = %e, "Failed to prefetch messages");
                    metrics::counter!("leasehold_receive_errors_total", "queue" => self.queue.queue_url.clone())
                        .increment(1);
                    let backoff = self.properties.error_backoff.get_or("error_backoff", DEFAULT_ERROR_BACKOFF);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        let extra: Vec<Message> = {
            let mut state = self.state.lock();
            self.stopped.store(true, Ordering::SeqCst);
            for slot in state.waiting.drain(..) {
                let _ = slot.send(Err(RetrievalError::Stopped));
            }
            state.buffered.drain(..).collect()
        };

        info!(queue = %self.queue, extra_messages = extra.len(), "Prefetching message retriever stopped");
        extra
    }
}
