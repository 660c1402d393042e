//! InMemoryQueue - SQS-like lease queue held in process memory
//!
//! Mirrors the parts of SQS semantics the listener runtime depends on:
//! - received messages are leased for a visibility timeout and redelivered when it expires
//! - deletes and visibility changes require the receipt handle of the current lease
//! - receives long-poll up to the requested wait time
//! - FIFO queues (`.fifo` suffix) never hand out a group while an earlier message of it is leased
//!
//! Every call is recorded so tests can assert on batching behaviour, and failures
//! can be injected to exercise transport error paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use lh_common::{
    Message, QueueProperties, APPROXIMATE_RECEIVE_COUNT_ATTRIBUTE, MESSAGE_GROUP_ID_ATTRIBUTE,
    SENT_TIMESTAMP_ATTRIBUTE,
};

use crate::{
    BatchEntryFailure, BatchResult, DeleteEntry, QueueClient, QueueError, ReceiveRequest, Result,
    VisibilityEntry, MAX_ENTRIES_PER_BATCH,
};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound between visibility re-checks while long polling; lease expiry
/// is not signalled
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Record of every call made against the queue
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub receive_calls: Vec<ReceiveRequest>,
    pub delete_calls: Vec<Vec<DeleteEntry>>,
    pub visibility_calls: Vec<Vec<VisibilityEntry>>,
}

struct Lease {
    receipt_handle: String,
    visible_at: Instant,
}

struct StoredMessage {
    id: String,
    body: String,
    group_id: Option<String>,
    message_attributes: HashMap<String, String>,
    sent_at_millis: i64,
    receive_count: u32,
    lease: Option<Lease>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.lease.as_ref().map_or(true, |lease| lease.visible_at <= now)
    }

    fn is_leased_by(&self, receipt_handle: &str, now: Instant) -> bool {
        self.lease
            .as_ref()
            .map_or(false, |lease| lease.receipt_handle == receipt_handle && lease.visible_at > now)
    }

    fn to_message(&self, receipt_handle: String) -> Message {
        let mut message = Message::new(self.id.clone(), receipt_handle, self.body.clone())
            .with_attribute(APPROXIMATE_RECEIVE_COUNT_ATTRIBUTE, self.receive_count.to_string())
            .with_attribute(SENT_TIMESTAMP_ATTRIBUTE, self.sent_at_millis.to_string());
        if let Some(group) = &self.group_id {
            message = message.with_attribute(MESSAGE_GROUP_ID_ATTRIBUTE, group.clone());
        }
        message.message_attributes = self.message_attributes.clone();
        message
    }
}

struct QueueState {
    fifo: bool,
    messages: Mutex<Vec<StoredMessage>>,
    changed: Notify,
}

impl QueueState {
    fn new(fifo: bool) -> Self {
        Self {
            fifo,
            messages: Mutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    fn lease_visible(&self, max_messages: usize, visibility_timeout: Duration) -> Vec<Message> {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut blocked_groups: HashSet<String> = HashSet::new();
        let mut leased = Vec::new();

        for stored in messages.iter_mut() {
            if leased.len() >= max_messages {
                break;
            }

            if self.fifo {
                if let Some(group) = &stored.group_id {
                    if blocked_groups.contains(group) {
                        continue;
                    }
                    if !stored.is_visible(now) {
                        blocked_groups.insert(group.clone());
                        continue;
                    }
                }
            }

            if !stored.is_visible(now) {
                continue;
            }

            let receipt_handle = Uuid::new_v4().to_string();
            stored.receive_count += 1;
            stored.lease = Some(Lease {
                receipt_handle: receipt_handle.clone(),
                visible_at: now + visibility_timeout,
            });
            leased.push(stored.to_message(receipt_handle));
        }

        leased
    }
}

pub struct InMemoryQueue {
    queues: DashMap<String, Arc<QueueState>>,
    default_visibility_timeout: Duration,
    receive_failures: AtomicUsize,
    delete_failures: AtomicUsize,
    visibility_failures: AtomicUsize,
    calls: Mutex<CallLog>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            default_visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            receive_failures: AtomicUsize::new(0),
            delete_failures: AtomicUsize::new(0),
            visibility_failures: AtomicUsize::new(0),
            calls: Mutex::new(CallLog::default()),
        }
    }

    /// Lease used when a receive does not ask for a specific visibility timeout
    pub fn with_default_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.default_visibility_timeout = timeout;
        self
    }

    /// Create a queue; FIFO semantics apply when the URL ends in `.fifo`
    pub fn create_queue(&self, queue_url: impl Into<String>) -> QueueProperties {
        let queue = QueueProperties::new(queue_url);
        self.queues
            .entry(queue.queue_url.clone())
            .or_insert_with(|| Arc::new(QueueState::new(queue.is_fifo())));
        queue
    }

    pub fn send_message(&self, queue: &QueueProperties, body: impl Into<String>) -> String {
        self.store(queue, body.into(), None, HashMap::new())
    }

    pub fn send_message_with_group(
        &self,
        queue: &QueueProperties,
        body: impl Into<String>,
        group_id: impl Into<String>,
    ) -> String {
        self.store(queue, body.into(), Some(group_id.into()), HashMap::new())
    }

    pub fn send_message_with_attributes(
        &self,
        queue: &QueueProperties,
        body: impl Into<String>,
        message_attributes: HashMap<String, String>,
    ) -> String {
        self.store(queue, body.into(), None, message_attributes)
    }

    fn store(
        &self,
        queue: &QueueProperties,
        body: String,
        group_id: Option<String>,
        message_attributes: HashMap<String, String>,
    ) -> String {
        let state = self
            .queues
            .entry(queue.queue_url.clone())
            .or_insert_with(|| Arc::new(QueueState::new(queue.is_fifo())))
            .clone();

        let id = Uuid::new_v4().to_string();
        state.messages.lock().push(StoredMessage {
            id: id.clone(),
            body,
            group_id,
            message_attributes,
            sent_at_millis: chrono::Utc::now().timestamp_millis(),
            receive_count: 0,
            lease: None,
        });
        state.changed.notify_waiters();
        id
    }

    /// Messages not yet deleted, leased or not
    pub fn message_count(&self, queue: &QueueProperties) -> usize {
        self.queues
            .get(&queue.queue_url)
            .map(|state| state.messages.lock().len())
            .unwrap_or(0)
    }

    /// Messages currently leased to a consumer
    pub fn in_flight_count(&self, queue: &QueueProperties) -> usize {
        let now = Instant::now();
        self.queues
            .get(&queue.queue_url)
            .map(|state| {
                state
                    .messages
                    .lock()
                    .iter()
                    .filter(|stored| !stored.is_visible(now))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Fail the next `count` receive calls with a transport error
    pub fn fail_next_receives(&self, count: usize) {
        self.receive_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` delete calls with a transport error
    pub fn fail_next_deletes(&self, count: usize) {
        self.delete_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` visibility change calls with a transport error
    pub fn fail_next_visibility_changes(&self, count: usize) {
        self.visibility_failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> CallLog {
        self.calls.lock().clone()
    }

    fn state(&self, queue: &QueueProperties) -> Result<Arc<QueueState>> {
        self.queues
            .get(&queue.queue_url)
            .map(|state| state.clone())
            .ok_or_else(|| QueueError::QueueNotFound(queue.queue_url.clone()))
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .is_ok()
    }

    fn validate_batch<'a>(ids: impl Iterator<Item = &'a str>) -> Result<()> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id) {
                return Err(QueueError::InvalidRequest(format!(
                    "batch entry ids must be distinct, '{}' repeated",
                    id
                )));
            }
        }
        if seen.is_empty() {
            return Err(QueueError::InvalidRequest("batch request contains no entries".to_string()));
        }
        if seen.len() > MAX_ENTRIES_PER_BATCH {
            return Err(QueueError::InvalidRequest(format!(
                "batch request has {} entries, maximum is {}",
                seen.len(),
                MAX_ENTRIES_PER_BATCH
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive_messages(
        &self,
        queue: &QueueProperties,
        request: ReceiveRequest,
    ) -> Result<Vec<Message>> {
        self.calls.lock().receive_calls.push(request.clone());

        if Self::take_failure(&self.receive_failures) {
            return Err(QueueError::Transport("injected receive failure".to_string()));
        }

        let state = self.state(queue)?;
        let visibility_timeout = request
            .visibility_timeout
            .unwrap_or(self.default_visibility_timeout);
        let deadline = Instant::now() + request.wait_time;

        loop {
            let changed = state.changed.notified();
            let messages = state.lease_visible(request.max_messages, visibility_timeout);
            if !messages.is_empty() {
                debug!(queue = %queue, count = messages.len(), "Leased messages");
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout((deadline - now).min(LEASE_POLL_INTERVAL), changed).await;
        }
    }

    async fn delete_messages(
        &self,
        queue: &QueueProperties,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchResult> {
        self.calls.lock().delete_calls.push(entries.clone());

        if Self::take_failure(&self.delete_failures) {
            return Err(QueueError::Transport("injected delete failure".to_string()));
        }

        Self::validate_batch(entries.iter().map(|entry| entry.id.as_str()))?;
        let state = self.state(queue)?;
        let now = Instant::now();
        let mut result = BatchResult::default();

        {
            let mut messages = state.messages.lock();
            for entry in entries {
                let position = messages
                    .iter()
                    .position(|stored| stored.id == entry.id && stored.is_leased_by(&entry.receipt_handle, now));
                match position {
                    Some(index) => {
                        messages.remove(index);
                        result.successful.push(entry.id);
                    }
                    None => result.failed.push(BatchEntryFailure {
                        id: entry.id,
                        code: "ReceiptHandleIsInvalid".to_string(),
                        message: Some("The receipt handle is not valid for this message".to_string()),
                        sender_fault: true,
                    }),
                }
            }
        }

        state.changed.notify_waiters();
        Ok(result)
    }

    async fn change_message_visibility(
        &self,
        queue: &QueueProperties,
        entries: Vec<VisibilityEntry>,
    ) -> Result<BatchResult> {
        self.calls.lock().visibility_calls.push(entries.clone());

        if Self::take_failure(&self.visibility_failures) {
            return Err(QueueError::Transport("injected visibility change failure".to_string()));
        }

        Self::validate_batch(entries.iter().map(|entry| entry.id.as_str()))?;
        let state = self.state(queue)?;
        let now = Instant::now();
        let mut result = BatchResult::default();

        {
            let mut messages = state.messages.lock();
            for entry in entries {
                let stored = messages
                    .iter_mut()
                    .find(|stored| stored.id == entry.id && stored.is_leased_by(&entry.receipt_handle, now));
                match stored.and_then(|stored| stored.lease.as_mut()) {
                    Some(lease) => {
                        lease.visible_at = now + entry.visibility_timeout;
                        result.successful.push(entry.id);
                    }
                    None => result.failed.push(BatchEntryFailure {
                        id: entry.id,
                        code: "MessageNotInflight".to_string(),
                        message: Some("The message is not currently leased with this receipt handle".to_string()),
                        sender_fault: true,
                    }),
                }
            }
        }

        state.changed.notify_waiters();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receive(max: usize) -> ReceiveRequest {
        ReceiveRequest::new(max).with_wait_time(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_receive_leases_messages() {
        let queue = InMemoryQueue::new();
        let properties = queue.create_queue("memory://orders");
        queue.send_message(&properties, "one");
        queue.send_message(&properties, "two");

        let first = queue.receive_messages(&properties, receive(10)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].body, "one");
        assert_eq!(first[0].receive_count(), Some(1));

        let second = queue.receive_messages(&properties, receive(10)).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(queue.in_flight_count(&properties), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let queue = InMemoryQueue::new();
        let properties = queue.create_queue("memory://orders");
        queue.send_message(&properties, "one");

        let request = receive(1).with_visibility_timeout(Some(Duration::from_secs(5)));
        let first = queue.receive_messages(&properties, request.clone()).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let second = queue.receive_messages(&properties, request).await.unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
        assert_eq!(second[0].receive_count(), Some(2));
    }

    #[tokio::test]
    async fn test_delete_requires_current_receipt_handle() {
        let queue = InMemoryQueue::new();
        let properties = queue.create_queue("memory://orders");
        queue.send_message(&properties, "one");
        let message = queue.receive_messages(&properties, receive(1)).await.unwrap().remove(0);

        let result = queue
            .delete_messages(&properties, vec![DeleteEntry {
                id: message.id.clone(),
                receipt_handle: "stale".to_string(),
            }])
            .await
            .unwrap();
        assert_eq!(result.failed.len(), 1);

        let result = queue
            .delete_messages(&properties, vec![DeleteEntry::from(&message)])
            .await
            .unwrap();
        assert!(result.is_successful(&message.id));
        assert_eq!(queue.message_count(&properties), 0);
    }

    #[tokio::test]
    async fn test_duplicate_batch_ids_are_rejected() {
        let queue = InMemoryQueue::new();
        let properties = queue.create_queue("memory://orders");
        let entry = DeleteEntry { id: "a".to_string(), receipt_handle: "h".to_string() };

        let result = queue.delete_messages(&properties, vec![entry.clone(), entry]).await;
        assert!(matches!(result, Err(QueueError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_fifo_blocks_group_while_leased() {
        let queue = InMemoryQueue::new();
        let properties = queue.create_queue("memory://orders.fifo");
        queue.send_message_with_group(&properties, "a-1", "a");
        queue.send_message_with_group(&properties, "b-1", "b");
        queue.send_message_with_group(&properties, "a-2", "a");

        let first = queue.receive_messages(&properties, receive(1)).await.unwrap();
        assert_eq!(first[0].body, "a-1");

        let second = queue.receive_messages(&properties, receive(10)).await.unwrap();
        let bodies: Vec<_> = second.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["b-1"]);
        assert_eq!(second[0].message_group_id(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_send() {
        let queue = Arc::new(InMemoryQueue::new());
        let properties = queue.create_queue("memory://orders");

        let receiver = {
            let queue = queue.clone();
            let properties = properties.clone();
            tokio::spawn(async move {
                queue
                    .receive_messages(&properties, ReceiveRequest::new(1).with_wait_time(Duration::from_secs(20)))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.send_message(&properties, "late");

        let messages = receiver.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_change_extends_lease() {
        let queue = InMemoryQueue::new();
        let properties = queue.create_queue("memory://orders");
        queue.send_message(&properties, "one");
        let request = receive(1).with_visibility_timeout(Some(Duration::from_secs(2)));
        let message = queue.receive_messages(&properties, request.clone()).await.unwrap().remove(0);

        let result = queue
            .change_message_visibility(&properties, vec![VisibilityEntry::for_message(&message, Duration::from_secs(10))])
            .await
            .unwrap();
        assert!(result.is_successful(&message.id));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(queue.receive_messages(&properties, request).await.unwrap().is_empty());
        assert_eq!(queue.calls().visibility_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_injected_receive_failure() {
        let queue = InMemoryQueue::new();
        let properties = queue.create_queue("memory://orders");
        queue.fail_next_receives(1);

        assert!(matches!(
            queue.receive_messages(&properties, receive(1)).await,
            Err(QueueError::Transport(_))
        ));
        assert!(queue.receive_messages(&properties, receive(1)).await.is_ok());
    }
}
