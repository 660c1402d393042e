//! Leasehold Queue - transport abstraction for lease-based queues
//!
//! The listener runtime talks to the queue exclusively through [`QueueClient`]:
//! - batched receive with a lease (visibility) timeout and long-poll wait
//! - batched delete to acknowledge messages
//! - batched visibility change to extend leases
//!
//! Implementations:
//! - [`memory::InMemoryQueue`]: SQS-like queue held in process memory, for tests and local development
//! - `sqs::SqsQueueClient` (feature `sqs`): AWS SQS via `aws-sdk-sqs`

pub mod error;
pub mod memory;
#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::QueueError;
pub use memory::InMemoryQueue;
#[cfg(feature = "sqs")]
pub use sqs::SqsQueueClient;

use async_trait::async_trait;
use lh_common::{Message, QueueProperties};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Maximum number of messages a single receive call may return
pub const MAX_MESSAGES_PER_RECEIVE: usize = 10;

/// Maximum number of entries in a batched delete or visibility change
pub const MAX_ENTRIES_PER_BATCH: usize = 10;

/// Maximum long-poll wait for a receive call
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

// ============================================================================
// Requests and Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: usize,
    /// Lease to take on received messages; `None` uses the queue default
    pub visibility_timeout: Option<Duration>,
    pub wait_time: Duration,
}

impl ReceiveRequest {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.clamp(1, MAX_MESSAGES_PER_RECEIVE),
            visibility_timeout: None,
            wait_time: MAX_WAIT_TIME,
        }
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Option<Duration>) -> Self {
        self.visibility_timeout = visibility_timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time.min(MAX_WAIT_TIME);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

impl From<&Message> for DeleteEntry {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            receipt_handle: message.receipt_handle.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityEntry {
    pub id: String,
    pub receipt_handle: String,
    pub visibility_timeout: Duration,
}

impl VisibilityEntry {
    pub fn for_message(message: &Message, visibility_timeout: Duration) -> Self {
        Self {
            id: message.id.clone(),
            receipt_handle: message.receipt_handle.clone(),
            visibility_timeout,
        }
    }
}

/// A single entry the queue refused in a batched call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntryFailure {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
    pub sender_fault: bool,
}

/// Outcome of a batched delete or visibility change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub successful: Vec<String>,
    pub failed: Vec<BatchEntryFailure>,
}

impl BatchResult {
    pub fn is_successful(&self, id: &str) -> bool {
        self.successful.iter().any(|successful| successful == id)
    }

    pub fn failure(&self, id: &str) -> Option<&BatchEntryFailure> {
        self.failed.iter().find(|failure| failure.id == id)
    }
}

// ============================================================================
// Client
// ============================================================================

/// Batched operations the listener runtime needs from a lease-based queue
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `request.max_messages`, waiting up to `request.wait_time`
    /// for at least one message to become available
    async fn receive_messages(
        &self,
        queue: &QueueProperties,
        request: ReceiveRequest,
    ) -> Result<Vec<Message>>;

    /// Delete (acknowledge) messages by their current receipt handle
    async fn delete_messages(
        &self,
        queue: &QueueProperties,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchResult>;

    /// Change the remaining lease of in-flight messages
    async fn change_message_visibility(
        &self,
        queue: &QueueProperties,
        entries: Vec<VisibilityEntry>,
    ) -> Result<BatchResult>;
}
