//! Leasehold Common - types shared by every Leasehold crate
//!
//! - Message: a leased message as handed out by the queue transport
//! - QueueProperties: identity of the queue a listener consumes from
//! - DynamicValue: tunables that are either fixed or re-read on every cycle
//! - logging: tracing subscriber initialisation

pub mod dynamic;
pub mod logging;

pub use dynamic::DynamicValue;
pub use logging::{init_logging, LogFormat};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// System attribute carrying the FIFO group key
pub const MESSAGE_GROUP_ID_ATTRIBUTE: &str = "MessageGroupId";

/// System attribute carrying the number of times the message was received
pub const APPROXIMATE_RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

/// System attribute carrying the epoch millis the message was sent at
pub const SENT_TIMESTAMP_ATTRIBUTE: &str = "SentTimestamp";

// ============================================================================
// Message
// ============================================================================

/// A message received from a lease-based queue.
///
/// The receipt handle identifies the current lease and is required to delete the
/// message or change its visibility. Messages are never mutated after being
/// received; stages that need to keep a copy clone it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub receipt_handle: String,
    pub body: String,
    /// System attributes, e.g. `MessageGroupId`
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// User supplied message attributes
    #[serde(default)]
    pub message_attributes: HashMap<String, String>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        receipt_handle: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            receipt_handle: receipt_handle.into(),
            body: body.into(),
            attributes: HashMap::new(),
            message_attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_message_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.message_attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn message_attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes.get(name).map(String::as_str)
    }

    /// FIFO group key, if the queue assigned one
    pub fn message_group_id(&self) -> Option<&str> {
        self.attribute(MESSAGE_GROUP_ID_ATTRIBUTE)
            .filter(|group| !group.is_empty())
    }

    pub fn receive_count(&self) -> Option<u32> {
        self.attribute(APPROXIMATE_RECEIVE_COUNT_ATTRIBUTE)
            .and_then(|count| count.parse().ok())
    }
}

// ============================================================================
// Queue Properties
// ============================================================================

/// Identifies the queue that a listener consumes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueProperties {
    pub queue_url: String,
}

impl QueueProperties {
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self { queue_url: queue_url.into() }
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// FIFO queues follow the SQS naming convention of a `.fifo` suffix
    pub fn is_fifo(&self) -> bool {
        self.queue_url.ends_with(".fifo")
    }
}

impl fmt::Display for QueueProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.queue_url)
    }
}
