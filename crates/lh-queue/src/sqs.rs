//! SqsQueueClient - AWS SQS transport

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_sqs::types::{
    ChangeMessageVisibilityBatchRequestEntry, DeleteMessageBatchRequestEntry,
    MessageSystemAttributeName,
};
use aws_sdk_sqs::Client;
use tracing::{debug, warn};

use lh_common::{Message, QueueProperties};

use crate::{
    BatchEntryFailure, BatchResult, DeleteEntry, QueueClient, QueueError, ReceiveRequest, Result,
    VisibilityEntry,
};

pub struct SqsQueueClient {
    client: Client,
}

impl SqsQueueClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS credential and region chain
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }

    fn to_message(message: &aws_sdk_sqs::types::Message) -> Option<Message> {
        let (Some(id), Some(receipt_handle)) = (message.message_id(), message.receipt_handle()) else {
            warn!("Received SQS message without id or receipt handle, skipping");
            return None;
        };

        let attributes: HashMap<String, String> = message
            .attributes()
            .map(|attributes| {
                attributes
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let message_attributes: HashMap<String, String> = message
            .message_attributes()
            .map(|attributes| {
                attributes
                    .iter()
                    .filter_map(|(name, value)| {
                        value.string_value().map(|v| (name.clone(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Message {
            id: id.to_string(),
            receipt_handle: receipt_handle.to_string(),
            body: message.body().unwrap_or_default().to_string(),
            attributes,
            message_attributes,
        })
    }

    fn to_failure(entry: &aws_sdk_sqs::types::BatchResultErrorEntry) -> BatchEntryFailure {
        BatchEntryFailure {
            id: entry.id().to_string(),
            code: entry.code().to_string(),
            message: entry.message().map(str::to_string),
            sender_fault: entry.sender_fault(),
        }
    }
}

fn transport_error(error: impl std::fmt::Display) -> QueueError {
    QueueError::Transport(error.to_string())
}

fn seconds(duration: std::time::Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive_messages(
        &self,
        queue: &QueueProperties,
        request: ReceiveRequest,
    ) -> Result<Vec<Message>> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue.queue_url())
            .max_number_of_messages(request.max_messages as i32)
            .wait_time_seconds(seconds(request.wait_time))
            .set_visibility_timeout(request.visibility_timeout.map(seconds))
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(transport_error)?;

        let messages: Vec<Message> = output
            .messages()
            .iter()
            .filter_map(Self::to_message)
            .collect();

        debug!(queue = %queue, count = messages.len(), "Received messages from SQS");
        Ok(messages)
    }

    async fn delete_messages(
        &self,
        queue: &QueueProperties,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchResult> {
        let entries = entries
            .into_iter()
            .map(|entry| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(entry.id)
                    .receipt_handle(entry.receipt_handle)
                    .build()
                    .map_err(|e| QueueError::InvalidRequest(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .delete_message_batch()
            .queue_url(queue.queue_url())
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(transport_error)?;

        Ok(BatchResult {
            successful: output.successful().iter().map(|entry| entry.id().to_string()).collect(),
            failed: output.failed().iter().map(Self::to_failure).collect(),
        })
    }

    async fn change_message_visibility(
        &self,
        queue: &QueueProperties,
        entries: Vec<VisibilityEntry>,
    ) -> Result<BatchResult> {
        let entries = entries
            .into_iter()
            .map(|entry| {
                ChangeMessageVisibilityBatchRequestEntry::builder()
                    .id(entry.id)
                    .receipt_handle(entry.receipt_handle)
                    .visibility_timeout(seconds(entry.visibility_timeout))
                    .build()
                    .map_err(|e| QueueError::InvalidRequest(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let output = self
            .client
            .change_message_visibility_batch()
            .queue_url(queue.queue_url())
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(transport_error)?;

        Ok(BatchResult {
            successful: output.successful().iter().map(|entry| entry.id().to_string()).collect(),
            failed: output.failed().iter().map(Self::to_failure).collect(),
        })
    }
}
