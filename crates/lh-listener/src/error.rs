use std::time::Duration;

use lh_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Config(#[from] lh_config::ConfigError),

    #[error("{component} did not stop within {timeout:?}")]
    ShutdownTimeout {
        component: &'static str,
        timeout: Duration,
    },

    #[error("Listener task failed: {0}")]
    TaskFailed(String),

    #[error("Listener containers must be started from within a Tokio runtime")]
    NoRuntime,
}

/// Why a request for a message produced no message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetrievalError {
    #[error("Failed to receive messages: {0}")]
    Transport(#[from] QueueError),

    #[error("Message retriever stopped")]
    Stopped,
}

/// Why a message could not be deleted from the queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Queue rejected delete of message {id}: {code} {}", .reason.as_deref().unwrap_or(""))]
    Failed {
        id: String,
        code: String,
        reason: Option<String>,
    },

    #[error("Message {id} not handled by batch delete")]
    NotHandled { id: String },

    #[error("Batch delete failed: {0}")]
    Transport(QueueError),

    #[error("Message resolver stopped")]
    Stopped,
}

/// Why processing of a message did not succeed
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Decorator '{decorator}' rejected the message: {source}")]
    PreSupply {
        decorator: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Message handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("Message handler panicked: {0}")]
    Panicked(String),

    #[error("Message processing task failed: {0}")]
    Task(String),
}

impl ProcessingError {
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        ProcessingError::Panicked(panic_message(payload.as_ref()))
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Why a manual visibility extension did not take effect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VisibilityError {
    #[error("Visibility change failed: {0}")]
    Transport(#[from] QueueError),

    #[error("Queue refused visibility change for message {id}: {code}")]
    Rejected { id: String, code: String },

    #[error("No Tokio runtime available to change visibility")]
    NoRuntime,
}
