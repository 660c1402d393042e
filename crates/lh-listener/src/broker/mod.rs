//! Message brokers - decide when to request the next message and hand it to the
//! processing executor
//!
//! - ConcurrentMessageBroker: bounded parallelism through a resizable gate
//! - GroupingMessageBroker: adds per-group ordering on top of the concurrent broker

mod concurrent;
mod grouping;

pub use concurrent::{ConcurrentBrokerProperties, ConcurrentMessageBroker};
pub use grouping::{GroupKey, GroupingBrokerProperties, GroupingMessageBroker};

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lh_common::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ProcessingError, RetrievalError};
use crate::executor::ProcessingExecutor;
use crate::retriever::MessageRetrieval;

/// Checked before every cycle, a false result ends the broker run
pub type KeepProcessing = Arc<dyn Fn() -> bool + Send + Sync>;

/// Requests one message. `Err(RetrievalError::Stopped)` ends the broker run.
pub type MessageSupplier = Arc<dyn Fn() -> Result<MessageRetrieval, RetrievalError> + Send + Sync>;

/// Processes one message to its logical result
pub type MessageDispatcher = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), ProcessingError>> + Send + Sync>;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Request and dispatch messages until `shutdown` is cancelled, the
    /// supplier reports it stopped, or `keep_processing` returns false.
    ///
    /// Dispatches still running when this returns stay tracked by `executor`.
    async fn process_messages(
        &self,
        executor: &ProcessingExecutor,
        keep_processing: KeepProcessing,
        supplier: MessageSupplier,
        dispatcher: MessageDispatcher,
        shutdown: CancellationToken,
    );
}
