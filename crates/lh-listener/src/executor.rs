//! ProcessingExecutor - owns every in-flight processing task of a container
//!
//! Handlers are invoked on Tokio's blocking pool so synchronous handlers cannot
//! stall the runtime. The logical result of async handlers is then awaited on
//! the runtime proper.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lh_common::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{panic_message, ProcessingError};
use crate::processor::MessageProcessor;

#[derive(Clone, Default)]
pub struct ProcessingExecutor {
    tracker: TaskTracker,
    interrupt: CancellationToken,
}

impl ProcessingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Process one message to its logical result.
    ///
    /// The handler's cancellation token is a child of the executor's interrupt
    /// token.
    pub async fn process(
        &self,
        processor: Arc<dyn MessageProcessor>,
        message: Message,
    ) -> Result<(), ProcessingError> {
        let cancellation = self.interrupt.child_token();
        let supplied = tokio::task::spawn_blocking(move || processor.process_message(message, cancellation)).await;

        match supplied {
            Ok(pending) => pending.await,
            Err(error) if error.is_panic() => Err(ProcessingError::Panicked(panic_message(error.into_panic().as_ref()))),
            Err(error) => Err(ProcessingError::Task(error.to_string())),
        }
    }

    /// Cancel the token of every current and future handler
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Mark the task set complete so `wait` can return once it drains
    pub fn close(&self) {
        self.tracker.close();
    }

    /// Wait for every tracked task. Returns false if `timeout` elapsed first.
    /// Only completes once the executor has been closed.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }
}
