//! BatchingMessageResolver - coalesces deletes into batched delete calls
//!
//! Resolutions are buffered until `buffering_size_limit` are waiting or
//! `buffering_time` has passed, then sent as one delete call with entries in
//! submission order. Each entry's outcome is reported individually; an id the
//! queue reports neither as deleted nor as failed is an error, never a success.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use lh_common::{DynamicValue, Message, QueueProperties};
use lh_queue::{DeleteEntry, QueueClient, MAX_ENTRIES_PER_BATCH};

use super::{MessageResolution, MessageResolver, ResolutionResult};
use crate::error::ResolutionError;

const DEFAULT_BUFFERING_TIME: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BatchingResolverProperties {
    /// Buffered resolutions that trigger a delete immediately. Clamped to 1..=10.
    pub buffering_size_limit: DynamicValue<usize>,
    /// Longest a resolution waits in the buffer
    pub buffering_time: DynamicValue<Duration>,
}

impl Default for BatchingResolverProperties {
    fn default() -> Self {
        Self {
            buffering_size_limit: DynamicValue::fixed(MAX_ENTRIES_PER_BATCH),
            buffering_time: DynamicValue::fixed(DEFAULT_BUFFERING_TIME),
        }
    }
}

struct PendingResolution {
    entry: DeleteEntry,
    completion: oneshot::Sender<ResolutionResult>,
}

pub struct BatchingMessageResolver {
    queue: QueueProperties,
    client: Arc<dyn QueueClient>,
    properties: BatchingResolverProperties,
    pending_tx: mpsc::UnboundedSender<PendingResolution>,
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingResolution>>>,
}

impl BatchingMessageResolver {
    pub fn new(
        queue: QueueProperties,
        client: Arc<dyn QueueClient>,
        properties: BatchingResolverProperties,
    ) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            queue,
            client,
            properties,
            pending_tx,
            pending_rx: Mutex::new(Some(pending_rx)),
        }
    }

    fn size_limit(&self) -> usize {
        self.properties
            .buffering_size_limit
            .get_where("buffering_size_limit", MAX_ENTRIES_PER_BATCH, |limit| *limit > 0)
            .min(MAX_ENTRIES_PER_BATCH)
    }

    fn submit(&self, batch: Vec<PendingResolution>, tracker: &TaskTracker) {
        if batch.is_empty() {
            return;
        }
        let client = self.client.clone();
        let queue = self.queue.clone();
        tracker.spawn(async move { delete_batch(client, queue, batch).await });
    }
}

/// Move up to `limit` resolutions with distinct ids out of `backlog`, keeping
/// the order of everything left behind
fn take_batch(backlog: &mut VecDeque<PendingResolution>, limit: usize) -> Vec<PendingResolution> {
    let mut batch = Vec::new();
    let mut ids = HashSet::new();
    let mut skipped = VecDeque::new();

    while batch.len() < limit {
        let Some(pending) = backlog.pop_front() else {
            break;
        };
        if ids.insert(pending.entry.id.clone()) {
            batch.push(pending);
        } else {
            skipped.push_back(pending);
        }
    }

    while let Some(pending) = skipped.pop_back() {
        backlog.push_front(pending);
    }
    batch
}

async fn delete_batch(client: Arc<dyn QueueClient>, queue: QueueProperties, batch: Vec<PendingResolution>) {
    let entries: Vec<DeleteEntry> = batch.iter().map(|pending| pending.entry.clone()).collect();
    let count = entries.len();

    match client.delete_messages(&queue, entries).await {
        Ok(result) => {
            debug!(
                queue = %queue,
                requested = count,
                deleted = result.successful.len(),
                failed = result.failed.len(),
                "Batch delete completed"
            );

            for pending in batch {
                let id = pending.entry.id;
                let outcome = if result.is_successful(&id) {
                    metrics::counter!("leasehold_messages_resolved_total", "queue" => queue.queue_url.clone())
                        .increment(1);
                    Ok(())
                } else if let Some(failure) = result.failure(&id) {
                    warn!(
                        queue = %queue,
                        message_id = %id,
                        code = %failure.code,
                        reason = ?failure.message,
                        "Queue rejected message delete"
                    );
                    Err(ResolutionError::Failed {
                        id,
                        code: failure.code.clone(),
                        reason: failure.message.clone(),
                    })
                } else {
                    error!(queue = %queue, message_id = %id, "Message missing from batch delete response");
                    Err(ResolutionError::NotHandled { id })
                };

                if outcome.is_err() {
                    metrics::counter!("leasehold_resolution_failures_total", "queue" => queue.queue_url.clone())
                        .increment(1);
                }
                let _ = pending.completion.send(outcome);
            }
        }
        Err(e) => {
            error!(queue = %queue, count, error = %e, "Batch delete failed");
            metrics::counter!("leasehold_resolution_failures_total", "queue" => queue.queue_url.clone())
                .increment(count as u64);
            for pending in batch {
                let _ = pending.completion.send(Err(ResolutionError::Transport(e.clone())));
            }
        }
    }
}

#[async_trait]
impl MessageResolver for BatchingMessageResolver {
    fn resolve_message(&self, message: &Message) -> MessageResolution {
        let (completion, resolution) = MessageResolution::pending();
        let pending = PendingResolution {
            entry: DeleteEntry::from(message),
            completion,
        };
        if let Err(mpsc::error::SendError(pending)) = self.pending_tx.send(pending) {
            let _ = pending.completion.send(Err(ResolutionError::Stopped));
        }
        resolution
    }

    async fn run(&self, shutdown: CancellationToken) {
        let Some(mut pending_rx) = self.pending_rx.lock().take() else {
            warn!(queue = %self.queue, "Batching resolver already ran, ignoring start");
            return;
        };

        info!(queue = %self.queue, "Batching message resolver started");
        let tracker = TaskTracker::new();
        let mut deferred: VecDeque<PendingResolution> = VecDeque::new();

        loop {
            let limit = self.size_limit();
            let mut batch = take_batch(&mut deferred, limit);

            if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    pending = pending_rx.recv() => match pending {
                        Some(pending) => batch.push(pending),
                        None => break,
                    },
                }
            }

            let mut ids: HashSet<String> = batch.iter().map(|pending| pending.entry.id.clone()).collect();
            let window = tokio::time::sleep(
                self.properties
                    .buffering_time
                    .get_or("buffering_time", DEFAULT_BUFFERING_TIME),
            );
            tokio::pin!(window);
            let mut interrupted = false;

            while batch.len() < limit {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        interrupted = true;
                        break;
                    }
                    _ = &mut window => break,
                    pending = pending_rx.recv() => match pending {
                        Some(pending) if ids.contains(&pending.entry.id) => deferred.push_back(pending),
                        Some(pending) => {
                            ids.insert(pending.entry.id.clone());
                            batch.push(pending);
                        }
                        None => {
                            interrupted = true;
                            break;
                        }
                    },
                }
            }

            self.submit(batch, &tracker);
            if interrupted {
                break;
            }
        }

        // Flush everything requested before shutdown
        pending_rx.close();
        while let Ok(pending) = pending_rx.try_recv() {
            deferred.push_back(pending);
        }
        let flushed = deferred.len();
        let limit = self.size_limit();
        while !deferred.is_empty() {
            let batch = take_batch(&mut deferred, limit);
            self.submit(batch, &tracker);
        }

        tracker.close();
        tracker.wait().await;
        info!(queue = %self.queue, flushed, "Batching message resolver stopped");
    }
}
