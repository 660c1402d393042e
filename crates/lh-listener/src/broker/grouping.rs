//! GroupingMessageBroker - per-group ordering on top of the concurrent broker
//!
//! At most one message per group is in flight. Messages of busy groups are
//! cached in arrival order and dispatched as their group frees up, first-cached
//! group first. Retrieval continues while messages are cached, bounded by the
//! maximum number of cached groups.
//!
//! Upstream retrievals are applied in the order they were requested, so
//! messages of one group enter the cache in the order the queue returned them
//! even when their retrievals complete on different worker threads.
//!
//! On a handler failure the group's cached messages can be purged, along with
//! messages of that group received shortly afterwards, so the queue redelivers
//! the whole group in order once the leases expire.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::FutureExt;
use indexmap::IndexMap;
use lh_common::{DynamicValue, Message};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::concurrent::DEFAULT_CONCURRENCY;
use super::{ConcurrentMessageBroker, KeepProcessing, MessageBroker, MessageDispatcher, MessageSupplier};
use crate::error::{panic_message, RetrievalError};
use crate::executor::ProcessingExecutor;
use crate::retriever::{MessageRetrieval, RetrievalResult, RetrievalSlot};

/// Messages of a group retrieved within this window after a failure are dropped
const FAILED_GROUP_WINDOW: Duration = Duration::from_secs(1);

/// Used when a max-cached-groups supplier fails
const FALLBACK_MAX_CACHED_MESSAGE_GROUPS: usize = 10;

/// Extracts the ordering key of a message
pub type GroupKey = Arc<dyn Fn(&Message) -> String + Send + Sync>;

#[derive(Debug, Clone)]
pub struct GroupingBrokerProperties {
    /// `None` follows the inner broker's concurrency
    pub max_cached_message_groups: Option<DynamicValue<usize>>,
    pub purge_extra_messages_in_group_on_error: bool,
    pub process_cached_messages_on_shutdown: bool,
}

impl Default for GroupingBrokerProperties {
    fn default() -> Self {
        Self {
            max_cached_message_groups: None,
            purge_extra_messages_in_group_on_error: true,
            process_cached_messages_on_shutdown: false,
        }
    }
}

pub struct GroupingMessageBroker {
    inner: ConcurrentMessageBroker,
    group_key: GroupKey,
    properties: GroupingBrokerProperties,
}

impl GroupingMessageBroker {
    pub fn new(inner: ConcurrentMessageBroker, group_key: GroupKey, properties: GroupingBrokerProperties) -> Self {
        Self {
            inner,
            group_key,
            properties,
        }
    }

    /// Groups by `MessageGroupId`, falling back to the message id so ungrouped
    /// messages are independent
    pub fn by_message_group_id(inner: ConcurrentMessageBroker, properties: GroupingBrokerProperties) -> Self {
        let group_key: GroupKey = Arc::new(|message: &Message| {
            message
                .message_group_id()
                .map(str::to_string)
                .unwrap_or_else(|| message.id.clone())
        });
        Self::new(inner, group_key, properties)
    }

    fn max_cached_message_groups(&self) -> DynamicValue<usize> {
        if let Some(max) = &self.properties.max_cached_message_groups {
            return max.clone();
        }
        let concurrency = self.inner.properties().concurrency.clone();
        DynamicValue::supplier(move || concurrency.get_or("concurrency", DEFAULT_CONCURRENCY) as usize)
    }
}

#[async_trait]
impl MessageBroker for GroupingMessageBroker {
    async fn process_messages(
        &self,
        executor: &ProcessingExecutor,
        keep_processing: KeepProcessing,
        supplier: MessageSupplier,
        dispatcher: MessageDispatcher,
        shutdown: CancellationToken,
    ) {
        let run = Arc::new(GroupingRun::new(
            supplier,
            self.group_key.clone(),
            self.max_cached_message_groups(),
            self.properties.purge_extra_messages_in_group_on_error,
        ));
        let grouped_supplier = run.supplier();
        let grouped_dispatcher = run.dispatcher(dispatcher);

        self.inner
            .process_messages(
                executor,
                keep_processing,
                grouped_supplier.clone(),
                grouped_dispatcher.clone(),
                shutdown,
            )
            .await;

        let drain_cached = self.properties.process_cached_messages_on_shutdown;
        run.disable_retrieval();
        if !drain_cached {
            run.discard_cached();
            run.release_waiters();
        }
        run.wait_for_retrievals().await;

        if drain_cached && run.cached_count() > 0 {
            info!(cached = run.cached_count(), "Processing cached messages before shutdown");
            run.pump();
            let drain = run.clone();
            self.inner
                .process_messages(
                    executor,
                    Arc::new(move || drain.cached_count() > 0),
                    grouped_supplier,
                    grouped_dispatcher,
                    CancellationToken::new(),
                )
                .await;
        }

        run.discard_cached();
        run.release_waiters();
    }
}

#[derive(Default)]
struct GroupState {
    cached: IndexMap<String, VecDeque<Message>>,
    in_flight: HashSet<String>,
    waiting: VecDeque<RetrievalSlot>,
    outstanding: usize,
    failed: HashMap<String, Instant>,
    retrieval_disabled: bool,
    /// Sequence number of the next retrieval to apply
    next_to_apply: u64,
    /// Retrievals that settled before an earlier one; `None` when cancelled
    settled: BTreeMap<u64, Option<RetrievalResult>>,
}

impl GroupState {
    fn cached_messages(&self) -> usize {
        self.cached.values().map(VecDeque::len).sum()
    }

    fn recently_failed(&mut self, group: &str) -> bool {
        self.failed.retain(|_, failed_at| failed_at.elapsed() < FAILED_GROUP_WINDOW);
        self.failed.contains_key(group)
    }

    /// Take the first cached message whose group is idle and mark the group busy
    fn take_dispatchable(&mut self) -> Option<(usize, String, Message)> {
        let index = self
            .cached
            .keys()
            .position(|group| !self.in_flight.contains(group))?;
        let (group, messages) = self.cached.get_index_mut(index)?;
        let group = group.clone();
        let message = messages.pop_front()?;
        if messages.is_empty() {
            self.cached.shift_remove_index(index);
        }
        self.in_flight.insert(group.clone());
        Some((index, group, message))
    }

    /// Undo `take_dispatchable` for a message nobody received
    fn restore(&mut self, index: usize, group: String, message: Message) {
        self.in_flight.remove(&group);
        match self.cached.get_mut(&group) {
            Some(messages) => messages.push_front(message),
            None => {
                let index = index.min(self.cached.len());
                self.cached.shift_insert(index, group, VecDeque::from([message]));
            }
        }
    }
}

/// Grouping state for one broker run
struct GroupingRun {
    upstream: MessageSupplier,
    group_key: GroupKey,
    max_cached_groups: DynamicValue<usize>,
    purge_on_error: bool,
    state: Mutex<GroupState>,
    /// Next retrieval sequence number, held while calling upstream
    next_sequence: Mutex<u64>,
    retrieval_cancel: CancellationToken,
    retrievals: TaskTracker,
}

impl GroupingRun {
    fn new(
        upstream: MessageSupplier,
        group_key: GroupKey,
        max_cached_groups: DynamicValue<usize>,
        purge_on_error: bool,
    ) -> Self {
        Self {
            upstream,
            group_key,
            max_cached_groups,
            purge_on_error,
            state: Mutex::new(GroupState::default()),
            next_sequence: Mutex::new(0),
            retrieval_cancel: CancellationToken::new(),
            retrievals: TaskTracker::new(),
        }
    }

    fn supplier(self: &Arc<Self>) -> MessageSupplier {
        let run = self.clone();
        Arc::new(move || run.request())
    }

    fn dispatcher(self: &Arc<Self>, inner: MessageDispatcher) -> MessageDispatcher {
        let run = self.clone();
        Arc::new(move |message: Message| {
            let guard = GroupGuard {
                run: run.clone(),
                group: (run.group_key)(&message),
                succeeded: false,
            };
            let dispatch = inner(message);
            async move {
                let mut guard = guard;
                let result = dispatch.await;
                guard.succeeded = result.is_ok();
                result
            }
            .boxed()
        })
    }

    fn request(self: &Arc<Self>) -> Result<MessageRetrieval, RetrievalError> {
        let retrieval = {
            let mut state = self.state.lock();
            if state.retrieval_disabled && state.cached.is_empty() && state.outstanding == 0 {
                return Err(RetrievalError::Stopped);
            }
            let (slot, retrieval) = MessageRetrieval::pending();
            state.waiting.push_back(slot);
            retrieval
        };
        self.pump();
        Ok(retrieval)
    }

    /// Hand cached messages to waiting requests, then start as many upstream
    /// retrievals as the remaining requests and the cache limit allow
    fn pump(self: &Arc<Self>) {
        let to_start = {
            let mut state = self.state.lock();

            loop {
                while state.waiting.front().is_some_and(|slot| slot.is_closed()) {
                    state.waiting.pop_front();
                }
                if state.waiting.is_empty() {
                    break;
                }
                let Some((index, group, message)) = state.take_dispatchable() else {
                    break;
                };
                let Some(slot) = state.waiting.pop_front() else {
                    state.restore(index, group, message);
                    break;
                };
                if let Err(Ok(Some(message))) = slot.send(Ok(Some(message))) {
                    state.restore(index, group, message);
                }
            }

            if state.retrieval_disabled {
                if state.cached.is_empty() && state.outstanding == 0 {
                    for slot in state.waiting.drain(..) {
                        let _ = slot.send(Ok(None));
                    }
                }
                0
            } else {
                let max_groups = self.max_cached_groups.get_where(
                    "max_cached_message_groups",
                    FALLBACK_MAX_CACHED_MESSAGE_GROUPS,
                    |max| *max > 0,
                );
                let mut to_start = 0;
                while state.waiting.len() > state.outstanding && state.cached.len() + state.outstanding < max_groups {
                    state.outstanding += 1;
                    to_start += 1;
                }
                to_start
            }
        };

        for _ in 0..to_start {
            self.start_retrieval();
        }
    }

    fn start_retrieval(self: &Arc<Self>) {
        let (sequence, retrieval) = {
            let mut next_sequence = self.next_sequence.lock();
            let retrieval = match catch_unwind(AssertUnwindSafe(|| (self.upstream)())) {
                Ok(Ok(retrieval)) => retrieval,
                Ok(Err(error)) => {
                    drop(next_sequence);
                    self.settle_failed_request(error);
                    return;
                }
                Err(payload) => {
                    drop(next_sequence);
                    warn!(panic = %panic_message(payload.as_ref()), "Upstream message supplier panicked");
                    self.settle_failed_request(RetrievalError::Stopped);
                    return;
                }
            };
            let sequence = *next_sequence;
            *next_sequence += 1;
            (sequence, retrieval)
        };

        let run = self.clone();
        let cancel = self.retrieval_cancel.clone();
        self.retrievals.spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = retrieval => Some(result),
            };
            run.on_settled(sequence, result);
        });
    }

    fn settle_failed_request(&self, error: RetrievalError) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if error == RetrievalError::Stopped {
            state.retrieval_disabled = true;
        }
        if let Some(slot) = state.waiting.pop_front() {
            let _ = slot.send(Err(error));
        }
    }

    /// Record a settled retrieval and apply every retrieval that is now next in
    /// request order
    fn on_settled(self: &Arc<Self>, sequence: u64, result: Option<RetrievalResult>) {
        {
            let mut state = self.state.lock();
            state.settled.insert(sequence, result);

            loop {
                let next = state.next_to_apply;
                let Some(result) = state.settled.remove(&next) else {
                    break;
                };
                state.next_to_apply += 1;
                state.outstanding = state.outstanding.saturating_sub(1);
                if let Some(result) = result {
                    self.apply_retrieved(&mut state, result);
                }
            }
        }
        self.pump();
    }

    fn apply_retrieved(&self, state: &mut GroupState, result: RetrievalResult) {
        match result {
            Ok(Some(message)) => {
                let group = (self.group_key)(&message);
                if state.recently_failed(&group) {
                    debug!(
                        message_id = %message.id,
                        group = %group,
                        "Dropping message of recently failed group, it will be redelivered"
                    );
                } else {
                    state.cached.entry(group).or_default().push_back(message);
                }
            }
            Ok(None) => {
                if let Some(slot) = state.waiting.pop_front() {
                    let _ = slot.send(Ok(None));
                }
            }
            Err(error) => {
                if error == RetrievalError::Stopped {
                    state.retrieval_disabled = true;
                }
                if let Some(slot) = state.waiting.pop_front() {
                    let _ = slot.send(Err(error));
                }
            }
        }
    }

    fn complete(self: &Arc<Self>, group: &str, succeeded: bool) {
        {
            let mut state = self.state.lock();
            state.in_flight.remove(group);

            if !succeeded && self.purge_on_error {
                if let Some(purged) = state.cached.shift_remove(group) {
                    info!(
                        group = %group,
                        purged = purged.len(),
                        "Purged cached messages of failed group, they will be redelivered"
                    );
                }
                state.failed.insert(group.to_string(), Instant::now());
            }
        }
        self.pump();
    }

    /// Cancel outstanding retrievals and start no new ones
    fn disable_retrieval(&self) {
        self.state.lock().retrieval_disabled = true;
        self.retrieval_cancel.cancel();
        self.retrievals.close();
    }

    async fn wait_for_retrievals(&self) {
        self.retrievals.wait().await;
    }

    fn cached_count(&self) -> usize {
        self.state.lock().cached_messages()
    }

    fn discard_cached(&self) {
        let discarded = {
            let mut state = self.state.lock();
            let count = state.cached_messages();
            state.cached.clear();
            count
        };
        if discarded > 0 {
            info!(discarded, "Cached messages left unprocessed, they will be redelivered");
        }
    }

    fn release_waiters(&self) {
        let waiting: Vec<RetrievalSlot> = self.state.lock().waiting.drain(..).collect();
        for slot in waiting {
            let _ = slot.send(Ok(None));
        }
    }
}

/// Frees the message's group when its dispatch settles or is dropped
struct GroupGuard {
    run: Arc<GroupingRun>,
    group: String,
    succeeded: bool,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.run.complete(&self.group, self.succeeded);
    }
}
