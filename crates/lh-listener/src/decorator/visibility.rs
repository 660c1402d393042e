//! AutoVisibilityExtender - keeps leases alive while handlers run
//!
//! Per message:
//! - Idle: registered at pre-supply
//! - Scheduled: waiting for `visibility_timeout - buffer` to elapse
//! - Extending: change-visibility call in flight
//! - Extended: lease renewed, about to be scheduled again
//! - Stopped: supply finished, acknowledged, or the maximum duration was reached
//!
//! Reaching `max_duration` cancels the handler's cancellation token instead of
//! extending again. Handlers must check the token to actually stop.
//!
//! Supply-finished ends extension, so for async handlers it stops as soon as the
//! handler has returned its future. Use the handler's `VisibilityExtender` for
//! manual extension in that case.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lh_common::{DynamicValue, Message, QueueProperties};
use lh_queue::{QueueClient, VisibilityEntry};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MessageProcessingDecorator, ProcessingContext};
use crate::error::ListenerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    Idle,
    Scheduled,
    Extending,
    Extended,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct AutoVisibilityExtenderProperties {
    /// Lease requested on every extension
    pub visibility_timeout: DynamicValue<Duration>,
    /// How long before the lease expires the extension is made
    pub buffer: DynamicValue<Duration>,
    /// Total processing time after which the handler is cancelled
    pub max_duration: DynamicValue<Duration>,
}

impl AutoVisibilityExtenderProperties {
    pub fn new(visibility_timeout: Duration, buffer: Duration, max_duration: Duration) -> Self {
        Self {
            visibility_timeout: visibility_timeout.into(),
            buffer: buffer.into(),
            max_duration: max_duration.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Schedule {
    visibility_timeout: Duration,
    interval: Duration,
    max_duration: Duration,
}

struct TrackedMessage {
    stop: CancellationToken,
    state: Arc<Mutex<ExtensionState>>,
}

pub struct AutoVisibilityExtender {
    queue: QueueProperties,
    client: Arc<dyn QueueClient>,
    properties: AutoVisibilityExtenderProperties,
    initial: Schedule,
    tracked: DashMap<Uuid, TrackedMessage>,
}

impl AutoVisibilityExtender {
    pub fn new(
        queue: QueueProperties,
        client: Arc<dyn QueueClient>,
        properties: AutoVisibilityExtenderProperties,
    ) -> Result<Self, ListenerError> {
        let visibility_timeout = properties.visibility_timeout.get();
        let buffer = properties.buffer.get();
        let max_duration = properties.max_duration.get();

        if visibility_timeout.is_zero() {
            return Err(ListenerError::InvalidConfiguration(
                "visibility extender timeout must be positive".to_string(),
            ));
        }
        if buffer >= visibility_timeout {
            return Err(ListenerError::InvalidConfiguration(format!(
                "visibility extender buffer ({:?}) must be less than the visibility timeout ({:?})",
                buffer, visibility_timeout
            )));
        }
        if max_duration.is_zero() {
            return Err(ListenerError::InvalidConfiguration(
                "visibility extender max duration must be positive".to_string(),
            ));
        }

        Ok(Self {
            queue,
            client,
            properties,
            initial: Schedule {
                visibility_timeout,
                interval: visibility_timeout - buffer,
                max_duration,
            },
            tracked: DashMap::new(),
        })
    }

    /// Current values, falling back to the values seen at construction when a
    /// supplier fails or produces an invalid combination
    fn schedule(&self) -> Schedule {
        let visibility_timeout = self
            .properties
            .visibility_timeout
            .get_where("visibility_timeout", self.initial.visibility_timeout, |t| !t.is_zero());
        let buffer = self.properties.buffer.get_or("buffer", Duration::ZERO);
        let max_duration = self
            .properties
            .max_duration
            .get_where("max_duration", self.initial.max_duration, |d| !d.is_zero());

        if buffer >= visibility_timeout {
            warn!(?buffer, ?visibility_timeout, "Visibility buffer not below timeout, using initial schedule");
            return self.initial;
        }
        Schedule {
            visibility_timeout,
            interval: visibility_timeout - buffer,
            max_duration,
        }
    }

    /// Extension state for a dispatch still being tracked
    pub fn state(&self, processing_id: Uuid) -> Option<ExtensionState> {
        self.tracked.get(&processing_id).map(|tracked| *tracked.state.lock())
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    fn stop_tracking(&self, context: &ProcessingContext) {
        if let Some((_, tracked)) = self.tracked.remove(&context.processing_id()) {
            tracked.stop.cancel();
            *tracked.state.lock() = ExtensionState::Stopped;
        }
    }
}

impl MessageProcessingDecorator for AutoVisibilityExtender {
    fn name(&self) -> &str {
        "auto-visibility-extender"
    }

    fn on_pre_supply(&self, context: &ProcessingContext, message: &Message) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("visibility extension needs a Tokio runtime: {}", e))?;

        let stop = CancellationToken::new();
        let state = Arc::new(Mutex::new(ExtensionState::Idle));
        self.tracked.insert(
            context.processing_id(),
            TrackedMessage {
                stop: stop.clone(),
                state: state.clone(),
            },
        );

        runtime.spawn(extend_until_stopped(ExtensionTask {
            queue: self.queue.clone(),
            client: self.client.clone(),
            message: message.clone(),
            schedule: self.schedule(),
            handler_cancellation: context.cancellation().clone(),
            stop,
            state,
        }));
        Ok(())
    }

    fn on_supply_finished(&self, context: &ProcessingContext, _message: &Message) {
        self.stop_tracking(context);
    }

    fn on_resolve(&self, context: &ProcessingContext, _message: &Message) {
        self.stop_tracking(context);
    }
}

struct ExtensionTask {
    queue: QueueProperties,
    client: Arc<dyn QueueClient>,
    message: Message,
    schedule: Schedule,
    handler_cancellation: CancellationToken,
    stop: CancellationToken,
    state: Arc<Mutex<ExtensionState>>,
}

impl ExtensionTask {
    fn set_state(&self, state: ExtensionState) {
        *self.state.lock() = state;
    }
}

async fn extend_until_stopped(task: ExtensionTask) {
    let deadline = Instant::now() + task.schedule.max_duration;
    let mut next_extension = Instant::now() + task.schedule.interval;

    loop {
        task.set_state(ExtensionState::Scheduled);
        let wake_at = next_extension.min(deadline);

        tokio::select! {
            biased;
            _ = task.stop.cancelled() => return,
            _ = tokio::time::sleep_until(wake_at) => {}
        }

        if Instant::now() >= deadline {
            warn!(
                queue = %task.queue,
                message_id = %task.message.id,
                max_duration = ?task.schedule.max_duration,
                "Message exceeded its maximum processing time, cancelling handler"
            );
            metrics::counter!("leasehold_processing_timeouts_total", "queue" => task.queue.queue_url.clone())
                .increment(1);
            task.set_state(ExtensionState::Stopped);
            task.handler_cancellation.cancel();
            return;
        }

        task.set_state(ExtensionState::Extending);
        let entry = VisibilityEntry::for_message(&task.message, task.schedule.visibility_timeout);
        let result = tokio::select! {
            biased;
            _ = task.stop.cancelled() => return,
            result = task.client.change_message_visibility(&task.queue, vec![entry]) => result,
        };

        match result {
            Ok(result) if result.is_successful(&task.message.id) => {
                debug!(
                    queue = %task.queue,
                    message_id = %task.message.id,
                    visibility_timeout = ?task.schedule.visibility_timeout,
                    "Extended message visibility"
                );
                metrics::counter!("leasehold_visibility_extensions_total", "queue" => task.queue.queue_url.clone())
                    .increment(1);
            }
            Ok(result) => {
                let failure = result.failure(&task.message.id);
                warn!(
                    queue = %task.queue,
                    message_id = %task.message.id,
                    code = failure.map(|f| f.code.as_str()).unwrap_or("missing"),
                    "Queue refused visibility extension, will retry on next schedule"
                );
            }
            Err(e) => warn!(
                queue = %task.queue,
                message_id = %task.message.id,
                error = %e,
                "Visibility extension failed, will retry on next schedule"
            ),
        }

        task.set_state(ExtensionState::Extended);
        next_extension = Instant::now() + task.schedule.interval;
    }
}
