//! Message processing decorators - observers of the processing lifecycle
//!
//! Every hook has a no-op default, so a decorator implements only what it needs.
//! Hooks fire in registration order:
//!
//! | Hook                       | Fires when                                         | Handler's thread |
//! |----------------------------|----------------------------------------------------|------------------|
//! | `on_pre_supply`            | before the handler runs; an error skips the message | yes              |
//! | `on_supply_failure`        | the handler failed synchronously                   | yes              |
//! | `on_supply_success`        | the handler returned, or returned its future       | yes              |
//! | `on_supply_finished`       | the invocation attempt is over                     | yes              |
//! | `on_processing_failure`    | the logical result is an error                     | not guaranteed   |
//! | `on_processing_success`    | the logical result is a success                    | not guaranteed   |
//! | `on_processing_finished`   | the logical result settled                         | not guaranteed   |
//! | `on_resolve`               | acknowledgement was requested                      | not guaranteed   |
//! | `on_resolve_success/failure` | the delete succeeded or failed                   | not guaranteed   |
//!
//! A panic in any hook other than `on_pre_supply` is caught and logged; the
//! remaining decorators still run.

mod visibility;

pub use visibility::{AutoVisibilityExtender, AutoVisibilityExtenderProperties, ExtensionState};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use lh_common::{Message, QueueProperties};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;
use uuid::Uuid;

use crate::error::{panic_message, ProcessingError, ResolutionError};

/// Per-dispatch state shared by every hook for one message
#[derive(Debug)]
pub struct ProcessingContext {
    listener_identifier: String,
    queue: QueueProperties,
    processing_id: Uuid,
    cancellation: CancellationToken,
    attributes: Mutex<HashMap<String, serde_json::Value>>,
}

impl ProcessingContext {
    pub fn new(
        listener_identifier: impl Into<String>,
        queue: QueueProperties,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            listener_identifier: listener_identifier.into(),
            queue,
            processing_id: Uuid::new_v4(),
            cancellation,
            attributes: Mutex::new(HashMap::new()),
        }
    }

    pub fn listener_identifier(&self) -> &str {
        &self.listener_identifier
    }

    pub fn queue(&self) -> &QueueProperties {
        &self.queue
    }

    /// Unique for each dispatch, including redeliveries of the same message
    pub fn processing_id(&self) -> Uuid {
        self.processing_id
    }

    /// Cancelled when the handler should stop, e.g. on shutdown with interruption
    /// or when it has exceeded its maximum processing time
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.attributes.lock().insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<serde_json::Value> {
        self.attributes.lock().get(key).cloned()
    }

    pub fn remove_attribute(&self, key: &str) -> Option<serde_json::Value> {
        self.attributes.lock().remove(key)
    }
}

pub trait MessageProcessingDecorator: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_pre_supply(&self, _context: &ProcessingContext, _message: &Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_supply_success(&self, _context: &ProcessingContext, _message: &Message) {}

    fn on_supply_failure(&self, _context: &ProcessingContext, _message: &Message, _error: &ProcessingError) {}

    fn on_supply_finished(&self, _context: &ProcessingContext, _message: &Message) {}

    fn on_processing_success(&self, _context: &ProcessingContext, _message: &Message) {}

    fn on_processing_failure(&self, _context: &ProcessingContext, _message: &Message, _error: &ProcessingError) {}

    fn on_processing_finished(&self, _context: &ProcessingContext, _message: &Message) {}

    fn on_resolve(&self, _context: &ProcessingContext, _message: &Message) {}

    fn on_resolve_success(&self, _context: &ProcessingContext, _message: &Message) {}

    fn on_resolve_failure(&self, _context: &ProcessingContext, _message: &Message, _error: &ResolutionError) {}
}

/// Ordered decorator list with per-decorator failure isolation
#[derive(Clone, Default)]
pub(crate) struct DecoratorChain {
    decorators: Arc<Vec<Arc<dyn MessageProcessingDecorator>>>,
}

impl DecoratorChain {
    pub(crate) fn new(decorators: Vec<Arc<dyn MessageProcessingDecorator>>) -> Self {
        Self {
            decorators: Arc::new(decorators),
        }
    }

    /// Run every pre-supply hook. On the first failure, supply-finished fires for
    /// the decorators that had already accepted the message.
    pub(crate) fn pre_supply(&self, context: &ProcessingContext, message: &Message) -> Result<(), ProcessingError> {
        for (index, decorator) in self.decorators.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| decorator.on_pre_supply(context, message)))
                .unwrap_or_else(|payload| Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()))));

            if let Err(source) = outcome {
                error!(
                    listener = %context.listener_identifier(),
                    message_id = %message.id,
                    decorator = decorator.name(),
                    error = %source,
                    "Pre-supply hook failed, message will not be processed"
                );
                for accepted in &self.decorators[..index] {
                    Self::isolate(accepted.as_ref(), "supply_finished", context, |d| {
                        d.on_supply_finished(context, message)
                    });
                }
                return Err(ProcessingError::PreSupply {
                    decorator: decorator.name().to_string(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Run `hook` on every decorator, logging rather than propagating panics
    pub(crate) fn fire<F>(&self, hook: &'static str, context: &ProcessingContext, f: F)
    where
        F: Fn(&dyn MessageProcessingDecorator),
    {
        for decorator in self.decorators.iter() {
            Self::isolate(decorator.as_ref(), hook, context, &f);
        }
    }

    fn isolate<F>(decorator: &dyn MessageProcessingDecorator, hook: &'static str, context: &ProcessingContext, f: F)
    where
        F: Fn(&dyn MessageProcessingDecorator),
    {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(decorator))) {
            error!(
                listener = %context.listener_identifier(),
                decorator = decorator.name(),
                hook,
                panic = %panic_message(payload.as_ref()),
                "Decorator hook panicked"
            );
        }
    }
}
