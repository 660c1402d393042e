//! ConcurrentMessageBroker - admits up to `concurrency` messages at a time
//!
//! Each cycle re-reads the desired concurrency, waits up to the polling rate for
//! a permit, then requests a message and dispatches it on a tracked task that
//! holds the permit until processing settles. Polling with a timeout lets a
//! raised concurrency take effect even when no traffic releases permits.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use lh_common::DynamicValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{KeepProcessing, MessageBroker, MessageDispatcher, MessageSupplier};
use crate::error::{panic_message, RetrievalError};
use crate::executor::ProcessingExecutor;
use crate::semaphore::ResizableSemaphore;

pub const DEFAULT_CONCURRENCY: u32 = 10;
pub const DEFAULT_CONCURRENCY_POLLING_RATE: Duration = Duration::from_secs(60);
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConcurrentBrokerProperties {
    pub concurrency: DynamicValue<u32>,
    pub concurrency_polling_rate: DynamicValue<Duration>,
    pub error_backoff: DynamicValue<Duration>,
}

impl Default for ConcurrentBrokerProperties {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY.into(),
            concurrency_polling_rate: DEFAULT_CONCURRENCY_POLLING_RATE.into(),
            error_backoff: DEFAULT_ERROR_BACKOFF.into(),
        }
    }
}

enum Cycle {
    Continue,
    Stop,
}

pub struct ConcurrentMessageBroker {
    properties: ConcurrentBrokerProperties,
    gate: Arc<ResizableSemaphore>,
}

impl ConcurrentMessageBroker {
    pub fn new(properties: ConcurrentBrokerProperties) -> Self {
        Self {
            properties,
            gate: Arc::new(ResizableSemaphore::new(0)),
        }
    }

    pub fn properties(&self) -> &ConcurrentBrokerProperties {
        &self.properties
    }

    /// Admission gate, exposed for inspection
    pub fn gate(&self) -> &Arc<ResizableSemaphore> {
        &self.gate
    }

    fn adjust_concurrency(&self) {
        let desired = self.properties.concurrency.get_or("concurrency", DEFAULT_CONCURRENCY);
        self.gate.set_capacity(desired);
        metrics::gauge!("leasehold_broker_concurrency").set(desired as f64);
    }

    async fn cycle(
        &self,
        executor: &ProcessingExecutor,
        keep_processing: &KeepProcessing,
        supplier: &MessageSupplier,
        dispatcher: &MessageDispatcher,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<Cycle> {
        self.adjust_concurrency();

        let polling_rate = self.properties.concurrency_polling_rate.get_where(
            "concurrency_polling_rate",
            DEFAULT_CONCURRENCY_POLLING_RATE,
            |rate| !rate.is_zero(),
        );
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(Cycle::Stop),
            permit = self.gate.try_acquire_owned(polling_rate) => permit,
        };
        let Some(permit) = permit else {
            trace!("No permit within polling rate, re-reading concurrency");
            return Ok(Cycle::Continue);
        };

        if shutdown.is_cancelled() || !keep_processing() {
            return Ok(Cycle::Stop);
        }

        let retrieval = match catch_unwind(AssertUnwindSafe(|| supplier())) {
            Ok(Ok(retrieval)) => retrieval,
            Ok(Err(RetrievalError::Stopped)) => {
                debug!("Message supplier stopped");
                return Ok(Cycle::Stop);
            }
            Ok(Err(error)) => return Err(anyhow!(error).context("failed to request message")),
            Err(payload) => {
                return Err(anyhow!("message supplier panicked: {}", panic_message(payload.as_ref())))
            }
        };

        let dispatcher = dispatcher.clone();
        executor.spawn(async move {
            let _permit = permit;
            match retrieval.await {
                Ok(Some(message)) => {
                    let message_id = message.id.clone();
                    if let Err(error) = dispatcher(message).await {
                        debug!(message_id = %message_id, error = %error, "Dispatch finished with error");
                    }
                }
                Ok(None) => trace!("No message received"),
                Err(RetrievalError::Stopped) => debug!("Retrieval abandoned, retriever stopped"),
                Err(error) => warn!(error = %error, "Message retrieval failed"),
            }
        });
        Ok(Cycle::Continue)
    }
}

impl Default for ConcurrentMessageBroker {
    fn default() -> Self {
        Self::new(ConcurrentBrokerProperties::default())
    }
}

#[async_trait]
impl MessageBroker for ConcurrentMessageBroker {
    async fn process_messages(
        &self,
        executor: &ProcessingExecutor,
        keep_processing: KeepProcessing,
        supplier: MessageSupplier,
        dispatcher: MessageDispatcher,
        shutdown: CancellationToken,
    ) {
        info!("Concurrent message broker started");

        while !shutdown.is_cancelled() && keep_processing() {
            match self
                .cycle(executor, &keep_processing, &supplier, &dispatcher, &shutdown)
                .await
            {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::Stop) => break,
                Err(error) => {
                    let backoff = self
                        .properties
                        .error_backoff
                        .get_or("error_backoff", DEFAULT_ERROR_BACKOFF);
                    warn!(error = %error, backoff_ms = backoff.as_millis() as u64, "Broker cycle failed, backing off");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        info!(in_flight = self.gate.issued(), "Concurrent message broker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use futures::future::FutureExt;
    use lh_common::Message;
    use parking_lot::Mutex;

    use super::*;
    use crate::broker::testing::{message, ScriptedSupplier};
    use crate::retriever::MessageRetrieval;

    struct Tracking {
        active: AtomicU32,
        max_active: AtomicU32,
        processed: Mutex<Vec<String>>,
    }

    fn tracking_dispatcher(work: Duration) -> (Arc<Tracking>, MessageDispatcher) {
        let tracking = Arc::new(Tracking {
            active: AtomicU32::new(0),
            max_active: AtomicU32::new(0),
            processed: Mutex::new(Vec::new()),
        });
        let state = tracking.clone();
        let dispatcher: MessageDispatcher = Arc::new(move |message: Message| {
            let state = state.clone();
            async move {
                let now = state.active.fetch_add(1, Ordering::SeqCst) + 1;
                state.max_active.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(work).await;
                state.active.fetch_sub(1, Ordering::SeqCst);
                state.processed.lock().push(message.id);
                Ok(())
            }
            .boxed()
        });
        (tracking, dispatcher)
    }

    fn properties(concurrency: DynamicValue<u32>) -> ConcurrentBrokerProperties {
        ConcurrentBrokerProperties {
            concurrency,
            concurrency_polling_rate: Duration::from_secs(1).into(),
            error_backoff: Duration::from_secs(1).into(),
        }
    }

    fn always() -> KeepProcessing {
        Arc::new(|| true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_concurrency() {
        let broker = ConcurrentMessageBroker::new(properties(3.into()));
        let executor = ProcessingExecutor::new();
        let scripted = ScriptedSupplier::new((0..20).map(|i| message(&i.to_string(), "g")).collect());
        let (tracking, dispatcher) = tracking_dispatcher(Duration::from_millis(100));
        let shutdown = CancellationToken::new();

        let stopper = {
            let shutdown = shutdown.clone();
            let tracking = tracking.clone();
            tokio::spawn(async move {
                while tracking.processed.lock().len() < 20 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                shutdown.cancel();
            })
        };

        broker
            .process_messages(&executor, always(), scripted.supplier(), dispatcher, shutdown)
            .await;
        stopper.await.unwrap();
        // Releases the requests parked after the script ran out
        drop(scripted);
        executor.close();
        assert!(executor.wait(Duration::from_secs(5)).await);

        assert_eq!(tracking.processed.lock().len(), 20);
        assert!(tracking.max_active.load(Ordering::SeqCst) <= 3);
        assert_eq!(tracking.max_active.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_increase_is_discovered_by_polling() {
        let desired = Arc::new(AtomicU32::new(0));
        let source = desired.clone();
        let broker = ConcurrentMessageBroker::new(properties(DynamicValue::supplier(move || {
            source.load(Ordering::SeqCst)
        })));
        let executor = ProcessingExecutor::new();
        let scripted = ScriptedSupplier::new(vec![message("1", "g"), message("2", "g")]);
        let (tracking, dispatcher) = tracking_dispatcher(Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        let run = {
            let executor = executor.clone();
            let shutdown = shutdown.clone();
            let supplier = scripted.supplier();
            tokio::spawn(async move {
                broker
                    .process_messages(&executor, Arc::new(|| true), supplier, dispatcher, shutdown)
                    .await;
                broker
            })
        };

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(tracking.processed.lock().is_empty());

        desired.store(2, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(tracking.processed.lock().len(), 2);

        shutdown.cancel();
        let broker = run.await.unwrap();
        assert_eq!(broker.gate().capacity(), 2);
        assert_eq!(broker.gate().resize_events(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_supplier_backs_off_and_recovers() {
        let broker = ConcurrentMessageBroker::new(properties(1.into()));
        let executor = ProcessingExecutor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let scripted = ScriptedSupplier::new(vec![message("1", "g")]);
        let inner = scripted.supplier();
        let supplier: MessageSupplier = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("supplier bug");
            }
            inner()
        });
        let (tracking, dispatcher) = tracking_dispatcher(Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let stopper = {
            let shutdown = shutdown.clone();
            let tracking = tracking.clone();
            tokio::spawn(async move {
                while tracking.processed.lock().is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                shutdown.cancel();
            })
        };

        broker
            .process_messages(&executor, always(), supplier, dispatcher, shutdown)
            .await;
        stopper.await.unwrap();

        assert_eq!(*tracking.processed.lock(), vec!["1"]);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_supplier_ends_run() {
        let broker = ConcurrentMessageBroker::new(properties(2.into()));
        let executor = ProcessingExecutor::new();
        let supplier: MessageSupplier = Arc::new(|| Err(RetrievalError::Stopped));
        let (_, dispatcher) = tracking_dispatcher(Duration::ZERO);

        broker
            .process_messages(&executor, always(), supplier, dispatcher, CancellationToken::new())
            .await;

        assert_eq!(broker.gate().issued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_released_when_no_message() {
        let broker = ConcurrentMessageBroker::new(properties(1.into()));
        let executor = ProcessingExecutor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let supplier: MessageSupplier = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) >= 3 {
                return Err(RetrievalError::Stopped);
            }
            Ok(MessageRetrieval::ready(Ok(None)))
        });
        let (_, dispatcher) = tracking_dispatcher(Duration::ZERO);

        broker
            .process_messages(&executor, always(), supplier, dispatcher, CancellationToken::new())
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
