//! End-to-end listener scenarios against the in-memory queue

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lh_listener::{
    AutoVisibilityExtender, AutoVisibilityExtenderProperties, BatchingContainerProperties,
    BatchingMessageListenerContainer, BatchingRetrieverProperties, ConcurrentBrokerProperties, ContainerProperties,
    FifoContainerProperties, FifoMessageListenerContainer, ListenerDefinition, MessageHandler,
    MessageListenerContainer, PrefetchingContainerProperties, PrefetchingMessageListenerContainer,
};
use lh_queue::InMemoryQueue;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn fast_retriever() -> BatchingRetrieverProperties {
    BatchingRetrieverProperties {
        batching_period: Duration::from_millis(50).into(),
        wait_time: Duration::from_millis(500).into(),
        ..Default::default()
    }
}

fn broker(concurrency: u32) -> ConcurrentBrokerProperties {
    ConcurrentBrokerProperties {
        concurrency: concurrency.into(),
        ..Default::default()
    }
}

async fn with_timeout<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(30), future)
        .await
        .expect("scenario timed out")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_listener_processes_every_message() {
    init_tracing();
    let client = Arc::new(InMemoryQueue::new());
    let queue = client.create_queue("memory://orders");
    for i in 0..20 {
        client.send_message(&queue, format!("order-{}", i));
    }

    let processed = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicU32::new(0));
    let max_active = Arc::new(AtomicU32::new(0));
    let handler = {
        let processed = processed.clone();
        let active = active.clone();
        let max_active = max_active.clone();
        MessageHandler::blocking(move |message, _| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            active.fetch_sub(1, Ordering::SeqCst);
            processed.lock().push(message.body);
            Ok(())
        })
    };

    let container = BatchingMessageListenerContainer::new(
        ListenerDefinition::new("orders", queue.clone(), client.clone(), handler),
        BatchingContainerProperties {
            broker: broker(3),
            retriever: fast_retriever(),
            ..Default::default()
        },
    )
    .unwrap();
    container.start().unwrap();

    assert!(wait_until(Duration::from_secs(20), || processed.lock().len() >= 20).await);
    assert!(with_timeout(container.stop()).await);

    assert_eq!(processed.lock().len(), 20);
    assert!(max_active.load(Ordering::SeqCst) <= 3);
    assert_eq!(client.message_count(&queue), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_listener_keeps_group_order() {
    init_tracing();
    let client = Arc::new(InMemoryQueue::new());
    let queue = client.create_queue("memory://orders.fifo");
    for i in 0..20 {
        for group in 0..5 {
            client.send_message_with_group(&queue, i.to_string(), group.to_string());
        }
    }

    let seen: Arc<Mutex<HashMap<String, Vec<u32>>>> = Arc::new(Mutex::new(HashMap::new()));
    let handler = {
        let seen = seen.clone();
        MessageHandler::blocking(move |message, _| {
            let group = message.message_group_id().unwrap_or_default().to_string();
            let sequence: u32 = message.body.parse()?;
            std::thread::sleep(Duration::from_millis(10));
            seen.lock().entry(group).or_default().push(sequence);
            Ok(())
        })
    };

    let container = FifoMessageListenerContainer::new(
        ListenerDefinition::new("orders-fifo", queue.clone(), client.clone(), handler),
        FifoContainerProperties {
            broker: broker(5),
            retriever: fast_retriever(),
            ..Default::default()
        },
    )
    .unwrap();
    container.start().unwrap();

    let total = || seen.lock().values().map(Vec::len).sum::<usize>();
    assert!(wait_until(Duration::from_secs(20), || total() >= 100).await);
    assert!(with_timeout(container.stop()).await);

    let expected: Vec<u32> = (0..20).collect();
    let seen = seen.lock();
    assert_eq!(seen.len(), 5);
    for (group, sequence) in seen.iter() {
        assert_eq!(sequence, &expected, "group {} out of order", group);
    }
    assert_eq!(client.message_count(&queue), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fifo_listener_keeps_order_within_one_receive() {
    init_tracing();
    let client = Arc::new(InMemoryQueue::new());
    let queue = client.create_queue("memory://ledger.fifo");
    // Each group's messages are consecutive, so a receive returns a run of one group
    for group in ["a", "b", "c"] {
        for i in 0..16 {
            client.send_message_with_group(&queue, i.to_string(), group);
        }
    }

    let seen: Arc<Mutex<HashMap<String, Vec<u32>>>> = Arc::new(Mutex::new(HashMap::new()));
    let handler = {
        let seen = seen.clone();
        MessageHandler::blocking(move |message, _| {
            let group = message.message_group_id().unwrap_or_default().to_string();
            let sequence: u32 = message.body.parse()?;
            seen.lock().entry(group).or_default().push(sequence);
            std::thread::sleep(Duration::from_millis(2));
            Ok(())
        })
    };

    let container = FifoMessageListenerContainer::new(
        ListenerDefinition::new("ledger-fifo", queue.clone(), client.clone(), handler),
        FifoContainerProperties {
            broker: broker(8),
            retriever: BatchingRetrieverProperties {
                batch_size: 8.into(),
                ..fast_retriever()
            },
            ..Default::default()
        },
    )
    .unwrap();
    container.start().unwrap();

    let total = || seen.lock().values().map(Vec::len).sum::<usize>();
    assert!(wait_until(Duration::from_secs(20), || total() >= 48).await);
    assert!(with_timeout(container.stop()).await);

    let expected: Vec<u32> = (0..16).collect();
    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    for (group, sequence) in seen.iter() {
        assert_eq!(sequence, &expected, "group {} out of order", group);
    }
    assert_eq!(client.message_count(&queue), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_visibility_extended_once_for_slow_handler() {
    init_tracing();
    let client = Arc::new(InMemoryQueue::new());
    let queue = client.create_queue("memory://reports");
    client.send_message(&queue, "report");

    let extender = AutoVisibilityExtender::new(
        queue.clone(),
        client.clone(),
        AutoVisibilityExtenderProperties::new(Duration::from_secs(2), Duration::from_secs(1), Duration::from_secs(10)),
    )
    .unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let handler = {
        let done = done.clone();
        MessageHandler::blocking(move |_, _| {
            std::thread::sleep(Duration::from_millis(1200));
            done.store(true, Ordering::SeqCst);
            Ok(())
        })
    };

    let container = BatchingMessageListenerContainer::new(
        ListenerDefinition::new("reports", queue.clone(), client.clone(), handler).with_decorator(Arc::new(extender)),
        BatchingContainerProperties {
            broker: broker(1),
            retriever: fast_retriever(),
            ..Default::default()
        },
    )
    .unwrap();
    container.start().unwrap();

    assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst)).await);
    // Past the point where a second extension would have been due
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(with_timeout(container.stop()).await);

    let calls = client.calls().visibility_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0][0].visibility_timeout, Duration::from_secs(2));
    assert_eq!(client.message_count(&queue), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_cancelled_after_max_duration() {
    init_tracing();
    let client = Arc::new(InMemoryQueue::new());
    let queue = client.create_queue("memory://reports");
    client.send_message(&queue, "report");

    let extender = AutoVisibilityExtender::new(
        queue.clone(),
        client.clone(),
        AutoVisibilityExtenderProperties::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
            Duration::from_millis(1500),
        ),
    )
    .unwrap();
    let cancelled_after = Arc::new(Mutex::new(None));
    let handler = {
        let cancelled_after = cancelled_after.clone();
        MessageHandler::blocking(move |_, context| {
            let started = Instant::now();
            while started.elapsed() < Duration::from_secs(10) {
                if context.is_cancelled() {
                    *cancelled_after.lock() = Some(started.elapsed());
                    anyhow::bail!("cancelled");
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(())
        })
    };

    let container = BatchingMessageListenerContainer::new(
        ListenerDefinition::new("reports", queue.clone(), client.clone(), handler).with_decorator(Arc::new(extender)),
        BatchingContainerProperties {
            broker: broker(1),
            retriever: fast_retriever(),
            container: ContainerProperties {
                process_extra_messages_on_shutdown: false,
                ..Default::default()
            },
            ..Default::default()
        },
    )
    .unwrap();
    container.start().unwrap();

    assert!(wait_until(Duration::from_secs(10), || cancelled_after.lock().is_some()).await);
    let extensions_at_cancel = client.calls().visibility_calls.len();
    // Past the next extension slot, before the extended lease runs out
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(with_timeout(container.stop()).await);

    let elapsed = (*cancelled_after.lock()).unwrap_or_default();
    assert!(elapsed >= Duration::from_millis(1400) && elapsed < Duration::from_secs(3));
    assert_eq!(extensions_at_cancel, 1);
    assert_eq!(client.calls().visibility_calls.len(), 1);
    // Failed processing leaves the message for redelivery
    assert_eq!(client.message_count(&queue), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prefetching_listener_with_async_handler() {
    init_tracing();
    let client = Arc::new(InMemoryQueue::new());
    let queue = client.create_queue("memory://events");
    for i in 0..15 {
        client.send_message(&queue, format!("event-{}", i));
    }

    let processed = Arc::new(AtomicU32::new(0));
    let handler = {
        let processed = processed.clone();
        MessageHandler::from_async(move |_, _| {
            let processed = processed.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };

    let mut properties = PrefetchingContainerProperties {
        broker: broker(4),
        ..Default::default()
    };
    properties.retriever.wait_time = Duration::from_millis(500).into();

    let container = PrefetchingMessageListenerContainer::new(
        ListenerDefinition::new("events", queue.clone(), client.clone(), handler),
        properties,
    )
    .unwrap();
    container.start().unwrap();

    assert!(wait_until(Duration::from_secs(10), || processed.load(Ordering::SeqCst) >= 15).await);
    assert!(with_timeout(container.stop()).await);
    assert_eq!(client.message_count(&queue), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_acknowledgement_controls_deletion() {
    init_tracing();
    let client = Arc::new(InMemoryQueue::new());
    let queue = client.create_queue("memory://payments");
    client.send_message(&queue, "keep");
    client.send_message(&queue, "delete");

    let handled = Arc::new(AtomicU32::new(0));
    let handler = {
        let handled = handled.clone();
        MessageHandler::blocking_with_ack(move |message, _, acknowledge| {
            if message.body == "delete" {
                drop(acknowledge.acknowledge());
            }
            handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };

    let container = BatchingMessageListenerContainer::new(
        ListenerDefinition::new("payments", queue.clone(), client.clone(), handler),
        BatchingContainerProperties {
            broker: broker(2),
            retriever: fast_retriever(),
            ..Default::default()
        },
    )
    .unwrap();
    container.start().unwrap();

    assert!(wait_until(Duration::from_secs(10), || handled.load(Ordering::SeqCst) >= 2).await);
    assert!(with_timeout(container.stop()).await);
    assert_eq!(client.message_count(&queue), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_container_restarts_after_stop() {
    init_tracing();
    let client = Arc::new(InMemoryQueue::new());
    let queue = client.create_queue("memory://restart");
    let processed = Arc::new(AtomicU32::new(0));
    let handler = {
        let processed = processed.clone();
        MessageHandler::blocking(move |_, _| {
            processed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };
    let container = BatchingMessageListenerContainer::new(
        ListenerDefinition::new("restart", queue.clone(), client.clone(), handler),
        BatchingContainerProperties {
            retriever: fast_retriever(),
            ..Default::default()
        },
    )
    .unwrap();

    container.start().unwrap();
    container.start().unwrap();
    assert!(container.core().is_running());
    client.send_message(&queue, "first");
    assert!(wait_until(Duration::from_secs(10), || processed.load(Ordering::SeqCst) == 1).await);
    assert!(with_timeout(container.stop()).await);
    assert!(!container.core().is_running());

    container.start().unwrap();
    client.send_message(&queue, "second");
    assert!(wait_until(Duration::from_secs(10), || processed.load(Ordering::SeqCst) == 2).await);
    assert!(with_timeout(container.stop()).await);
    assert_eq!(client.message_count(&queue), 0);
}
