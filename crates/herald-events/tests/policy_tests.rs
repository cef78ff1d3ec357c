//! Tests for dispatch policies and concurrent publishing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded, unbounded};
use herald_events::{
    CleanupPolicy, Consumer, ConsumerError, ConsumerFailure, DispatchPolicy, DispatchTask,
    EventError, EventService, EventServiceConfig, Executor, FailureAction, FailureStage,
    ThreadPoolConfig, WorkerBuilder, WorkerConfig,
};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(5);

fn service() -> EventService {
    let config = EventServiceConfig {
        cleanup: CleanupPolicy::Manual,
        pool: ThreadPoolConfig::with_threads(2).thread_name("test-pool"),
        worker: WorkerConfig::with_name("test-worker"),
    };
    EventService::builder().config(config).build().unwrap()
}

fn thread_name() -> String {
    thread::current().name().unwrap_or("<unnamed>").to_string()
}

fn recv_all<T>(rx: &Receiver<T>, n: usize) -> Vec<T> {
    (0..n).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect()
}

#[test]
fn test_immediate_runs_before_publish_returns() {
    let service = service();
    let channel = service.register_channel::<u8>(None);
    let caller = thread::current().id();
    let seen = Arc::new(Mutex::new(None));
    let seen_clone = seen.clone();

    let _s = channel
        .subscribe(Consumer::new(move |_: &u8| {
            *seen_clone.lock() = Some(thread::current().id());
        }))
        .unwrap();

    channel.publish(1).unwrap();
    assert_eq!(*seen.lock(), Some(caller));
}

#[test]
fn test_background_runs_on_pool() {
    let service = service();
    let channel = service.register_channel::<u8>(None);
    let (tx, rx) = unbounded();

    let _s = channel
        .subscribe(
            Consumer::new(move |v: &u8| tx.send((*v, thread_name())).unwrap())
                .policy(DispatchPolicy::Background),
        )
        .unwrap();

    channel.publish(1).unwrap();
    let (value, name) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(value, 1);
    assert!(name.starts_with("test-pool-"), "{name}");
}

#[test]
fn test_dedicated_preserves_publish_order() {
    let service = service();
    let channel = service.register_channel::<u32>(None);
    let (tx, rx) = unbounded();

    let _s = channel
        .subscribe(
            Consumer::new(move |v: &u32| tx.send((*v, thread_name())).unwrap())
                .policy(DispatchPolicy::Dedicated),
        )
        .unwrap();

    for i in 0..50 {
        channel.publish(i).unwrap();
    }
    let received = recv_all(&rx, 50);
    assert!(received.iter().all(|(_, name)| name == "test-worker"));
    assert_eq!(
        received.into_iter().map(|(v, _)| v).collect::<Vec<_>>(),
        (0..50).collect::<Vec<_>>()
    );
}

#[test]
fn test_deferred_runs_on_fresh_thread() {
    let service = service();
    let channel = service.register_channel::<u8>(None);
    let (tx, rx) = unbounded();

    let _s = channel
        .subscribe(
            Consumer::new(move |_: &u8| tx.send(thread_name()).unwrap())
                .policy(DispatchPolicy::Deferred),
        )
        .unwrap();

    channel.publish(1).unwrap();
    channel.publish(2).unwrap();
    let names = recv_all(&rx, 2);
    assert!(names.iter().all(|name| name.starts_with("herald-deferred-")));
    assert_ne!(names[0], names[1]);
}

#[test]
fn test_priority_order_holds_within_each_executor() {
    let service = service();
    let channel = service.register_channel::<u8>(None);
    let (tx, rx) = unbounded();

    let mut subscriptions = Vec::new();
    for (name, priority) in [("late", 10), ("early", -10), ("middle", 0)] {
        let tx = tx.clone();
        subscriptions.push(
            channel
                .subscribe(
                    Consumer::new(move |_: &u8| tx.send(name).unwrap())
                        .priority(priority)
                        .policy(DispatchPolicy::Dedicated),
                )
                .unwrap(),
        );
    }
    assert_eq!(channel.executor_count(), 1);

    channel.publish(0).unwrap();
    assert_eq!(recv_all(&rx, 3), vec!["early", "middle", "late"]);
}

#[test]
fn test_stalled_executor_does_not_block_others() {
    let service = service();
    let channel = service.register_channel::<u8>(None);
    let (release_tx, release_rx) = bounded::<()>(0);
    let immediate_calls = Arc::new(AtomicUsize::new(0));
    let calls = immediate_calls.clone();

    let _slow = channel
        .subscribe(
            Consumer::new(move |_: &u8| {
                let _ = release_rx.recv_timeout(TIMEOUT);
            })
            .policy(DispatchPolicy::Dedicated),
        )
        .unwrap();
    let _fast = channel
        .subscribe(Consumer::new(move |_: &u8| {
            calls.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    channel.publish(1).unwrap();
    channel.publish(2).unwrap();
    assert_eq!(immediate_calls.load(Ordering::SeqCst), 2);
    let _ = release_tx.send_timeout((), TIMEOUT);
    let _ = release_tx.send_timeout((), TIMEOUT);
}

#[test]
fn test_empty_batches_are_not_submitted() {
    struct Counting {
        submitted: Arc<AtomicUsize>,
    }

    impl Executor for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn execute(&self, task: DispatchTask) -> herald_events::Result<()> {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            task.run()
        }
    }

    let submitted = Arc::new(AtomicUsize::new(0));
    let service = EventService::builder()
        .cleanup_policy(CleanupPolicy::Manual)
        .bind_executor(
            "counting",
            Counting {
                submitted: submitted.clone(),
            },
        )
        .build()
        .unwrap();
    let channel = service.register_channel::<i32>(None);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    let _s = channel
        .subscribe(
            Consumer::new(move |_: &i32| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })
            .filter(|v| *v > 0)
            .policy(DispatchPolicy::named("counting")),
        )
        .unwrap();

    channel.publish(-1).unwrap();
    assert_eq!(submitted.load(Ordering::SeqCst), 0);
    channel.publish(1).unwrap();
    assert_eq!(submitted.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

type Failures = Arc<Mutex<Vec<(String, FailureStage, String)>>>;

fn recording_service(failures: &Failures, action: FailureAction) -> EventService {
    let failures = failures.clone();
    EventService::builder()
        .config(EventServiceConfig {
            cleanup: CleanupPolicy::Manual,
            ..Default::default()
        })
        .exception_handler(move |failure: &ConsumerFailure<'_>| {
            failures.lock().push((
                failure.consumer.to_string(),
                failure.stage,
                failure.error.to_string(),
            ));
            action
        })
        .bind_executor(
            "bounded",
            WorkerBuilder::new()
                .name("bounded-worker")
                .queue_capacity(1)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

struct Closed;

impl Executor for Closed {
    fn name(&self) -> &str {
        "closed"
    }

    fn execute(&self, _task: DispatchTask) -> herald_events::Result<()> {
        Err(EventError::rejected("closed", "shut down"))
    }
}

#[test]
fn test_executor_rejection_goes_to_exception_handler() {
    let failures = Failures::default();
    let service = recording_service(&failures, FailureAction::Continue);
    let channel = service.register_channel::<u8>(None);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    let _closed = channel
        .subscribe(
            Consumer::new(|_: &u8| {})
                .named("closed-consumer")
                .policy(DispatchPolicy::custom(Closed)),
        )
        .unwrap();
    let _open = channel
        .subscribe(Consumer::new(move |_: &u8| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    assert!(channel.publish(1).is_ok());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        *failures.lock(),
        vec![(
            "closed-consumer".to_string(),
            FailureStage::Submit,
            "rejected by executor 'closed': shut down".to_string(),
        )]
    );
}

#[test]
fn test_escalated_rejection_reaches_publisher_after_other_batches() {
    let failures = Failures::default();
    let service = recording_service(&failures, FailureAction::Escalate);
    let channel = service.register_channel::<u8>(None);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    let _closed = channel
        .subscribe(
            Consumer::new(|_: &u8| {})
                .named("closed-consumer")
                .priority(-1)
                .policy(DispatchPolicy::custom(Closed)),
        )
        .unwrap();
    let _open = channel
        .subscribe(Consumer::new(move |_: &u8| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    match channel.publish(1).unwrap_err() {
        EventError::Escalated { consumer, source } => {
            assert_eq!(consumer, "closed-consumer");
            assert!(matches!(source, ConsumerError::Rejected { .. }));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stalled_dedicated_consumer_loses_no_events() {
    let service = service();
    let channel = service.register_channel::<u32>(None);
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(0);
    let (tx, rx) = unbounded();

    let _s = channel
        .subscribe(
            Consumer::new(move |v: &u32| {
                if *v == 0 {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }
                tx.send(*v).unwrap();
            })
            .policy(DispatchPolicy::Dedicated),
        )
        .unwrap();

    channel.publish(0).unwrap();
    started_rx.recv_timeout(TIMEOUT).unwrap();
    for v in 1..2000 {
        assert!(channel.publish(v).is_ok(), "publish {v} failed");
    }

    release_tx.send(()).unwrap();
    assert_eq!(recv_all(&rx, 2000), (0..2000).collect::<Vec<_>>());
}

#[test]
fn test_saturated_bounded_worker_reports_to_exception_handler() {
    let failures = Failures::default();
    let service = recording_service(&failures, FailureAction::Continue);
    let channel = service.register_channel::<u32>(None);
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(0);
    let (tx, rx) = unbounded();

    let _s = channel
        .subscribe(
            Consumer::new(move |v: &u32| {
                if *v == 0 {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }
                tx.send(*v).unwrap();
            })
            .named("slow")
            .policy(DispatchPolicy::named("bounded")),
        )
        .unwrap();

    channel.publish(0).unwrap();
    started_rx.recv_timeout(TIMEOUT).unwrap();
    for v in 1..20 {
        assert!(channel.publish(v).is_ok(), "publish {v} failed");
    }

    release_tx.send(()).unwrap();
    assert_eq!(recv_all(&rx, 2), vec![0, 1]);

    let failures = failures.lock();
    assert_eq!(failures.len(), 18);
    for (consumer, stage, error) in failures.iter() {
        assert_eq!(consumer, "slow");
        assert_eq!(*stage, FailureStage::Submit);
        assert_eq!(error, "rejected by executor 'bounded-worker': queue full");
    }
}

#[test]
fn test_background_failure_reported_on_executor_thread() {
    let (tx, rx) = unbounded();
    let service = EventService::builder()
        .config(EventServiceConfig {
            cleanup: CleanupPolicy::Manual,
            pool: ThreadPoolConfig::with_threads(1).thread_name("failing-pool"),
            ..Default::default()
        })
        .exception_handler(move |failure: &ConsumerFailure<'_>| {
            tx.send((failure.consumer.to_string(), thread_name())).unwrap();
            FailureAction::Escalate
        })
        .build()
        .unwrap();
    let channel = service.register_channel::<u8>(None);

    let _s = channel
        .subscribe(
            Consumer::new(|_: &u8| panic!("background failure"))
                .named("bg")
                .policy(DispatchPolicy::Background),
        )
        .unwrap();

    // Escalation on another thread cannot reach the publisher.
    assert!(channel.publish(1).is_ok());
    let (consumer, thread) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(consumer, "bg");
    assert!(thread.starts_with("failing-pool-"), "{thread}");
}

#[test]
fn test_concurrent_publishers() {
    let service = Arc::new(service());
    let channel = service.register_channel::<usize>(None);
    let total = Arc::new(AtomicUsize::new(0));
    let total_clone = total.clone();
    let _s = channel
        .subscribe(Consumer::new(move |v: &usize| {
            total_clone.fetch_add(*v, Ordering::SeqCst);
        }))
        .unwrap();

    let publishers: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || {
                let channel = service.get_channel::<usize>(None).unwrap();
                for _ in 0..100 {
                    channel.publish(1).unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.join().unwrap();
    }

    assert_eq!(total.load(Ordering::SeqCst), 400);
}

#[test]
fn test_registration_during_publish() {
    let service = Arc::new(service());
    let channel = service.register_channel::<u32>(None);
    let seen = Arc::new(AtomicUsize::new(0));

    let registrar = {
        let channel = channel.clone();
        let seen = seen.clone();
        thread::spawn(move || {
            let mut ids = Vec::new();
            for _ in 0..50 {
                let seen = seen.clone();
                ids.push(
                    channel
                        .add_consumer(Consumer::new(move |_: &u32| {
                            seen.fetch_add(1, Ordering::SeqCst);
                        }))
                        .unwrap(),
                );
            }
            ids
        })
    };
    for i in 0..200 {
        channel.publish(i).unwrap();
    }
    let ids = registrar.join().unwrap();

    assert_eq!(channel.consumer_count(), 50);
    for id in ids {
        assert!(channel.remove_consumer(id));
    }
    assert_eq!(channel.consumer_count(), 0);
    assert!(seen.load(Ordering::SeqCst) <= 50 * 200);
}
