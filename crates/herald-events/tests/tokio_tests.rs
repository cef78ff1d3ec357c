//! Tests for dispatching onto a Tokio runtime.

#![cfg(feature = "tokio")]

use std::time::Duration;

use herald_events::{CleanupPolicy, Consumer, DispatchPolicy, EventService, TokioExecutor};
use tokio::sync::mpsc;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_named_tokio_executor() {
    let service = EventService::builder()
        .cleanup_policy(CleanupPolicy::Manual)
        .bind_executor("tokio", TokioExecutor::current().unwrap())
        .build()
        .unwrap();
    let channel = service.register_channel::<String>(Some("jobs"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _s = channel
        .subscribe(
            Consumer::new(move |job: &String| {
                // Blocking pool threads still see the runtime.
                let in_runtime = tokio::runtime::Handle::try_current().is_ok();
                tx.send((job.clone(), in_runtime)).unwrap();
            })
            .policy(DispatchPolicy::named("tokio")),
        )
        .unwrap();

    channel.publish("build".to_string()).unwrap();
    channel.publish("deploy".to_string()).unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(item);
    }
    received.sort();
    assert_eq!(
        received,
        vec![("build".to_string(), true), ("deploy".to_string(), true)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_custom_tokio_executor_failure_does_not_reach_publisher() {
    let service = EventService::builder()
        .cleanup_policy(CleanupPolicy::Manual)
        .exception_handler(herald_events::EscalatingExceptionHandler)
        .build()
        .unwrap();
    let channel = service.register_channel::<u8>(None);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _failing = channel
        .subscribe(
            Consumer::new(|_: &u8| panic!("job failed"))
                .priority(0)
                .policy(DispatchPolicy::custom(TokioExecutor::current().unwrap())),
        )
        .unwrap();
    let _after = channel
        .subscribe(Consumer::new(move |v: &u8| tx.send(*v).unwrap()).priority(1))
        .unwrap();

    assert!(channel.publish(7).is_ok());
    let value = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(value, Some(7));
}
