// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for keyed, at-most-once execution using only the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use rebound::{
    CancellationToken, Classifier, Context, ErrorKind, IdempotencyKey, IdempotencyStore, InFlight, InMemoryStore, OperationContext,
    RecordState, RecordStatus, Retrier,
};
use tick::{Clock, ClockControl};
use tokio::sync::Notify;

async fn yield_times(count: u32) {
    for _ in 0..count {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn concurrent_callers_share_one_execution() {
    let clock = Clock::new_frozen();
    let runs = AtomicU32::new(0);
    let retrier = Retrier::<u64, String>::builder("reserve_seat", &Context::new(&clock)).build();

    let runs = &runs;
    let callers = (0..5).map(|_| {
        retrier.invoke().key("seat-12A").execute(move |_| {
            runs.fetch_add(1, Ordering::Relaxed);
            async {
                yield_times(3).await;
                Ok::<_, String>(4_200)
            }
        })
    });

    let executions = join_all(callers).await;

    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert!(executions.iter().all(|execution| execution.outcome().as_ref().ok() == Some(&4_200)));
    assert_eq!(executions.iter().filter(|execution| execution.is_replayed()).count(), 4);
    assert_eq!(executions.iter().filter(|execution| execution.attempt_count() == 1).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_increment_once() {
    let clock = Clock::new_frozen();
    let counter = Arc::new(AtomicU32::new(0));
    let retrier = Retrier::<u32, String>::builder("increment", &Context::new(&clock)).build();

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let retrier = retrier.clone();
            let counter = Arc::clone(&counter);

            tokio::spawn(async move {
                retrier
                    .invoke()
                    .key("increment-once")
                    .execute(|_| {
                        let counter = Arc::clone(&counter);
                        async move {
                            yield_times(2).await;
                            Ok::<_, String>(counter.fetch_add(1, Ordering::SeqCst) + 1)
                        }
                    })
                    .await
                    .into_result()
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fail_fast_reports_conflict() {
    let clock = Clock::new_frozen();
    let release = Notify::new();
    let retrier = Retrier::<u32, String>::builder("fail_fast", &Context::new(&clock))
        .in_flight(InFlight::FailFast)
        .build();

    let holder = retrier.invoke().key("report-7").execute(|_| async {
        release.notified().await;
        Ok::<_, String>(7)
    });

    let contender = async {
        let execution = retrier.invoke().key("report-7").execute(|_| async { Ok::<_, String>(8) }).await;
        release.notify_one();
        execution
    };

    let (holder, contender) = tokio::join!(holder, contender);

    assert_eq!(holder.into_result().ok(), Some(7));
    assert_eq!(contender.attempt_count(), 0);
    assert_eq!(contender.into_result().unwrap_err().kind(), ErrorKind::IdempotencyConflict);
}

#[tokio::test]
async fn terminal_failure_is_replayed() {
    let clock = Clock::new_frozen();
    let runs = AtomicU32::new(0);
    let retrier = Retrier::<u32, String>::builder("charge", &Context::new(&clock)).build();

    let operation = |_: OperationContext| {
        runs.fetch_add(1, Ordering::Relaxed);
        async { Err::<u32, _>("card declined".to_string()) }
    };

    let first = retrier.invoke().key("charge-9").execute(operation).await;
    let second = retrier.invoke().key("charge-9").execute(operation).await;

    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert!(!first.is_replayed());
    assert!(second.is_replayed());

    let error = second.into_result().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Permanent);
    assert!(error.is_replayed());
    assert_eq!(error.replayed_failure().map(|failure| failure.message()), Some("card declined"));
    assert!(error.last_error().is_none());

    let record = retrier.store().get(&IdempotencyKey::from("charge-9")).await.unwrap().unwrap();
    assert_eq!(record.status(), RecordStatus::Failed);
}

#[tokio::test]
async fn expired_record_runs_again() {
    let control = ClockControl::new();
    let clock = control.to_clock();
    let runs = AtomicU32::new(0);
    let retrier = Retrier::<u32, String>::builder("ttl", &Context::new(&clock))
        .idempotency_ttl(Duration::from_secs(60))
        .build();

    let operation = |_: OperationContext| {
        let run = runs.fetch_add(1, Ordering::Relaxed) + 1;
        async move { Ok::<_, String>(run) }
    };

    assert_eq!(retrier.invoke().key("k").execute(operation).await.into_result().ok(), Some(1));

    control.advance(Duration::from_secs(30));
    assert_eq!(retrier.invoke().key("k").execute(operation).await.into_result().ok(), Some(1));

    control.advance(Duration::from_secs(31));
    assert_eq!(retrier.invoke().key("k").execute(operation).await.into_result().ok(), Some(2));
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn abandoned_lease_is_reclaimed() {
    let control = ClockControl::new();
    let clock = control.to_clock();
    let retrier = Retrier::<&'static str, String>::builder("lease", &Context::new(&clock))
        .idempotency_lease(Duration::from_secs(5))
        .build();

    // the holder starts, then its future is dropped mid-flight
    let abandoned = retrier
        .invoke()
        .key("job-1")
        .execute(|_| std::future::pending::<Result<&'static str, String>>())
        .now_or_never();
    assert!(abandoned.is_none());

    let key = IdempotencyKey::from("job-1");
    let record = retrier.store().get(&key).await.unwrap().unwrap();
    assert_eq!(record.status(), RecordStatus::InProgress);

    control.advance(Duration::from_secs(6));

    let execution = retrier
        .invoke()
        .key("job-1")
        .execute(|_| async { Ok::<_, String>("recovered") })
        .await;

    assert!(!execution.is_replayed());
    assert_eq!(execution.into_result().ok(), Some("recovered"));

    let record = retrier.store().get(&key).await.unwrap().unwrap();
    assert_eq!(record.state(), &RecordState::Succeeded("recovered"));
}

#[tokio::test]
async fn live_holder_keeps_its_claim_past_the_lease() {
    let control = ClockControl::new();
    let clock = control.to_clock();
    let runs = AtomicU32::new(0);
    let retrier = Retrier::<u32, String>::builder("slow_job", &Context::new(&clock))
        .idempotency_lease(Duration::from_secs(60))
        .build();

    let (runs_ref, clock_ref) = (&runs, &clock);
    let operation = move |_: OperationContext| {
        let run = runs_ref.fetch_add(1, Ordering::Relaxed) + 1;
        let clock = clock_ref.clone();
        async move {
            clock.delay(Duration::from_secs(90)).await;
            Ok::<_, String>(run)
        }
    };

    let first = retrier.invoke().key("job-2").execute(operation);
    let second = async {
        tokio::task::yield_now().await;
        retrier.invoke().key("job-2").execute(operation).await
    };
    let driver = async {
        for _ in 0..12 {
            yield_times(5).await;
            control.advance(Duration::from_secs(10));
        }
    };

    let (first, second, ()) = tokio::join!(first, second, driver);

    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert!(second.is_replayed());
    assert_eq!(first.into_result().ok(), Some(1));
    assert_eq!(second.into_result().ok(), Some(1));
}

#[tokio::test]
async fn cancelled_waiter_leaves_the_holder_alone() {
    let clock = Clock::new_frozen();
    let release = Notify::new();
    let token = CancellationToken::new();
    let retrier = Retrier::<u32, String>::builder("export", &Context::new(&clock)).build();
    let key = IdempotencyKey::from("export-3");

    let holder = retrier.invoke().key("export-3").execute(|_| async {
        release.notified().await;
        Ok::<_, String>(3)
    });

    let waiter = async {
        let execution = retrier
            .invoke()
            .key("export-3")
            .cancellation(token.clone())
            .execute(|_| async { Ok::<_, String>(4) })
            .await;
        let record = retrier.store().get(&key).await.unwrap().unwrap();
        release.notify_one();
        (execution, record.status())
    };

    let cancel = async {
        yield_times(3).await;
        token.cancel();
    };

    let (holder, (waiter, status_while_held), ()) = tokio::join!(holder, waiter, cancel);

    assert_eq!(waiter.attempt_count(), 0);
    assert_eq!(waiter.into_result().unwrap_err().kind(), ErrorKind::Cancelled);
    assert_eq!(status_while_held, RecordStatus::InProgress);
    assert_eq!(holder.into_result().ok(), Some(3));

    let record = retrier.store().get(&key).await.unwrap().unwrap();
    assert_eq!(record.status(), RecordStatus::Succeeded);
}

#[tokio::test]
async fn shared_store_spans_retriers() {
    let clock = Clock::new_frozen();
    let store = Arc::new(InMemoryStore::<u32>::new(&clock));
    let context = Context::new(&clock);

    let first = Retrier::<u32, String>::builder("writer", &context)
        .idempotency_store(Arc::clone(&store))
        .build();
    let second = Retrier::<u32, String>::builder("reader", &context)
        .idempotency_store(Arc::clone(&store))
        .classifier(Classifier::always())
        .build();

    _ = first.invoke().key("shared").execute(|_| async { Ok::<_, String>(11) }).await;
    let replay = second.invoke().key("shared").execute(|_| async { Ok::<_, String>(22) }).await;

    assert!(replay.is_replayed());
    assert_eq!(replay.into_result().ok(), Some(11));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn sweep_drops_expired_records() {
    let control = ClockControl::new();
    let clock = control.to_clock();
    let retrier = Retrier::<u32, String>::builder("sweep", &Context::new(&clock))
        .idempotency_ttl(Duration::from_secs(10))
        .build();

    for key in ["a", "b", "c"] {
        _ = retrier.invoke().key(key).execute(|_| async { Ok::<_, String>(1) }).await;
    }
    assert_eq!(retrier.store().len(), 3);

    control.advance(Duration::from_secs(11));

    assert_eq!(retrier.store().sweep(), 3);
    assert!(retrier.store().is_empty());
}
