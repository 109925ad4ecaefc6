// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for the retrying executor using only the public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rebound::{
    AttemptOutcome, Backoff, BackoffSpec, Budget, Classifier, Context, ErrorKind, ExhaustionReason, HookContext, Hooks, Jitter,
    Recovery, RecoveryInfo, RecoveryKind, Retrier,
};
use tick::{Clock, ClockControl};

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU32,
    retries: AtomicU32,
    successes: AtomicU32,
    exhaustions: AtomicU32,
    delays: Mutex<Vec<Duration>>,
    last_reason: Mutex<Option<ExhaustionReason>>,
}

#[derive(Debug, Clone, Default)]
struct CountingHooks(Arc<Counters>);

impl<E> Hooks<E> for CountingHooks {
    fn on_attempt(&self, _context: &HookContext<'_>, _attempt: u32) {
        self.0.attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn on_retry_scheduled(&self, _context: &HookContext<'_>, _attempt: u32, delay: Duration, _error: &E) {
        self.0.retries.fetch_add(1, Ordering::Relaxed);
        self.0.delays.lock().unwrap().push(delay);
    }

    fn on_success(&self, _context: &HookContext<'_>, _attempt: u32, _elapsed: Duration) {
        self.0.successes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_exhausted(&self, _context: &HookContext<'_>, reason: ExhaustionReason, _error: Option<&E>) {
        self.0.exhaustions.fetch_add(1, Ordering::Relaxed);
        *self.0.last_reason.lock().unwrap() = Some(reason);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ServiceError {
    Unavailable,
    Throttled(Duration),
    Rejected,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable => f.write_str("service unavailable"),
            Self::Throttled(after) => write!(f, "throttled for {after:?}"),
            Self::Rejected => f.write_str("request rejected"),
        }
    }
}

impl Recovery for ServiceError {
    fn recovery(&self) -> RecoveryInfo {
        match self {
            Self::Unavailable => RecoveryInfo::retry(),
            Self::Throttled(after) => RecoveryInfo::retry().delay(*after),
            Self::Rejected => RecoveryInfo::never(),
        }
    }
}

fn millis(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_millis).collect()
}

#[tokio::test]
async fn exponential_schedule_until_attempts_run_out() {
    let clock = ClockControl::new().auto_advance_timers(true).to_clock();
    let hooks = CountingHooks::default();

    let retrier = Retrier::<u32, ServiceError>::builder("exponential", &Context::new(&clock))
        .max_attempts(6)
        .backoff(Backoff::Exponential)
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(200))
        .jitter(Jitter::None)
        .classifier(Classifier::recovery())
        .hooks(hooks.clone())
        .build();

    let execution = retrier.execute(|_| async { Err::<u32, _>(ServiceError::Unavailable) }).await;

    assert_eq!(execution.attempt_count(), 6);
    assert_eq!(*hooks.0.delays.lock().unwrap(), millis(&[10, 20, 40, 80, 160]));

    let recorded: Vec<_> = execution.attempts().iter().filter_map(|attempt| attempt.delay()).collect();
    assert_eq!(recorded, millis(&[10, 20, 40, 80, 160]));
    assert!(
        execution
            .attempts()
            .iter()
            .all(|attempt| matches!(attempt.outcome(), AttemptOutcome::Failed(recovery) if recovery.kind() == RecoveryKind::Retry))
    );

    let error = execution.into_result().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::BudgetExhausted);
    assert_eq!(error.attempts(), 6);
    assert_eq!(error.last_error(), Some(&ServiceError::Unavailable));
    assert_eq!(*hooks.0.last_reason.lock().unwrap(), Some(ExhaustionReason::BudgetExhausted));

    let schedule = BackoffSpec::new(Backoff::Exponential)
        .base_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(200))
        .jitter(Jitter::None);
    assert_eq!(schedule.delays().take(6).collect::<Vec<_>>(), millis(&[10, 20, 40, 80, 160, 200]));
}

#[tokio::test]
async fn permanent_error_aborts_immediately() {
    let clock = ClockControl::new().auto_advance_timers(true).to_clock();
    let hooks = CountingHooks::default();
    let budget = Budget::attempts(&clock, 5);

    let retrier = Retrier::<u32, ServiceError>::builder("permanent", &Context::new(&clock))
        .classifier(Classifier::recovery())
        .budget(budget.clone())
        .hooks(hooks.clone())
        .build();

    let execution = retrier.execute(|_| async { Err::<u32, _>(ServiceError::Rejected) }).await;

    assert_eq!(execution.attempt_count(), 1);
    assert_eq!(hooks.0.retries.load(Ordering::Relaxed), 0);
    assert_eq!(*hooks.0.last_reason.lock().unwrap(), Some(ExhaustionReason::NonRetryable));

    let error = execution.into_result().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Permanent);
    assert_eq!(error.last_error(), Some(&ServiceError::Rejected));

    // only the first attempt was charged
    assert_eq!(budget.remaining_attempts(), Some(4));
    assert!(!budget.is_exhausted());
}

#[tokio::test]
async fn unknown_errors_are_terminal_by_default() {
    let clock = Clock::new_frozen();
    let calls = AtomicU32::new(0);

    let retrier = Retrier::<u32, String>::builder("default_classifier", &Context::new(&clock)).build();

    let execution = retrier
        .execute(|_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err::<u32, _>("socket closed".to_string()) }
        })
        .await;

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(execution.into_result().unwrap_err().kind(), ErrorKind::Permanent);
}

#[tokio::test]
async fn success_on_third_attempt_fires_hooks_once_each() {
    let clock = ClockControl::new().auto_advance_timers(true).to_clock();
    let hooks = CountingHooks::default();

    let retrier = Retrier::<&'static str, ServiceError>::builder("third_time_lucky", &Context::new(&clock))
        .classifier(Classifier::recovery())
        .hooks(hooks.clone())
        .build();

    let execution = retrier
        .execute(|context| async move {
            if context.attempt() < 3 {
                Err(ServiceError::Unavailable)
            } else {
                Ok("done")
            }
        })
        .await;

    assert_eq!(execution.attempt_count(), 3);
    assert!(execution.attempts()[2].is_success());
    assert_eq!(execution.into_result().ok(), Some("done"));

    assert_eq!(hooks.0.attempts.load(Ordering::Relaxed), 3);
    assert_eq!(hooks.0.retries.load(Ordering::Relaxed), 2);
    assert_eq!(hooks.0.successes.load(Ordering::Relaxed), 1);
    assert_eq!(hooks.0.exhaustions.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn throttling_hint_overrides_backoff() {
    let clock = ClockControl::new().auto_advance_timers(true).to_clock();
    let hooks = CountingHooks::default();

    let retrier = Retrier::<u32, ServiceError>::builder("throttled", &Context::new(&clock))
        .backoff(Backoff::Constant)
        .base_delay(Duration::from_millis(10))
        .jitter(Jitter::None)
        .classifier(Classifier::recovery())
        .hooks(hooks.clone())
        .build();

    let execution = retrier
        .execute(|context| async move {
            if context.attempt() == 1 {
                Err(ServiceError::Throttled(Duration::from_millis(750)))
            } else {
                Ok(context.attempt())
            }
        })
        .await;

    assert_eq!(execution.into_result().ok(), Some(2));
    assert_eq!(*hooks.0.delays.lock().unwrap(), millis(&[750]));
}

#[tokio::test]
async fn elapsed_ceiling_stops_retrying() {
    let clock = ClockControl::new().auto_advance_timers(true).to_clock();

    let retrier = Retrier::<u32, ServiceError>::builder("time_boxed", &Context::new(&clock))
        .infinite_attempts()
        .max_elapsed(Duration::from_millis(100))
        .backoff(Backoff::Constant)
        .base_delay(Duration::from_millis(30))
        .jitter(Jitter::None)
        .classifier(Classifier::recovery())
        .build();

    let execution = retrier.execute(|_| async { Err::<u32, _>(ServiceError::Unavailable) }).await;

    // attempts start at 0, 30, 60, 90 and 100 ms; the last delay is clamped to the time left
    assert_eq!(execution.attempt_count(), 5);
    assert_eq!(execution.attempts()[3].delay(), Some(Duration::from_millis(10)));
    assert_eq!(execution.elapsed(), Duration::from_millis(100));
    assert_eq!(execution.into_result().unwrap_err().kind(), ErrorKind::BudgetExhausted);
}

#[tokio::test]
async fn shared_budget_spans_invocations() {
    let clock = ClockControl::new().auto_advance_timers(true).to_clock();
    let budget = Budget::attempts(&clock, 3);

    let retrier = Retrier::<u32, ServiceError>::builder("shared", &Context::new(&clock))
        .classifier(Classifier::recovery())
        .budget(budget.clone())
        .build();

    let first = retrier.execute(|_| async { Err::<u32, _>(ServiceError::Unavailable) }).await;
    assert_eq!(first.attempt_count(), 3);

    let second = retrier.execute(|_| async { Ok::<_, ServiceError>(1) }).await;
    assert_eq!(second.attempt_count(), 0);
    assert_eq!(second.into_result().unwrap_err().kind(), ErrorKind::BudgetExhausted);
    assert!(budget.is_exhausted());
}

#[cfg(feature = "serde")]
#[tokio::test]
async fn retrier_from_json_config() {
    use rebound::RetryConfig;

    let config: RetryConfig = serde_json::from_str(
        r#"{
            "max_attempts": 3,
            "backoff": "linear",
            "jitter": "none",
            "base_delay_ms": 5
        }"#,
    )
    .unwrap();
    config.validate().unwrap();

    let clock = ClockControl::new().auto_advance_timers(true).to_clock();
    let hooks = CountingHooks::default();
    let retrier = Retrier::<u32, ServiceError>::builder("configured", &Context::new(&clock))
        .config(&config)
        .classifier(Classifier::recovery())
        .hooks(hooks.clone())
        .build();

    let execution = retrier.execute(|_| async { Err::<u32, _>(ServiceError::Unavailable) }).await;

    assert_eq!(execution.attempt_count(), 3);
    assert_eq!(*hooks.0.delays.lock().unwrap(), millis(&[5, 10]));
}
