// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(
    not(all(feature = "logs", feature = "metrics")),
    expect(
        rustdoc::broken_intra_doc_links,
        reason = "the telemetry switches on Context only exist with their features"
    )
)]

//! Retries fallible async operations with backoff, shared budgets, and idempotent execution.
//!
//! A [`Retrier`] wraps an operation that may fail transiently, such as a remote call,
//! and runs it again until it succeeds, a [`Classifier`] declares the error terminal,
//! a [`Budget`] refuses another attempt, or the caller cancels.
//!
//! # Core Types
//!
//! - [`BackoffSpec`]: Computes the delay before each retry from a [`Backoff`] shape and a [`Jitter`] mode.
//! - [`Classifier`]: Maps an error to [`RecoveryInfo`]. Errors it does not recognize are terminal.
//! - [`Budget`]: An attempt and elapsed-time allowance. Per invocation, or shared by many.
//! - [`IdempotencyStore`]: Records results by [`IdempotencyKey`] so a keyed operation runs at most
//!   once at a time and its result is replayed to later callers. [`InMemoryStore`] is bundled.
//! - [`Hooks`]: Synchronous callbacks for attempts, retries, successes, and exhaustion.
//! - [`Batch`]: Runs many inputs with bounded parallelism against one shared budget.
//! - [`Stopper`]: Ends retrying early, for example when a shared [`TokenBucket`] runs dry.
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//!
//! use rebound::{Backoff, Classifier, Context, Jitter, Retrier};
//! use tick::Clock;
//!
//! # async fn example(clock: Clock) {
//! let context = Context::new(&clock);
//!
//! let retrier = Retrier::builder("charge_card", &context)
//!     .max_attempts(4)
//!     .backoff(Backoff::Exponential)
//!     .base_delay(Duration::from_millis(50))
//!     .max_delay(Duration::from_secs(2))
//!     .jitter(Jitter::Equal)
//!     .classifier(Classifier::predicate(|error: &std::io::Error| {
//!         error.kind() == std::io::ErrorKind::ConnectionReset
//!     }))
//!     .build();
//!
//! let execution = retrier
//!     .invoke()
//!     .key("payment-42")
//!     .execute(|_context| async { Ok::<_, std::io::Error>(42_u64) })
//!     .await;
//!
//! assert_eq!(execution.into_result().ok(), Some(42));
//! # }
//! ```
//!
//! > **Note**: Every timing decision goes through the [`Clock`][tick::Clock] passed in via
//! > [`Context`], so tests can drive delays deterministically.
//!
//! # Recovery Metadata
//!
//! Error types that implement [`Recovery`] can be classified with [`Classifier::recovery`].
//! A [`RecoveryInfo`] may carry a delay; the retrier waits at least that long before the
//! next attempt, but never past the remaining time of any budget.
//! HTTP clients can take that delay from a `Retry-After` header with
//! [`Classifier::with_retry_after`].
//!
//! # Features
//!
//! - `serde`: Implements `Serialize` and `Deserialize` for [`RetryConfig`], [`Backoff`], and [`Jitter`].
//! - `logs`: Emits structured `tracing` events for retries, exhaustion, replays, and store failures.
//!   Enable per retrier with [`Context::enable_logs`].
//! - `metrics`: Reports the `resilience.event` OpenTelemetry counter. Enable per retrier with
//!   [`Context::enable_metrics`].

#[doc(inline)]
pub use recoverable::{Recovery, RecoveryInfo, RecoveryKind};

mod attempt;
mod backoff;
mod batch;
mod budget;
mod classifier;
mod config;
mod constants;
mod context;
mod error;
mod hooks;
pub mod idempotency;
pub mod retry;
mod retry_after;
mod rnd;
mod stopper;
mod telemetry;

pub(crate) mod define_fn_wrapper;

pub use attempt::{Attempt, AttemptOutcome};
pub(crate) use attempt::MaxAttempts;
pub use backoff::{Backoff, BackoffSpec, Jitter};
pub use batch::{Batch, BatchReport, ItemOutcome, ItemStatus};
pub use budget::Budget;
pub use classifier::{Classifier, ClassifyArgs};
pub use config::{ConfigError, RetryConfig};
pub use context::Context;
pub use error::{ErrorKind, RetryError};
pub use hooks::{ExhaustionReason, HookContext, Hooks};
#[doc(inline)]
pub use idempotency::{
    Claim, Completion, Failure, IdempotencyKey, IdempotencyRecord, IdempotencyStore, InMemoryStore, Lease, RecordState, RecordStatus,
    StoreError,
};
#[doc(inline)]
pub use retry::{Execution, InFlight, Invocation, OperationContext, Retrier, RetryBuilder, TimeoutArgs};
pub use retry_after::parse_retry_after;
pub use stopper::{StopArgs, Stopper, TokenBucket};
#[doc(no_inline)]
pub use tokio_util::sync::CancellationToken;

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
pub(crate) mod testing;
