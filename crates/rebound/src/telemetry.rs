// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(not(any(feature = "logs", test)), expect(unused_variables, reason = "only logs read every argument"))]
#![cfg_attr(
    not(any(feature = "logs", feature = "metrics", test)),
    expect(clippy::unused_self, reason = "telemetry compiles away without logs or metrics")
)]

use std::time::Duration;

use crate::{ErrorKind, IdempotencyKey, StoreError};

/// Attribute key for the name of the retrier.
#[cfg(any(feature = "metrics", test))]
pub(crate) const OPERATION_NAME: &str = "resilience.operation.name";

/// Attribute key for the resilience event being reported.
#[cfg(any(feature = "metrics", test))]
pub(crate) const EVENT_NAME: &str = "resilience.event.name";

/// Attribute key for the 1-based attempt index.
#[cfg(any(feature = "metrics", test))]
pub(crate) const ATTEMPT_INDEX: &str = "resilience.attempt.index";

/// Attribute key for the terminal error kind.
#[cfg(any(feature = "metrics", test))]
pub(crate) const ERROR_KIND: &str = "resilience.error.kind";

#[cfg(any(feature = "metrics", test))]
pub(crate) const RETRY_EVENT: &str = "retry";
#[cfg(any(feature = "metrics", test))]
pub(crate) const SUCCESS_EVENT: &str = "success";
#[cfg(any(feature = "metrics", test))]
pub(crate) const FAILURE_EVENT: &str = "failure";
#[cfg(any(feature = "metrics", test))]
pub(crate) const REPLAY_EVENT: &str = "replay";
#[cfg(any(feature = "metrics", test))]
pub(crate) const STORE_EVENT: &str = "store_error";

#[cfg(any(feature = "metrics", test))]
const METER_NAME: &str = "rebound";
#[cfg(any(feature = "metrics", test))]
const VERSION: &str = "v0.1.0";
#[cfg(any(feature = "metrics", test))]
const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.47.0";

#[cfg(any(feature = "metrics", test))]
pub(crate) fn create_meter(meter_provider: &dyn opentelemetry::metrics::MeterProvider) -> opentelemetry::metrics::Meter {
    meter_provider.meter_with_scope(
        opentelemetry::InstrumentationScope::builder(METER_NAME)
            .with_version(VERSION)
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
}

#[cfg(any(feature = "metrics", test))]
pub(crate) fn create_resilience_event_counter(meter: &opentelemetry::metrics::Meter) -> opentelemetry::metrics::Counter<u64> {
    meter
        .u64_counter("resilience.event")
        .with_description("Emitted upon the occurrence of a resilience event.")
        .with_unit("u64")
        .build()
}

/// Emits logs and metrics for one retrier.
#[derive(Debug, Clone, Default)]
pub(crate) struct TelemetryHelper {
    #[cfg(any(feature = "metrics", feature = "logs", test))]
    pub(crate) operation_name: std::borrow::Cow<'static, str>,
    #[cfg(any(feature = "metrics", test))]
    pub(crate) event_reporter: Option<opentelemetry::metrics::Counter<u64>>,
    #[cfg(any(feature = "logs", test))]
    pub(crate) logs_enabled: bool,
}

impl TelemetryHelper {
    pub(crate) fn retry_scheduled(&self, attempt: u32, delay: Duration) {
        #[cfg(any(feature = "logs", test))]
        if self.logs_enabled {
            tracing::event!(
                name: "rebound.retry",
                tracing::Level::WARN,
                resilience.operation.name = %self.operation_name,
                resilience.attempt.index = attempt,
                resilience.retry.delay = delay.as_secs_f32(),
            );
        }

        #[cfg(any(feature = "metrics", test))]
        self.report(RETRY_EVENT, attempt, None);
    }

    pub(crate) fn succeeded(&self, attempt: u32) {
        #[cfg(any(feature = "logs", test))]
        if self.logs_enabled && attempt > 1 {
            tracing::event!(
                name: "rebound.success",
                tracing::Level::INFO,
                resilience.operation.name = %self.operation_name,
                resilience.attempt.index = attempt,
            );
        }

        #[cfg(any(feature = "metrics", test))]
        self.report(SUCCESS_EVENT, attempt, None);
    }

    pub(crate) fn failed(&self, kind: ErrorKind, attempts: u32) {
        #[cfg(any(feature = "logs", test))]
        if self.logs_enabled {
            tracing::event!(
                name: "rebound.exhausted",
                tracing::Level::ERROR,
                resilience.operation.name = %self.operation_name,
                resilience.attempt.index = attempts,
                resilience.error.kind = kind.as_str(),
            );
        }

        #[cfg(any(feature = "metrics", test))]
        self.report(FAILURE_EVENT, attempts, Some(kind));
    }

    pub(crate) fn replayed(&self, key: &IdempotencyKey) {
        #[cfg(any(feature = "logs", test))]
        if self.logs_enabled {
            tracing::event!(
                name: "rebound.replay",
                tracing::Level::DEBUG,
                resilience.operation.name = %self.operation_name,
                resilience.idempotency.key = %key,
            );
        }

        #[cfg(any(feature = "metrics", test))]
        self.report(REPLAY_EVENT, 0, None);
    }

    pub(crate) fn store_failed(&self, key: &IdempotencyKey, error: &StoreError) {
        #[cfg(any(feature = "logs", test))]
        if self.logs_enabled {
            tracing::event!(
                name: "rebound.store",
                tracing::Level::ERROR,
                resilience.operation.name = %self.operation_name,
                resilience.idempotency.key = %key,
                error = %error,
            );
        }

        #[cfg(any(feature = "metrics", test))]
        self.report(STORE_EVENT, 0, Some(ErrorKind::Store));
    }

    pub(crate) fn hook_panicked(&self, hook: &'static str) {
        #[cfg(any(feature = "logs", test))]
        if self.logs_enabled {
            tracing::event!(
                name: "rebound.hook_panic",
                tracing::Level::ERROR,
                resilience.operation.name = %self.operation_name,
                hook = hook,
                "observability hook panicked; the panic was ignored"
            );
        }
    }

    #[cfg(any(feature = "metrics", test))]
    fn report(&self, event: &'static str, attempt: u32, kind: Option<ErrorKind>) {
        use opentelemetry::KeyValue;

        let Some(reporter) = &self.event_reporter else {
            return;
        };

        let mut attributes = vec![
            KeyValue::new(OPERATION_NAME, self.operation_name.clone()),
            KeyValue::new(EVENT_NAME, event),
            KeyValue::new(ATTEMPT_INDEX, i64::from(attempt)),
        ];

        if let Some(kind) = kind {
            attributes.push(KeyValue::new(ERROR_KIND, kind.as_str()));
        }

        reporter.add(1, &attributes);
    }
}
