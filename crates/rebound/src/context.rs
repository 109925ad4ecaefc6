// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;

use tick::Clock;

use crate::telemetry::TelemetryHelper;

/// Shared dependencies for retriers: the clock and telemetry configuration.
///
/// Build one `Context` per application or subsystem and pass it to every
/// [`Retrier::builder`][crate::Retrier::builder] so that they share a clock and
/// report through the same meter.
///
/// # Examples
///
/// ```
/// use rebound::Context;
/// use tick::Clock;
///
/// # fn example(clock: Clock) {
/// let context = Context::new(&clock);
/// # let _ = context;
/// # }
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Context {
    clock: Clock,
    #[cfg(any(feature = "metrics", test))]
    meter: Option<opentelemetry::metrics::Meter>,
    #[cfg(any(feature = "logs", test))]
    logs_enabled: bool,
}

impl Context {
    /// Creates a context around `clock`. Logs and metrics start disabled.
    pub fn new(clock: impl AsRef<Clock>) -> Self {
        Self {
            clock: clock.as_ref().clone(),
            #[cfg(any(feature = "metrics", test))]
            meter: None,
            #[cfg(any(feature = "logs", test))]
            logs_enabled: false,
        }
    }

    /// The clock used for delays, deadlines, and record timestamps.
    #[must_use]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Reports resilience events to the given OpenTelemetry meter provider.
    #[must_use]
    #[cfg(any(feature = "metrics", test))]
    pub fn enable_metrics(self, provider: &dyn opentelemetry::metrics::MeterProvider) -> Self {
        Self {
            meter: Some(crate::telemetry::create_meter(provider)),
            ..self
        }
    }

    /// Emits `tracing` events for retries, exhaustion, and replays.
    #[must_use]
    #[cfg(any(feature = "logs", test))]
    pub fn enable_logs(self) -> Self {
        Self {
            logs_enabled: true,
            ..self
        }
    }

    #[cfg_attr(
        not(any(feature = "metrics", feature = "logs", test)),
        expect(unused_variables, reason = "unused when logs nor metrics are used")
    )]
    pub(crate) fn create_telemetry(&self, operation_name: Cow<'static, str>) -> TelemetryHelper {
        TelemetryHelper {
            #[cfg(any(feature = "metrics", test))]
            event_reporter: self.meter.as_ref().map(crate::telemetry::create_resilience_event_counter),
            #[cfg(any(feature = "metrics", feature = "logs", test))]
            operation_name,
            #[cfg(any(feature = "logs", test))]
            logs_enabled: self.logs_enabled,
        }
    }
}
