// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Helpers shared by unit tests.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, Metric, MetricData};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, SdkMeterProvider};
use tracing_subscriber::fmt::MakeWriter;

use crate::{ExhaustionReason, HookContext, Hooks, Recovery, RecoveryInfo};

/// Collects `OTel` metrics in memory.
#[derive(Debug)]
pub(crate) struct MetricTester {
    exporter: InMemoryMetricExporter,
    provider: SdkMeterProvider,
}

impl MetricTester {
    #[must_use]
    pub fn new() -> Self {
        let in_memory = InMemoryMetricExporter::default();

        Self {
            exporter: in_memory.clone(),
            provider: SdkMeterProvider::builder().with_periodic_exporter(in_memory).build(),
        }
    }

    #[must_use]
    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.provider
    }

    /// Debug dump of everything exported so far.
    #[must_use]
    pub fn dump(&self) -> String {
        self.provider.force_flush().unwrap();
        format!("{:?}", self.exporter.get_finished_metrics().unwrap())
    }

    #[must_use]
    pub fn collect_attributes(&self) -> Vec<KeyValue> {
        self.provider.force_flush().unwrap();

        self.exporter
            .get_finished_metrics()
            .unwrap()
            .iter()
            .flat_map(opentelemetry_sdk::metrics::data::ResourceMetrics::scope_metrics)
            .flat_map(opentelemetry_sdk::metrics::data::ScopeMetrics::metrics)
            .flat_map(collect_attributes_for_metric)
            .collect()
    }

    pub fn assert_attributes_contain(&self, key_values: &[KeyValue]) {
        let attributes = self.collect_attributes();

        for attr in key_values {
            assert!(
                attributes.contains(attr),
                "attribute {attr:?} not found in collected attributes: {attributes:?}"
            );
        }
    }
}

fn collect_attributes_for_metric(metric: &Metric) -> Vec<KeyValue> {
    // The retrier only records u64 counters.
    match metric.data() {
        AggregatedMetrics::U64(MetricData::Sum(data)) => data.data_points().flat_map(|v| v.attributes().cloned()).collect(),
        _ => Vec::new(),
    }
}

/// Captures formatted `tracing` output for the current thread.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    pub fn assert_contains(&self, expected: &str) {
        let output = self.output();
        assert!(
            output.contains(expected),
            "log output does not contain '{expected}', got:\n{output}"
        );
    }

    /// Use with `set_default()` for thread-local capture.
    #[must_use]
    pub fn subscriber(&self) -> impl tracing::Subscriber {
        use tracing_subscriber::layer::SubscriberExt;
        tracing_subscriber::registry().with(tracing_subscriber::fmt::layer().with_writer(self.clone()).with_ansi(false))
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

pub(crate) struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Error type whose recovery is fixed at construction.
#[derive(Debug, Clone)]
pub(crate) struct RecoverableType(RecoveryInfo);

impl Recovery for RecoverableType {
    fn recovery(&self) -> RecoveryInfo {
        self.0.clone()
    }
}

impl From<RecoveryInfo> for RecoverableType {
    fn from(recovery: RecoveryInfo) -> Self {
        Self(recovery)
    }
}

impl std::fmt::Display for RecoverableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0.kind())
    }
}

/// One hook invocation, as seen by [`RecordingHooks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HookEvent {
    Attempt(u32),
    RetryScheduled(u32, Duration),
    Success(u32),
    Exhausted(ExhaustionReason, bool),
}

/// Hooks that remember every call in order.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingHooks {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl RecordingHooks {
    #[must_use]
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HookEvent::RetryScheduled(_, delay) => Some(delay),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: HookEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl<E> Hooks<E> for RecordingHooks {
    fn on_attempt(&self, _context: &HookContext<'_>, attempt: u32) {
        self.push(HookEvent::Attempt(attempt));
    }

    fn on_retry_scheduled(&self, _context: &HookContext<'_>, attempt: u32, delay: Duration, _error: &E) {
        self.push(HookEvent::RetryScheduled(attempt, delay));
    }

    fn on_success(&self, _context: &HookContext<'_>, attempt: u32, _elapsed: Duration) {
        self.push(HookEvent::Success(attempt));
    }

    fn on_exhausted(&self, _context: &HookContext<'_>, reason: ExhaustionReason, error: Option<&E>) {
        self.push(HookEvent::Exhausted(reason, error.is_some()));
    }
}
