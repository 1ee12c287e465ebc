//! Pluggable monitoring hooks.
//!
//! The queue and the agent report what they do through a [`QueueMonitor`].
//! The default does nothing; [`OtelMonitor`] feeds the OTel instruments in
//! [`super::metrics`].

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram};
use std::time::Duration;

use crate::model::RequestStatus;

/// How a put_request call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Updated,
    /// The stored request was Canceled; nothing was written.
    Canceled,
    Duplicate,
    Error,
}

impl PutOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PutOutcome::Created => "created",
            PutOutcome::Updated => "updated",
            PutOutcome::Canceled => "canceled",
            PutOutcome::Duplicate => "duplicate",
            PutOutcome::Error => "error",
        }
    }
}

/// Observer of queue activity. All methods default to no-ops.
pub trait QueueMonitor: Send + Sync {
    fn request_put(&self, _outcome: PutOutcome) {}

    /// `mode` is "named", "anonymous" or "bulk".
    fn requests_claimed(&self, _mode: &'static str, _count: usize) {}

    fn status_changed(&self, _from: RequestStatus, _to: RequestStatus) {}

    fn operation_handled(&self, _operation_type: &str, _result: &'static str) {}

    fn cycle_finished(&self, _requests: usize, _elapsed: Duration) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

impl QueueMonitor for NoopMonitor {}

/// Records into the globally registered OTel meter provider.
pub struct OtelMonitor {
    put: Counter<u64>,
    claimed: Counter<u64>,
    status_changes: Counter<u64>,
    operations: Counter<u64>,
    cycle_duration: Histogram<f64>,
}

impl OtelMonitor {
    pub fn new() -> Self {
        Self {
            put: super::metrics::requests_put(),
            claimed: super::metrics::requests_claimed(),
            status_changes: super::metrics::status_changes(),
            operations: super::metrics::operations_handled(),
            cycle_duration: super::metrics::cycle_duration_ms(),
        }
    }
}

impl Default for OtelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueMonitor for OtelMonitor {
    fn request_put(&self, outcome: PutOutcome) {
        self.put
            .add(1, &[KeyValue::new("result", outcome.as_str())]);
    }

    fn requests_claimed(&self, mode: &'static str, count: usize) {
        if count > 0 {
            self.claimed
                .add(count as u64, &[KeyValue::new("mode", mode)]);
        }
    }

    fn status_changed(&self, from: RequestStatus, to: RequestStatus) {
        self.status_changes.add(
            1,
            &[
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
    }

    fn operation_handled(&self, operation_type: &str, result: &'static str) {
        self.operations.add(
            1,
            &[
                KeyValue::new("operation_type", operation_type.to_string()),
                KeyValue::new("result", result),
            ],
        );
    }

    fn cycle_finished(&self, requests: usize, elapsed: Duration) {
        self.cycle_duration.record(
            elapsed.as_secs_f64() * 1000.0,
            &[KeyValue::new("requests", requests as i64)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl QueueMonitor for Recorder {
        fn request_put(&self, outcome: PutOutcome) {
            self.0.lock().unwrap().push(outcome.as_str().to_string());
        }
    }

    #[test]
    fn defaults_are_noops_and_overrides_fire() {
        let recorder = Recorder::default();
        recorder.request_put(PutOutcome::Created);
        recorder.requests_claimed("bulk", 3);
        recorder.status_changed(RequestStatus::Waiting, RequestStatus::Assigned);
        assert_eq!(*recorder.0.lock().unwrap(), vec!["created".to_string()]);
    }

    #[test]
    fn otel_monitor_records_without_provider() {
        let monitor = OtelMonitor::new();
        monitor.request_put(PutOutcome::Duplicate);
        monitor.requests_claimed("anonymous", 1);
        monitor.cycle_finished(2, Duration::from_millis(15));
    }
}
