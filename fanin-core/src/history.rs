use crate::message::{BufferedRecord, CorrelationId};

/// Hook notified as records leave the worker and as their verdicts come back, for pipelines
/// that keep a processing trail per record. Every callback defaults to doing nothing.
pub trait HistoryRecorder: Send + Sync {
    fn emitted(&self, _record: &BufferedRecord) {}

    fn acked(&self, _correlation: &CorrelationId) {}

    fn failed(&self, _correlation: &CorrelationId) {}
}
