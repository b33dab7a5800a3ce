use super::{Severity, SessionMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    BytesIn,
    BytesOut,
    BytesTotal,
    RequestCount,
    DurationSecs,
    IdleTimeSecs,
    RequestsPerMinute,
}

#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub name: String,
    pub kind: ThresholdKind,
    pub threshold: f64,
    pub severity: Severity,
    pub description: String,
}

pub fn actual_value(kind: ThresholdKind, metrics: &SessionMetrics) -> f64 {
    match kind {
        ThresholdKind::BytesIn => metrics.bytes_in as f64,
        ThresholdKind::BytesOut => metrics.bytes_out as f64,
        ThresholdKind::BytesTotal => (metrics.bytes_in + metrics.bytes_out) as f64,
        ThresholdKind::RequestCount => metrics.request_count as f64,
        ThresholdKind::DurationSecs => metrics.duration_secs,
        ThresholdKind::IdleTimeSecs => metrics.idle_time_secs,
        ThresholdKind::RequestsPerMinute => metrics.requests_per_minute as f64,
    }
}
