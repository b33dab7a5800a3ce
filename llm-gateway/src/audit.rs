//! The audit sink boundary (ambient, ): the manager's end-of-session
//! hook hands each terminal [`SessionRecord`] to whatever sink is
//! configured. The on-disk audit log storage engine itself is out of
//! scope; this module only defines the seam and two minimal
//! implementations a caller can wire in directly.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use crate::manager::EndOfSessionHook;
use crate::session::{SessionSnapshot, ToolCallRecord};

/// The audit-facing flattened projection named in .6's "End-of-session
/// callback": everything derivable from the [`SessionSnapshot`] alone.
/// `violations`/`capturedContent` are not included here — those live in
/// the policy engine's `FlaggedSession`, keyed by the same session ID, and
/// are the caller's responsibility to join in before handing the combined
/// record to the on-disk audit log (out of scope for this crate).
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub client_address: String,
    pub backend: Option<String>,
    pub state: crate::session::SessionState,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub duration_ms: i64,
    pub request_count: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: u64,
    pub metadata: HashMap<String, String>,
    pub backends_used: HashMap<String, u64>,
    pub tool_call_history: Vec<ToolCallRecord>,
}

impl From<&SessionSnapshot> for SessionRecord {
    fn from(snapshot: &SessionSnapshot) -> Self {
        let data = &snapshot.data;
        let duration = data.duration(OffsetDateTime::now_utc());

        Self {
            session_id: data.id.clone(),
            client_address: data.client_address.clone(),
            backend: data.backend.clone(),
            state: data.state,
            start_time: data.start_time,
            end_time: data.end_time,
            duration_ms: duration.whole_milliseconds() as i64,
            request_count: data.request_count,
            bytes_in: data.bytes_in,
            bytes_out: data.bytes_out,
            tokens_in: data.tokens_in,
            tokens_out: data.tokens_out,
            tool_calls: data.tool_calls,
            metadata: data.metadata.clone(),
            backends_used: data.backends_used.clone(),
            tool_call_history: data.tool_call_history.iter().cloned().collect(),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: SessionRecord);
}

/// Discards every record. The default when no audit backend is configured.
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _record: SessionRecord) {}
}

/// Emits each record as a structured `tracing` event at `info` level —
/// useful standalone, and as the fallback a real storage-engine sink would
/// wrap for failures.
pub struct LoggingAuditSink;

#[async_trait]
impl AuditSink for LoggingAuditSink {
    async fn record(&self, record: SessionRecord) {
        info!(
            session_id = %record.session_id,
            client_address = %record.client_address,
            backend = record.backend.as_deref().unwrap_or("none"),
            request_count = record.request_count,
            bytes_in = record.bytes_in,
            bytes_out = record.bytes_out,
            tokens_in = record.tokens_in,
            tokens_out = record.tokens_out,
            tool_calls = record.tool_calls,
            "session ended"
        );
    }
}

/// Adapts any [`AuditSink`] into the manager's [`EndOfSessionHook`] seam.
/// Open Question (b) ( §9): flagged-session entries are retired in
/// lockstep with their session, so once this hook's `sink` has had a
/// chance to read the terminal record, the matching [`PolicyEngine`] entry
/// (if any) is dropped too — policy state never outlives the session it
/// describes.
pub struct AuditHook<S> {
    sink: S,
    policy: Option<std::sync::Arc<crate::policy::PolicyEngine>>,
}

impl<S: AuditSink> AuditHook<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, policy: None }
    }

    pub fn with_policy(sink: S, policy: std::sync::Arc<crate::policy::PolicyEngine>) -> Self {
        Self { sink, policy: Some(policy) }
    }
}

#[async_trait]
impl<S: AuditSink> EndOfSessionHook for AuditHook<S> {
    async fn on_session_end(&self, snapshot: SessionSnapshot) {
        let session_id = snapshot.data.id.clone();
        self.sink.record(SessionRecord::from(&snapshot)).await;

        if let Some(policy) = &self.policy {
            policy.remove_flagged_session(&session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionData;

    #[tokio::test]
    async fn with_policy_removes_flagged_session_after_recording() {
        use crate::policy::{PolicyConfig, PolicyEngine, Severity, SessionMetrics, ThresholdKind, ThresholdRule};

        let policy = std::sync::Arc::new(PolicyEngine::new(PolicyConfig {
            threshold_rules: vec![ThresholdRule {
                name: "bytes-out-cap".to_owned(),
                kind: ThresholdKind::BytesOut,
                threshold: 10.0,
                severity: Severity::Critical,
                description: "too big".to_owned(),
            }],
            content_rules: vec![],
            capture_enabled: false,
            max_capture_size: 0,
        }));

        policy.evaluate(
            "s1",
            &SessionMetrics { bytes_in: 0, bytes_out: 100, request_count: 1, duration_secs: 1.0, idle_time_secs: 0.0, requests_per_minute: 0 },
        );
        assert!(policy.get_flagged_session("s1").is_some());

        let hook = AuditHook::with_policy(NoopAuditSink, std::sync::Arc::clone(&policy));
        let snapshot = SessionSnapshot {
            data: SessionData::new("s1".to_owned(), None, "127.0.0.1".to_owned()),
            killed: false,
        };
        hook.on_session_end(snapshot).await;

        assert!(policy.get_flagged_session("s1").is_none());
    }

    #[tokio::test]
    async fn noop_sink_never_panics() {
        let snapshot = SessionSnapshot {
            data: SessionData::new("s1".to_owned(), None, "127.0.0.1".to_owned()),
            killed: false,
        };
        let hook = AuditHook::new(NoopAuditSink);
        hook.on_session_end(snapshot).await;
    }

    #[tokio::test]
    async fn session_record_carries_over_core_fields() {
        let mut data = SessionData::new("s1".to_owned(), Some("openai".to_owned()), "10.0.0.1".to_owned());
        data.request_count = 3;
        data.bytes_in = 100;
        let snapshot = SessionSnapshot { data, killed: false };

        let record = SessionRecord::from(&snapshot);
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.backend.as_deref(), Some("openai"));
        assert_eq!(record.request_count, 3);
        assert_eq!(record.bytes_in, 100);
    }
}
