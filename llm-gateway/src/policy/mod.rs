//! The policy engine: threshold rules over session metrics,
//! content-match rules over request/response bodies, severity ranking,
//! violation accumulation, and sample capture. Read-mostly over rules,
//! write-only to the flagged set — readers never block writers for long
//! (: policy evaluation is CPU-only and non-suspending).

mod content;
mod threshold;

pub use content::{ContentAction, ContentRule, ContentTarget};
pub use threshold::{ThresholdKind, ThresholdRule};

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    fn rank(self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }
}

/// `severityMeetsMinimum(actual, min)` — .4.
pub fn severity_meets_minimum(actual: Severity, min: Severity) -> bool {
    actual.rank() >= min.rank()
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub rule_name: String,
    pub description: String,
    pub severity: Severity,
    pub threshold: f64,
    pub actual_value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapturedContent {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlaggedSession {
    pub session_id: String,
    pub violations: Vec<Violation>,
    pub max_severity: Severity,
    #[serde(with = "time::serde::rfc3339")]
    pub first_flagged: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_flagged: OffsetDateTime,
    pub captured_content: Vec<CapturedContent>,
}

impl FlaggedSession {
    fn recompute_max_severity(&mut self) {
        self.max_severity = self
            .violations
            .iter()
            .map(|v| v.severity)
            .max()
            .unwrap_or(Severity::Info);
    }
}

/// Metrics derived from a [`crate::session::SessionSnapshot`] by the
/// caller — the policy engine is decoupled from the session type itself,
/// consuming only the numbers .4's threshold rules need.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub request_count: u64,
    pub duration_secs: f64,
    pub idle_time_secs: f64,
    pub requests_per_minute: u64,
}

pub struct ContentEvalResult {
    pub violations: Vec<Violation>,
    pub should_block: bool,
    pub should_terminate: bool,
}

pub struct PolicyConfig {
    pub threshold_rules: Vec<ThresholdRule>,
    pub content_rules: Vec<ContentRule>,
    pub capture_enabled: bool,
    pub max_capture_size: usize,
}

pub struct PolicyEngine {
    threshold_rules: Vec<ThresholdRule>,
    content_rules: Vec<ContentRule>,
    capture_enabled: bool,
    max_capture_size: usize,
    flagged: RwLock<HashMap<String, FlaggedSession>>,
}

const TRUNCATION_MARKER: &str = "...[truncated]";

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            threshold_rules: config.threshold_rules,
            content_rules: config.content_rules,
            capture_enabled: config.capture_enabled,
            max_capture_size: config.max_capture_size,
            flagged: RwLock::new(HashMap::new()),
        }
    }

    /// For each threshold rule, compares `actual` to `threshold`; emits a
    /// violation when `actual > threshold` (strictly greater — 's
    /// boundary law: "`requestsPerMinute` at exactly `threshold` must
    /// **not** violate"). Accumulates evidence monotonically into the
    /// session's [`FlaggedSession`] entry.
    pub fn evaluate(&self, session_id: &str, metrics: &SessionMetrics) -> Vec<Violation> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for rule in &self.threshold_rules {
            let actual = threshold::actual_value(rule.kind, metrics);

            if actual > rule.threshold {
                violations.push(Violation {
                    rule_name: rule.name.clone(),
                    description: rule.description.clone(),
                    severity: rule.severity,
                    threshold: rule.threshold,
                    actual_value: actual,
                    timestamp: now,
                });
            }
        }

        if !violations.is_empty() {
            self.record_violations(session_id, violations.clone(), now);
        }

        violations
    }

    fn record_violations(&self, session_id: &str, new_violations: Vec<Violation>, now: OffsetDateTime) {
        let mut flagged = self.flagged.write();

        let entry = flagged.entry(session_id.to_owned()).or_insert_with(|| FlaggedSession {
            session_id: session_id.to_owned(),
            violations: Vec::new(),
            max_severity: Severity::Info,
            first_flagged: now,
            last_flagged: now,
            captured_content: Vec::new(),
        });

        for violation in new_violations {
            match entry.violations.iter_mut().find(|v| v.rule_name == violation.rule_name) {
                Some(existing) => {
                    existing.actual_value = violation.actual_value;
                    existing.timestamp = violation.timestamp;
                }
                None => entry.violations.push(violation),
            }
        }

        entry.last_flagged = now;
        entry.recompute_max_severity();
    }

    /// Tests each content-match rule whose target matches `target`; on any
    /// pattern hit, emits a violation and folds the rule's action into the
    /// returned block/terminate flags. Malformed runtime
    /// patterns are never possible here since [`ContentRule`] only holds
    /// already-compiled regexes — construction-time failures are reported
    /// at configuration load.
    pub fn evaluate_content(&self, session_id: &str, body: &[u8], target: ContentTarget) -> ContentEvalResult {
        let now = OffsetDateTime::now_utc();
        let text = String::from_utf8_lossy(body);

        let mut violations = Vec::new();
        let mut should_block = false;
        let mut should_terminate = false;

        for rule in &self.content_rules {
            if !rule.matches_target(target) {
                continue;
            }

            if rule.patterns.iter().any(|pattern| pattern.is_match(&text)) {
                violations.push(Violation {
                    rule_name: rule.name.clone(),
                    description: rule.description.clone(),
                    severity: rule.severity,
                    threshold: 0.0,
                    actual_value: 1.0,
                    timestamp: now,
                });

                match rule.action {
                    ContentAction::Flag => {}
                    ContentAction::Block => should_block = true,
                    ContentAction::Terminate => should_terminate = true,
                }
            }
        }

        if !violations.is_empty() {
            self.record_violations(session_id, violations.clone(), now);
        }

        ContentEvalResult { violations, should_block, should_terminate }
    }

    /// No-op if capture is disabled or the session has no flagged entry.
    /// Truncates both bodies to `max_capture_size` bytes, appending the
    /// truncation marker, exactly matching boundary law.
    pub fn capture_request(&self, session_id: &str, request: &[u8], response: &[u8]) {
        if !self.capture_enabled {
            return;
        }

        let mut flagged = self.flagged.write();
        let Some(entry) = flagged.get_mut(session_id) else {
            return;
        };

        entry.captured_content.push(CapturedContent {
            request: truncate(request, self.max_capture_size),
            response: truncate(response, self.max_capture_size),
            timestamp: OffsetDateTime::now_utc(),
        });
    }

    pub fn get_flagged_session(&self, session_id: &str) -> Option<FlaggedSession> {
        self.flagged.read().get(session_id).cloned()
    }

    pub fn get_flagged_sessions(&self) -> Vec<FlaggedSession> {
        self.flagged.read().values().cloned().collect()
    }

    pub fn get_flagged_sessions_by_severity(&self, min: Severity) -> Vec<FlaggedSession> {
        self.flagged
            .read()
            .values()
            .filter(|f| severity_meets_minimum(f.max_severity, min))
            .cloned()
            .collect()
    }

    pub fn remove_flagged_session(&self, session_id: &str) {
        self.flagged.write().remove(session_id);
    }
}

fn truncate(data: &[u8], max_len: usize) -> Vec<u8> {
    if data.len() <= max_len {
        return data.to_vec();
    }

    let mut out = data[..max_len].to_vec();
    out.extend_from_slice(TRUNCATION_MARKER.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn engine_with_bytes_out_rule() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig {
            threshold_rules: vec![ThresholdRule {
                name: "bytes-out-cap".to_owned(),
                kind: ThresholdKind::BytesOut,
                threshold: 1000.0,
                severity: Severity::Critical,
                description: "response too large".to_owned(),
            }],
            content_rules: vec![],
            capture_enabled: true,
            max_capture_size: 16,
        })
    }

    fn metrics(bytes_out: u64) -> SessionMetrics {
        SessionMetrics {
            bytes_in: 0,
            bytes_out,
            request_count: 1,
            duration_secs: 1.0,
            idle_time_secs: 0.0,
            requests_per_minute: 0,
        }
    }

    #[test]
    fn accumulates_violation_evidence_across_calls() {
        let engine = engine_with_bytes_out_rule();

        assert!(engine.evaluate("s1", &metrics(500)).is_empty());
        assert!(engine.get_flagged_session("s1").is_none());

        let violations = engine.evaluate("s1", &metrics(1500));
        assert_eq!(violations.len(), 1);

        let flagged = engine.get_flagged_session("s1").unwrap();
        assert_eq!(flagged.violations.len(), 1);
        assert_eq!(flagged.violations[0].actual_value, 1500.0);
        assert_eq!(flagged.max_severity, Severity::Critical);
    }

    #[test]
    fn threshold_rule_does_not_violate_at_exact_value() {
        let engine = engine_with_bytes_out_rule();
        assert!(engine.evaluate("s1", &metrics(1000)).is_empty());
    }

    #[test]
    fn capture_is_noop_when_session_not_flagged() {
        let engine = engine_with_bytes_out_rule();
        engine.capture_request("unflagged", b"req", b"resp");
        assert!(engine.get_flagged_session("unflagged").is_none());
    }

    #[test]
    fn capture_truncates_to_exact_max_size() {
        let engine = engine_with_bytes_out_rule();
        engine.evaluate("s1", &metrics(2000));

        let body = vec![b'a'; 17]; // max_capture_size + 1
        engine.capture_request("s1", &body, b"");

        let flagged = engine.get_flagged_session("s1").unwrap();
        let captured = &flagged.captured_content[0].request;
        assert_eq!(&captured[..16], &body[..16]);
        assert_eq!(&captured[16..], TRUNCATION_MARKER.as_bytes());
    }

    #[test]
    fn content_rule_block_action_sets_flag() {
        let engine = PolicyEngine::new(PolicyConfig {
            threshold_rules: vec![],
            content_rules: vec![ContentRule {
                name: "secret-leak".to_owned(),
                target: ContentTarget::Response,
                patterns: vec![Regex::new(r"sk-[a-zA-Z0-9]+").unwrap()],
                severity: Severity::Critical,
                action: ContentAction::Block,
                description: "leaked API key".to_owned(),
            }],
            capture_enabled: false,
            max_capture_size: 100,
        });

        let result = engine.evaluate_content("s1", b"here is sk-abc123", ContentTarget::Response);
        assert!(result.should_block);
        assert!(!result.should_terminate);
        assert_eq!(result.violations.len(), 1);
    }

    #[test]
    fn severity_ranking_order() {
        assert!(severity_meets_minimum(Severity::Critical, Severity::Warning));
        assert!(!severity_meets_minimum(Severity::Info, Severity::Warning));
        assert!(severity_meets_minimum(Severity::Warning, Severity::Warning));
    }

    #[test]
    fn remove_flagged_session_drops_entry() {
        let engine = engine_with_bytes_out_rule();
        engine.evaluate("s1", &metrics(2000));
        assert!(engine.get_flagged_session("s1").is_some());
        engine.remove_flagged_session("s1");
        assert!(engine.get_flagged_session("s1").is_none());
    }
}
