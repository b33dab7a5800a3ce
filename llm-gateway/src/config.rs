//! Configuration: a JSON config file overlaid with environment
//! variables, resolved once at startup into an immutable [`Conf`]. Mirrors
//! the gateway's own `ConfFile` → `Conf` split: the file (and its
//! mostly-optional [`ConfFile`] DTO) describes *what the operator wrote
//! down*, `Conf` describes *what the process actually runs with*.

use std::collections::HashMap;
use std::env;
use std::fs;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use time::Duration;

use crate::manager::SessionManagerConfig;
use crate::policy::{ContentAction, ContentRule, ContentTarget, Severity, ThresholdKind, ThresholdRule};
use crate::router::{Backend, SelectionMethod};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BackendFile {
    name: String,
    url: String,
    #[serde(rename = "type")]
    backend_type: String,
    #[serde(default)]
    model_globs: Vec<String>,
    #[serde(default)]
    is_default: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RouterFile {
    #[serde(default)]
    backends: Vec<BackendFile>,
    #[serde(default)]
    strict_model_matching: bool,
    #[serde(default)]
    blocked_models: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ManagerFile {
    idle_timeout_secs: Option<i64>,
    kill_resume_timeout_secs: Option<i64>,
    retention_period_secs: Option<i64>,
    default_kill_block_mode: Option<String>,
    default_kill_block_duration_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThresholdRuleFile {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    threshold: f64,
    severity: String,
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentRuleFile {
    name: String,
    target: String,
    patterns: Vec<String>,
    severity: String,
    action: String,
    description: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PolicyFile {
    #[serde(default)]
    threshold_rules: Vec<ThresholdRuleFile>,
    #[serde(default)]
    content_rules: Vec<ContentRuleFile>,
    capture_enabled: Option<bool>,
    max_capture_size: Option<usize>,
}

fn parse_severity(raw: &str) -> anyhow::Result<Severity> {
    match raw {
        "info" => Ok(Severity::Info),
        "warning" => Ok(Severity::Warning),
        "critical" => Ok(Severity::Critical),
        other => anyhow::bail!("unknown severity {other:?}"),
    }
}

fn parse_threshold_kind(raw: &str) -> anyhow::Result<ThresholdKind> {
    match raw {
        "bytesIn" => Ok(ThresholdKind::BytesIn),
        "bytesOut" => Ok(ThresholdKind::BytesOut),
        "bytesTotal" => Ok(ThresholdKind::BytesTotal),
        "requestCount" => Ok(ThresholdKind::RequestCount),
        "duration" => Ok(ThresholdKind::DurationSecs),
        "requestsPerMinute" => Ok(ThresholdKind::RequestsPerMinute),
        "idleTime" => Ok(ThresholdKind::IdleTimeSecs),
        other => anyhow::bail!("unknown threshold rule type {other:?}"),
    }
}

fn parse_content_target(raw: &str) -> anyhow::Result<ContentTarget> {
    match raw {
        "request" => Ok(ContentTarget::Request),
        "response" => Ok(ContentTarget::Response),
        "both" => Ok(ContentTarget::Both),
        other => anyhow::bail!("unknown content rule target {other:?}"),
    }
}

fn parse_content_action(raw: &str) -> anyhow::Result<ContentAction> {
    match raw {
        "flag" => Ok(ContentAction::Flag),
        "block" => Ok(ContentAction::Block),
        "terminate" => Ok(ContentAction::Terminate),
        other => anyhow::bail!("unknown content rule action {other:?}"),
    }
}

/// Resolves the on-disk policy rule set into compiled rules. A malformed
/// regex or an unrecognized enum value is a startup-fatal configuration
/// error (.7: "Invalid policy patterns are reported at configuration
/// load"), never a runtime one.
fn resolve_policy_rules(file: PolicyFile) -> anyhow::Result<(Vec<ThresholdRule>, Vec<ContentRule>)> {
    let threshold_rules = file
        .threshold_rules
        .into_iter()
        .map(|r| {
            Ok(ThresholdRule {
                name: r.name.clone(),
                kind: parse_threshold_kind(&r.kind).with_context(|| format!("rule {:?}", r.name))?,
                threshold: r.threshold,
                severity: parse_severity(&r.severity).with_context(|| format!("rule {:?}", r.name))?,
                description: r.description,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let content_rules = file
        .content_rules
        .into_iter()
        .map(|r| {
            let patterns = r
                .patterns
                .iter()
                .map(|p| regex::Regex::new(p).with_context(|| format!("invalid pattern {p:?} in rule {:?}", r.name)))
                .collect::<anyhow::Result<Vec<_>>>()?;

            Ok(ContentRule {
                name: r.name.clone(),
                target: parse_content_target(&r.target).with_context(|| format!("rule {:?}", r.name))?,
                patterns,
                severity: parse_severity(&r.severity).with_context(|| format!("rule {:?}", r.name))?,
                action: parse_content_action(&r.action).with_context(|| format!("rule {:?}", r.name))?,
                description: r.description,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok((threshold_rules, content_rules))
}

/// The on-disk, mostly-optional shape of the config file. Kept distinct
/// from [`Conf`] so a missing field can fall back to either a default or
/// an environment variable without the rest of the codebase needing to
/// know the difference.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfFile {
    listen_addr: Option<String>,
    control_addr: Option<String>,
    session_store: Option<String>,
    shared_store_addr: Option<String>,
    policy_enabled: Option<bool>,
    #[serde(default)]
    router: RouterFile,
    #[serde(default)]
    manager: ManagerFile,
    #[serde(default)]
    policy: PolicyFile,
}

impl ConfFile {
    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read config file at {path}"))?;
        serde_json::from_str(&raw).with_context(|| format!("failed to parse config file at {path}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStoreKind {
    Memory,
    Shared,
}

#[derive(Debug, Clone)]
pub struct Conf {
    pub listen_addr: String,
    pub control_addr: String,
    pub session_store: SessionStoreKind,
    pub shared_store_addr: Option<String>,
    pub policy_enabled: bool,
    pub router_backends: Vec<Backend>,
    pub router_selection_methods: Vec<SelectionMethod>,
    pub router_strict_model_matching: bool,
    pub router_blocked_models: Vec<String>,
    pub manager: SessionManagerConfig,
    pub policy_threshold_rules: Vec<ThresholdRule>,
    pub policy_content_rules: Vec<ContentRule>,
    pub policy_capture_enabled: bool,
    pub policy_max_capture_size: usize,
    pub log_dir: Utf8PathBuf,
    pub log_directive: Option<String>,
    pub otel_endpoint: Option<String>,
}

const ENV_LISTEN_ADDR: &str = "LISTEN_ADDR";
const ENV_CONTROL_ADDR: &str = "CONTROL_ADDR";
const ENV_SESSION_STORE: &str = "SESSION_STORE";
const ENV_SHARED_STORE_ADDR: &str = "SHARED_STORE_ADDR";
const ENV_POLICY_ENABLED: &str = "POLICY_ENABLED";
const ENV_LOG_DIRECTIVE: &str = "LLM_GATEWAY_LOG_DIRECTIVE";
const ENV_LOG_FILE: &str = "LLM_GATEWAY_LOG_FILE";
const ENV_CONFIG_PATH: &str = "LLM_GATEWAY_CONFIG_PATH";
/// Standard OpenTelemetry endpoint variable (.6). Exporter wiring
/// itself is out of scope; this crate only recognizes the variable so a
/// downstream collector integration has a single place to read it from.
const ENV_OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Reads an environment variable, falling back to a value already present
/// in the config file, falling back again to a hardcoded default — the
/// same three-tier precedence the gateway applies to every setting.
fn overlay(env_key: &str, file_value: Option<String>, default: &str) -> String {
    env::var(env_key).ok().or(file_value).unwrap_or_else(|| default.to_owned())
}

impl Conf {
    /// Locates the config file via `LLM_GATEWAY_CONFIG_PATH` (falling back
    /// to `./llm-gateway.json`), reads it if present, and resolves it
    /// against the environment into a final [`Conf`]. A missing config
    /// file is not fatal — every setting has a hardcoded default.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| "llm-gateway.json".to_owned());
        let config_path = Utf8PathBuf::from(config_path);

        let file = if config_path.exists() {
            ConfFile::load(&config_path)?
        } else {
            ConfFile::default()
        };

        Self::from_conf_file(file)
    }

    pub fn from_conf_file(file: ConfFile) -> anyhow::Result<Self> {
        let listen_addr = overlay(ENV_LISTEN_ADDR, file.listen_addr, "0.0.0.0:8080");
        let control_addr = overlay(ENV_CONTROL_ADDR, file.control_addr, "127.0.0.1:8081");

        let session_store = match overlay(ENV_SESSION_STORE, file.session_store, "memory").as_str() {
            "shared" => SessionStoreKind::Shared,
            _ => SessionStoreKind::Memory,
        };

        let shared_store_addr = env::var(ENV_SHARED_STORE_ADDR).ok().or(file.shared_store_addr);

        anyhow::ensure!(
            session_store != SessionStoreKind::Shared || shared_store_addr.is_some(),
            "SESSION_STORE=shared requires SHARED_STORE_ADDR to be set"
        );

        let policy_enabled = env::var(ENV_POLICY_ENABLED)
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.policy_enabled)
            .unwrap_or(true);

        let router_backends = file
            .router
            .backends
            .into_iter()
            .map(|b| Backend::new(b.name, b.url, b.backend_type, b.model_globs, b.is_default))
            .collect::<Vec<_>>();

        let manager = SessionManagerConfig {
            idle_timeout: Duration::seconds(file.manager.idle_timeout_secs.unwrap_or(1800)),
            kill_resume_timeout: Duration::seconds(file.manager.kill_resume_timeout_secs.unwrap_or(300)),
            retention_period: Duration::seconds(file.manager.retention_period_secs.unwrap_or(86_400)),
            cleanup_interval: std::time::Duration::from_secs(30),
            default_kill_block: crate::manager::parse_kill_block_spec(
                file.manager.default_kill_block_mode.as_deref().unwrap_or("duration"),
                file.manager.default_kill_block_duration_secs.map(Duration::seconds).or(Some(Duration::minutes(5))),
            ),
        };

        let policy_capture_enabled = file.policy.capture_enabled.unwrap_or(false);
        let policy_max_capture_size = file.policy.max_capture_size.unwrap_or(4096);
        let (policy_threshold_rules, policy_content_rules) =
            resolve_policy_rules(file.policy).context("failed to resolve policy rule set")?;

        let log_dir = Utf8PathBuf::from(env::var(ENV_LOG_FILE).unwrap_or_else(|_| "logs".to_owned()));
        let log_directive = env::var(ENV_LOG_DIRECTIVE).ok().or_else(|| env::var("RUST_LOG").ok());
        let otel_endpoint = env::var(ENV_OTEL_EXPORTER_OTLP_ENDPOINT).ok();

        Ok(Self {
            listen_addr,
            control_addr,
            session_store,
            shared_store_addr,
            policy_enabled,
            router_backends,
            router_selection_methods: crate::router::default_selection_methods(),
            router_strict_model_matching: file.router.strict_model_matching,
            router_blocked_models: file.router.blocked_models,
            manager,
            policy_threshold_rules,
            policy_content_rules,
            policy_capture_enabled,
            policy_max_capture_size,
            log_dir,
            log_directive,
            otel_endpoint,
        })
    }
}

/// Not yet exposed over any interface (the dashboard UI is out of scope);
/// kept so future admin endpoints have a single place to read resolved,
/// redacted configuration from.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSummary {
    pub fields: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_empty() {
        let conf = Conf::from_conf_file(ConfFile::default()).unwrap();
        assert_eq!(conf.listen_addr, "0.0.0.0:8080");
        assert_eq!(conf.session_store, SessionStoreKind::Memory);
        assert!(conf.policy_enabled);
    }

    #[test]
    fn shared_store_without_address_is_rejected() {
        let file = ConfFile {
            session_store: Some("shared".to_owned()),
            ..Default::default()
        };
        assert!(Conf::from_conf_file(file).is_err());
    }

    #[test]
    fn backends_are_translated_from_file_dto() {
        let file = ConfFile {
            router: RouterFile {
                backends: vec![BackendFile {
                    name: "openai".to_owned(),
                    url: "https://api.openai.com".to_owned(),
                    backend_type: "openai".to_owned(),
                    model_globs: vec!["gpt-*".to_owned()],
                    is_default: true,
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let conf = Conf::from_conf_file(file).unwrap();
        assert_eq!(conf.router_backends.len(), 1);
        assert_eq!(conf.router_backends[0].websocket_url, "wss://api.openai.com");
    }

    #[test]
    fn policy_rules_are_translated_from_file_dto() {
        let file = ConfFile {
            policy: PolicyFile {
                threshold_rules: vec![ThresholdRuleFile {
                    name: "bytes-out-cap".to_owned(),
                    kind: "bytesOut".to_owned(),
                    threshold: 1000.0,
                    severity: "critical".to_owned(),
                    description: "response too large".to_owned(),
                }],
                content_rules: vec![ContentRuleFile {
                    name: "secret-leak".to_owned(),
                    target: "response".to_owned(),
                    patterns: vec![r"sk-[a-zA-Z0-9]+".to_owned()],
                    severity: "critical".to_owned(),
                    action: "block".to_owned(),
                    description: "leaked API key".to_owned(),
                }],
                capture_enabled: Some(true),
                max_capture_size: Some(2048),
            },
            ..Default::default()
        };

        let conf = Conf::from_conf_file(file).unwrap();
        assert_eq!(conf.policy_threshold_rules.len(), 1);
        assert_eq!(conf.policy_threshold_rules[0].kind, ThresholdKind::BytesOut);
        assert_eq!(conf.policy_content_rules.len(), 1);
        assert!(matches!(conf.policy_content_rules[0].action, ContentAction::Block));
        assert!(conf.policy_capture_enabled);
        assert_eq!(conf.policy_max_capture_size, 2048);
    }

    #[test]
    fn malformed_content_pattern_is_a_startup_error() {
        let file = ConfFile {
            policy: PolicyFile {
                threshold_rules: vec![],
                content_rules: vec![ContentRuleFile {
                    name: "broken".to_owned(),
                    target: "request".to_owned(),
                    patterns: vec!["(unclosed".to_owned()],
                    severity: "info".to_owned(),
                    action: "flag".to_owned(),
                    description: "d".to_owned(),
                }],
                capture_enabled: None,
                max_capture_size: None,
            },
            ..Default::default()
        };

        assert!(Conf::from_conf_file(file).is_err());
    }

    #[test]
    fn unknown_threshold_kind_is_a_startup_error() {
        let file = ConfFile {
            policy: PolicyFile {
                threshold_rules: vec![ThresholdRuleFile {
                    name: "bogus".to_owned(),
                    kind: "not-a-real-kind".to_owned(),
                    threshold: 1.0,
                    severity: "info".to_owned(),
                    description: "d".to_owned(),
                }],
                content_rules: vec![],
                capture_enabled: None,
                max_capture_size: None,
            },
            ..Default::default()
        };

        assert!(Conf::from_conf_file(file).is_err());
    }
}
