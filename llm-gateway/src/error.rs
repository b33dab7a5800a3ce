use thiserror::Error;

/// Error kinds surfaced by the control plane.
///
/// Startup-time configuration errors (no default backend, unreachable
/// shared store at init) are represented separately as plain `anyhow::Error`
/// values returned from the bootstrap path; they are fatal and are never
/// wrapped in this enum, since callers never need to match on them.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session not found")]
    NotFound,

    #[error("session rejected: {0}")]
    Rejected(&'static str),

    #[error("model is blocked")]
    ModelBlocked,

    #[error("model is not allowed by the current router configuration")]
    ModelNotAllowed,

    #[error("no backend configured for this request")]
    BackendUnconfigured,

    #[error("shared store is unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("invalid pattern in rule {rule_name:?}: {source}")]
    InvalidPattern {
        rule_name: String,
        #[source]
        source: anyhow::Error,
    },
}
