//! The multi-backend router: resolves each request to exactly
//! one configured backend. Purely CPU-bound — no suspension points —
//! so `select` is a plain synchronous function.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;

/// `{name, url, websocket_url, type, model_globs, is_default}`.
/// `websocket_url` is derived from `url` by scheme substitution
/// (`http→ws`, `https→wss`).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Backend {
    pub name: String,
    pub url: String,
    pub websocket_url: String,
    pub backend_type: String,
    pub model_globs: Vec<String>,
    pub is_default: bool,
}

impl Backend {
    pub fn new(name: impl Into<String>, url: impl Into<String>, backend_type: impl Into<String>, model_globs: Vec<String>, is_default: bool) -> Self {
        let url = url.into();
        let websocket_url = derive_websocket_url(&url);
        Self {
            name: name.into(),
            url,
            websocket_url,
            backend_type: backend_type.into(),
            model_globs,
            is_default,
        }
    }
}

/// `http→ws`, `https→wss`; any other scheme is left untouched.
fn derive_websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    Header,
    Model,
    Path,
    Default,
}

pub fn default_selection_methods() -> Vec<SelectionMethod> {
    vec![
        SelectionMethod::Header,
        SelectionMethod::Model,
        SelectionMethod::Path,
        SelectionMethod::Default,
    ]
}

struct CompiledBackend {
    backend: Backend,
    globs: GlobSet,
}

pub struct RouterConfig {
    pub backends: Vec<Backend>,
    pub selection_methods: Vec<SelectionMethod>,
    pub strict_model_matching: bool,
    pub blocked_models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    ModelBlocked,
    ModelNotAllowed,
}

pub struct RouteRequest<'a> {
    pub header_backend: Option<&'a str>,
    pub path: &'a str,
    pub body: &'a [u8],
}

/// Compiled, immutable router: one [`GlobSet`] per backend plus one for the
/// blocklist, built once at configuration load time (startup error if a
/// glob fails to compile, or if there is not exactly one default backend —
/// .2).
pub struct Router {
    backends: Vec<CompiledBackend>,
    default_index: usize,
    selection_methods: Vec<SelectionMethod>,
    strict_model_matching: bool,
    blocked_models: GlobSet,
}

impl Router {
    pub fn new(config: RouterConfig) -> anyhow::Result<Self> {
        let mut compiled = Vec::with_capacity(config.backends.len());
        let mut default_index = None;

        for backend in config.backends {
            let mut builder = GlobSetBuilder::new();
            for pattern in &backend.model_globs {
                builder.add(Glob::new(pattern).map_err(|e| anyhow::anyhow!("invalid model glob {pattern:?} on backend {:?}: {e}", backend.name))?);
            }
            let globs = builder.build()?;

            if backend.is_default {
                anyhow::ensure!(default_index.is_none(), "configuration must contain exactly one default backend");
                default_index = Some(compiled.len());
            }

            compiled.push(CompiledBackend { backend, globs });
        }

        let default_index =
            default_index.ok_or_else(|| anyhow::anyhow!("configuration must contain exactly one default backend"))?;

        let mut blocked_builder = GlobSetBuilder::new();
        for pattern in &config.blocked_models {
            blocked_builder.add(Glob::new(pattern).map_err(|e| anyhow::anyhow!("invalid blocked-model glob {pattern:?}: {e}"))?);
        }
        let blocked_models = blocked_builder.build()?;

        Ok(Self {
            backends: compiled,
            default_index,
            selection_methods: config.selection_methods,
            strict_model_matching: config.strict_model_matching,
            blocked_models,
        })
    }

    pub fn backend_by_name(&self, name: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.backend.name == name).map(|b| &b.backend)
    }

    fn default_backend(&self) -> &Backend {
        &self.backends[self.default_index].backend
    }

    /// Implements .2's four-step algorithm exactly: blocklist check,
    /// then the selection-method walk (`header`, `model`, `path`,
    /// `default`), then strict-mode gating on the final fallthrough.
    pub fn select(&self, request: &RouteRequest<'_>) -> Result<&Backend, RouteOutcome> {
        let model = crate::extract::extract_model(request.body).unwrap_or_default();

        if !model.is_empty() && self.blocked_models.is_match(&model) {
            return Err(RouteOutcome::ModelBlocked);
        }

        let mut matched_by_model = false;

        for method in &self.selection_methods {
            match method {
                SelectionMethod::Header => {
                    if let Some(name) = request.header_backend {
                        if let Some(backend) = self.backend_by_name(name) {
                            return Ok(backend);
                        }
                    }
                }
                SelectionMethod::Model => {
                    if !model.is_empty() {
                        if let Some(compiled) = self.backends.iter().find(|b| b.globs.is_match(&model)) {
                            matched_by_model = true;
                            return Ok(&compiled.backend);
                        }
                    }
                }
                SelectionMethod::Path => {
                    for compiled in &self.backends {
                        let by_name = format!("/{}/", compiled.backend.name);
                        let by_type = format!("/{}/", compiled.backend.backend_type);
                        if request.path.starts_with(&by_name) || request.path.starts_with(&by_type) {
                            return Ok(&compiled.backend);
                        }
                    }
                }
                SelectionMethod::Default => {
                    if self.strict_model_matching && !model.is_empty() && !matched_by_model {
                        return Err(RouteOutcome::ModelNotAllowed);
                    }
                    return Ok(self.default_backend());
                }
            }
        }

        if self.strict_model_matching && !model.is_empty() && !matched_by_model {
            return Err(RouteOutcome::ModelNotAllowed);
        }

        Ok(self.default_backend())
    }
}
