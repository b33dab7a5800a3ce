//! HTTP-facing error wrapper, adapted from the gateway's own `http` module:
//! a builder that captures the call site and an optional message, and maps
//! cleanly onto the propagation policy from .

use core::fmt;
use core::panic::Location;
use std::error::Error as StdError;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::GatewayError;

pub struct HttpErrorBuilder {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
}

impl HttpErrorBuilder {
    #[track_caller]
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            loc: Location::caller(),
            msg: None,
        }
    }

    pub fn err<T: Into<Box<dyn StdError + Sync + Send + 'static>>>(self) -> impl FnOnce(T) -> HttpError {
        move |source| HttpError {
            code: self.code,
            loc: self.loc,
            msg: self.msg,
            source: Some(source.into()),
        }
    }

    pub fn msg(self, msg: &'static str) -> HttpError {
        HttpError {
            code: self.code,
            loc: self.loc,
            msg: Some(msg),
            source: None,
        }
    }
}

pub struct HttpError {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub msg: Option<&'static str>,
    pub source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl HttpError {
    #[track_caller]
    pub fn forbidden() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::FORBIDDEN)
    }

    #[track_caller]
    pub fn not_found() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::NOT_FOUND)
    }

    #[track_caller]
    pub fn internal() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    #[track_caller]
    pub fn bad_gateway() -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_GATEWAY)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.code, self.loc)?;

        if let Some(msg) = self.msg {
            write!(f, ": {msg}")?;
        }

        if let Some(source) = self.source.as_deref() {
            write!(f, " [source: {source}")?;
            for cause in anyhow::Chain::new(source).skip(1) {
                write!(f, ", because {cause}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        error!(error = %self);
        self.code.into_response()
    }
}

/// Maps a control-plane error onto the HTTP status dictated by 's
/// propagation policy: `ModelBlocked`/`ModelNotAllowed` → 403-class,
/// `BackendUnconfigured` → 502, everything else → a generic failure.
#[track_caller]
pub fn map_gateway_error(error: GatewayError) -> HttpError {
    match error {
        GatewayError::ModelBlocked => HttpError::forbidden().msg("model is blocked"),
        GatewayError::ModelNotAllowed => HttpError::forbidden().msg("model is not allowed"),
        GatewayError::BackendUnconfigured => HttpError::bad_gateway().msg("no backend configured"),
        GatewayError::NotFound => HttpError::not_found().msg("session not found"),
        GatewayError::Rejected(_) => HttpError::forbidden().msg("session rejected"),
        GatewayError::StoreUnavailable(source) => HttpError::internal().err()(source),
        GatewayError::InvalidPattern { source, .. } => HttpError::internal().err()(source),
    }
}
