//! Error types for the poster proxy.
//!
//! `FetchError` is the resolve/fetch taxonomy the proxy endpoint maps onto
//! HTTP responses; `AppError` covers startup and configuration. A single
//! request can only end in image bytes, a soft "not found", a soft "retry
//! later", or a gateway-style fetch failure.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced while resolving or fetching a poster.
#[derive(Error, Debug)]
pub enum FetchError {
    /// No candidate image passes selection and nothing is cached. Callers
    /// fall through to an external fallback provider; not a system fault.
    #[error("no acceptable image")]
    NotFound,

    /// Upstream is rate-limiting; retry after the given number of seconds.
    #[error("upstream throttled: {reason}")]
    UpstreamThrottled { reason: String, retry_after_secs: u64 },

    /// Upstream rejected our credentials even after a forced refresh.
    #[error("upstream authorization expired")]
    AuthExpired,

    /// Upstream returned HTTP 200 with something that is not image bytes.
    #[error("upstream returned a non-image payload: {detail}")]
    NonImagePayload { detail: String },

    /// Login refused with a lockout-style code. Carries the server's clock
    /// when reported, so backoff deadlines anchor on upstream time.
    #[error("upstream login lockout: {message}")]
    LoginLockout {
        message: String,
        server_time: Option<DateTime<Utc>>,
    },

    /// Any other upstream failure (non-200, malformed body, timeout).
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),
}

impl FetchError {
    pub fn upstream<S: Into<String>>(message: S) -> Self {
        Self::Upstream(message.into())
    }

    pub fn throttled<S: Into<String>>(reason: S, retry_after: chrono::Duration) -> Self {
        Self::UpstreamThrottled {
            reason: reason.into(),
            retry_after_secs: retry_after.num_seconds().max(0) as u64,
        }
    }
}

/// Top-level application error, used during startup and wiring.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl AppError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
