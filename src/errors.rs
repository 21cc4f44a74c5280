use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Parse(String),
    #[error("no source parser registered for {domain} ({url})")]
    UnknownSource { url: String, domain: String },
    #[error("failed to load {url}: {reason}")]
    Navigation { url: String, reason: String },
    #[error("{source_name} extraction looks broken on {page}: {detail}")]
    ExtractionIntegrity {
        source_name: &'static str,
        page: String,
        detail: String,
    },
    #[error("cache invariant violated: {0}")]
    CacheInvariant(String),
    #[error("{service} responded with {status}: {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },
    #[error("{service} lookup failed: {detail}")]
    Lookup {
        service: &'static str,
        detail: String,
    },
}

impl AppError {
    pub fn navigation(url: &str, reason: impl ToString) -> Self {
        AppError::Navigation {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn integrity(source_name: &'static str, page: &str, detail: impl Into<String>) -> Self {
        AppError::ExtractionIntegrity {
            source_name,
            page: page.to_string(),
            detail: detail.into(),
        }
    }

    /// Worth another attempt after a backoff: timeouts, dropped connections,
    /// rate limiting and server-side failures.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .map(|status| status.as_u16() == 429 || status.is_server_error())
                        .unwrap_or(false)
            }
            AppError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Errors that must stop a whole run instead of a single document.
    pub fn halts_run(&self) -> bool {
        matches!(self, AppError::CacheInvariant(_))
    }
}
