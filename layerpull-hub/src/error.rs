use std::time::Duration;

use crate::layer::LayerId;

/// Errors produced by the registry client and the layer applier.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("layer error: {0}")]
    Layer(String),

    #[error("invalid layer chain: {0}")]
    Chain(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HubError>;

/// Terminal failure of a single layer download.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Every endpoint was tried and none produced a usable stream.
    #[error("layer {layer}: all {} endpoint(s) failed: {}", .attempts.len(), format_attempts(.attempts))]
    Exhausted {
        layer: LayerId,
        attempts: Vec<EndpointFailure>,
    },

    #[error("layer {layer}: no endpoints to fetch from")]
    NoEndpoints { layer: LayerId },

    #[error("layer {layer}: download exceeded {}", format_limit(.limit))]
    Timeout { layer: LayerId, limit: Duration },

    #[error("layer {layer}: download task panicked")]
    Panicked { layer: LayerId },

    #[error("layer {layer}: no worker was left to run the download")]
    Abandoned { layer: LayerId },
}

/// One endpoint's contribution to a [`FetchError::Exhausted`].
#[derive(Debug)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub error: HubError,
}

fn format_limit(limit: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*limit)
}

fn format_attempts(attempts: &[EndpointFailure]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.endpoint, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}
