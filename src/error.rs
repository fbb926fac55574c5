//! Error types for layerpull

use std::path::PathBuf;

use layerpull_hub::{FetchError, HubError, LayerId};
use thiserror::Error;

use crate::snapshot::SnapshotError;

/// Result type alias using layerpull Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a pull.
///
/// Every variant names the stage it came from; the ones raised inside the
/// apply loop also name the layer and its chain position.
#[derive(Error, Debug)]
pub enum Error {
    /// The index could not locate the repository
    #[error("failed to resolve repository {image}: {source}")]
    MetadataResolution {
        image: String,
        #[source]
        source: HubError,
    },

    /// The tag is unknown or the tag listing could not be fetched
    #[error("failed to resolve tag {tag} of {image}{}", describe(.source))]
    TagResolution {
        image: String,
        tag: String,
        #[source]
        source: Option<HubError>,
    },

    /// No endpoint could produce the layer chain
    #[error("failed to resolve history of layer {leaf}: {source}")]
    HistoryResolution {
        leaf: LayerId,
        #[source]
        source: HubError,
    },

    /// The destination directory could not be prepared
    #[error("failed to prepare destination {}: {source}", .path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The snapshot root could not be created at the destination
    #[error("failed to initialise snapshot root at {}: {source}", .path.display())]
    SnapshotInit {
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },

    /// The ordered apply loop stopped at this layer
    #[error("pull aborted at layer {position} ({layer}): {cause}")]
    ApplyAborted {
        position: usize,
        layer: LayerId,
        #[source]
        cause: LayerFailure,
    },

    /// A per-layer branch could not be opened
    #[error("failed to branch for layer {position} ({layer}): {source}")]
    Branch {
        position: usize,
        layer: LayerId,
        #[source]
        source: SnapshotError,
    },

    /// A per-layer commit could not be recorded
    #[error("failed to commit layer {position} ({layer}): {source}")]
    Commit {
        position: usize,
        layer: LayerId,
        #[source]
        source: SnapshotError,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Why a single layer could not be applied.
#[derive(Error, Debug)]
pub enum LayerFailure {
    /// The download failed on every endpoint (or timed out, or panicked)
    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),

    /// The layer was never part of the fetch batch
    #[error("layer was not scheduled for download")]
    Missing,

    /// The archive could not be merged onto the destination
    #[error("apply failed: {0}")]
    Apply(#[source] HubError),

    /// A well-known file could not be written after applying
    #[error("failed to write {file}: {source}")]
    Persist {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Chain position of the failing layer, for errors raised in the apply loop.
    pub fn position(&self) -> Option<usize> {
        match self {
            Error::ApplyAborted { position, .. }
            | Error::Branch { position, .. }
            | Error::Commit { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// Failing layer, for errors raised in the apply loop.
    pub fn layer(&self) -> Option<&LayerId> {
        match self {
            Error::ApplyAborted { layer, .. }
            | Error::Branch { layer, .. }
            | Error::Commit { layer, .. } => Some(layer),
            Error::HistoryResolution { leaf, .. } => Some(leaf),
            _ => None,
        }
    }
}

fn describe(source: &Option<HubError>) -> String {
    match source {
        Some(e) => format!(": {}", e),
        None => ": tag not found".to_string(),
    }
}
