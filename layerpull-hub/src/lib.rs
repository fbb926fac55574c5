//! Registry access and layer application for `layerpull`.
//!
//! [`registry::HubClient`] talks to a v1-style image index and its registry
//! endpoints; [`unpack::apply_layer`] merges one layer archive onto a
//! destination directory.

pub mod error;
pub mod layer;
pub mod registry;
pub mod unpack;

pub use error::{EndpointFailure, FetchError, HubError, Result};
pub use layer::{FetchedLayer, LayerChain, LayerId, LayerStream};
pub use registry::{HubClient, ImageName, RepositoryData, DEFAULT_INDEX};
