//! layerpull: concurrent-fetch, ordered-apply image puller
//!
//! Reconstructs a layered filesystem image on a destination directory by
//! downloading its layer chain in parallel and applying the layers strictly
//! root first.
//!
//! # Key Features
//!
//! - **Bounded concurrency**: at most K layer downloads in flight
//! - **Ordered apply**: layers land in chain order regardless of which
//!   download finished first
//! - **Endpoint failover**: every registry endpoint is tried before a layer
//!   is given up on
//! - **Layer history**: optionally one git branch + commit per layer
//!
//! # Example
//!
//! ```no_run
//! use layerpull::{PullConfig, Puller};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let puller = Puller::new(PullConfig::default().concurrency(4))?;
//!     let report = puller
//!         .pull_repository("busybox:latest", Path::new("/tmp/busybox"))
//!         .await?;
//!     for (i, layer) in report.layers.iter().enumerate() {
//!         println!("layer{}_{}", i, layer);
//!     }
//!     Ok(())
//! }
//! ```

pub mod apply;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod scheduler;
pub mod snapshot;
pub mod source;

// Re-exports for convenience
pub use config::{load_config, PullConfig};
pub use error::{Error, LayerFailure, Result};
pub use layerpull_hub::{FetchError, FetchedLayer, ImageName, LayerChain, LayerId, LayerStream};
pub use pipeline::{Layering, PullReport, Puller};
