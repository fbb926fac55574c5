//! Merging a layer's archive onto the destination.

use std::path::Path;

use async_trait::async_trait;
use layerpull_hub::{unpack, HubError, LayerStream};

/// Applies one layer stream to a destination directory.
///
/// The applier takes ownership of the stream and releases it before
/// returning, whether or not the apply succeeded.
#[async_trait]
pub trait LayerApplier: Send + Sync + 'static {
    async fn apply(&self, stream: LayerStream, dest: &Path) -> Result<u64, HubError>;
}

/// Tar-archive applier with whiteout support.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarApplier;

#[async_trait]
impl LayerApplier for TarApplier {
    async fn apply(&self, mut stream: LayerStream, dest: &Path) -> Result<u64, HubError> {
        // Unpacking is CPU- and disk-bound; run on the blocking pool.
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let applied = unpack::apply_layer(&mut stream, &dest);
            stream.close();
            applied
        })
        .await
        .map_err(|e| HubError::Layer(format!("apply task panicked: {}", e)))?
    }
}
