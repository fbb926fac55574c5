//! Layer pipeline driver.
//!
//! One pull resolves the image's layer chain, downloads every layer through
//! the [`Scheduler`], then applies the layers to the destination strictly in
//! chain order, optionally recording each one as a snapshot.
//!
//! ```no_run
//! use layerpull::{PullConfig, Puller};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let puller = Puller::new(PullConfig::default())?;
//!     let report = puller.pull_image("busybox:latest", Path::new("/tmp/rootfs")).await?;
//!     println!("applied {} layers", report.layers.len());
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use layerpull_hub::{FetchedLayer, HubClient, ImageName, LayerId};
use tracing::{debug, info};

use crate::apply::{LayerApplier, TarApplier};
use crate::config::PullConfig;
use crate::error::LayerFailure;
use crate::scheduler::{BatchError, FetchJob, Scheduler};
use crate::snapshot::{branch_name, commit_message, GitSnapshotter, NoopSnapshotter, Snapshotter};
use crate::source::LayerSource;
use crate::{Error, Result};

/// Whether and how applied layers are recorded.
pub enum Layering<'a> {
    /// Merge every layer into one flat tree with no history.
    Flat,
    /// Record each layer as its own branch + commit.
    Snapshots(&'a mut dyn Snapshotter),
}

/// Outcome of a successful pull.
#[derive(Debug, Clone)]
pub struct PullReport {
    pub image: ImageName,
    pub leaf: LayerId,
    /// Layers in the order they were applied, root first.
    pub layers: Vec<LayerId>,
    /// Sum of the layer sizes reported by the source.
    pub bytes: u64,
    pub destination: PathBuf,
}

/// Pulls images onto a destination directory.
pub struct Puller {
    source: Arc<dyn LayerSource>,
    applier: Arc<dyn LayerApplier>,
    config: PullConfig,
}

impl Puller {
    /// Puller backed by the registry client and the tar applier.
    pub fn new(config: PullConfig) -> Result<Self> {
        let client = HubClient::new(&config.user_agent)
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Self::with_parts(Arc::new(client), Arc::new(TarApplier), config)
    }

    /// Puller with caller-supplied collaborators.
    pub fn with_parts(
        source: Arc<dyn LayerSource>,
        applier: Arc<dyn LayerApplier>,
        config: PullConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            applier,
            config,
        })
    }

    pub fn config(&self) -> &PullConfig {
        &self.config
    }

    /// Parse `reference` (`[index/]name[:tag]`) against the configured index.
    pub fn parse_reference(&self, reference: &str) -> Result<ImageName> {
        ImageName::parse(reference, &self.config.index)
            .map_err(|e| Error::Config(format!("invalid image reference '{}': {}", reference, e)))
    }

    /// Download an image as one flattened tree.
    pub async fn pull_image(&self, reference: &str, dest: &Path) -> Result<PullReport> {
        let image = self.parse_reference(reference)?;
        self.pull(&image, dest, Layering::Flat).await
    }

    /// Download an image with every layer committed on its own git branch,
    /// each branch stacked on the previous one.
    pub async fn pull_repository(&self, reference: &str, dest: &Path) -> Result<PullReport> {
        let image = self.parse_reference(reference)?;
        let mut git = GitSnapshotter::new();
        self.pull(&image, dest, Layering::Snapshots(&mut git)).await
    }

    /// Run one full pull of `image` onto `dest`.
    pub async fn pull(
        &self,
        image: &ImageName,
        dest: &Path,
        layering: Layering<'_>,
    ) -> Result<PullReport> {
        let mut noop = NoopSnapshotter;
        let (snapshots, layered): (&mut dyn Snapshotter, bool) = match layering {
            Layering::Flat => (&mut noop, false),
            Layering::Snapshots(s) => (s, true),
        };

        info!(
            index = %image.index,
            repository = %image.repository,
            tag = %image.tag,
            layered,
            "pulling image",
        );

        // 1. Repository endpoints + tokens.
        let repo = self
            .source
            .resolve_repository(image)
            .await
            .map_err(|source| Error::MetadataResolution {
                image: image.repository.clone(),
                source,
            })?;

        // 2. Tag -> leaf layer.
        let tags = self
            .source
            .resolve_tags(image, &repo)
            .await
            .map_err(|source| Error::TagResolution {
                image: image.repository.clone(),
                tag: image.tag.clone(),
                source: Some(source),
            })?;
        let leaf = tags
            .get(&image.tag)
            .cloned()
            .ok_or_else(|| Error::TagResolution {
                image: image.repository.clone(),
                tag: image.tag.clone(),
                source: None,
            })?;
        info!(layer = %leaf, "resolved image id");

        // 3. Leaf -> chain. Fetched once; the only source of apply order.
        let chain = self
            .source
            .resolve_chain(&leaf, &repo)
            .await
            .map_err(|source| Error::HistoryResolution {
                leaf: leaf.clone(),
                source,
            })?;

        // 4. Destination.
        create_destination(dest)
            .await
            .map_err(|source| Error::Destination {
                path: dest.to_path_buf(),
                source,
            })?;

        // 5. Snapshot root.
        if layered {
            snapshots
                .init_root(dest)
                .await
                .map_err(|source| Error::SnapshotInit {
                    path: dest.to_path_buf(),
                    source,
                })?;
        }

        // 6. Fetch every layer; order of completion does not matter.
        info!(layers = chain.len(), concurrency = self.config.concurrency, "pulling layers");
        let repo = Arc::new(repo);
        let scheduler = Scheduler::new(self.config.concurrency, self.config.job_timeout)?;
        for id in &chain {
            let job = FetchJob::new(id.clone(), Arc::clone(&self.source), Arc::clone(&repo));
            scheduler.enqueue(job).await;
        }
        let mut batch = scheduler.finish().await;
        let stats = batch.stats();
        info!(
            completed = stats.completed,
            failed = stats.failed,
            peak_in_flight = stats.peak_in_flight,
            "downloads finished",
        );

        // 7. Apply strictly in chain order.
        let mut applied = Vec::with_capacity(chain.len());
        let mut bytes = 0u64;
        for (position, id) in chain.iter().enumerate() {
            let abort = |cause: LayerFailure| Error::ApplyAborted {
                position,
                layer: id.clone(),
                cause,
            };

            let FetchedLayer {
                stream,
                metadata,
                size,
                ..
            } = batch.take(id).map_err(|e| {
                abort(match e {
                    BatchError::NotFound(_) => LayerFailure::Missing,
                    BatchError::Failed(fetch) => LayerFailure::Fetch(fetch),
                })
            })?;

            if layered {
                snapshots
                    .branch(&branch_name(position, id))
                    .await
                    .map_err(|source| Error::Branch {
                        position,
                        layer: id.clone(),
                        source,
                    })?;
            }

            // The applier owns the stream from here and releases it on
            // every path.
            let entries = self
                .applier
                .apply(stream, dest)
                .await
                .map_err(|e| abort(LayerFailure::Apply(e)))?;

            self.persist(dest, &self.config.metadata_file, &metadata)
                .await
                .map_err(&abort)?;
            if layered {
                self.persist(dest, &self.config.size_file, size.to_string().as_bytes())
                    .await
                    .map_err(&abort)?;

                snapshots
                    .commit_all(&commit_message(position))
                    .await
                    .map_err(|source| Error::Commit {
                        position,
                        layer: id.clone(),
                        source,
                    })?;
            }

            debug!(layer = %id, position, entries, size, "layer applied");
            bytes += size;
            applied.push(id.clone());
        }

        info!(layers = applied.len(), bytes, dest = %dest.display(), "pull complete");
        Ok(PullReport {
            image: image.clone(),
            leaf,
            layers: applied,
            bytes,
            destination: dest.to_path_buf(),
        })
    }

    async fn persist(
        &self,
        dest: &Path,
        file: &str,
        contents: &[u8],
    ) -> std::result::Result<(), LayerFailure> {
        tokio::fs::write(dest.join(file), contents)
            .await
            .map_err(|source| LayerFailure::Persist {
                file: file.to_string(),
                source,
            })
    }
}

async fn create_destination(dest: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(dest).await
}
