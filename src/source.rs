//! Where layers come from.
//!
//! [`LayerSource`] is the metadata + stream provider the pull driver consumes.
//! [`HubClient`] is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use layerpull_hub::{
    FetchError, FetchedLayer, HubClient, HubError, ImageName, LayerChain, LayerId, RepositoryData,
};
use secrecy::SecretString;
use tracing::warn;

#[async_trait]
pub trait LayerSource: Send + Sync + 'static {
    /// Locate the repository and obtain its endpoints and access tokens.
    async fn resolve_repository(&self, image: &ImageName) -> Result<RepositoryData, HubError>;

    /// List the repository's tags.
    async fn resolve_tags(
        &self,
        image: &ImageName,
        repo: &RepositoryData,
    ) -> Result<HashMap<String, LayerId>, HubError>;

    /// Walk the ancestry of `leaf` on one endpoint.
    async fn resolve_ancestry(
        &self,
        leaf: &LayerId,
        endpoint: &str,
        tokens: &[SecretString],
    ) -> Result<LayerChain, HubError>;

    /// Download one layer, failing over across the repository's endpoints.
    async fn fetch_layer(
        &self,
        id: &LayerId,
        repo: &RepositoryData,
    ) -> Result<FetchedLayer, FetchError>;

    /// Resolve the chain for `leaf`, trying each endpoint in order.
    ///
    /// The first endpoint that answers wins; the last error is returned when
    /// none does.
    async fn resolve_chain(
        &self,
        leaf: &LayerId,
        repo: &RepositoryData,
    ) -> Result<LayerChain, HubError> {
        let mut last_err = HubError::Registry("no endpoints to resolve history from".to_string());
        for endpoint in &repo.endpoints {
            match self.resolve_ancestry(leaf, endpoint, &repo.tokens).await {
                Ok(chain) => return Ok(chain),
                Err(e) => {
                    warn!(layer = %leaf, %endpoint, error = %e, "history lookup failed; trying next endpoint");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl LayerSource for HubClient {
    async fn resolve_repository(&self, image: &ImageName) -> Result<RepositoryData, HubError> {
        self.repository_data(image).await
    }

    async fn resolve_tags(
        &self,
        image: &ImageName,
        repo: &RepositoryData,
    ) -> Result<HashMap<String, LayerId>, HubError> {
        self.tags(&repo.endpoints, &image.repository, &repo.tokens)
            .await
    }

    async fn resolve_ancestry(
        &self,
        leaf: &LayerId,
        endpoint: &str,
        tokens: &[SecretString],
    ) -> Result<LayerChain, HubError> {
        self.ancestry(leaf, endpoint, tokens).await
    }

    async fn fetch_layer(
        &self,
        id: &LayerId,
        repo: &RepositoryData,
    ) -> Result<FetchedLayer, FetchError> {
        HubClient::fetch_layer(self, id, &repo.endpoints, &repo.tokens).await
    }
}
