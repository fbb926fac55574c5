use std::collections::HashMap;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{EndpointFailure, FetchError, HubError, Result};
use crate::layer::{FetchedLayer, LayerChain, LayerId, LayerStream};

/// Index host used when an image name does not carry one.
pub const DEFAULT_INDEX: &str = "index.docker.io";

const HEADER_TOKEN: &str = "X-Docker-Token";
const HEADER_ENDPOINTS: &str = "X-Docker-Endpoints";
const HEADER_SIZE: &str = "X-Docker-Size";

// ---------------------------------------------------------------------------
// ImageName
// ---------------------------------------------------------------------------

/// A parsed `[index/]repository[:tag]` image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Index hostname (e.g. "index.docker.io").
    pub index: String,
    /// Repository path (e.g. "library/busybox").
    pub repository: String,
    /// Human tag (e.g. "latest").
    pub tag: String,
}

impl ImageName {
    /// Parse a raw image name, resolving against `default_index`.
    ///
    /// Supported formats:
    /// - `busybox`
    /// - `busybox:1.36`
    /// - `someuser/tool:v2`
    /// - `localhost:5000/team/tool:v2`
    pub fn parse(raw: &str, default_index: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(HubError::Registry("empty image name".to_string()));
        }

        // A tag colon always comes after the last '/', so a port in the
        // index host is never mistaken for a tag.
        let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name_part, tag) = match raw.rfind(':') {
            Some(colon) if colon > after_last_slash => (&raw[..colon], &raw[colon + 1..]),
            _ => (raw, "latest"),
        };
        if tag.is_empty() {
            return Err(HubError::Registry(format!("empty tag in image name {raw}")));
        }

        let (index, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (default_index.to_string(), name_part.to_string()),
        };

        if repository.is_empty() {
            return Err(HubError::Registry(format!("empty repository in {raw}")));
        }

        let repository = if !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            index,
            repository,
            tag: tag.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// RepositoryData
// ---------------------------------------------------------------------------

/// Endpoints and access tokens handed out by the index for one repository.
#[derive(Debug, Clone)]
pub struct RepositoryData {
    /// Registry endpoints in priority order.
    pub endpoints: Vec<String>,
    pub tokens: Vec<SecretString>,
}

/// Tag listings come either as a `{tag: id}` object or as a list of
/// `{name, layer}` records depending on registry vintage.
#[derive(Deserialize)]
#[serde(untagged)]
enum TagListing {
    Map(HashMap<String, LayerId>),
    List(Vec<TagRecord>),
}

#[derive(Deserialize)]
struct TagRecord {
    name: String,
    layer: LayerId,
}

impl From<TagListing> for HashMap<String, LayerId> {
    fn from(listing: TagListing) -> Self {
        match listing {
            TagListing::Map(m) => m,
            TagListing::List(records) => records.into_iter().map(|r| (r.name, r.layer)).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// HubClient
// ---------------------------------------------------------------------------

/// HTTP client for a v1-style image index and its registry endpoints.
#[derive(Clone)]
pub struct HubClient {
    client: reqwest::Client,
}

/// Return the base URL scheme for a host.
/// Localhost and loopback hosts default to HTTP; everything else to HTTPS.
fn host_scheme(host: &str) -> &'static str {
    let bare = host.split(':').next().unwrap_or(host);
    if bare == "localhost" || bare == "127.0.0.1" || bare == "::1" {
        "http"
    } else {
        "https"
    }
}

/// Base URL for an endpoint, which may be a bare host or a full URL.
fn base_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("{}://{}", host_scheme(endpoint), endpoint)
    }
}

impl HubClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }

    // -- public API ---------------------------------------------------------

    /// Ask the index where `image` lives and obtain access tokens.
    pub async fn repository_data(&self, image: &ImageName) -> Result<RepositoryData> {
        let url = format!(
            "{}/v1/repositories/{}/images",
            base_url(&image.index),
            image.repository
        );
        debug!(%url, "requesting repository data");

        let resp = self
            .client
            .get(&url)
            .header(HEADER_TOKEN, "true")
            .send()
            .await?;
        let resp = check_status(&url, resp).await?;

        let endpoints = header_list(resp.headers(), HEADER_ENDPOINTS);
        if endpoints.is_empty() {
            return Err(HubError::Registry(format!(
                "index response for {} carried no {} header",
                image.repository, HEADER_ENDPOINTS
            )));
        }
        let tokens = header_list(resp.headers(), HEADER_TOKEN)
            .into_iter()
            .map(SecretString::from)
            .collect();

        info!(
            repository = %image.repository,
            endpoints = ?endpoints,
            "resolved repository",
        );
        Ok(RepositoryData { endpoints, tokens })
    }

    /// List the tags of `repository`, trying each endpoint in order.
    pub async fn tags(
        &self,
        endpoints: &[String],
        repository: &str,
        tokens: &[SecretString],
    ) -> Result<HashMap<String, LayerId>> {
        let mut last_err = HubError::Registry("no endpoints to list tags from".to_string());
        for endpoint in endpoints {
            let url = format!("{}/v1/repositories/{}/tags", base_url(endpoint), repository);
            match self.get_json::<TagListing>(&url, tokens).await {
                Ok(listing) => return Ok(listing.into()),
                Err(e) => {
                    warn!(%endpoint, error = %e, "tag listing failed; trying next endpoint");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Walk the ancestry of `leaf` on a single endpoint.
    pub async fn ancestry(
        &self,
        leaf: &LayerId,
        endpoint: &str,
        tokens: &[SecretString],
    ) -> Result<LayerChain> {
        let url = format!("{}/v1/images/{}/ancestry", base_url(endpoint), leaf);
        let ancestry: Vec<LayerId> = self.get_json(&url, tokens).await?;
        LayerChain::from_ancestry(ancestry)
    }

    /// Download one layer, failing over across `endpoints` in order.
    ///
    /// Only fails once every endpoint has failed.
    pub async fn fetch_layer(
        &self,
        id: &LayerId,
        endpoints: &[String],
        tokens: &[SecretString],
    ) -> std::result::Result<FetchedLayer, FetchError> {
        if endpoints.is_empty() {
            return Err(FetchError::NoEndpoints { layer: id.clone() });
        }

        let mut attempts = Vec::new();
        for endpoint in endpoints {
            match self.fetch_layer_from(id, endpoint, tokens).await {
                Ok(layer) => {
                    debug!(layer = %id, %endpoint, size = layer.size, "layer downloaded");
                    return Ok(layer);
                }
                Err(error) => {
                    warn!(layer = %id, %endpoint, %error, "layer download failed");
                    attempts.push(EndpointFailure {
                        endpoint: endpoint.clone(),
                        error,
                    });
                }
            }
        }

        Err(FetchError::Exhausted {
            layer: id.clone(),
            attempts,
        })
    }

    // -- internals ----------------------------------------------------------

    async fn fetch_layer_from(
        &self,
        id: &LayerId,
        endpoint: &str,
        tokens: &[SecretString],
    ) -> Result<FetchedLayer> {
        let base = base_url(endpoint);

        let json_url = format!("{}/v1/images/{}/json", base, id);
        let resp = check_status(&json_url, self.get(&json_url, tokens).send().await?).await?;
        let advertised_size = resp
            .headers()
            .get(HEADER_SIZE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let metadata = resp.bytes().await?.to_vec();

        let layer_url = format!("{}/v1/images/{}/layer", base, id);
        let resp = check_status(&layer_url, self.get(&layer_url, tokens).send().await?).await?;

        // Spool the body to an anonymous temp file so the layer is fully
        // downloaded before the worker reports completion.
        let spool = tempfile::tempfile()?;
        let mut writer = tokio::fs::File::from_std(spool);
        let mut received: u64 = 0;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        let spool = writer.into_std().await;

        Ok(FetchedLayer {
            id: id.clone(),
            stream: LayerStream::spooled(spool)?,
            metadata,
            size: advertised_size.unwrap_or(received),
        })
    }

    fn get(&self, url: &str, tokens: &[SecretString]) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        if tokens.is_empty() {
            return req;
        }
        let joined = tokens
            .iter()
            .map(|t| t.expose_secret())
            .collect::<Vec<_>>()
            .join(",");
        req.header(AUTHORIZATION, format!("Token {}", joined))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        tokens: &[SecretString],
    ) -> Result<T> {
        let resp = check_status(url, self.get(url, tokens).send().await?).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn check_status(url: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        Err(HubError::NotFound(url.to_string()))
    } else if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        Err(HubError::Registry(format!(
            "GET {} returned {}: {}",
            url, status, body
        )))
    } else {
        Ok(resp)
    }
}

/// Collect every comma-separated value of `name` across repeated headers.
fn header_list(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
