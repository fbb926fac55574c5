//! Pull configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use layerpull_hub::DEFAULT_INDEX;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default number of layers downloaded at once.
pub const DEFAULT_CONCURRENCY: usize = 7;

/// Settings for one or more pulls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PullConfig {
    /// Maximum simultaneous layer downloads (must be at least 1).
    pub concurrency: usize,
    /// Index host used for names without one.
    pub index: String,
    /// Optional per-layer download deadline, e.g. "90s" or "5m".
    #[serde(with = "humantime_opt")]
    pub job_timeout: Option<Duration>,
    /// File in the destination that receives the current layer's JSON.
    pub metadata_file: String,
    /// File in the destination that receives the current layer's size
    /// (layered pulls only).
    pub size_file: String,
    /// User-Agent sent to the index and registries.
    pub user_agent: String,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            index: DEFAULT_INDEX.to_string(),
            job_timeout: None,
            metadata_file: "json".to_string(),
            size_file: "layersize".to_string(),
            user_agent: concat!("layerpull/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl PullConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download concurrency
    pub fn concurrency(mut self, k: usize) -> Self {
        self.concurrency = k;
        self
    }

    /// Set the default index host
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    /// Set the per-layer download deadline
    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.index.trim().is_empty() {
            return Err(Error::Config("index must not be empty".to_string()));
        }
        for (key, name) in [
            ("metadata_file", &self.metadata_file),
            ("size_file", &self.size_file),
        ] {
            if name.is_empty() || name.contains('/') || name == "." || name == ".." {
                return Err(Error::Config(format!(
                    "{} must be a plain file name, got '{}'",
                    key, name
                )));
            }
        }
        if self.metadata_file == self.size_file {
            return Err(Error::Config(
                "metadata_file and size_file must differ".to_string(),
            ));
        }
        if self.job_timeout == Some(Duration::ZERO) {
            return Err(Error::Config("job_timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Load a config from YAML (`.yaml`/`.yml`) or JSON (anything else).
pub fn load_config(path: &Path) -> Result<PullConfig> {
    let raw = fs::read_to_string(path)?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let config: PullConfig = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)?
    };

    config.validate()?;
    Ok(config)
}

/// Serde adapter for `Option<Duration>` written as humantime strings.
mod humantime_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
