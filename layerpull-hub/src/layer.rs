use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};

/// Opaque, content-addressed identifier of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LayerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered ancestry of an image, root layer first and leaf layer last.
///
/// This is the only source of apply order. It is never empty and never
/// contains the same layer twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerChain {
    layers: Vec<LayerId>,
}

impl LayerChain {
    /// Build a chain from layers listed root first.
    pub fn new(layers: Vec<LayerId>) -> Result<Self> {
        if layers.is_empty() {
            return Err(HubError::Chain("chain is empty".to_string()));
        }
        let mut seen = HashSet::with_capacity(layers.len());
        for id in &layers {
            if !seen.insert(id) {
                return Err(HubError::Chain(format!("layer {} appears twice", id)));
            }
        }
        Ok(Self { layers })
    }

    /// Build a chain from a registry ancestry listing, which names the leaf
    /// first and the root last.
    pub fn from_ancestry(mut ancestry: Vec<LayerId>) -> Result<Self> {
        ancestry.reverse();
        Self::new(ancestry)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LayerId> {
        self.layers.iter()
    }

    pub fn root(&self) -> &LayerId {
        &self.layers[0]
    }

    pub fn leaf(&self) -> &LayerId {
        &self.layers[self.layers.len() - 1]
    }

    pub fn position_of(&self, id: &LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l == id)
    }

    pub fn as_slice(&self) -> &[LayerId] {
        &self.layers
    }
}

impl<'a> IntoIterator for &'a LayerChain {
    type Item = &'a LayerId;
    type IntoIter = std::slice::Iter<'a, LayerId>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}

/// Owned, single-read layer byte source.
///
/// The underlying resource is released when the stream is closed or dropped,
/// whichever comes first; `close` consumes the stream so it cannot be used
/// afterwards.
pub struct LayerStream {
    inner: Box<dyn Read + Send>,
}

impl LayerStream {
    /// Wrap an already-downloaded spool file, rewinding it to the start.
    pub fn spooled(mut file: std::fs::File) -> io::Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner: Box::new(file),
        })
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        Self {
            inner: Box::new(reader),
        }
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Read for LayerStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl fmt::Debug for LayerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStream").finish_non_exhaustive()
    }
}

/// A downloaded layer: its byte stream, its metadata blob, and its size.
#[derive(Debug)]
pub struct FetchedLayer {
    pub id: LayerId,
    pub stream: LayerStream,
    /// Layer JSON exactly as served by the registry.
    pub metadata: Vec<u8>,
    /// Layer size in bytes.
    pub size: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
