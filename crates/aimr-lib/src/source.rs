//! Where a generator bundle comes from when the local cache misses.

use std::path::{Path, PathBuf};

use aimr_common::model::{TOPOLOGY_FILE, WEIGHTS_FILE};

use crate::error::{LibError, Result};

/// Files making up a generator bundle.
pub const BUNDLE_FILES: [&str; 2] = [TOPOLOGY_FILE, WEIGHTS_FILE];

/// A place a generator bundle can be copied from.
pub trait ModelSource: Send {
    /// Human-readable location, for logs.
    fn location(&self) -> String;

    /// Write every file of the bundle into `dir`, creating it if needed.
    fn fetch_into(&self, dir: &Path) -> Result<()>;
}

/// Bundle stored in a local directory (shared drive, mounted volume).
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl ModelSource for DirectorySource {
    fn location(&self) -> String {
        self.root.display().to_string()
    }

    fn fetch_into(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for name in BUNDLE_FILES {
            let from = self.root.join(name);
            std::fs::copy(&from, dir.join(name)).map_err(|e| LibError::Fetch {
                url: from.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Bundle served over HTTP: `<base>/model.json` and `<base>/weights.safetensors`.
#[cfg(feature = "remote")]
pub struct RemoteSource {
    base_url: String,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "remote")]
impl RemoteSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| LibError::Fetch {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        let fail = |reason: String| LibError::Fetch {
            url: url.to_string(),
            reason,
        };
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| fail(e.to_string()))?
            .error_for_status()
            .map_err(|e| fail(e.to_string()))?;
        let bytes = response.bytes().map_err(|e| fail(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(feature = "remote")]
impl ModelSource for RemoteSource {
    fn location(&self) -> String {
        self.base_url.clone()
    }

    fn fetch_into(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        // nothing is written until every file has downloaded
        let mut files = Vec::with_capacity(BUNDLE_FILES.len());
        for name in BUNDLE_FILES {
            let url = self.url_for(name);
            tracing::debug!(url = %url, "downloading");
            files.push((name, self.download(&url)?));
        }
        for (name, bytes) in files {
            std::fs::write(dir.join(name), bytes)?;
        }
        Ok(())
    }
}
