//! On-disk cache of LoRA weight files, keyed by the filename derived from
//! each download URL.
//!
//! A file is downloaded into a uniquely named `.part` sibling and renamed
//! into place once complete, so the final name never refers to a partial
//! file. Two jobs racing on the same missing file both download it and the
//! last rename wins. An existing file is trusted as-is; its content is not
//! checked against the URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use comfyjob_core::assets::filename_from_url;
use comfyjob_core::error::CoreError;

/// Timeout for a whole LoRA download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("Invalid LoRA URL: {0}")]
    InvalidUrl(#[from] CoreError),

    #[error("Failed to download {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Download of {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Filesystem error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct LoraCache {
    dir: PathBuf,
    client: reqwest::Client,
}

impl LoraCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_client(reqwest::Client::new(), dir)
    }

    pub fn with_client(client: reqwest::Client, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            client,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the filename a workflow should reference for `url`.
    ///
    /// With no URL (or a blank one) `default` is returned untouched and no
    /// I/O happens. Otherwise the file is fetched unless already cached.
    pub async fn resolve(&self, url: Option<&str>, default: &str) -> Result<String, AssetError> {
        let url = match url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => url,
            None => return Ok(default.to_string()),
        };

        let filename = filename_from_url(url)?;
        let target = self.dir.join(&filename);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| AssetError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let cached = tokio::fs::try_exists(&target)
            .await
            .map_err(|source| AssetError::Io {
                path: target.clone(),
                source,
            })?;
        if cached {
            tracing::info!(filename = %filename, "LoRA already cached, skipping download");
            return Ok(filename);
        }

        tracing::info!(url, filename = %filename, "Downloading LoRA");
        let temp = self
            .dir
            .join(format!(".{filename}.{}.part", uuid::Uuid::new_v4()));

        match self.download(url, &temp).await {
            Ok(bytes) => {
                tokio::fs::rename(&temp, &target)
                    .await
                    .map_err(|source| AssetError::Io {
                        path: target.clone(),
                        source,
                    })?;
                tracing::info!(filename = %filename, bytes, "LoRA downloaded");
                Ok(filename)
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&temp).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %temp.display(), error = %rm, "Failed to remove partial download");
                    }
                }
                Err(e)
            }
        }
    }

    /// Stream `url` into `path`, returning the number of bytes written.
    async fn download(&self, url: &str, path: &Path) -> Result<u64, AssetError> {
        let request_err = |source| AssetError::Request {
            url: url.to_string(),
            source,
        };
        let io_err = |source| AssetError::Io {
            path: path.to_path_buf(),
            source,
        };

        let response = self
            .client
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(request_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(request_err)?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;

        Ok(written)
    }
}
