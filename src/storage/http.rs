//! Streaming downloads of presigned fetch URLs.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::debug;

use super::redact_url;
use crate::error::StorageError;

/// Downloads URLs straight to disk, chunk by chunk.
///
/// The timeout bounds connecting, waiting for the response, and every gap
/// between body chunks. A slow but steady transfer is never cut off.
#[derive(Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StorageError::ClientBuild(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    /// Streams `url` into `dest`, truncating any previous content.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<u64, StorageError> {
        let display_url = redact_url(url);
        let timed_out = || StorageError::Timeout {
            url: display_url.clone(),
            seconds: self.timeout.as_secs(),
        };

        let mut response = timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| timed_out())?
            .map_err(|e| StorageError::Request {
                url: display_url.clone(),
                source: e.without_url(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::HttpStatus {
                url: display_url.clone(),
                status: status.as_u16(),
            });
        }

        let io_error = |source| StorageError::Io {
            path: dest.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::create(dest).await.map_err(io_error)?;
        let mut written = 0u64;

        loop {
            let chunk = timeout(self.timeout, response.chunk())
                .await
                .map_err(|_| timed_out())?
                .map_err(|e| StorageError::Request {
                    url: display_url.clone(),
                    source: e.without_url(),
                })?;

            match chunk {
                Some(bytes) => {
                    file.write_all(&bytes).await.map_err(io_error)?;
                    written += bytes.len() as u64;
                }
                None => break,
            }
        }

        file.flush().await.map_err(io_error)?;

        debug!(url = %display_url, bytes = written, path = ?dest, "Download finished");
        Ok(written)
    }
}
