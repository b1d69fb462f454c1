//! Object storage access: presigned URL downloads, destination uploads, and
//! the source asset listing.

pub mod catalog;
pub mod http;
pub mod s3;

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::error::StorageError;

pub use catalog::{AssetCatalog, S3Catalog};
pub use http::HttpDownloader;
pub use s3::S3Store;

/// Read and write operations the job pipeline needs from storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Streams the content at `url` into `dest`, replacing any existing file.
    /// Returns the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, StorageError>;

    /// Uploads the file at `path` to the destination bucket under `key`.
    async fn upload(&self, path: &Path, key: &str) -> Result<(), StorageError>;
}

/// Storage backed by plain HTTP for source reads and an S3 bucket for writes.
///
/// Built once per worker process and shared between jobs.
pub struct StorageClient {
    downloader: HttpDownloader,
    destination: S3Store,
    content_type: String,
}

impl StorageClient {
    pub fn new(downloader: HttpDownloader, destination: S3Store, content_type: impl Into<String>) -> Self {
        Self {
            downloader,
            destination,
            content_type: content_type.into(),
        }
    }
}

#[async_trait]
impl Storage for StorageClient {
    async fn download(&self, url: &str, dest: &Path) -> Result<u64, StorageError> {
        self.downloader.download(url, dest).await
    }

    async fn upload(&self, path: &Path, key: &str) -> Result<(), StorageError> {
        info!(key, bucket = self.destination.bucket(), "Uploading compressed file");
        self.destination.put_file(path, key, &self.content_type).await
    }
}

/// Strips the query string from a URL so presigned signatures stay out of logs.
pub fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    }
}
