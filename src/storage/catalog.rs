//! Source asset listing.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::s3::S3Store;
use crate::error::StorageError;

/// Lists the source videos to process as time-limited fetch URLs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetCatalog: Send + Sync {
    /// Returns fetch URLs in listing order.
    async fn list_fetch_urls(&self) -> Result<Vec<String>, StorageError>;
}

/// Catalog over an S3 bucket, keeping keys that match any glob pattern.
pub struct S3Catalog {
    store: S3Store,
    patterns: Vec<glob::Pattern>,
    url_ttl: Duration,
}

impl S3Catalog {
    pub fn new(store: S3Store, patterns: &[String], url_ttl: Duration) -> Result<Self, StorageError> {
        Ok(Self {
            store,
            patterns: compile_patterns(patterns)?,
            url_ttl,
        })
    }

    /// Lists keys of the source bucket that match the configured patterns.
    pub async fn matching_keys(&self) -> Result<Vec<String>, StorageError> {
        let keys = self.store.list_keys().await?;
        Ok(filter_keys(keys, &self.patterns))
    }
}

#[async_trait]
impl AssetCatalog for S3Catalog {
    async fn list_fetch_urls(&self) -> Result<Vec<String>, StorageError> {
        let keys = self.matching_keys().await?;

        let mut urls = Vec::with_capacity(keys.len());
        for key in &keys {
            urls.push(self.store.presign_get(key, self.url_ttl).await?);
        }

        info!(bucket = self.store.bucket(), count = urls.len(), "Listed source assets");
        Ok(urls)
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<glob::Pattern>, StorageError> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|e| StorageError::InvalidKeyPattern {
                pattern: p.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

fn filter_keys(keys: Vec<String>, patterns: &[glob::Pattern]) -> Vec<String> {
    keys.into_iter()
        .filter(|key| patterns.iter().any(|p| p.matches(key)))
        .collect()
}
