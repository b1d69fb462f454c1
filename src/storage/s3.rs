//! S3-compatible bucket access for listing, presigning, and uploads.

use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::config::model::{CredentialsConfig, DestinationConfig, SourceConfig};
use crate::error::StorageError;

/// Connection settings for one bucket.
#[derive(Debug, Clone)]
pub struct BucketSettings<'a> {
    pub endpoint: Option<&'a str>,
    pub region: &'a str,
    pub bucket: &'a str,
    pub credentials: &'a CredentialsConfig,
    pub force_path_style: bool,
}

impl<'a> From<&'a SourceConfig> for BucketSettings<'a> {
    fn from(config: &'a SourceConfig) -> Self {
        Self {
            endpoint: config.endpoint.as_deref(),
            region: &config.region,
            bucket: &config.bucket,
            credentials: &config.credentials,
            force_path_style: config.force_path_style,
        }
    }
}

impl<'a> From<&'a DestinationConfig> for BucketSettings<'a> {
    fn from(config: &'a DestinationConfig) -> Self {
        Self {
            endpoint: config.endpoint.as_deref(),
            region: &config.region,
            bucket: &config.bucket,
            credentials: &config.credentials,
            force_path_style: config.force_path_style,
        }
    }
}

/// A client bound to a single bucket with its own endpoint and credentials.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Builds a client, reading credentials from the configured environment variables.
    pub fn new(settings: BucketSettings<'_>) -> Result<Self, StorageError> {
        let access_key_id = read_env(&settings.credentials.access_key_id_env)?;
        let secret_access_key = read_env(&settings.credentials.secret_access_key_env)?;
        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "static");

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.to_string()))
            .credentials_provider(credentials)
            .force_path_style(settings.force_path_style);

        if let Some(endpoint) = settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(
            bucket = settings.bucket,
            region = settings.region,
            endpoint = ?settings.endpoint,
            "Configured S3 client"
        );

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Lists every object key in the bucket, following continuation tokens.
    pub async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| StorageError::ListFailed {
                    bucket: self.bucket.clone(),
                    message: DisplayErrorContext(&e).to_string(),
                })?;

            for object in response.contents() {
                match object.key() {
                    Some(key) => keys.push(key.to_string()),
                    None => warn!(bucket = %self.bucket, "Skipping listed object without a key"),
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(bucket = %self.bucket, count = keys.len(), "Listed bucket");
        Ok(keys)
    }

    /// Returns a time-limited GET URL for `key`.
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let presign_error = |message: String| StorageError::PresignFailed {
            key: key.to_string(),
            message,
        };

        let presign_config =
            PresigningConfig::expires_in(expires_in).map_err(|e| presign_error(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| presign_error(DisplayErrorContext(&e).to_string()))?;

        Ok(presigned.uri().to_string())
    }

    /// Uploads a local file, streaming it from disk.
    pub async fn put_file(&self, path: &Path, key: &str, content_type: &str) -> Result<(), StorageError> {
        let upload_error = |message: String| StorageError::UploadFailed {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            message,
        };

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| upload_error(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| upload_error(DisplayErrorContext(&e).to_string()))?;

        info!(bucket = %self.bucket, key, "Upload successful");
        Ok(())
    }
}

fn read_env(var: &str) -> Result<String, StorageError> {
    std::env::var(var).map_err(|_| StorageError::MissingCredential {
        var: var.to_string(),
    })
}
