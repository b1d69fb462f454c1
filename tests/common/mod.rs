//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use video_compress_pipeline::config::model::{JobOptions, StageRetries};
use video_compress_pipeline::error::{StorageError, TranscodeError};
use video_compress_pipeline::pipeline::Pipeline;
use video_compress_pipeline::queue::{Job, NewJob};
use video_compress_pipeline::storage::{AssetCatalog, Storage};
use video_compress_pipeline::transcode::Transcoder;
use walkdir::WalkDir;

pub const SOURCE_BYTES: &[u8] = b"original video bytes";

/// Storage that writes fixed bytes on download and records uploads by key.
#[derive(Default)]
pub struct FakeStorage {
    download_failures: AtomicU32,
    upload_failures: AtomicU32,
    pub download_calls: AtomicU32,
    pub upload_calls: AtomicU32,
    pub uploads: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeStorage {
    /// Fails the first `n` downloads.
    pub fn failing_downloads(self, n: u32) -> Self {
        self.download_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fails the first `n` uploads.
    pub fn failing_uploads(self, n: u32) -> Self {
        self.upload_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn uploaded_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.uploads.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Storage for FakeStorage {
    async fn download(&self, _url: &str, dest: &Path) -> Result<u64, StorageError> {
        let attempt = self.download_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.download_failures) {
            return Err(StorageError::HttpStatus {
                url: format!("attempt-{}", attempt),
                status: 503,
            });
        }

        tokio::fs::write(dest, SOURCE_BYTES).await.unwrap();
        Ok(SOURCE_BYTES.len() as u64)
    }

    async fn upload(&self, path: &Path, key: &str) -> Result<(), StorageError> {
        let attempt = self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.upload_failures) {
            return Err(StorageError::UploadFailed {
                bucket: "dest".to_string(),
                key: key.to_string(),
                message: format!("attempt-{}", attempt),
            });
        }

        let body = tokio::fs::read(path).await.unwrap();
        self.uploads.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }
}

/// Transcoder that halves the input, optionally failing the first attempts.
#[derive(Default)]
pub struct FakeTranscoder {
    failures: AtomicU32,
    pub calls: AtomicU32,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
    /// Most files seen in a job directory during any call.
    pub max_scratch_files: AtomicUsize,
    delay: Duration,
}

impl FakeTranscoder {
    pub fn failing(self, n: u32) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn compress(&self, input: &Path, output: &Path) -> Result<(), TranscodeError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let dir_entries = std::fs::read_dir(input.parent().unwrap()).unwrap().count();
        self.max_scratch_files.fetch_max(dir_entries, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if take_failure(&self.failures) {
            // Leave a partial file behind the way a crashed encoder would.
            tokio::fs::write(output, b"partial").await.unwrap();
            return Err(TranscodeError::EngineFailed {
                code: 1,
                stderr: format!("attempt {}", attempt),
            });
        }

        let source = tokio::fs::read(input).await.unwrap();
        tokio::fs::write(output, &source[..source.len() / 2]).await.unwrap();
        Ok(())
    }
}

/// Catalog returning a fixed listing.
pub struct FixedCatalog(pub Vec<String>);

#[async_trait]
impl AssetCatalog for FixedCatalog {
    async fn list_fetch_urls(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.0.clone())
    }
}

pub fn retries(download: u32, transcode: u32, upload: u32) -> StageRetries {
    StageRetries {
        download,
        transcode,
        upload,
    }
}

pub fn pipeline(
    storage: &Arc<FakeStorage>,
    transcoder: &Arc<FakeTranscoder>,
    scratch: &Path,
    budgets: StageRetries,
) -> Pipeline {
    Pipeline::new(storage.clone(), transcoder.clone(), scratch, budgets)
}

pub fn job(index: usize, url: &str) -> Job {
    let mut job = Job::new(NewJob::for_listing_position(index, url), &JobOptions::default());
    job.start();
    job
}

/// Every path left under `root`.
pub fn leftovers(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.into_path())
        .collect()
}
