//! One pass over the source catalog, submitting a job per asset.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{EnqueueError, QueueError};
use crate::queue::{AddResult, JobQueue, NewJob};
use crate::storage::AssetCatalog;

/// Result of an enqueue pass, in the shape reported to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueSummary {
    /// Jobs newly added to the queue.
    #[serde(rename = "enqueuedCount")]
    pub enqueued_count: usize,
    /// Listed assets whose job id the queue already knew.
    pub duplicates: usize,
}

impl EnqueueSummary {
    /// Number of assets in the listing.
    pub fn listed(&self) -> usize {
        self.enqueued_count + self.duplicates
    }
}

pub struct Enqueuer {
    catalog: Arc<dyn AssetCatalog>,
    queue: Arc<dyn JobQueue>,
}

impl Enqueuer {
    pub fn new(catalog: Arc<dyn AssetCatalog>, queue: Arc<dyn JobQueue>) -> Self {
        Self { catalog, queue }
    }

    /// Lists the catalog and submits job `video-<i>` for the asset at position `i`.
    ///
    /// Submissions run concurrently and all of them settle before this
    /// returns. An empty listing touches the queue not at all.
    pub async fn enqueue_all(&self) -> Result<EnqueueSummary, EnqueueError> {
        let urls = self.catalog.list_fetch_urls().await?;
        if urls.is_empty() {
            info!("No source assets to enqueue");
            return Ok(EnqueueSummary::default());
        }

        let total = urls.len();
        let mut submissions = JoinSet::new();
        for (index, url) in urls.into_iter().enumerate() {
            let queue = self.queue.clone();
            let job = NewJob::for_listing_position(index, url);
            submissions.spawn(async move {
                let id = job.id.clone();
                (id, queue.add(job).await)
            });
        }

        let mut summary = EnqueueSummary::default();
        let mut failures: Vec<QueueError> = Vec::new();

        while let Some(joined) = submissions.join_next().await {
            match joined {
                Ok((id, Ok(AddResult::Added))) => {
                    debug!(job_id = %id, "Job enqueued");
                    summary.enqueued_count += 1;
                }
                Ok((id, Ok(AddResult::Duplicate))) => {
                    debug!(job_id = %id, "Job already queued");
                    summary.duplicates += 1;
                }
                Ok((id, Err(e))) => {
                    error!(job_id = %id, error = %e, "Failed to enqueue job");
                    failures.push(e);
                }
                Err(e) => {
                    error!(error = %e, "Enqueue task aborted");
                    failures.push(QueueError::EnqueueFailed(e.to_string()));
                }
            }
        }

        let failed = failures.len();
        if let Some(first) = failures.into_iter().next() {
            return Err(EnqueueError::Submit {
                failed,
                total,
                first,
            });
        }

        info!(
            enqueued = summary.enqueued_count,
            duplicates = summary.duplicates,
            "Enqueue pass finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::StorageError;
    use crate::queue::MockJobQueue;
    use crate::storage::catalog::MockAssetCatalog;

    fn catalog_of(urls: &[&str]) -> MockAssetCatalog {
        let urls: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
        let mut catalog = MockAssetCatalog::new();
        catalog
            .expect_list_fetch_urls()
            .times(1)
            .returning(move || Ok(urls.clone()));
        catalog
    }

    #[tokio::test]
    async fn submits_one_job_per_listed_asset() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut queue = MockJobQueue::new();
        {
            let seen = seen.clone();
            queue.expect_add().times(3).returning(move |job| {
                seen.lock().unwrap().push((job.id, job.data.file_url));
                Ok(AddResult::Added)
            });
        }

        let enqueuer = Enqueuer::new(
            Arc::new(catalog_of(&["https://src/a.mp4", "https://src/b.mp4", "https://src/c.mp4"])),
            Arc::new(queue),
        );
        let summary = enqueuer.enqueue_all().await.unwrap();

        assert_eq!(summary.enqueued_count, 3);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("video-0".to_string(), "https://src/a.mp4".to_string()),
                ("video-1".to_string(), "https://src/b.mp4".to_string()),
                ("video-2".to_string(), "https://src/c.mp4".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_listing_never_touches_queue() {
        let mut queue = MockJobQueue::new();
        queue.expect_add().never();

        let enqueuer = Enqueuer::new(Arc::new(catalog_of(&[])), Arc::new(queue));

        assert_eq!(enqueuer.enqueue_all().await.unwrap(), EnqueueSummary::default());
    }

    #[tokio::test]
    async fn duplicates_are_reported_separately() {
        let mut queue = MockJobQueue::new();
        queue.expect_add().times(2).returning(|job| {
            Ok(if job.id == "video-0" {
                AddResult::Duplicate
            } else {
                AddResult::Added
            })
        });

        let enqueuer = Enqueuer::new(
            Arc::new(catalog_of(&["https://src/a.mp4", "https://src/b.mp4"])),
            Arc::new(queue),
        );
        let summary = enqueuer.enqueue_all().await.unwrap();

        assert_eq!(summary.enqueued_count, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.listed(), 2);
        assert_eq!(
            serde_json::to_string(&summary).unwrap(),
            r#"{"enqueuedCount":1,"duplicates":1}"#
        );
    }

    #[tokio::test]
    async fn failed_submission_fails_pass_after_all_settle() {
        let mut queue = MockJobQueue::new();
        queue.expect_add().times(3).returning(|job| {
            if job.id == "video-1" {
                Err(QueueError::EnqueueFailed("connection reset".to_string()))
            } else {
                Ok(AddResult::Added)
            }
        });

        let enqueuer = Enqueuer::new(
            Arc::new(catalog_of(&["https://src/a.mp4", "https://src/b.mp4", "https://src/c.mp4"])),
            Arc::new(queue),
        );
        let err = enqueuer.enqueue_all().await.unwrap_err();

        match err {
            EnqueueError::Submit { failed, total, .. } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn listing_failure_is_reported() {
        let mut catalog = MockAssetCatalog::new();
        catalog.expect_list_fetch_urls().returning(|| {
            Err(StorageError::ListFailed {
                bucket: "src".to_string(),
                message: "access denied".to_string(),
            })
        });
        let mut queue = MockJobQueue::new();
        queue.expect_add().never();

        let enqueuer = Enqueuer::new(Arc::new(catalog), Arc::new(queue));

        assert!(matches!(
            enqueuer.enqueue_all().await.unwrap_err(),
            EnqueueError::Listing(_)
        ));
    }
}
