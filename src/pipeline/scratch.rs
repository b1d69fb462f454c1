//! Per-job scratch directories.
//!
//! Each job works in `<root>/<job id>/`, where `root` is the worker's own
//! subdirectory of the configured scratch dir, holding at most the downloaded
//! input and the compressed output. The directory is reset when the job
//! starts and removed when it reaches a terminal state.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use url::Url;
use walkdir::WalkDir;

use crate::error::JobError;

/// Suffix appended to the source file stem for the compressed artifact.
pub const COMPRESSED_SUFFIX: &str = "-compressed";

/// Container extension of every compressed artifact.
pub const OUTPUT_EXTENSION: &str = "mp4";

/// Derives the source filename from the last path segment of a fetch URL.
///
/// The query string (where presigned signatures live) never takes part.
pub fn source_filename(file_url: &str) -> Result<String, JobError> {
    let malformed = || JobError::MalformedUrl {
        url: crate::storage::redact_url(file_url),
    };

    let url = Url::parse(file_url).map_err(|_| malformed())?;
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .ok_or_else(malformed)?;

    match name {
        "" | "." | ".." => Err(malformed()),
        name => Ok(name.to_string()),
    }
}

/// Name of the compressed artifact for a source filename (`a.mp4` -> `a-compressed.mp4`).
pub fn compressed_filename(source: &str) -> String {
    let stem = Path::new(source)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(source);

    format!("{}{}.{}", stem, COMPRESSED_SUFFIX, OUTPUT_EXTENSION)
}

/// Maps a job id or worker name onto a single safe path component.
pub fn path_component(raw: &str) -> String {
    let name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match name.as_str() {
        "" | "." | ".." => format!("job{}", name.replace('.', "_")),
        _ => name,
    }
}

/// Scratch files owned by one job.
#[derive(Debug)]
pub struct JobScratch {
    dir: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

impl JobScratch {
    /// Creates an empty job directory under `root`, discarding leftovers
    /// from an earlier delivery of the same job.
    pub async fn prepare(root: &Path, job_id: &str, source_filename: &str) -> Result<Self, JobError> {
        let dir = root.join(path_component(job_id));

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Discarded stale scratch directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(JobError::Scratch { path: dir, source }),
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| JobError::Scratch {
                path: dir.clone(),
                source,
            })?;

        Ok(Self {
            input: dir.join(source_filename),
            output: dir.join(compressed_filename(source_filename)),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Removes both files and the job directory. Failures are logged, not returned.
    pub async fn cleanup(self) {
        for path in [&self.input, &self.output] {
            remove_logged(path, tokio::fs::remove_file(path).await);
        }
        remove_logged(&self.dir, tokio::fs::remove_dir_all(&self.dir).await);
    }
}

fn remove_logged(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => debug!(path = %path.display(), "Removed scratch path"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch path"),
    }
}

/// Deletes everything under `root` left behind by a previous process.
///
/// Must only run while no job of this worker is in flight.
pub fn sweep(root: &Path) -> io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to sweep scratch path"),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_presigned_url() {
        let url = "https://bucket.s3.amazonaws.com/videos/clip.mp4?X-Amz-Signature=abc&X-Amz-Expires=3600";
        assert_eq!(source_filename(url).unwrap(), "clip.mp4");
    }

    #[test]
    fn url_without_filename_is_malformed() {
        for url in ["https://src/videos/", "https://src", "not a url", "https://src/videos/.."] {
            let err = source_filename(url).unwrap_err();
            assert!(matches!(err, JobError::MalformedUrl { .. }), "{url}");
            assert_eq!(err.stage(), None);
        }
    }

    #[test]
    fn malformed_error_hides_signature() {
        let err = source_filename("https://src/?X-Amz-Signature=secret").unwrap_err();
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn compressed_names() {
        assert_eq!(compressed_filename("a.mp4"), "a-compressed.mp4");
        assert_eq!(compressed_filename("clip.final.mp4"), "clip.final-compressed.mp4");
        assert_eq!(compressed_filename("noext"), "noext-compressed.mp4");
        assert_eq!(compressed_filename(".mp4"), ".mp4-compressed.mp4");
    }

    #[test]
    fn job_ids_become_single_components() {
        assert_eq!(path_component("video-3"), "video-3");
        assert_eq!(path_component("../etc/x"), ".._etc_x");
        assert_eq!(path_component(".."), "job__");
        assert_eq!(path_component(""), "job");
    }

    #[tokio::test]
    async fn prepare_resets_and_cleanup_removes() {
        let root = tempfile::tempdir().unwrap();

        let first = JobScratch::prepare(root.path(), "video-0", "a.mp4").await.unwrap();
        std::fs::write(first.input(), b"partial").unwrap();
        assert_eq!(first.output(), root.path().join("video-0/a-compressed.mp4"));

        // A second delivery starts from an empty directory.
        let second = JobScratch::prepare(root.path(), "video-0", "a.mp4").await.unwrap();
        assert!(!second.input().exists());

        std::fs::write(second.input(), b"in").unwrap();
        std::fs::write(second.output(), b"out").unwrap();
        let dir = second.dir().to_path_buf();
        second.cleanup().await;

        assert!(!dir.exists());
    }

    #[test]
    fn sweep_removes_leftovers() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("video-1")).unwrap();
        std::fs::write(root.path().join("video-1/a.mp4"), b"x").unwrap();
        std::fs::write(root.path().join("stray.tmp"), b"x").unwrap();

        assert_eq!(sweep(root.path()).unwrap(), 2);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert_eq!(sweep(&root.path().join("missing")).unwrap(), 0);
    }
}
