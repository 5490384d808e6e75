use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use super::RunWorkspace;

/// One path to delete, and whether a failed first attempt is retried
#[derive(Debug, Clone)]
pub struct CleanupTarget {
    pub path: PathBuf,
    pub retry: bool,
}

impl CleanupTarget {
    /// A compiled binary; a just-exited process may still hold it briefly
    pub fn artifact(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: true,
        }
    }

    pub fn source(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: false,
        }
    }
}

/// Best-effort deletion of run files
///
/// Failures are logged and never returned as errors. A path that is already
/// gone counts as deleted, so cleaning twice is harmless.
#[derive(Debug, Clone)]
pub struct ArtifactCleaner {
    retry_delay: Duration,
}

impl ArtifactCleaner {
    pub fn new(retry_delay: Duration) -> Self {
        Self { retry_delay }
    }

    /// Deletes both files of a finished run. Consuming the workspace makes this
    /// happen at most once per run.
    pub async fn cleanup_run(&self, workspace: RunWorkspace) -> bool {
        let run_id = workspace.run_id();
        let (source, artifact) = workspace.disarm();
        let clean = self
            .cleanup(&[CleanupTarget::source(source), CleanupTarget::artifact(artifact)])
            .await;
        if clean {
            log::debug!("Cleaned up run {run_id}");
        } else {
            log::warn!("Run {run_id} left files behind");
        }
        clean
    }

    /// Returns whether every target is gone afterwards
    pub async fn cleanup(&self, targets: &[CleanupTarget]) -> bool {
        let mut clean = true;
        for target in targets {
            clean &= self.remove(target).await;
        }
        clean
    }

    async fn remove(&self, target: &CleanupTarget) -> bool {
        let first_error = match tokio::fs::remove_file(&target.path).await {
            Ok(()) => return true,
            Err(e) if e.kind() == ErrorKind::NotFound => return true,
            Err(e) => e,
        };

        if !target.retry {
            log::error!("Failed to delete {}: {first_error}", target.path.display());
            return false;
        }

        log::debug!(
            "Failed to delete {} ({first_error}), retrying in {:?}",
            target.path.display(),
            self.retry_delay
        );
        tokio::time::sleep(self.retry_delay).await;

        match tokio::fs::remove_file(&target.path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => {
                log::error!("Failed to delete {} after retry: {e}", target.path.display());
                false
            }
        }
    }
}
