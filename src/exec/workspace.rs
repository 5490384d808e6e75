use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static RUN_SEQ: AtomicU64 = AtomicU64::new(1);

/// The source file and artifact paths owned by exactly one run
///
/// Paths embed the server pid and a process-wide sequence number, so no two runs
/// (in any session) ever share a path. The workspace is consumed by
/// [`ArtifactCleaner::cleanup_run`](super::ArtifactCleaner::cleanup_run); if it is
/// dropped without being cleaned up, the files are removed synchronously instead.
#[derive(Debug)]
pub struct RunWorkspace {
    run_id: u64,
    source_path: PathBuf,
    artifact_path: PathBuf,
    armed: bool,
}

impl RunWorkspace {
    pub(super) fn create(work_dir: &Path, source_extension: &str) -> Self {
        let run_id = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
        let stem = format!("run-{}-{run_id}", std::process::id());
        let artifact_name = if cfg!(windows) {
            format!("{stem}.exe")
        } else {
            stem.clone()
        };

        Self {
            run_id,
            source_path: work_dir.join(format!("{stem}.{source_extension}")),
            artifact_path: work_dir.join(artifact_name),
            armed: true,
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Hands the paths over to the cleaner; the drop fallback no longer applies
    pub(super) fn disarm(mut self) -> (PathBuf, PathBuf) {
        self.armed = false;
        (
            std::mem::take(&mut self.source_path),
            std::mem::take(&mut self.artifact_path),
        )
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!("Run {} dropped without cleanup, removing files", self.run_id);
        for path in [&self.source_path, &self.artifact_path] {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::error!("Failed to delete {}: {e}", path.display());
                }
            }
        }
    }
}
