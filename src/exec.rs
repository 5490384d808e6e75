mod builder;
mod cleaner;
mod process;
mod workspace;

pub use builder::{ArtifactBuilder, BuildResult};
pub use cleaner::{ArtifactCleaner, CleanupTarget};
pub use process::{ProcessEvent, ProcessHandle, ProcessStatus, StreamKind, signal_name};
pub use workspace::RunWorkspace;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, PolicyConfig};
use crate::source::{SourceCatalog, SourceRef};

/// Shared, read-only execution environment used by every session and single-shot run
pub struct ExecEnv {
    pub builder: ArtifactBuilder,
    pub cleaner: ArtifactCleaner,
    pub catalog: SourceCatalog,
    pub policy: PolicyConfig,
    work_dir: PathBuf,
    source_extension: String,
}

impl ExecEnv {
    pub fn from_config(config: &Config) -> Result<Self> {
        let work_dir = config
            .resolve_work_dir()
            .context("Unable to create work directory")?;
        log::info!("Run files are placed under {}", work_dir.display());

        Ok(Self {
            builder: ArtifactBuilder::from_config(&config.builder),
            cleaner: ArtifactCleaner::new(config.policy.cleanup_retry_delay.as_duration()),
            catalog: SourceCatalog::new(&config.programs),
            policy: config.policy.clone(),
            work_dir,
            source_extension: config.builder.source_extension.clone(),
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Allocates fresh source/artifact paths for one run
    pub fn workspace(&self) -> RunWorkspace {
        RunWorkspace::create(&self.work_dir, &self.source_extension)
    }

    /// Resolves the source, writes it to `source_path` and builds it into `artifact_path`
    ///
    /// Once `cancel` fires, no further file is written and any running build
    /// tool is killed. A write already in progress completes first, so the
    /// caller may clean up as soon as this future has returned.
    pub async fn prepare(
        &self,
        source: &SourceRef,
        source_path: &Path,
        artifact_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<BuildResult> {
        let code = tokio::select! {
            biased;
            _ = cancel.cancelled() => bail!("build cancelled"),
            code = self.catalog.resolve(source) => code?,
        };
        tokio::fs::write(source_path, format!("{code}\n"))
            .await
            .with_context(|| format!("Unable to write {}", source_path.display()))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => bail!("build cancelled"),
            built = self.builder.build(source_path, artifact_path, self.builder.timeout()) => Ok(built),
        }
    }

    pub fn spawn(&self, artifact_path: &Path) -> Result<ProcessHandle> {
        ProcessHandle::spawn(artifact_path, self.policy.output_drain_grace.as_duration())
    }
}
