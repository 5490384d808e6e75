use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::process::kill_process_group;
use crate::config::BuilderConfig;

/// How long to keep reading build output once the build tool is gone
const READ_GRACE: Duration = Duration::from_millis(500);

/// Outcome of one build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
    Artifact(PathBuf),
    Diagnostic(String),
}

impl BuildResult {
    pub fn is_artifact(&self) -> bool {
        matches!(self, Self::Artifact(_))
    }
}

/// Runs the configured toolchain command on a source file
///
/// The builder never runs or deletes the artifact it produces; the caller owns it.
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    command: Vec<String>,
    timeout: Duration,
}

/// Kills the build tool's whole process group if the build is abandoned mid-way,
/// e.g. when the owning session cancels the build task.
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            kill_process_group(pid);
        }
    }
}

impl ArtifactBuilder {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn from_config(config: &BuilderConfig) -> Self {
        Self::new(config.command.clone(), config.timeout.as_duration())
    }

    /// The configured build budget
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds `source_path` into `output_path`, killing the build tool after `limit`
    pub async fn build(&self, source_path: &Path, output_path: &Path, limit: Duration) -> BuildResult {
        let command = self.generate_build_command(
            &source_path.to_string_lossy(),
            &output_path.to_string_lossy(),
        );
        let Some((program, args)) = command.split_first() else {
            return BuildResult::Diagnostic("Empty build command".to_string());
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to start build tool `{program}`: {e}");
                return BuildResult::Diagnostic(format!("Failed to start build tool `{program}`: {e}"));
            }
        };
        let mut guard = GroupGuard(child.id());
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let outcome = timeout(limit, child.wait()).await;
        if !matches!(outcome, Ok(Ok(_))) {
            log::warn!("Build of {} did not finish cleanly, killing build tool", source_path.display());
            if let Some(pid) = guard.0 {
                kill_process_group(pid);
            }
            // kill() also reaps the child
            if let Err(e) = child.kill().await {
                log::debug!("Build tool already gone: {e}");
            }
        }
        guard.disarm();

        let stderr = collect(stderr).await;
        let diagnostic = |fallback: String| {
            let stderr = stderr.trim_end();
            BuildResult::Diagnostic(if stderr.is_empty() {
                fallback
            } else {
                stderr.to_string()
            })
        };

        match outcome {
            Ok(Ok(status)) if status.success() => {
                if output_path.exists() {
                    BuildResult::Artifact(output_path.to_path_buf())
                } else {
                    diagnostic(format!("Build tool produced no artifact at {}", output_path.display()))
                }
            }
            Ok(Ok(status)) => diagnostic(format!("Build tool exited with {status}")),
            Ok(Err(e)) => diagnostic(format!("Build tool failed: {e}")),
            Err(_) => diagnostic(format!("Build timed out after {limit:?}")),
        }
    }

    /// Generates the build command by applying template substitutions
    fn generate_build_command(&self, source_path: &str, output_path: &str) -> Vec<String> {
        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", source_path);
        mapping.insert("%OUTPUT%", output_path);

        self.command
            .iter()
            .map(|s| {
                let mut t = s.clone();
                for (k, v) in mapping.iter() {
                    t = t.replace(k, v);
                }
                t
            })
            .collect()
    }
}

async fn read_all<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            log::debug!("Stopped reading build output: {e}");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(mut reader: JoinHandle<String>) -> String {
    match timeout(READ_GRACE, &mut reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            log::error!("Build output reader failed: {e}");
            String::new()
        }
        Err(_) => {
            reader.abort();
            String::new()
        }
    }
}
