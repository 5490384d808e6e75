use anyhow::Result;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::exec::{BuildResult, ExecEnv, ProcessEvent, StreamKind};
use crate::source::SourceRef;

/// Builds and runs `source` once, feeding `input` and closing stdin, and returns
/// the aggregate text response: stdout, an optional `STDERR:` section, a kill
/// marker if the hard timeout fired, and the exit code.
///
/// Errors only when the source itself cannot be prepared.
pub async fn execute(env: &ExecEnv, source: &SourceRef, input: Option<&str>) -> Result<String> {
    let workspace = env.workspace();
    let run_id = workspace.run_id();
    log::info!("Single-shot run {run_id} building");

    let built = env
        .prepare(
            source,
            workspace.source_path(),
            workspace.artifact_path(),
            &CancellationToken::new(),
        )
        .await;
    let artifact = match built {
        Ok(BuildResult::Artifact(path)) => path,
        Ok(BuildResult::Diagnostic(text)) => {
            env.cleaner.cleanup_run(workspace).await;
            return Ok(format!("Compilation failed:\n{text}"));
        }
        Err(e) => {
            env.cleaner.cleanup_run(workspace).await;
            return Err(e);
        }
    };

    let mut process = match env.spawn(&artifact) {
        Ok(process) => process,
        Err(e) => {
            log::warn!("Single-shot run {run_id} failed to start: {e:#}");
            env.cleaner.cleanup_run(workspace).await;
            return Ok(format!("Failed to start process: {e:#}"));
        }
    };
    if let Some(input) = input {
        process.write(input);
    }
    process.close_stdin();

    let limit = env.policy.hard_timeout;
    let deadline = Instant::now() + limit.as_duration();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut killed = false;
    let mut exit_code = -1;

    loop {
        tokio::select! {
            event = process.next_event() => match event {
                Some(ProcessEvent::Output { stream: StreamKind::Stdout, data }) => stdout.extend(data),
                Some(ProcessEvent::Output { stream: StreamKind::Stderr, data }) => stderr.extend(data),
                Some(ProcessEvent::Exited { code, signal }) => {
                    exit_code = code.or(signal.map(|s| 128 + s)).unwrap_or(-1);
                    break;
                }
                Some(ProcessEvent::Error(reason)) => {
                    log::error!("Single-shot run {run_id}: {reason}");
                    stderr.extend(format!("Process error: {reason}\n").into_bytes());
                    break;
                }
                None => break,
            },
            _ = sleep_until(deadline), if !killed => {
                log::info!("Single-shot run {run_id} hit the {}s timeout", limit.as_secs());
                killed = true;
                process.close();
            }
        }
    }
    drop(process);
    env.cleaner.cleanup_run(workspace).await;

    let mut response = String::from_utf8_lossy(&stdout).into_owned();
    if !stderr.is_empty() {
        response.push_str("\nSTDERR:\n");
        response.push_str(&String::from_utf8_lossy(&stderr));
    }
    if killed {
        response.push_str(&format!(
            "\n[Process was killed after {} second timeout]",
            limit.as_secs()
        ));
    }
    response.push_str(&format!("\n[Exit code: {exit_code}]"));

    log::info!("Single-shot run {run_id} finished with exit code {exit_code}");
    Ok(response)
}
