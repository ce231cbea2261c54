use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use fleetfw_domain::UpdateError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

pub struct ProcessOutput {
    pub exit_code: i32,
    /// stdout and stderr lines in arrival order per stream.
    pub lines: Vec<String>,
}

impl ProcessOutput {
    pub fn last_line(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }
}

/// Run a management tool out of process. Arguments are passed as an argv
/// vector, never through a shell; stdin is closed; stdout/stderr are
/// line-streamed. Argv is not logged (it carries credentials).
pub async fn run_streamed(
    binary: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<ProcessOutput, UpdateError> {
    let tool = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.display().to_string());

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| UpdateError::dependency(format!("cannot spawn {}: {}", tool, e)))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let drain = async {
        // Both pipes drained concurrently so neither can fill and stall the
        // child.
        let read_out = async {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(tool = %tool, %line, "subprocess stdout");
                lines.push(line);
            }
            lines
        };
        let read_err = async {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!(tool = %tool, %line, "subprocess stderr");
                lines.push(line);
            }
            lines
        };
        let (mut lines, err_lines) = tokio::join!(read_out, read_err);
        lines.extend(err_lines);

        let status = child
            .wait()
            .await
            .map_err(|e| UpdateError::dependency(format!("{} wait failed: {}", tool, e)))?;
        Ok::<ProcessOutput, UpdateError>(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            lines,
        })
    };

    match tokio::time::timeout(timeout, drain).await {
        Ok(result) => result,
        Err(_) => Err(UpdateError::timeout(format!(
            "{} did not finish within {:?}",
            tool, timeout
        ))),
    }
}
