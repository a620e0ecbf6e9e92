//! Bounded execution of OS networking tools.

use crate::error::PlatformError;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Default upper bound for a single tool invocation.
pub(crate) const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a program to completion and return its stdout.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<String, PlatformError> {
    run_inner(program, args, None, &[]).await
}

/// Run a program, treating failures whose stderr contains one of
/// `absent` as success. Used for removals of things that may already
/// be gone.
pub(crate) async fn run_absent_ok(
    program: &str,
    args: &[&str],
    absent: &[&str],
) -> Result<(), PlatformError> {
    run_inner(program, args, None, absent).await.map(|_| ())
}

/// Run a program feeding `input` on stdin.
pub(crate) async fn run_with_input(
    program: &str,
    args: &[&str],
    input: &str,
) -> Result<String, PlatformError> {
    run_inner(program, args, Some(input), &[]).await
}

async fn run_inner(
    program: &str,
    args: &[&str],
    input: Option<&str>,
    absent: &[&str],
) -> Result<String, PlatformError> {
    debug!("exec: {} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| PlatformError::Spawn {
        program: program.to_string(),
        message: e.to_string(),
    })?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| PlatformError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            })?;
    }

    let output = match tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(PlatformError::Spawn {
                program: program.to_string(),
                message: e.to_string(),
            });
        }
        Err(_) => {
            return Err(PlatformError::Timeout {
                program: program.to_string(),
                timeout: COMMAND_TIMEOUT,
            });
        }
    };

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if is_absent(&stderr, absent) {
        debug!("{}: already absent ({})", program, stderr);
        return Ok(String::new());
    }

    Err(PlatformError::Command {
        program: program.to_string(),
        code: output.status.code(),
        stderr,
    })
}

fn is_absent(stderr: &str, absent: &[&str]) -> bool {
    let lower = stderr.to_ascii_lowercase();
    absent
        .iter()
        .any(|pattern| lower.contains(&pattern.to_ascii_lowercase()))
}
