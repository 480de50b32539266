// Subprocess execution with deadline and cancellation wiring. Extractors,
// build systems, patch tools and the verify command all run through here,
// so killing an install kills its children too.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Result, TsukuError};
use crate::libs::cancel::CancelToken;
use crate::log_debug;

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Runs a command to completion, polling for cancellation and a deadline.
/// The child is killed on either; a killed child surfaces as `Cancelled`
/// or `Execution` respectively.
pub fn run_command(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    log_debug!("[Proc] {} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| TsukuError::Execution {
        command: program.to_string(),
        reason: format!("failed to spawn: {e}"),
    })?;

    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TsukuError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(_status)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TsukuError::Execution {
                        command: program.to_string(),
                        reason: format!("timed out after {}s", timeout.as_secs()),
                    });
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                let _ = child.kill();
                return Err(TsukuError::Execution {
                    command: program.to_string(),
                    reason: format!("wait failed: {e}"),
                });
            }
        }
    }

    let output = child.wait_with_output().map_err(|e| TsukuError::Execution {
        command: program.to_string(),
        reason: format!("could not collect output: {e}"),
    })?;

    Ok(CommandOutput {
        status_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Like `run_command` but non-zero exit is an `Execution` error carrying
/// the tail of stderr.
pub fn run_checked(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    let output = run_command(program, args, cwd, env, timeout, cancel)?;
    if !output.success() {
        let mut reason = match output.status_code {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr_tail: String =
            output.stderr.lines().rev().take(8).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
        if !stderr_tail.is_empty() {
            reason.push_str(&format!("\n{stderr_tail}"));
        }
        return Err(TsukuError::Execution { command: program.to_string(), reason });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run_command(
            "sh",
            &["-c".into(), "echo out; echo err >&2".into()],
            None,
            &no_env(),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn nonzero_exit_is_an_execution_error() {
        let err = run_checked(
            "sh",
            &["-c".into(), "echo boom >&2; exit 3".into()],
            None,
            &no_env(),
            Duration::from_secs(5),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn timeout_kills_the_child() {
        let start = Instant::now();
        let err = run_command(
            "sh",
            &["-c".into(), "sleep 30".into()],
            None,
            &no_env(),
            Duration::from_millis(200),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "execution");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn pre_cancelled_token_aborts_immediately() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run_command(
            "sh",
            &["-c".into(), "sleep 30".into()],
            None,
            &no_env(),
            Duration::from_secs(30),
            &cancel,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[test]
    fn missing_program_reports_spawn_failure() {
        let err = run_command(
            "definitely-not-a-real-binary-xyz",
            &[],
            None,
            &no_env(),
            Duration::from_secs(1),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
