//! Process execution with cancellation, timeout and output limits.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use termpilot_config::ExecConfig;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code reported when a command runs out of time.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to wait for output pipes after the child is gone. Background
/// processes started by the command can keep them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub max_output_lines: usize,
}

impl ExecOptions {
    pub fn from_config(config: &ExecConfig) -> Self {
        Self {
            workdir: config.resolved_workdir(),
            timeout: Duration::from_millis(config.timeout_ms),
            max_output_bytes: config.max_output_bytes,
            max_output_lines: config.max_output_lines,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub output: String,
    pub exit_code: i32,
    pub duration: Duration,
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Run `cmd` to completion, or until `cancel` fires or the timeout elapses.
/// The child is killed in the latter two cases. Never fails: spawn errors
/// are reported in the output.
pub async fn exec(cmd: &[String], options: &ExecOptions, cancel: &CancellationToken) -> ExecResult {
    let started = Instant::now();
    let Some((program, args)) = cmd.split_first() else {
        return ExecResult {
            output: "empty command".into(),
            exit_code: 1,
            duration: started.elapsed(),
        };
    };

    debug!(command = ?cmd, workdir = %options.workdir.display(), "Executing command");

    let mut child = match Command::new(program)
        .args(args)
        .current_dir(&options.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %program, error = %e, "Failed to spawn command");
            return ExecResult {
                output: format!("Failed to run {program}: {e}"),
                exit_code: 127,
                duration: started.elapsed(),
            };
        }
    };

    let cap = options.max_output_bytes;
    let stdout = child.stdout.take().map(|out| tokio::spawn(read_capped(out, cap)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(read_capped(err, cap)));

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = tokio::time::sleep(options.timeout) => Outcome::TimedOut,
    };

    if !matches!(outcome, Outcome::Exited(_)) {
        if let Err(e) = child.kill().await {
            warn!(program = %program, error = %e, "Failed to kill command");
        }
    }

    let (stdout, stdout_truncated) = drain(stdout).await;
    let (stderr, stderr_truncated) = drain(stderr).await;
    let duration = started.elapsed();

    let (mut output, exit_code) = match outcome {
        Outcome::Cancelled => {
            debug!(program = %program, "Command aborted");
            return ExecResult {
                output: "aborted".into(),
                exit_code: 1,
                duration,
            };
        }
        Outcome::TimedOut => {
            warn!(program = %program, timeout_ms = options.timeout.as_millis() as u64, "Command timed out");
            let mut text = combine(&stdout, &stderr);
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&format!(
                "[command timed out after {} ms]",
                options.timeout.as_millis()
            ));
            (text, TIMEOUT_EXIT_CODE)
        }
        Outcome::Exited(Ok(status)) => {
            let code = status.code().unwrap_or(-1);
            if !status.success() {
                warn!(program = %program, exit_code = code, "Command failed");
            }
            (combine(&stdout, &stderr), code)
        }
        Outcome::Exited(Err(e)) => (format!("Failed to wait for {program}: {e}"), 1),
    };

    output = truncate_lines(output, options.max_output_lines);
    if stdout_truncated || stderr_truncated {
        output.push_str(&format!(
            "\n[... output truncated after {} bytes]",
            options.max_output_bytes
        ));
    }

    ExecResult {
        output,
        exit_code,
        duration,
    }
}

fn combine(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n[stderr]: {stderr}"),
    }
}

fn truncate_lines(output: String, max_lines: usize) -> String {
    let total = output.lines().count();
    if total <= max_lines {
        return output;
    }
    let mut kept: String = output
        .lines()
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n");
    kept.push_str(&format!("\n[... {} lines truncated]", total - max_lines));
    kept
}

/// Read everything, keeping at most `cap` bytes. The rest is drained so the
/// child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}

async fn drain(handle: Option<JoinHandle<(Vec<u8>, bool)>>) -> (String, bool) {
    let Some(mut handle) = handle else {
        return (String::new(), false);
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(_)) => (String::new(), false),
        Err(_) => {
            handle.abort();
            (String::new(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ExecOptions {
        ExecOptions {
            workdir: std::env::temp_dir(),
            timeout: Duration::from_secs(10),
            max_output_bytes: 10 * 1024,
            max_output_lines: 256,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn execute_echo() {
        let result = exec(&sh("echo hello"), &options(), &CancellationToken::new()).await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "hello");
    }

    #[tokio::test]
    async fn reports_exit_code_and_stderr() {
        let result = exec(
            &sh("echo out; echo err 1>&2; exit 3"),
            &options(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.output, "out\n[stderr]: err");
    }

    #[tokio::test]
    async fn spawn_failure_is_output_not_error() {
        let result = exec(
            &["definitely-not-a-real-binary-xyz".to_string()],
            &options(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.exit_code, 127);
        assert!(result.output.contains("Failed to run"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = exec(&sh("sleep 5"), &options(), &cancel).await;
        assert_eq!(result.output, "aborted");
        assert_eq!(result.exit_code, 1);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let opts = ExecOptions {
            timeout: Duration::from_millis(100),
            ..options()
        };
        let result = exec(&sh("sleep 5"), &opts, &CancellationToken::new()).await;
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.output.contains("timed out after 100 ms"));
    }

    #[tokio::test]
    async fn long_output_is_truncated() {
        let opts = ExecOptions {
            max_output_lines: 5,
            ..options()
        };
        let result = exec(&sh("seq 1 100"), &opts, &CancellationToken::new()).await;
        assert!(result.output.starts_with("1\n2\n3\n4\n5\n"));
        assert!(result.output.ends_with("[... 95 lines truncated]"));

        let opts = ExecOptions {
            max_output_bytes: 16,
            ..options()
        };
        let result = exec(&sh("seq 1 1000"), &opts, &CancellationToken::new()).await;
        assert!(result.output.contains("output truncated after 16 bytes"));
    }

    #[test]
    fn combine_formats() {
        assert_eq!(combine("a\n", ""), "a");
        assert_eq!(combine("", "boom\n"), "boom");
        assert_eq!(combine("a", "b"), "a\n[stderr]: b");
    }
}
