use std::io;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Grace between SIGTERM and SIGKILL when a helper overruns its deadline.
const KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct HelperOutput {
    /// Exit code; None when the helper died to a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl HelperOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug)]
pub enum HelperRun {
    Completed(HelperOutput),
    /// Deadline hit; the child and its process group were terminated.
    TimedOut,
}

/// Run a helper binary with a hard deadline.
///
/// The child gets its own process group so the kill reaches grandchildren
/// (elevation fallbacks re-exec through a wrapper). `stdin_data`, if any,
/// is written to the child's stdin followed by a newline, then stdin is
/// closed; this is the only channel secrets travel on.
pub async fn run_helper(
    program: &str,
    args: &[String],
    stdin_data: Option<&str>,
    deadline: Duration,
) -> io::Result<HelperRun> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin_data.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let pid = child.id();

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = child.stdin.take() {
            let mut line = data.as_bytes().to_vec();
            line.push(b'\n');
            // a helper that never reads stdin must not wedge us
            if let Err(e) = stdin.write_all(&line).await {
                debug!(program, "stdin write failed: {}", e);
            }
            let _ = stdin.shutdown().await;
            drop(stdin);
        }
    }

    let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            warn!(program, ?deadline, "helper overran deadline, killing process group");
            terminate_group(pid).await;
            // reap so the zombie doesn't outlive us
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            return Ok(HelperRun::TimedOut);
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    Ok(HelperRun::Completed(HelperOutput {
        code: status.code(),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }))
}

/// SIGTERM the group, give it half a second, then SIGKILL whatever is left.
async fn terminate_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let pgid = Pid::from_raw(pid as i32);

    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        debug!(%pgid, "SIGTERM failed: {}", e);
        return;
    }
    tokio::time::sleep(KILL_GRACE).await;
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => debug!(%pgid, "SIGKILL failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let run = run_helper(
            "/bin/sh",
            &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        match run {
            HelperRun::Completed(out) => {
                assert_eq!(out.code, Some(3));
                assert_eq!(out.stdout.trim(), "out");
                assert_eq!(out.stderr.trim(), "err");
                assert!(!out.success());
            }
            HelperRun::TimedOut => panic!("should have completed"),
        }
    }

    #[tokio::test]
    async fn feeds_stdin_with_trailing_newline() {
        let run = run_helper(
            "/bin/sh",
            &["-c".to_string(), "read line; echo got:$line".to_string()],
            Some("s3cret"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        match run {
            HelperRun::Completed(out) => {
                assert_eq!(out.code, Some(0));
                assert_eq!(out.stdout.trim(), "got:s3cret");
            }
            HelperRun::TimedOut => panic!("should have completed"),
        }
    }

    #[tokio::test]
    async fn kills_overrunning_helper() {
        let start = Instant::now();
        let run = run_helper(
            "/bin/sh",
            &["-c".to_string(), "sleep 30".to_string()],
            None,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert!(matches!(run, HelperRun::TimedOut));
        // SIGTERM + 500 ms grace + reap, nowhere near the 30 s sleep
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let err = run_helper("/nonexistent/helper", &[], None, Duration::from_secs(1)).await;
        assert!(err.is_err());
    }
}
