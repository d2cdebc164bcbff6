//! Worker process supervision: spawn, capture, cap, terminate.
//!
//! Each call spawns a fresh interpreter process (never forked, never
//! pooled). The monitor waits on the child with a wall-clock deadline
//! and an RSS sampler; breaching either kills the process and marks
//! the outcome as a resource failure.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use dp_domain::config::STREAM_CAP_BYTES;
use dp_domain::error::{Error, Result};

use crate::bootstrap::{RESULT_BEGIN, RESULT_END};

/// How the worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerExit {
    Completed,
    TimedOut,
    MemoryBreach,
}

#[derive(Debug)]
pub(crate) struct WorkerOutput {
    pub exit: WorkerExit,
    pub exit_code: Option<i32>,
    /// Stdout with the sentinel block removed.
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// The sentinel-framed JSON payload, if the worker got that far.
    pub sentinel: Option<serde_json::Value>,
    pub elapsed: Duration,
}

/// A capped line buffer: keeps the head, flags the cut.
struct CaptureBuffer {
    text: String,
    truncated: bool,
}

impl CaptureBuffer {
    fn new() -> Self {
        Self {
            text: String::new(),
            truncated: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + line.len() + 1 > STREAM_CAP_BYTES {
            let remaining = STREAM_CAP_BYTES.saturating_sub(self.text.len());
            let mut boundary = remaining.min(line.len());
            while boundary > 0 && !line.is_char_boundary(boundary) {
                boundary -= 1;
            }
            self.text.push_str(&line[..boundary]);
            self.truncated = true;
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }
}

/// Spawn the worker and supervise it to completion.
pub(crate) async fn run(
    program: &str,
    flags: &[String],
    args: &[&Path],
    workdir: &Path,
    timeout: Duration,
    memory_cap_bytes: u64,
    rss_poll: Duration,
) -> Result<WorkerOutput> {
    let started = Instant::now();

    let mut cmd = Command::new(program);
    for flag in flags {
        cmd.arg(flag);
    }
    for arg in args {
        cmd.arg(arg);
    }
    cmd.current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Internal(format!("failed to spawn {program}: {e}")))?;
    let pid = child.id();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Reader tasks drain the pipes so the child never blocks on a full
    // pipe even after truncation.
    let stdout_task = tokio::spawn(async move {
        let mut buf = CaptureBuffer::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push_line(&line);
            }
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = CaptureBuffer::new();
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push_line(&line);
            }
        }
        buf
    });

    let exit;
    let exit_code;

    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(s) => {
                    exit = WorkerExit::Completed;
                    exit_code = s.code();
                }
                Err(e) => {
                    return Err(Error::Internal(format!("worker wait failed: {e}")));
                }
            }
        }
        _ = tokio::time::sleep(timeout) => {
            terminate(&mut child).await;
            exit = WorkerExit::TimedOut;
            exit_code = None;
        }
        _ = watch_rss(pid, memory_cap_bytes, rss_poll) => {
            terminate(&mut child).await;
            exit = WorkerExit::MemoryBreach;
            exit_code = None;
        }
    }

    let stdout_buf = stdout_task.await.unwrap_or_else(|_| CaptureBuffer::new());
    let stderr_buf = stderr_task.await.unwrap_or_else(|_| CaptureBuffer::new());

    let (visible_stdout, sentinel) = extract_sentinel(&stdout_buf.text);

    Ok(WorkerOutput {
        exit,
        exit_code,
        stdout: visible_stdout,
        stderr: stderr_buf.text,
        stdout_truncated: stdout_buf.truncated,
        stderr_truncated: stderr_buf.truncated,
        sentinel,
        elapsed: started.elapsed(),
    })
}

/// Graceful-then-forced termination.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SIGTERM first so the interpreter can unwind.
            let _ = std::process::Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status();
            if tokio::time::timeout(Duration::from_millis(500), child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

/// Resolve forever on platforms without an RSS source; the select then
/// only races completion against the wall clock.
async fn watch_rss(pid: Option<u32>, cap_bytes: u64, poll: Duration) {
    #[cfg(target_os = "linux")]
    {
        if let Some(pid) = pid {
            loop {
                tokio::time::sleep(poll).await;
                match read_rss_bytes(pid) {
                    Some(rss) if rss > cap_bytes => {
                        tracing::warn!(pid, rss, cap_bytes, "worker breached memory cap");
                        return;
                    }
                    Some(_) => {}
                    None => {
                        // Process is gone; let child.wait() win the race.
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
    let _ = (pid, cap_bytes, poll);
    std::future::pending::<()>().await;
}

#[cfg(target_os = "linux")]
fn read_rss_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// Split the sentinel block out of captured stdout.
fn extract_sentinel(stdout: &str) -> (String, Option<serde_json::Value>) {
    let Some(begin) = stdout.find(RESULT_BEGIN) else {
        return (stdout.to_string(), None);
    };
    let after_begin = begin + RESULT_BEGIN.len();
    let Some(end_rel) = stdout[after_begin..].find(RESULT_END) else {
        return (stdout.to_string(), None);
    };
    let payload = stdout[after_begin..after_begin + end_rel].trim();
    let visible = format!(
        "{}{}",
        &stdout[..begin],
        &stdout[after_begin + end_rel + RESULT_END.len()..]
    )
    .trim_end()
    .to_string();

    match serde_json::from_str(payload) {
        Ok(value) => (visible, Some(value)),
        Err(e) => {
            tracing::warn!(error = %e, "worker sentinel payload was not valid JSON");
            (visible, None)
        }
    }
}
