//! Child process launching with line-by-line output capture.
//!
//! stdout and stderr are read on their own tasks and merged into one
//! channel. Lines from the same stream keep their order; interleaving
//! between the streams follows arrival.
//!
//! On unix every tool is the leader of its own process group, so the
//! helpers it starts (yosys, openroad, a backgrounded shell job) are killed
//! together with it.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::plan::CommandSpec;

/// Capacity of the merged output channel. A full channel backpressures the
/// reader tasks, and through the pipe, the tool itself.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct RunningTool {
    pub child: Child,
    /// Closed once both streams reach end of file.
    pub output: mpsc::Receiver<String>,
    /// Declared last: the group is killed after the leader on drop.
    pub group: ProcessGroup,
}

impl RunningTool {
    /// Kill every process of the tool's group, then reap the leader.
    pub async fn kill(&mut self) -> io::Result<()> {
        self.group.kill();
        self.child.kill().await
    }
}

/// Process group led by a spawned tool. Dropping it kills whatever is
/// still running in the group.
#[derive(Debug)]
pub struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn led_by(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    /// Send SIGKILL to the whole group. A group with no members left is
    /// not an error.
    pub fn kill(&self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: killpg only sends a signal; a stale pgid yields ESRCH.
            let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!(pgid, error = %err, "Failed to kill tool process group");
                }
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Spawn `spec` in `cwd` with stdin closed and both output streams piped.
///
/// The tool and everything it started are killed if the returned handle
/// is dropped.
pub fn spawn(spec: &CommandSpec, cwd: &Path) -> io::Result<RunningTool> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    let group = ProcessGroup::led_by(&child);
    let (tx, output) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(BufReader::new(stdout), tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(BufReader::new(stderr), tx));
    }

    Ok(RunningTool {
        child,
        output,
        group,
    })
}

/// Run `spec` to completion with its output discarded, killing it after
/// `limit`.
pub async fn run_quiet(spec: &CommandSpec, limit: Duration) -> io::Result<ExitStatus> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    tokio::time::timeout(limit, cmd.status())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", spec.program)))?
}

/// Send each line of `reader` without its terminator. Invalid UTF-8 is
/// replaced rather than dropped.
async fn forward_lines<R: AsyncBufRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read tool output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::with_args("sh", ["-c", script])
    }

    /// Zombies count as gone: whoever inherited them may never reap.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        !matches!(state, Some('Z' | 'X') | None)
    }

    #[cfg(target_os = "linux")]
    async fn exits_within(pid: u32, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while is_running(pid) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    async fn collect(mut tool: RunningTool) -> (Vec<String>, Option<i32>) {
        let mut lines = Vec::new();
        while let Some(line) = tool.output.recv().await {
            lines.push(line);
        }
        let status = tool.child.wait().await.unwrap();
        (lines, status.code())
    }

    #[tokio::test]
    async fn captures_both_streams_line_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let tool = spawn(&sh("echo out1; echo err1 >&2; echo out2"), dir.path()).unwrap();
        let (lines, code) = collect(tool).await;

        assert_eq!(code, Some(0));
        assert_eq!(lines.len(), 3);
        let out: Vec<_> = lines.iter().filter(|l| l.starts_with("out")).collect();
        assert_eq!(out, vec!["out1", "out2"]);
        assert!(lines.contains(&"err1".to_string()));
    }

    #[tokio::test]
    async fn crlf_and_invalid_utf8_are_normalised() {
        let dir = tempfile::tempdir().unwrap();
        let tool = spawn(&sh("printf 'a\\r\\nb\\377c\\n'"), dir.path()).unwrap();
        let (lines, _) = collect(tool).await;
        assert_eq!(lines, vec!["a".to_string(), "b\u{FFFD}c".to_string()]);
    }

    #[tokio::test]
    async fn runs_in_working_directory_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let tool = spawn(&sh("cat marker.txt; exit 3"), dir.path()).unwrap();
        let (lines, code) = collect(tool).await;
        assert_eq!(lines, vec!["here"]);
        assert_eq!(code, Some(3));
    }

    #[tokio::test]
    async fn quiet_run_is_bounded() {
        let ok = run_quiet(&sh("exit 0"), Duration::from_secs(5)).await.unwrap();
        assert!(ok.success());

        let err = run_quiet(&sh("exec sleep 5"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_reaches_backgrounded_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let mut tool = spawn(
            &sh("sleep 30 & echo $! > helper.pid; echo started; wait"),
            dir.path(),
        )
        .unwrap();
        assert_eq!(tool.output.recv().await.as_deref(), Some("started"));
        let helper: u32 = std::fs::read_to_string(dir.path().join("helper.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        tool.kill().await.unwrap();
        assert!(exits_within(helper, Duration::from_secs(5)).await);
        // Both pipes close once the helper holding them is gone.
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while tool.output.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn dropping_the_handle_kills_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let mut tool = spawn(
            &sh("sleep 30 & echo $! > helper.pid; echo started; wait"),
            dir.path(),
        )
        .unwrap();
        assert_eq!(tool.output.recv().await.as_deref(), Some("started"));
        let helper: u32 = std::fs::read_to_string(dir.path().join("helper.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        drop(tool);
        assert!(exits_within(helper, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn(&CommandSpec::new("a6hub-no-such-tool"), dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
