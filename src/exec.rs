//! Shell execution with a destructive-command blocklist, a sanitized
//! environment, and a two-phase timeout kill.
//!
//! The blocklist is best-effort hygiene, not a security boundary: it catches
//! the classic foot-guns (`rm -rf /`, fork bombs, raw writes to block
//! devices) before a subprocess is ever spawned, and every hit is logged.
//!
//! Timeout flow: SIGTERM via `kill <pid>`, a ~2 s grace period, then SIGKILL
//! through the runtime handle.

use std::{path::Path, process::Stdio, sync::LazyLock, time::Duration};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::error::{ErrorKind, ToolError};

/// Environment variables forwarded into subprocesses.  Everything else is
/// stripped; `HOME` is re-pointed at the workspace.
const ENV_ALLOWLIST: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "SHELL", "TMPDIR", "SCOPE_PATH",
];

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default cap on captured output, in characters.
pub const DEFAULT_MAX_OUTPUT: usize = 50_000;

// ─── Outcome ────────────────────────────────────────────────────────────────

/// Result of one shell execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// Exit code; `None` when the process was killed by a signal or timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
    /// True when either stream was truncated to the output cap.
    pub truncated: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

// ─── Blocklist ──────────────────────────────────────────────────────────────

static BLOCKLIST: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"\brm\s+(-[a-zA-Z]*\s+)*-[a-zA-Z]*[rf][a-zA-Z]*\s+/(\s|$)", "recursive delete of filesystem root"),
        (r"\brm\s+(-[a-zA-Z]*\s+)*-[a-zA-Z]*[rf][a-zA-Z]*\s+/\*", "recursive delete of filesystem root"),
        (r":\(\)\s*\{\s*:\|:&\s*\}", "fork bomb"),
        (r"\bdd\s+[^|;]*if=/dev/(zero|u?random)", "raw dd from a pseudo-device"),
        (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem format"),
        (r">\s*/dev/sd[a-z]", "redirect to a block device"),
    ]
    .into_iter()
    .map(|(pat, reason)| {
        (
            Regex::new(pat).unwrap_or_else(|e| panic!("blocklist pattern '{pat}': {e}")),
            reason,
        )
    })
    .collect()
});

/// Returns the blocklist reason if `command` matches a destructive pattern.
pub fn blocklist_reason(command: &str) -> Option<&'static str> {
    BLOCKLIST
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map(|(_, reason)| *reason)
}

// ─── Execution ──────────────────────────────────────────────────────────────

/// Run `command` under `sh -c` in `cwd` with the sanitized environment.
///
/// Never spawns when the blocklist matches.  On timeout the result carries
/// `timed_out = true` and `exit_code = None`; partial output is preserved.
pub async fn bash_execute(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    max_output: usize,
) -> Result<ExecOutcome, ToolError> {
    if let Some(reason) = blocklist_reason(command) {
        warn!(command, reason, "blocked destructive command");
        return Err(ToolError::new(
            ErrorKind::BlocklistedCommand,
            format!("command blocked: {reason}"),
        ));
    }

    let start = std::time::Instant::now();

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear();
    for key in ENV_ALLOWLIST {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    // The workspace is the process's home; SCOPE_PATH mirrors it for scripts.
    cmd.env("HOME", cwd).env("SCOPE_PATH", cwd);

    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::new(ErrorKind::CommandTimeout, format!("failed to spawn: {e}")))?;
    let pid = child.id();

    let stdout_task = capture_stream(child.stdout.take());
    let stderr_task = capture_stream(child.stderr.take());

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(e)) => {
            return Err(ToolError::new(
                ErrorKind::CommandTimeout,
                format!("error waiting for process: {e}"),
            ));
        }
        Err(_elapsed) => {
            // SIGTERM first so the process can clean up, then SIGKILL.
            if let Some(pid) = pid {
                sigterm(pid);
            }
            let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            let _ = child.start_kill();
            let _ = child.wait().await;
            (None, true)
        }
    };

    let (stdout, out_truncated) = truncate_front(&stdout_task.await.unwrap_or_default(), max_output);
    let (stderr, err_truncated) = truncate_front(&stderr_task.await.unwrap_or_default(), max_output);

    Ok(ExecOutcome {
        exit_code: if timed_out {
            None
        } else {
            status.and_then(|s| s.code())
        },
        stdout,
        stderr,
        timed_out,
        duration_ms: start.elapsed().as_millis() as u64,
        truncated: out_truncated || err_truncated,
    })
}

/// Send SIGTERM without holding unsafe code in-crate: shell out to `kill`,
/// the same way the daemon control path stops a background runtime.
pub fn sigterm(pid: u32) {
    #[cfg(unix)]
    {
        let _ = std::process::Command::new("kill").arg(pid.to_string()).status();
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Probe whether `pid` is alive (`kill -0`).
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

fn capture_stream<R>(stream: Option<R>) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(r) = stream {
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push_str(&line);
                buf.push('\n');
            }
        }
        buf
    })
}

/// Cap `text` at `max` characters, dropping from the front so the tail —
/// usually the interesting part — survives.
fn truncate_front(text: &str, max: usize) -> (String, bool) {
    let count = text.chars().count();
    if count <= max {
        return (text.to_owned(), false);
    }
    let skipped = count - max;
    let tail: String = text.chars().skip(skipped).collect();
    (
        format!("[... {skipped} characters truncated ...]\n{tail}"),
        true,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ── Blocklist ───────────────────────────────────────────────────────

    #[test]
    fn blocklist_catches_rm_rf_root() {
        assert!(blocklist_reason("rm -rf /").is_some());
        assert!(blocklist_reason("rm -fr /").is_some());
        assert!(blocklist_reason("sudo rm -rf /*").is_some());
    }

    #[test]
    fn blocklist_catches_fork_bomb() {
        assert!(blocklist_reason(":(){ :|:& };:").is_some());
    }

    #[test]
    fn blocklist_catches_dd_and_mkfs() {
        assert!(blocklist_reason("dd if=/dev/zero of=/dev/sda").is_some());
        assert!(blocklist_reason("dd if=/dev/urandom of=x").is_some());
        assert!(blocklist_reason("mkfs.ext4 /dev/sdb1").is_some());
        assert!(blocklist_reason("echo hi > /dev/sda").is_some());
    }

    #[test]
    fn blocklist_leaves_ordinary_commands_alone() {
        assert!(blocklist_reason("ls -la").is_none());
        assert!(blocklist_reason("rm -rf build/").is_none());
        assert!(blocklist_reason("cargo build").is_none());
        assert!(blocklist_reason("dd if=input.bin of=out.bin").is_none());
    }

    // ── Execution ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn echo_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let r = bash_execute("echo hello", dir.path(), DEFAULT_TIMEOUT, 1000)
            .await
            .unwrap();
        assert_eq!(r.exit_code, Some(0));
        assert!(r.success());
        assert_eq!(r.stdout.trim(), "hello");
        assert!(!r.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_reported() {
        let dir = TempDir::new().unwrap();
        let r = bash_execute("exit 3", dir.path(), DEFAULT_TIMEOUT, 1000)
            .await
            .unwrap();
        assert_eq!(r.exit_code, Some(3));
        assert!(!r.success());
    }

    #[tokio::test]
    async fn stderr_captured_separately() {
        let dir = TempDir::new().unwrap();
        let r = bash_execute("echo oops 1>&2", dir.path(), DEFAULT_TIMEOUT, 1000)
            .await
            .unwrap();
        assert!(r.stdout.is_empty());
        assert_eq!(r.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn blocklisted_command_never_spawns() {
        let dir = TempDir::new().unwrap();
        let err = bash_execute("rm -rf /", dir.path(), DEFAULT_TIMEOUT, 1000)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BlocklistedCommand);
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let dir = TempDir::new().unwrap();
        let r = bash_execute(
            "sleep 30",
            dir.path(),
            Duration::from_millis(100),
            1000,
        )
        .await
        .unwrap();
        assert!(r.timed_out);
        assert_eq!(r.exit_code, None);
        // Within grace + margin the process must be gone; wait() already
        // reaped it, so duration proves we did not sleep the full 30 s.
        assert!(r.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn env_is_allowlisted_and_home_repointed() {
        let dir = TempDir::new().unwrap();
        let r = bash_execute("echo $HOME:$SCOPE_PATH", dir.path(), DEFAULT_TIMEOUT, 1000)
            .await
            .unwrap();
        let cwd = dir.path().to_string_lossy();
        assert_eq!(r.stdout.trim(), format!("{cwd}:{cwd}"));

        // A variable outside the allowlist does not leak through.
        let r = bash_execute("echo x${CARGO_PKG_NAME}x", dir.path(), DEFAULT_TIMEOUT, 1000)
            .await
            .unwrap();
        assert_eq!(r.stdout.trim(), "xx");
    }

    #[tokio::test]
    async fn output_truncated_from_the_front() {
        let dir = TempDir::new().unwrap();
        let r = bash_execute("seq 1 200", dir.path(), DEFAULT_TIMEOUT, 50)
            .await
            .unwrap();
        assert!(r.truncated);
        assert!(r.stdout.starts_with("[..."));
        // The tail survives.
        assert!(r.stdout.contains("200"));
        assert!(!r.stdout.contains("\n1\n"));
    }

    #[test]
    fn truncate_front_keeps_short_text() {
        let (s, t) = truncate_front("short", 100);
        assert_eq!(s, "short");
        assert!(!t);
    }
}
