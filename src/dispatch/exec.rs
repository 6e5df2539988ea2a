//! Subprocess execution with timeout enforcement and output capture.
//!
//! Two deliberately separate entry points:
//! - `run_argv` — trusted structured commands (git, the recipe interpreter):
//!   a program and an argv list, never a shell.
//! - `run_shell` — explicitly shell-mode execution, used only for SYSTEM_OP
//!   payloads whose command text is the work itself.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::ExecError;

/// Maximum captured output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The audit text for this run: stdout on success, stderr on failure,
    /// falling back to the other stream so nothing is swallowed silently.
    pub fn result_text(&self) -> &str {
        let primary = if self.success() {
            &self.stdout
        } else {
            &self.stderr
        };
        if primary.trim().is_empty() {
            if self.success() { &self.stderr } else { &self.stdout }
        } else {
            primary
        }
    }
}

/// Run a command string through the platform shell.
pub async fn run_shell(
    command: &str,
    workdir: &Path,
    timeout: Duration,
) -> Result<CmdOutput, ExecError> {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    run(&mut cmd, "sh", workdir, timeout).await
}

/// Run a program with an argv list, no shell involved.
pub async fn run_argv(
    program: &str,
    args: &[&str],
    workdir: &Path,
    timeout: Duration,
) -> Result<CmdOutput, ExecError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    run(&mut cmd, program, workdir, timeout).await
}

async fn run(
    cmd: &mut Command,
    program: &str,
    workdir: &Path,
    timeout: Duration,
) -> Result<CmdOutput, ExecError> {
    cmd.current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, async {
        cmd.spawn()
            .map_err(|e| ExecError::Spawn {
                program: program.to_string(),
                source: e,
            })?
            .wait_with_output()
            .await
            .map_err(ExecError::Io)
    })
    .await
    .map_err(|_| ExecError::Timeout(timeout))??;

    Ok(CmdOutput {
        stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
        stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cwd() -> std::path::PathBuf {
        std::env::current_dir().unwrap()
    }

    #[tokio::test]
    async fn shell_captures_stdout() {
        let out = run_shell("echo hello", &cwd(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn shell_captures_stderr_on_failure() {
        let out = run_shell("echo oops >&2; exit 3", &cwd(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.result_text().contains("oops"));
    }

    #[tokio::test]
    async fn argv_runs_without_shell_expansion() {
        let out = run_argv("echo", &["$HOME"], &cwd(), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "$HOME");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let result = run_shell("sleep 10", &cwd(), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ExecError::Timeout(_))));
    }

    #[test]
    fn truncate_output_short() {
        let s = "short output";
        assert_eq!(truncate_output(s), s);
    }

    #[test]
    fn truncate_output_long() {
        let s = "x".repeat(MAX_OUTPUT_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.len() <= MAX_OUTPUT_SIZE + 100);
        assert!(result.contains("[truncated"));
    }

    #[test]
    fn floor_char_boundary_multibyte() {
        let s = "café";
        assert_eq!(floor_char_boundary(s, 100), 5);
        assert_eq!(floor_char_boundary(s, 4), 3);
        assert_eq!(floor_char_boundary(s, 3), 3);
    }
}
