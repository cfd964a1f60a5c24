//! Command execution on the client.
//!
//! Every outcome is rendered as text. A missing binary, a non-zero exit, or
//! a timeout becomes the response payload instead of an error, so nothing
//! a server asks for can bring the client down.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use crate::BoxFuture;
use crate::signal::Signal;

/// One unit of work requested by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A built-in diagnostic action.
    Stock(Signal),
    /// Free-form shell text.
    Custom(String),
}

impl Command {
    /// Short label shown to operators (`"LS"`, or the custom text itself).
    pub fn label(&self) -> String {
        match self {
            Command::Stock(signal) => signal.name().to_string(),
            Command::Custom(text) => text.clone(),
        }
    }

    /// The shell line this command runs, or `None` for a non-stock signal.
    pub fn shell_line(&self) -> Option<&str> {
        match self {
            Command::Stock(signal) => stock_command_line(*signal),
            Command::Custom(text) => Some(text.as_str()),
        }
    }
}

/// Platform shell line for a stock command.
pub fn stock_command_line(signal: Signal) -> Option<&'static str> {
    let line = match signal {
        Signal::Whoami => "whoami",
        Signal::Hostname => "hostname",
        Signal::Pwd => "pwd",
        Signal::Ls => "ls",
        Signal::Ipconfig if cfg!(windows) => "ipconfig",
        Signal::Ipconfig => "ip a",
        _ => return None,
    };
    Some(line)
}

/// Something that can run a [`Command`] and describe the outcome as text.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, String>;
}

/// Runs commands through the platform shell with `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    timeout: Option<Duration>,
    workdir: Option<PathBuf>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Timeout in whole seconds; 0 means none.
    pub fn with_timeout_secs(self, secs: u64) -> Self {
        if secs == 0 {
            self
        } else {
            self.with_timeout(Duration::from_secs(secs))
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    async fn run_line(&self, line: &str) -> String {
        let mut proc = if cfg!(windows) {
            let mut proc = tokio::process::Command::new("powershell.exe");
            proc.args(["-NoProfile", "-Command", line]);
            proc
        } else {
            let mut proc = tokio::process::Command::new("sh");
            proc.args(["-c", line]);
            proc
        };
        proc.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            proc.current_dir(dir);
        }

        let child = match proc.spawn() {
            Ok(child) => child,
            Err(e) => return format!("failed to run `{line}`: {e}"),
        };

        let output = match self.timeout {
            Some(dur) => match tokio::time::timeout(dur, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => return format!("`{line}` timed out after {}s", dur.as_secs_f64()),
            },
            None => child.wait_with_output().await,
        };

        match output {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.trim().is_empty() {
                    match output.status.code() {
                        Some(code) => format!("exit status {code}"),
                        None => "terminated by signal".to_string(),
                    }
                } else {
                    stderr.into_owned()
                }
            }
            Err(e) => format!("failed waiting for `{line}`: {e}"),
        }
    }
}

impl CommandRunner for ShellRunner {
    fn run<'a>(&'a self, command: &'a Command) -> BoxFuture<'a, String> {
        Box::pin(async move {
            match command.shell_line() {
                Some(line) => {
                    tracing::debug!(command = %command.label(), "Running command");
                    self.run_line(line).await
                }
                None => format!("{} is not a runnable command", command.label()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_stock_command_has_a_line() {
        for signal in Signal::stock_commands() {
            assert!(stock_command_line(signal).is_some(), "{signal}");
        }
        assert_eq!(stock_command_line(Signal::ClientHello), None);
    }

    #[test]
    fn test_labels() {
        assert_eq!(Command::Stock(Signal::Ls).label(), "LS");
        assert_eq!(Command::Custom("uname -a".into()).label(), "uname -a");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_custom_command_stdout() {
        let runner = ShellRunner::new().with_timeout_secs(5);
        let out = runner.run(&Command::Custom("echo hello".into())).await;
        assert_eq!(out.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stock_ls_runs_in_workdir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), b"x").unwrap();
        let runner = ShellRunner::new().with_workdir(dir.path());
        let out = runner.run(&Command::Stock(Signal::Ls)).await;
        assert!(out.contains("marker.txt"), "{out}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_returns_stderr() {
        let runner = ShellRunner::new();
        let out = runner
            .run(&Command::Custom("echo oops >&2; exit 3".into()))
            .await;
        assert_eq!(out.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_without_stderr_reports_status() {
        let runner = ShellRunner::new();
        let out = runner.run(&Command::Custom("exit 4".into())).await;
        assert_eq!(out, "exit status 4");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_binary_is_text() {
        let runner = ShellRunner::new();
        let out = runner
            .run(&Command::Custom("definitely-not-a-real-binary-xyz".into()))
            .await;
        assert!(!out.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_text() {
        let runner = ShellRunner::new().with_timeout(Duration::from_millis(100));
        let out = runner.run(&Command::Custom("sleep 10".into())).await;
        assert!(out.contains("timed out"), "{out}");
    }

    #[tokio::test]
    async fn test_non_stock_signal_is_text() {
        let out = ShellRunner::new()
            .run(&Command::Stock(Signal::ClientKill))
            .await;
        assert_eq!(out, "CLIENT_KILL is not a runnable command");
    }
}
