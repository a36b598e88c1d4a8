use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// Exit code reported when a process never produced one.
pub const NO_EXIT_CODE: i32 = -1;

/// Captured result of one process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// stdout followed by stderr.
    pub output: String,
    pub exit_code: i32,
}

/// Runs a program with discrete argv entries. Never goes through a shell.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, binary: &str, args: &[String], cwd: &Path) -> io::Result<ProcessOutput>;
}

/// Spawns real child processes on the tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, binary: &str, args: &[String], cwd: &Path) -> io::Result<ProcessOutput> {
        let mut command = tokio::process::Command::new(binary);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.output();

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child).await.map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{binary} timed out after {}s", limit.as_secs()),
                )
            })??,
            None => child.await?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }

        Ok(ProcessOutput {
            output: combined,
            exit_code: output.status.code().unwrap_or(NO_EXIT_CODE),
        })
    }
}
