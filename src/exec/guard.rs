use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::executor::{CommandExecutor, NO_EXIT_CODE};
use super::whitelist::CommandWhitelist;
use crate::actions::ErrorKind;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command not allowed: {command}")]
    NotWhitelisted { command: String },

    #[error("command failed with exit code {exit_code}: {command}")]
    CommandFailed {
        command: String,
        output: String,
        exit_code: i32,
    },
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotWhitelisted { .. } => ErrorKind::NotWhitelisted,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    pub output: String,
    pub exit_code: i32,
}

/// Gatekeeper between installer requests and process execution.
pub struct CommandGuard {
    whitelist: CommandWhitelist,
    executor: Arc<dyn CommandExecutor>,
    working_dir: PathBuf,
}

impl CommandGuard {
    pub fn new(
        whitelist: CommandWhitelist,
        executor: Arc<dyn CommandExecutor>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            whitelist,
            executor,
            working_dir: working_dir.into(),
        }
    }

    pub fn whitelist(&self) -> &CommandWhitelist {
        &self.whitelist
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn is_whitelisted(&self, binary: &str, args: &[String]) -> bool {
        self.whitelist.allows(binary, args)
    }

    /// Validate, then run in the application root.
    pub async fn run(&self, binary: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let command = display_command(binary, args);

        if !self.is_whitelisted(binary, args) {
            tracing::warn!(command = %command, "Rejected non-whitelisted command");
            return Err(CommandError::NotWhitelisted { command });
        }

        tracing::info!(command = %command, cwd = %self.working_dir.display(), "Running installer command");

        let result = match self.executor.execute(binary, args, &self.working_dir).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(command = %command, error = %e, "Failed to start command");
                return Err(CommandError::CommandFailed {
                    command,
                    output: e.to_string(),
                    exit_code: NO_EXIT_CODE,
                });
            }
        };

        if result.exit_code != 0 {
            tracing::warn!(command = %command, exit_code = result.exit_code, "Installer command failed");
            return Err(CommandError::CommandFailed {
                command,
                output: result.output,
                exit_code: result.exit_code,
            });
        }

        Ok(CommandOutput {
            command,
            output: result.output,
            exit_code: result.exit_code,
        })
    }
}

/// Human-readable form of an argv, for logs and results only.
pub fn display_command(binary: &str, args: &[String]) -> String {
    std::iter::once(binary)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::executor::{MockCommandExecutor, ProcessOutput};
    use std::io;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    fn guard(mock: MockCommandExecutor) -> CommandGuard {
        CommandGuard::new(
            CommandWhitelist::installer_default(),
            Arc::new(mock),
            "/srv/facturas",
        )
    }

    #[tokio::test]
    async fn whitelisted_command_runs_in_app_root() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|binary, args, cwd| {
                binary == "php"
                    && *args == ["artisan", "migrate", "--force"]
                    && cwd == Path::new("/srv/facturas")
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(ProcessOutput {
                    output: "Migrated".to_string(),
                    exit_code: 0,
                })
            });

        let out = guard(mock)
            .run("php", &args("artisan migrate --force"))
            .await
            .unwrap();
        assert_eq!(out.command, "php artisan migrate --force");
        assert_eq!(out.output, "Migrated");
        assert_eq!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn refused_commands_never_reach_executor() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().times(0);
        let guard = guard(mock);

        for (binary, argv) in [("php", "artisan db:wipe"), ("rm", "-rf /"), ("sh", "-c id")] {
            let err = guard.run(binary, &args(argv)).await.unwrap_err();
            assert!(matches!(err, CommandError::NotWhitelisted { .. }), "{binary} {argv}");
            assert_eq!(err.kind(), ErrorKind::NotWhitelisted);
        }
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_failed() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().times(1).returning(|_, _, _| {
            Ok(ProcessOutput {
                output: "SQLSTATE[HY000] [2002] Connection refused".to_string(),
                exit_code: 1,
            })
        });

        let err = guard(mock)
            .run("php", &args("artisan migrate --force"))
            .await
            .unwrap_err();
        match err {
            CommandError::CommandFailed { output, exit_code, .. } => {
                assert_eq!(exit_code, 1);
                assert!(output.contains("Connection refused"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_reports_minus_one() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .times(1)
            .returning(|_, _, _| Err(io::Error::new(io::ErrorKind::NotFound, "php: not found")));

        let err = guard(mock)
            .run("php", &args("artisan optimize"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommandError::CommandFailed { exit_code: NO_EXIT_CODE, .. }
        ));
    }

    #[test]
    fn introspection() {
        let guard = guard(MockCommandExecutor::new());
        assert!(guard.is_whitelisted("composer", &args("install --no-dev --optimize-autoloader")));
        assert!(!guard.is_whitelisted("composer", &args("require evil/pkg")));
        assert_eq!(guard.whitelist(), &CommandWhitelist::installer_default());
    }
}
