//! External command execution with timeouts.
//!
//! Adapters describe each device operation as an argv. The runner maps
//! exit status and output onto [`DeviceError`].

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{DeviceError, DeviceResult, looks_like_session_expiry};

/// Exit status an adapter command uses to report rejected credentials.
pub const EXIT_AUTH_REQUIRED: i32 = 77;

/// Program plus fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Build a `tokio` command with `extra` appended to the fixed args.
    pub fn command(&self, extra: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).args(extra);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    /// Run to completion within `timeout` and return trimmed stdout.
    pub async fn run(&self, extra: &[&str], timeout: Duration) -> DeviceResult<String> {
        let mut cmd = self.command(extra);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| {
                DeviceError::Transport(format!("failed to run {}: {e}", self.program))
            })?,
            Err(_) => return Err(DeviceError::Timeout(timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            if looks_like_session_expiry(&stdout) {
                return Err(DeviceError::SessionExpired(stdout));
            }
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let code = output.status.code().unwrap_or(-1);
        if code == EXIT_AUTH_REQUIRED {
            return Err(DeviceError::AuthRequired(stderr));
        }
        let detail = format!("{} exit code {code}: {stderr}", self.program);
        if looks_like_session_expiry(&stdout) {
            return Err(DeviceError::SessionExpired(detail));
        }
        Err(DeviceError::from_transport(detail))
    }
}

impl TryFrom<Vec<String>> for CommandSpec {
    type Error = String;

    fn try_from(mut argv: Vec<String>) -> Result<Self, Self::Error> {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err("command must have at least a program name".to_string());
        }
        let program = argv.remove(0);
        Ok(Self { program, args: argv })
    }
}

impl From<CommandSpec> for Vec<String> {
    fn from(spec: CommandSpec) -> Self {
        let mut argv = vec![spec.program];
        argv.extend(spec.args);
        argv
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    #[test]
    fn empty_argv_rejected() {
        assert!(CommandSpec::try_from(Vec::new()).is_err());
        let spec = CommandSpec::try_from(vec!["echo".to_string(), "hi".to_string()]).unwrap();
        assert_eq!(spec.program(), "echo");
        assert_eq!(Vec::<String>::from(spec), vec!["echo", "hi"]);
    }

    #[tokio::test]
    async fn captures_trimmed_stdout() {
        let out = sh("echo '  on  '").run(&[], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, "on");
    }

    #[tokio::test]
    async fn extra_args_are_appended() {
        let spec = sh("echo \"$0 $1\"");
        let out = spec.run(&["off", "now"], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, "off now");
    }

    #[tokio::test]
    async fn exit_77_is_auth_required() {
        let err = sh("echo denied >&2; exit 77").run(&[], Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, DeviceError::AuthRequired("denied".into()));
    }

    #[tokio::test]
    async fn nonzero_exit_is_transport() {
        let err = sh("exit 3").run(&[], Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
    }

    #[tokio::test]
    async fn session_event_output_is_expiry() {
        let err = sh("echo '{\"event\":\"ms.channel.ready\"}'")
            .run(&[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_session_expiry());
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = sh("sleep 5").run(&[], Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err, DeviceError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn missing_program_is_transport() {
        let spec = CommandSpec::new("/nonexistent/artsync-test-binary", Vec::<String>::new());
        let err = spec.run(&[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DeviceError::Transport(_)));
    }
}
