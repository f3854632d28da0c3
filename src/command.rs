//! External Commands
//!
//! The validator and the reload trigger are external programs. They are modelled
//! as an [`ExternalAction`] capability so the supervisor never needs to know
//! anything about the proxy it manages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Captured output longer than this is truncated before logging
const MAX_OUTPUT_BYTES: usize = 4096;

/// How to invoke an external program
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Run through `sh -c`
    Shell(String),
    /// Program followed by its arguments, no shell involved
    Argv(Vec<String>),
}

impl CommandSpec {
    /// An empty shell string or an empty argv list disables the command
    pub fn is_empty(&self) -> bool {
        match self {
            CommandSpec::Shell(line) => line.trim().is_empty(),
            CommandSpec::Argv(argv) => argv.is_empty(),
        }
    }

    fn to_command(&self) -> Command {
        match self {
            CommandSpec::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            CommandSpec::Argv(argv) => {
                let mut cmd = Command::new(&argv[0]);
                cmd.args(&argv[1..]);
                cmd
            }
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Shell(line) => write!(f, "{}", line),
            CommandSpec::Argv(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// Result of running an external action
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    /// `None` when the process never ran, timed out or died from a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// Set when the action failed before producing an exit status
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::ZERO,
            error: Some(error.into()),
        }
    }

    /// One-line description for log messages
    pub fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        let detail = if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        };
        match self.exit_code {
            Some(code) if detail.is_empty() => format!("exit code {}", code),
            Some(code) => format!("exit code {}: {}", code, detail),
            None if detail.is_empty() => "terminated by signal".to_string(),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

/// A side effect the supervisor can trigger and observe the success of
pub trait ExternalAction {
    /// Short name used in logs ("validate", "reload")
    fn name(&self) -> &str;

    fn run(&self) -> impl std::future::Future<Output = ActionOutcome> + Send;
}

/// [`ExternalAction`] backed by an external program
#[derive(Debug, Clone)]
pub struct CommandAction {
    name: String,
    spec: Option<CommandSpec>,
    timeout: Duration,
}

impl CommandAction {
    pub fn new(name: impl Into<String>, spec: Option<CommandSpec>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            spec: spec.filter(|spec| !spec.is_empty()),
            timeout,
        }
    }

    /// Whether this action always succeeds without running anything
    pub fn is_noop(&self) -> bool {
        self.spec.is_none()
    }

    pub fn spec(&self) -> Option<&CommandSpec> {
        self.spec.as_ref()
    }
}

impl ExternalAction for CommandAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> ActionOutcome {
        let Some(spec) = &self.spec else {
            debug!(action = %self.name, "No command configured, treating as success");
            return ActionOutcome::succeeded();
        };

        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(action = %self.name, command = %spec, "Running external command");
        let start = Instant::now();

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut outcome = ActionOutcome::failed(format!("failed to spawn '{}': {}", spec, e));
                outcome.elapsed = start.elapsed();
                return outcome;
            }
        };

        // Dropping the future on timeout drops the child, which kills it
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => ActionOutcome {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: truncate_output(&output.stdout),
                stderr: truncate_output(&output.stderr),
                elapsed: start.elapsed(),
                error: None,
            },
            Ok(Err(e)) => {
                let mut outcome = ActionOutcome::failed(format!("failed to wait for '{}': {}", spec, e));
                outcome.elapsed = start.elapsed();
                outcome
            }
            Err(_) => {
                let mut outcome =
                    ActionOutcome::failed(format!("'{}' timed out after {:?}", spec, self.timeout));
                outcome.elapsed = start.elapsed();
                outcome
            }
        }
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT_BYTES {
        return text.into_owned();
    }
    let mut end = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes truncated)", &text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn shell(line: &str) -> Option<CommandSpec> {
        Some(CommandSpec::Shell(line.to_string()))
    }

    #[tokio::test]
    async fn test_noop_action_succeeds() {
        let action = CommandAction::new("validate", None, Duration::from_secs(1));
        assert!(action.is_noop());
        assert!(action.run().await.success);

        let empty = CommandAction::new("reload", shell("   "), Duration::from_secs(1));
        assert!(empty.is_noop());
        assert!(empty.run().await.success);
    }

    #[tokio::test]
    async fn test_shell_command_success() {
        let action = CommandAction::new("validate", shell("echo configuration ok"), Duration::from_secs(5));
        let outcome = action.run().await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout.trim(), "configuration ok");
    }

    #[tokio::test]
    async fn test_shell_command_failure_captures_stderr() {
        let action = CommandAction::new(
            "validate",
            shell("echo 'unexpected \"}\"' >&2; exit 1"),
            Duration::from_secs(5),
        );
        let outcome = action.run().await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.summary().contains("exit code 1"));
        assert!(outcome.summary().contains("unexpected"));
    }

    #[tokio::test]
    async fn test_argv_command() {
        let action = CommandAction::new(
            "reload",
            Some(CommandSpec::Argv(vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()])),
            Duration::from_secs(5),
        );
        let outcome = action.run().await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_failure() {
        let action = CommandAction::new(
            "reload",
            Some(CommandSpec::Argv(vec!["/nonexistent/snippet-reloader-test-binary".to_string()])),
            Duration::from_secs(5),
        );
        let outcome = action.run().await;
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap_or_default().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let action = CommandAction::new("validate", shell("sleep 5"), Duration::from_millis(100));
        let start = Instant::now();
        let outcome = action.run().await;
        assert!(!outcome.success);
        assert!(outcome.summary().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_command_spec_deserialization() {
        #[derive(Debug, Deserialize)]
        struct Wrapper {
            cmd: CommandSpec,
        }

        let shell: Wrapper = assert_ok!(toml::from_str(r#"cmd = "nginx -t""#));
        assert_eq!(shell.cmd, CommandSpec::Shell("nginx -t".to_string()));
        assert_eq!(shell.cmd.to_string(), "nginx -t");

        let argv: Wrapper = assert_ok!(toml::from_str(r#"cmd = ["nginx", "-s", "reload"]"#));
        assert_eq!(argv.cmd.to_string(), "nginx -s reload");

        assert_err!(toml::from_str::<Wrapper>("cmd = 42"));
    }

    #[test]
    fn test_truncate_output() {
        let long = "x".repeat(MAX_OUTPUT_BYTES + 10);
        let truncated = truncate_output(long.as_bytes());
        assert!(truncated.ends_with("(10 bytes truncated)"));
        assert_eq!(truncate_output(b"short"), "short");
    }
}
