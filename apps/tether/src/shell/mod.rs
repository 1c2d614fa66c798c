use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::TermSize;

pub mod pty;
pub mod recording;

pub use pty::PtyLauncher;
pub use recording::{RecordingLauncher, RecordingShell, ShellOp};

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to launch shell: {0}")]
    Launch(String),
    #[error("shell io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown signal {0:?}")]
    UnknownSignal(String),
    #[error("shell has exited")]
    Exited,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// `$SHELL`, falling back to `/bin/sh`.
    pub fn login_shell() -> Self {
        let program = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self::new(program)
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub command: ShellCommand,
    pub size: TermSize,
}

/// Result of a health probe on a running shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Exited(Option<i32>),
    /// The shell's host could not be asked. May recover.
    Unreachable,
    /// Process tracking is lost for good.
    Gone,
}

#[async_trait]
pub trait ShellProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    async fn write(&self, bytes: &[u8]) -> Result<(), ShellError>;

    fn resize(&self, size: TermSize) -> Result<(), ShellError>;

    fn signal(&self, name: &str) -> Result<(), ShellError>;

    /// Next chunk of terminal output, `None` at end of stream.
    async fn read_chunk(&self) -> Result<Option<Vec<u8>>, ShellError>;

    fn probe(&self) -> Liveness;

    /// Waits for exit and returns the exit code when there is one.
    async fn wait(&self) -> Option<i32>;

    /// Graceful asks the shell to hang up; otherwise the process is killed.
    fn terminate(&self, graceful: bool) -> Result<(), ShellError>;
}

#[async_trait]
pub trait ShellLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ShellProcess>, ShellError>;
}

/// Maps `SIGINT`, `INT` or `2` style names to a signal number.
pub fn parse_signal(name: &str) -> Result<libc::c_int, ShellError> {
    let trimmed = name.trim();
    if let Ok(number) = trimmed.parse::<libc::c_int>() {
        if number > 0 && number < 32 {
            return Ok(number);
        }
        return Err(ShellError::UnknownSignal(name.to_string()));
    }
    let upper = trimmed.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    let signal = match bare {
        "HUP" => libc::SIGHUP,
        "INT" => libc::SIGINT,
        "QUIT" => libc::SIGQUIT,
        "KILL" => libc::SIGKILL,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "TERM" => libc::SIGTERM,
        "CONT" => libc::SIGCONT,
        "STOP" => libc::SIGSTOP,
        "TSTP" => libc::SIGTSTP,
        "WINCH" => libc::SIGWINCH,
        _ => return Err(ShellError::UnknownSignal(name.to_string())),
    };
    Ok(signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_parse_in_all_spellings() {
        assert_eq!(parse_signal("SIGINT").unwrap(), libc::SIGINT);
        assert_eq!(parse_signal("int").unwrap(), libc::SIGINT);
        assert_eq!(parse_signal("15").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal(" sigwinch ").unwrap(), libc::SIGWINCH);
        assert!(matches!(
            parse_signal("SIGBOGUS"),
            Err(ShellError::UnknownSignal(_))
        ));
        assert!(parse_signal("0").is_err());
    }

    #[test]
    fn command_builder_collects_env() {
        let cmd = ShellCommand::new("/bin/bash")
            .arg("-l")
            .env("TETHER_JOBID", "j1")
            .cwd("/tmp");
        assert_eq!(cmd.args, vec!["-l"]);
        assert_eq!(cmd.env, vec![("TETHER_JOBID".to_string(), "j1".to_string())]);
        assert_eq!(cmd.cwd, Some(PathBuf::from("/tmp")));
    }
}
