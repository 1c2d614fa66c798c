use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tracing::{info, warn};

use super::{ConnError, Connector};
use crate::transport::{StreamConfig, StreamTransport, Transport};

/// Reaches a remote daemon by running it over `ssh -T` and framing
/// envelopes across the child's stdio.
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub target: String,
    pub ssh_binary: String,
    pub ssh_flags: Vec<String>,
    pub remote_command: String,
    pub stream: StreamConfig,
}

impl SshConnector {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ssh_binary: "ssh".to_string(),
            ssh_flags: Vec::new(),
            remote_command: "tether serve --stdio".to_string(),
            stream: StreamConfig::default(),
        }
    }

    /// Arguments passed to the ssh binary, in order.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string(), "-T".to_string()];
        args.extend(self.ssh_flags.iter().cloned());
        args.push(self.target.clone());
        args.push(self.remote_command.clone());
        args
    }

    fn command(&self) -> TokioCommand {
        let mut command = TokioCommand::new(&self.ssh_binary);
        command.args(self.ssh_args());
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn open(&self, name: &str) -> Result<Arc<dyn Transport>, ConnError> {
        info!(
            target: "tether::conn",
            conn = name,
            target_host = %self.target,
            ssh_binary = %self.ssh_binary,
            remote_command = %self.remote_command,
            "launching ssh"
        );
        let open_error = |message: String| ConnError::Open {
            name: name.to_string(),
            message,
        };
        let mut child = self
            .command()
            .spawn()
            .map_err(|err| open_error(format!("spawn {}: {err}", self.ssh_binary)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| open_error("ssh stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| open_error("ssh stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_child_lines(BufReader::new(stderr), name.to_string()));
        }

        let transport = Arc::new(StreamTransport::spawn(
            stdout,
            stdin,
            self.stream.clone(),
            format!("ssh:{}", self.target),
        ));
        tokio::spawn(reap_on_close(child, Arc::clone(&transport), name.to_string()));
        Ok(transport)
    }
}

/// Kills ssh once the transport is closed.
async fn reap_on_close(mut child: Child, transport: Arc<StreamTransport>, name: String) {
    transport.closed().await;
    drop(transport);
    if let Err(err) = child.start_kill() {
        warn!(target: "tether::conn", conn = %name, error = %err, "failed to terminate ssh");
    }
    match child.wait().await {
        Ok(status) if !status.success() => {
            info!(target: "tether::conn", conn = %name, status = %status, "ssh exited");
        }
        Err(err) => warn!(target: "tether::conn", conn = %name, error = %err, "failed to await ssh"),
        _ => {}
    }
}

async fn forward_child_lines<R>(mut reader: BufReader<R>, name: String)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                if !trimmed.is_empty() {
                    info!(target: "tether::ssh", conn = %name, message = trimmed);
                }
            }
            Err(err) => {
                warn!(target: "tether::ssh", conn = %name, error = %err, "failed to read ssh stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_args_put_flags_before_target() {
        let mut connector = SshConnector::new("dev@box");
        connector.ssh_flags = vec!["-p".into(), "2222".into()];
        assert_eq!(
            connector.ssh_args(),
            vec!["-o", "BatchMode=yes", "-T", "-p", "2222", "dev@box", "tether serve --stdio"]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_an_open_error() {
        let mut connector = SshConnector::new("dev@box");
        connector.ssh_binary = "/definitely/not/ssh".into();
        assert!(matches!(
            connector.open("devbox").await,
            Err(ConnError::Open { .. })
        ));
    }
}
