//! A shell that records what it is asked to do instead of running anything.
//! Drives the job controller in tests and embedders' dry runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};

use super::{LaunchSpec, Liveness, ShellError, ShellLauncher, ShellProcess, parse_signal};
use crate::protocol::TermSize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOp {
    Write(Vec<u8>),
    Resize(TermSize),
    Signal(String),
    Terminate { graceful: bool },
}

pub struct RecordingShell {
    spec: LaunchSpec,
    ops: Mutex<Vec<ShellOp>>,
    changed: Notify,
    liveness: Mutex<Liveness>,
    exit: watch::Sender<Option<Option<i32>>>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    output_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    exit_on_terminate: bool,
}

impl RecordingShell {
    fn new(spec: LaunchSpec, exit_on_terminate: bool) -> Self {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            spec,
            ops: Mutex::new(Vec::new()),
            changed: Notify::new(),
            liveness: Mutex::new(Liveness::Alive),
            exit: watch::channel(None).0,
            output_tx,
            output_rx: AsyncMutex::new(output_rx),
            exit_on_terminate,
        }
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn ops(&self) -> Vec<ShellOp> {
        self.ops.lock().clone()
    }

    /// Every byte written so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                ShellOp::Write(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Waits until at least `count` operations were recorded.
    pub async fn wait_for_ops(&self, count: usize, timeout: Duration) -> Vec<ShellOp> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            let ops = self.ops();
            if ops.len() >= count {
                return ops;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.ops();
            }
        }
    }

    pub fn emit_output(&self, bytes: &[u8]) {
        let _ = self.output_tx.send(bytes.to_vec());
    }

    pub fn set_liveness(&self, liveness: Liveness) {
        *self.liveness.lock() = liveness;
    }

    /// Simulates the shell process exiting.
    pub fn exit(&self, code: Option<i32>) {
        *self.liveness.lock() = Liveness::Exited(code);
        self.exit.send_replace(Some(code));
    }

    fn record(&self, op: ShellOp) -> Result<(), ShellError> {
        if self.exit.borrow().is_some() {
            return Err(ShellError::Exited);
        }
        self.ops.lock().push(op);
        self.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl ShellProcess for RecordingShell {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), ShellError> {
        self.record(ShellOp::Write(bytes.to_vec()))
    }

    fn resize(&self, size: TermSize) -> Result<(), ShellError> {
        self.record(ShellOp::Resize(size))
    }

    fn signal(&self, name: &str) -> Result<(), ShellError> {
        parse_signal(name)?;
        self.record(ShellOp::Signal(name.to_string()))
    }

    async fn read_chunk(&self) -> Result<Option<Vec<u8>>, ShellError> {
        let mut rx = self.output_rx.lock().await;
        let mut exit = self.exit.subscribe();
        tokio::select! {
            biased;
            chunk = rx.recv() => Ok(chunk),
            _ = exit.wait_for(Option::is_some) => Ok(rx.try_recv().ok()),
        }
    }

    fn probe(&self) -> Liveness {
        *self.liveness.lock()
    }

    async fn wait(&self) -> Option<i32> {
        let mut exit = self.exit.subscribe();
        match exit.wait_for(Option::is_some).await {
            Ok(code) => code.flatten(),
            Err(_) => None,
        }
    }

    fn terminate(&self, graceful: bool) -> Result<(), ShellError> {
        if self.exit.borrow().is_some() {
            return Ok(());
        }
        self.ops.lock().push(ShellOp::Terminate { graceful });
        self.changed.notify_waiters();
        if self.exit_on_terminate || !graceful {
            self.exit(None);
        }
        Ok(())
    }
}

/// Hands out [`RecordingShell`]s and keeps a handle to each one.
#[derive(Default)]
pub struct RecordingLauncher {
    launched: Mutex<Vec<Arc<RecordingShell>>>,
    fail_next: AtomicBool,
    ignore_hangup: AtomicBool,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_launch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Shells launched afterwards survive a graceful terminate, so callers
    /// fall through to the forced kill.
    pub fn ignore_hangup(&self) {
        self.ignore_hangup.store(true, Ordering::SeqCst);
    }

    pub fn launched(&self) -> Vec<Arc<RecordingShell>> {
        self.launched.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<RecordingShell>> {
        self.launched.lock().last().cloned()
    }
}

#[async_trait]
impl ShellLauncher for RecordingLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ShellProcess>, ShellError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ShellError::Launch(format!(
                "{}: no such file or directory",
                spec.command.program
            )));
        }
        let exit_on_terminate = !self.ignore_hangup.load(Ordering::SeqCst);
        let shell = Arc::new(RecordingShell::new(spec, exit_on_terminate));
        self.launched.lock().push(Arc::clone(&shell));
        Ok(shell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::ShellCommand;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            command: ShellCommand::new("/bin/zsh"),
            size: TermSize::default(),
        }
    }

    #[tokio::test]
    async fn records_operations_in_order() {
        let launcher = RecordingLauncher::new();
        let shell = launcher.launch(spec()).await.unwrap();
        shell.write(b"ls").await.unwrap();
        shell.resize(TermSize::new(40, 100)).unwrap();
        shell.signal("SIGINT").unwrap();
        let recorded = launcher.last().unwrap();
        assert_eq!(
            recorded.ops(),
            vec![
                ShellOp::Write(b"ls".to_vec()),
                ShellOp::Resize(TermSize::new(40, 100)),
                ShellOp::Signal("SIGINT".into()),
            ]
        );
        assert_eq!(recorded.written(), b"ls");
    }

    #[tokio::test]
    async fn exit_ends_output_and_rejects_writes() {
        let launcher = RecordingLauncher::new();
        let shell = launcher.launch(spec()).await.unwrap();
        let recorded = launcher.last().unwrap();
        recorded.emit_output(b"bye");
        recorded.exit(Some(0));
        assert_eq!(shell.read_chunk().await.unwrap(), Some(b"bye".to_vec()));
        assert_eq!(shell.read_chunk().await.unwrap(), None);
        assert_eq!(shell.wait().await, Some(0));
        assert!(matches!(shell.write(b"x").await, Err(ShellError::Exited)));
    }

    #[tokio::test]
    async fn launch_failure_is_one_shot() {
        let launcher = RecordingLauncher::new();
        launcher.fail_next_launch();
        assert!(launcher.launch(spec()).await.is_err());
        assert!(launcher.launch(spec()).await.is_ok());
    }
}
