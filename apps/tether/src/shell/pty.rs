use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize, native_pty_system};
use tokio::sync::watch;
use tokio::task;
use tracing::{debug, warn};

use super::{LaunchSpec, Liveness, ShellCommand, ShellError, ShellLauncher, ShellProcess, parse_signal};
use crate::protocol::TermSize;

/// Launches shells on a local pty.
#[derive(Debug, Default, Clone)]
pub struct PtyLauncher;

#[async_trait]
impl ShellLauncher for PtyLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ShellProcess>, ShellError> {
        let shell = task::spawn_blocking(move || PtyShell::spawn(spec))
            .await
            .map_err(|err| ShellError::Launch(format!("join launch task: {err}")))??;
        Ok(Arc::new(shell))
    }
}

pub struct PtyShell {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    reader: Arc<Mutex<Box<dyn Read + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    exit: watch::Receiver<Option<Option<i32>>>,
}

impl PtyShell {
    const CHUNK: usize = 4096;

    fn spawn(spec: LaunchSpec) -> Result<Self, ShellError> {
        let size = spec.size.normalized();
        let mut pair = spawn_pair(size)?;
        let mut child = spawn_child(&mut pair, &spec.command)?;
        let master = pair.master;
        let reader = master
            .try_clone_reader()
            .map_err(|err| ShellError::Launch(format!("clone pty reader: {err}")))?;
        let writer = master
            .take_writer()
            .map_err(|err| ShellError::Launch(format!("take pty writer: {err}")))?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        let (exit_tx, exit_rx) = watch::channel(None);
        std::thread::Builder::new()
            .name("tether-pty-wait".into())
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => Some(status.exit_code() as i32),
                    Err(err) => {
                        warn!(target: "tether::shell", error = %err, "wait for pty child failed");
                        None
                    }
                };
                exit_tx.send_replace(Some(code));
            })?;
        debug!(target: "tether::shell", pid = ?pid, program = %spec.command.program, "pty shell spawned");

        Ok(Self {
            master: Arc::new(Mutex::new(master)),
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            killer: Mutex::new(killer),
            pid,
            exit: exit_rx,
        })
    }

    fn exit_code(&self) -> Option<Option<i32>> {
        *self.exit.borrow()
    }

    fn send_signal(&self, signal: libc::c_int) -> Result<(), ShellError> {
        let Some(pid) = self.pid else {
            return Err(ShellError::Exited);
        };
        if self.exit_code().is_some() {
            return Err(ShellError::Exited);
        }
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error().into())
        }
    }
}

#[async_trait]
impl ShellProcess for PtyShell {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), ShellError> {
        let writer = Arc::clone(&self.writer);
        let bytes = bytes.to_vec();
        task::spawn_blocking(move || {
            let mut guard = writer.lock();
            guard.write_all(&bytes)?;
            guard.flush()?;
            Ok::<_, ShellError>(())
        })
        .await
        .map_err(|err| ShellError::Io(std::io::Error::other(err)))?
    }

    fn resize(&self, size: TermSize) -> Result<(), ShellError> {
        let size = size.normalized();
        self.master
            .lock()
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| ShellError::Io(std::io::Error::other(err.to_string())))
    }

    fn signal(&self, name: &str) -> Result<(), ShellError> {
        self.send_signal(parse_signal(name)?)
    }

    async fn read_chunk(&self) -> Result<Option<Vec<u8>>, ShellError> {
        let reader = Arc::clone(&self.reader);
        task::spawn_blocking(move || {
            loop {
                let mut guard = reader.lock();
                let mut buffer = vec![0u8; Self::CHUNK];
                match guard.read(&mut buffer) {
                    Ok(0) => return Ok(None),
                    Ok(n) => {
                        buffer.truncate(n);
                        return Ok(Some(buffer));
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    // linux reports EIO once the slave side is gone
                    Err(err) if err.raw_os_error() == Some(libc::EIO) => return Ok(None),
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
        .map_err(|err| ShellError::Io(std::io::Error::other(err)))?
    }

    fn probe(&self) -> Liveness {
        if let Some(code) = self.exit_code() {
            return Liveness::Exited(code);
        }
        let Some(pid) = self.pid else {
            return Liveness::Gone;
        };
        // SAFETY: signal 0 only checks that the process exists.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return Liveness::Alive;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => Liveness::Gone,
            _ => Liveness::Unreachable,
        }
    }

    async fn wait(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(code) => code.flatten(),
            Err(_) => None,
        }
    }

    fn terminate(&self, graceful: bool) -> Result<(), ShellError> {
        if self.exit_code().is_some() {
            return Ok(());
        }
        if graceful {
            return self.send_signal(libc::SIGHUP);
        }
        self.killer.lock().kill().map_err(ShellError::from)
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        if self.exit_code().is_none() {
            let _ = self.killer.lock().kill();
        }
    }
}

fn spawn_pair(size: TermSize) -> Result<PtyPair, ShellError> {
    let pty_system = native_pty_system();
    pty_system
        .openpty(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| ShellError::Launch(format!("open pty pair: {err}")))
}

fn spawn_child(
    pair: &mut PtyPair,
    command: &ShellCommand,
) -> Result<Box<dyn Child + Send + Sync>, ShellError> {
    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &command.cwd {
        cmd.cwd(Path::new(cwd));
    }
    pair.slave
        .spawn_command(cmd)
        .map_err(|err| ShellError::Launch(format!("spawn {}: {err}", command.program)))
}
