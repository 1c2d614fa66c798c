//! Persistent shell jobs.
//!
//! A job owns one shell and outlives any single client connection. Input
//! reaches it through the job's own route (`job:<id>`), which is bound to the
//! job's input worker only while a client is attached, so keystrokes sent
//! while the job is disconnected wait in the route backlog and are flushed,
//! in order, on reattachment. The worker restores per-session order with a
//! reorder queue before touching the shell.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use status_bus::{LocalBus, StatusBus, StatusMessage};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::conn::ConnEvent;
use crate::protocol::{Envelope, ProtocolError, RouteId, TermSize};
use crate::router::{ROUTES_TOPIC, RouteError, RouteEvent, RouteTable};
use crate::shell::{ShellCommand, ShellError, ShellLauncher};
use crate::version::VersionGenerator;

mod controller;
pub mod status;

pub use controller::ShellJob;
pub use status::{DoneReason, JobStatus, JobStatusEvent};

pub const JOBS_TOPIC: &str = "jobs";

pub fn job_topic(job_id: &str) -> String {
    format!("job:{job_id}")
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("job {0} already exists")]
    Duplicate(String),
    #[error("job {job_id} is done ({reason})")]
    Done { job_id: String, reason: DoneReason },
    #[error("job {job_id} failed to start: {message}")]
    Startup { job_id: String, message: String },
    #[error("shell for job {0} is unreachable")]
    Unreachable(String),
    #[error("job {0} has no running shell")]
    NoShell(String),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// How a job should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "lowercase")]
pub enum StopIntent {
    /// Drop the client route; the shell keeps running.
    Detach,
    /// End the shell and keep the job record as `done(terminated)`.
    Terminate {
        #[serde(default)]
        graceful: bool,
    },
    /// End the shell and release everything the job holds.
    Destroy {
        #[serde(default)]
        graceful: bool,
    },
}

/// Request to start a persistent shell for a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termsize: Option<TermSize>,
    /// Client route to attach once the shell is up.
    #[serde(rename = "routeid", default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteId>,
    /// Connection hosting the shell, for reconnect notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn: Option<String>,
}

/// What every block controller can be asked to do.
#[async_trait]
pub trait BlockController: Send + Sync {
    fn block_id(&self) -> &str;

    fn status(&self) -> JobStatusEvent;

    async fn attach(&self, route: RouteId) -> Result<(), JobError>;

    fn detach(&self) -> Result<(), JobError>;

    fn send_input(&self, envelope: Envelope) -> Result<bool, JobError>;

    fn resize(&self, size: TermSize) -> Result<(), JobError>;

    fn reset_input(&self) -> Result<Option<String>, JobError>;

    async fn stop(&self, intent: StopIntent) -> Result<(), JobError>;
}

/// The controller kinds a block can run.
#[derive(Clone)]
pub enum Controller {
    ShellJob(Arc<ShellJob>),
}

impl Controller {
    pub fn as_block(&self) -> &dyn BlockController {
        match self {
            Controller::ShellJob(job) => job.as_ref(),
        }
    }
}

pub(crate) struct JobContext {
    pub routes: Arc<RouteTable>,
    pub bus: Arc<LocalBus<JobStatusEvent>>,
    pub versions: VersionGenerator,
    pub config: JobConfig,
}

pub struct JobManager {
    ctx: Arc<JobContext>,
    launcher: Arc<dyn ShellLauncher>,
    socket_path: Option<PathBuf>,
    jobs: RwLock<HashMap<String, Controller>>,
}

impl JobManager {
    /// Must be called inside a tokio runtime: it starts a task that watches
    /// route events for lost client routes.
    pub fn new(
        routes: Arc<RouteTable>,
        launcher: Arc<dyn ShellLauncher>,
        config: JobConfig,
        socket_path: Option<PathBuf>,
    ) -> Arc<Self> {
        let route_events = routes.subscribe(ROUTES_TOPIC);
        let manager = Arc::new(Self {
            ctx: Arc::new(JobContext {
                routes,
                bus: Arc::new(LocalBus::new()),
                versions: VersionGenerator::new(),
                config,
            }),
            launcher,
            socket_path,
            jobs: RwLock::new(HashMap::new()),
        });
        tokio::spawn(watch_routes(Arc::downgrade(&manager), route_events));
        manager
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.ctx.routes
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<StatusMessage<JobStatusEvent>> {
        self.ctx.bus.subscribe(topic)
    }

    pub fn subscribe_job(&self, job_id: &str) -> broadcast::Receiver<StatusMessage<JobStatusEvent>> {
        self.ctx.bus.subscribe(&job_topic(job_id))
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }

    fn controller(&self, job_id: &str) -> Result<Controller, JobError> {
        self.jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| JobError::UnknownJob(job_id.to_string()))
    }

    fn launch_command(&self, job_id: &str, spec: &JobSpec) -> ShellCommand {
        let mut command = match (&spec.cmd, &self.ctx.config.shell) {
            (Some(cmd), _) => ShellCommand::new(cmd.clone()).args(spec.args.iter().cloned()),
            (None, Some(shell)) => ShellCommand::new(shell.clone()),
            (None, None) => ShellCommand::login_shell(),
        };
        for (key, value) in &spec.env {
            command = command.env(key.clone(), value.clone());
        }
        command = command.env("TETHER_JOBID", job_id);
        if let Some(socket) = &self.socket_path {
            command = command.env("TETHER_SOCKET", socket.to_string_lossy().into_owned());
        }
        if let Some(cwd) = &spec.cwd {
            command = command.cwd(cwd.clone());
        }
        command
    }

    /// Starts a shell for a block and returns its job id. A launch failure
    /// leaves the job behind as `done(startuperror)`.
    pub async fn start_remote_shell_job(&self, spec: JobSpec) -> Result<String, JobError> {
        let job_id = spec
            .jobid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let term_size = spec.termsize.unwrap_or_default().normalized();
        let job = ShellJob::new(Arc::clone(&self.ctx), job_id.clone(), spec.conn.clone(), term_size);
        {
            let mut jobs = self.jobs.write();
            if jobs.contains_key(&job_id) {
                return Err(JobError::Duplicate(job_id));
            }
            jobs.insert(job_id.clone(), Controller::ShellJob(Arc::clone(&job)));
        }
        info!(target: "tether::job", job = %job_id, conn = ?spec.conn, "starting shell job");

        let command = self.launch_command(&job_id, &spec);
        job.launch(self.launcher.as_ref(), command).await?;
        if let Some(route) = spec.route {
            job.attach(route).await?;
        }
        Ok(job_id)
    }

    pub async fn attach(&self, job_id: &str, route: RouteId) -> Result<(), JobError> {
        let controller = self.controller(job_id)?;
        controller.as_block().attach(route).await
    }

    pub fn detach(&self, job_id: &str) -> Result<(), JobError> {
        self.controller(job_id)?.as_block().detach()
    }

    /// Enqueues input for the job. Never waits on the shell.
    pub fn send_input(&self, job_id: &str, envelope: Envelope) -> Result<bool, JobError> {
        self.controller(job_id)?.as_block().send_input(envelope)
    }

    pub fn resize(&self, job_id: &str, size: TermSize) -> Result<(), JobError> {
        self.controller(job_id)?.as_block().resize(size)
    }

    /// Clears a stalled input session. Returns the retired session id.
    pub fn reset_input(&self, job_id: &str) -> Result<Option<String>, JobError> {
        self.controller(job_id)?.as_block().reset_input()
    }

    pub async fn stop(&self, job_id: &str, intent: StopIntent) -> Result<(), JobError> {
        let controller = self.controller(job_id)?;
        controller.as_block().stop(intent).await?;
        if matches!(intent, StopIntent::Destroy { .. }) {
            self.jobs.write().remove(job_id);
            debug!(target: "tether::job", job = %job_id, "job destroyed");
        }
        Ok(())
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatusEvent, JobError> {
        Ok(self.controller(job_id)?.as_block().status())
    }

    /// Moves every job attached to `route` to `disconnected`.
    pub fn on_route_lost(&self, route: &RouteId) {
        let jobs: Vec<Controller> = self.jobs.read().values().cloned().collect();
        for controller in jobs {
            match controller {
                Controller::ShellJob(job) => job.on_route_lost(route),
            }
        }
    }

    /// True while some job attaches to `route` or sends its output there.
    pub fn holds_route(&self, route: &RouteId) -> bool {
        self.jobs.read().values().any(|controller| match controller {
            Controller::ShellJob(job) => job.holds_route(route),
        })
    }

    /// Re-probes disconnected jobs hosted on a connection that came back.
    pub fn on_conn_up(&self, conn_name: &str) {
        let jobs: Vec<Controller> = self.jobs.read().values().cloned().collect();
        for controller in jobs {
            match controller {
                Controller::ShellJob(job) if job.conn() == Some(conn_name) => {
                    debug!(target: "tether::job", job = %job.job_id(), conn = conn_name, "connection up, probing job");
                    job.probe_health();
                }
                Controller::ShellJob(_) => {}
            }
        }
    }

    pub fn spawn_conn_listener(
        self: &Arc<Self>,
        events: broadcast::Receiver<StatusMessage<ConnEvent>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(watch_connections(Arc::downgrade(self), events))
    }

    /// Destroys every job. Used on daemon shutdown.
    pub async fn shutdown(&self, graceful: bool) {
        for job_id in self.job_ids() {
            if let Err(err) = self.stop(&job_id, StopIntent::Destroy { graceful }).await {
                warn!(target: "tether::job", job = %job_id, error = %err, "failed to destroy job");
            }
        }
    }
}

async fn watch_routes(
    manager: Weak<JobManager>,
    mut events: broadcast::Receiver<StatusMessage<RouteEvent>>,
) {
    loop {
        let message = match events.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(target: "tether::job", skipped, "route event listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match message.event {
            RouteEvent::Down { route_id, .. } | RouteEvent::Closed { route_id } => {
                manager.on_route_lost(&route_id);
            }
            RouteEvent::Up { .. } | RouteEvent::BacklogOverflow { .. } => {}
        }
    }
}

async fn watch_connections(
    manager: Weak<JobManager>,
    mut events: broadcast::Receiver<StatusMessage<ConnEvent>>,
) {
    loop {
        let message = match events.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(manager) = manager.upgrade() else {
            return;
        };
        if let ConnEvent::Up { name, .. } = &message.event {
            manager.on_conn_up(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::shell::RecordingLauncher;

    fn manager() -> (Arc<JobManager>, Arc<RecordingLauncher>) {
        let routes = Arc::new(RouteTable::new(RouterConfig::default()));
        let launcher = Arc::new(RecordingLauncher::new());
        let manager = JobManager::new(
            routes,
            launcher.clone(),
            JobConfig::default(),
            Some(PathBuf::from("/run/tether.sock")),
        );
        (manager, launcher)
    }

    #[tokio::test]
    async fn launch_env_carries_job_id_and_socket() {
        let (manager, launcher) = manager();
        let mut env = BTreeMap::new();
        env.insert("LANG".to_string(), "C.UTF-8".to_string());
        let job_id = manager
            .start_remote_shell_job(JobSpec {
                jobid: Some("block-1".into()),
                cmd: Some("/bin/bash".into()),
                args: vec!["-l".into()],
                env,
                ..JobSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(job_id, "block-1");
        let shell = launcher.last().unwrap();
        let command = &shell.spec().command;
        assert_eq!(command.program, "/bin/bash");
        assert!(command.env.contains(&("LANG".into(), "C.UTF-8".into())));
        assert!(command.env.contains(&("TETHER_JOBID".into(), "block-1".into())));
        assert!(command.env.contains(&("TETHER_SOCKET".into(), "/run/tether.sock".into())));
        assert_eq!(shell.spec().size, TermSize::default());
        assert_eq!(manager.status(&job_id).unwrap().status, "init");
    }

    #[tokio::test]
    async fn duplicate_job_ids_are_rejected() {
        let (manager, _launcher) = manager();
        let spec = JobSpec {
            jobid: Some("dup".into()),
            ..JobSpec::default()
        };
        manager.start_remote_shell_job(spec.clone()).await.unwrap();
        assert!(matches!(
            manager.start_remote_shell_job(spec).await,
            Err(JobError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn startup_failure_is_terminal() {
        let (manager, launcher) = manager();
        launcher.fail_next_launch();
        let err = manager
            .start_remote_shell_job(JobSpec {
                jobid: Some("broken".into()),
                ..JobSpec::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Startup { .. }));
        let status = manager.status("broken").unwrap();
        assert_eq!(status.donereason, Some(DoneReason::StartupError));
        assert!(matches!(
            manager.attach("broken", RouteId::new("c")).await,
            Err(JobError::Done { .. })
        ));
    }

    #[tokio::test]
    async fn destroy_forgets_the_job() {
        let (manager, _launcher) = manager();
        let job_id = manager
            .start_remote_shell_job(JobSpec::default())
            .await
            .unwrap();
        manager
            .stop(&job_id, StopIntent::Destroy { graceful: false })
            .await
            .unwrap();
        assert!(matches!(
            manager.status(&job_id),
            Err(JobError::UnknownJob(_))
        ));
        assert!(!manager.routes().contains(&RouteId::job(&job_id)));
    }

    #[test]
    fn stop_intent_wire_shape() {
        let intent: StopIntent =
            serde_json::from_str(r#"{"intent":"terminate","graceful":true}"#).unwrap();
        assert_eq!(intent, StopIntent::Terminate { graceful: true });
        let intent: StopIntent = serde_json::from_str(r#"{"intent":"detach"}"#).unwrap();
        assert_eq!(intent, StopIntent::Detach);
    }
}
