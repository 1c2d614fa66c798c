use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use status_bus::StatusBus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    BlockController, DoneReason, JOBS_TOPIC, JobContext, JobError, JobStatus, JobStatusEvent,
    StopIntent, job_topic,
};
use crate::metrics;
use crate::protocol::{Envelope, InputPayload, RouteId, TermSize, commands};
use crate::reorder::{Accepted, InputReorder};
use crate::shell::{LaunchSpec, Liveness, ShellCommand, ShellLauncher, ShellProcess};
use crate::transport::{ChannelTransport, Transport};
use crate::version::VersionTs;

struct JobState {
    status: JobStatus,
    term_size: TermSize,
    version: VersionTs,
    /// Client route currently attached, if any.
    attached: Option<RouteId>,
    /// Where output and status events go. Starts as the job's placeholder
    /// controller route and stays on a lost client route until reattached.
    output_route: RouteId,
    exit_code: Option<i32>,
    unreachable_since: Option<Instant>,
}

/// Controller for one persistent shell.
pub struct ShellJob {
    ctx: Arc<JobContext>,
    job_id: String,
    route: RouteId,
    placeholder: RouteId,
    conn: Option<String>,
    state: Mutex<JobState>,
    attach_gate: Mutex<()>,
    shell: Mutex<Option<Arc<dyn ShellProcess>>>,
    reorder: Mutex<InputReorder<InputPayload>>,
    sinks: Mutex<Option<mpsc::UnboundedSender<ChannelTransport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShellJob {
    pub(crate) fn new(
        ctx: Arc<JobContext>,
        job_id: String,
        conn: Option<String>,
        term_size: TermSize,
    ) -> Arc<Self> {
        let route = RouteId::job(&job_id);
        let placeholder = RouteId::controller(&job_id);
        ctx.routes.ensure_route(&route);
        ctx.routes.ensure_route(&placeholder);
        let reorder = InputReorder::new(
            ctx.config.initial_seq,
            ctx.config.reorder_max_held,
            ctx.config.retired_sessions,
        );
        let version = ctx.versions.next();
        Arc::new(Self {
            job_id,
            route,
            placeholder: placeholder.clone(),
            conn,
            state: Mutex::new(JobState {
                status: JobStatus::Init,
                term_size,
                version,
                attached: None,
                output_route: placeholder,
                exit_code: None,
                unreachable_since: None,
            }),
            attach_gate: Mutex::new(()),
            shell: Mutex::new(None),
            reorder: Mutex::new(reorder),
            sinks: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            ctx,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The job's input route, `job:<id>`.
    pub fn route(&self) -> &RouteId {
        &self.route
    }

    pub fn conn(&self) -> Option<&str> {
        self.conn.as_deref()
    }

    pub fn current_status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn attached_route(&self) -> Option<RouteId> {
        self.state.lock().attached.clone()
    }

    pub(crate) fn holds_route(&self, route: &RouteId) -> bool {
        let state = self.state.lock();
        &state.output_route == route || state.attached.as_ref() == Some(route)
    }

    fn shell(&self) -> Option<Arc<dyn ShellProcess>> {
        self.shell.lock().clone()
    }

    fn done_error(&self, reason: DoneReason) -> JobError {
        JobError::Done {
            job_id: self.job_id.clone(),
            reason,
        }
    }

    fn ensure_live(&self) -> Result<(), JobError> {
        match self.current_status().done_reason() {
            Some(reason) => Err(self.done_error(reason)),
            None => Ok(()),
        }
    }

    pub(crate) async fn launch(
        self: &Arc<Self>,
        launcher: &dyn ShellLauncher,
        command: ShellCommand,
    ) -> Result<(), JobError> {
        let size = self.state.lock().term_size;
        let program = command.program.clone();
        let shell = match launcher.launch(LaunchSpec { command, size }).await {
            Ok(shell) => shell,
            Err(err) => {
                warn!(target: "tether::job", job = %self.job_id, program = %program, error = %err, "shell failed to start");
                self.finish(DoneReason::StartupError);
                return Err(JobError::Startup {
                    job_id: self.job_id.clone(),
                    message: err.to_string(),
                });
            }
        };
        info!(target: "tether::job", job = %self.job_id, pid = ?shell.pid(), program = %program, "shell started");
        *self.shell.lock() = Some(Arc::clone(&shell));

        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        *self.sinks.lock() = Some(sink_tx);
        let weak = Arc::downgrade(self);
        let tasks = vec![
            tokio::spawn(run_input(weak.clone(), sink_rx)),
            tokio::spawn(pump_output(weak.clone(), Arc::clone(&shell))),
            tokio::spawn(wait_exit(weak.clone(), Arc::clone(&shell))),
            tokio::spawn(monitor_health(weak, self.ctx.config.probe_interval())),
        ];
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    fn event_locked(&self, state: &JobState) -> JobStatusEvent {
        JobStatusEvent {
            jobid: self.job_id.clone(),
            status: state.status.as_str().to_string(),
            donereason: state.status.done_reason(),
            termsize: state.term_size,
            version: state.version,
            exitcode: state.exit_code,
        }
    }

    fn snapshot(&self) -> JobStatusEvent {
        self.event_locked(&self.state.lock())
    }

    fn publish(&self, event: JobStatusEvent, route: &RouteId) {
        let payload = serde_json::to_value(&event).unwrap_or_default();
        self.ctx
            .routes
            .send(route, Envelope::event(route.clone(), commands::JOB_STATUS, payload));
        let _ = self.ctx.bus.publish(&job_topic(&self.job_id), event.clone());
        let _ = self.ctx.bus.publish(JOBS_TOPIC, event);
    }

    /// Applies a status change. Returns false when the move is not allowed
    /// from the current status.
    fn transition(&self, next: JobStatus) -> bool {
        let (event, route) = {
            let mut state = self.state.lock();
            let previous = state.status;
            if !previous.can_transition_to(next) {
                debug!(target: "tether::job", job = %self.job_id, from = %previous, to = %next, "ignoring transition");
                return false;
            }
            state.status = next;
            state.version = self.ctx.versions.next();
            info!(target: "tether::job", job = %self.job_id, from = %previous, to = %next, "job status");
            (self.event_locked(&state), state.output_route.clone())
        };
        metrics::JOB_TRANSITIONS
            .with_label_values(&[next.as_str()])
            .inc();
        self.publish(event, &route);
        true
    }

    /// Re-sends the current status with a fresh version.
    fn announce(&self) {
        let (event, route) = {
            let mut state = self.state.lock();
            state.version = self.ctx.versions.next();
            (self.event_locked(&state), state.output_route.clone())
        };
        self.publish(event, &route);
    }

    fn finish(&self, reason: DoneReason) {
        if !self.transition(JobStatus::Done(reason)) {
            return;
        }
        self.sinks.lock().take();
        let discarded = self.ctx.routes.close_route(&self.route);
        if discarded > 0 {
            debug!(target: "tether::job", job = %self.job_id, discarded, "dropped queued input");
        }
    }

    fn on_exit(&self, code: Option<i32>) {
        {
            let mut state = self.state.lock();
            if state.exit_code.is_none() {
                state.exit_code = code;
            }
        }
        self.finish(DoneReason::Terminated);
    }

    /// Hands a fresh input channel to the worker and binds the job route to
    /// it, which flushes anything queued while detached.
    fn bind_input(&self) -> Result<(), JobError> {
        let (near, far) = ChannelTransport::pair(self.ctx.config.input_queue_depth);
        {
            let sinks = self.sinks.lock();
            let Some(sinks) = sinks.as_ref() else {
                return Err(JobError::NoShell(self.job_id.clone()));
            };
            if sinks.send(far).is_err() {
                return Err(JobError::NoShell(self.job_id.clone()));
            }
        }
        self.ctx.routes.register_route(&self.route, Arc::new(near))?;
        Ok(())
    }

    fn attach_route(&self, route: RouteId) -> Result<(), JobError> {
        let _gate = self.attach_gate.lock();
        self.ensure_live()?;
        let shell = self
            .shell()
            .ok_or_else(|| JobError::NoShell(self.job_id.clone()))?;
        let status = self.current_status();
        match shell.probe() {
            Liveness::Alive => {}
            Liveness::Exited(code) => {
                self.on_exit(code);
                return Err(self.done_error(DoneReason::Terminated));
            }
            Liveness::Gone => {
                self.finish(DoneReason::Gone);
                return Err(self.done_error(DoneReason::Gone));
            }
            Liveness::Unreachable if status == JobStatus::Disconnected => {
                return Err(JobError::Unreachable(self.job_id.clone()));
            }
            Liveness::Unreachable => {}
        }

        let (previous, displaced_live, size) = {
            let mut state = self.state.lock();
            if state.status == JobStatus::Connected && state.attached.as_ref() == Some(&route) {
                drop(state);
                debug!(target: "tether::job", job = %self.job_id, route = %route, "already attached");
                self.announce();
                return Ok(());
            }
            let displaced_live = state.status == JobStatus::Connected;
            let previous = std::mem::replace(&mut state.output_route, route.clone());
            state.attached = Some(route.clone());
            state.unreachable_since = None;
            (previous, displaced_live, state.term_size)
        };

        if previous != route && !displaced_live {
            let moved = self.ctx.routes.transfer_backlog(&previous, &route);
            if previous == self.placeholder {
                self.ctx.routes.remove_route(&previous);
            } else {
                self.ctx.routes.close_route(&previous);
            }
            debug!(target: "tether::job", job = %self.job_id, from = %previous, to = %route, moved, "output moved to new route");
        }

        if !displaced_live {
            self.bind_input()?;
        }
        if let Err(err) = shell.resize(size) {
            debug!(target: "tether::job", job = %self.job_id, error = %err, "replaying term size failed");
        }
        if !self.transition(JobStatus::Connected) {
            self.announce();
        }
        self.ctx.routes.flush_backlog(&route);
        Ok(())
    }

    fn detach_route(&self, reason: &str) -> Result<(), JobError> {
        let _gate = self.attach_gate.lock();
        self.ensure_live()?;
        if self.current_status() != JobStatus::Connected {
            return Ok(());
        }
        self.ctx.routes.detach_route(&self.route, reason);
        self.state.lock().attached = None;
        self.transition(JobStatus::Disconnected);
        Ok(())
    }

    /// Called when a client route goes down or closes.
    pub(crate) fn on_route_lost(&self, route: &RouteId) {
        if self.attached_route().as_ref() != Some(route) {
            return;
        }
        info!(target: "tether::job", job = %self.job_id, route = %route, "attached route lost");
        if let Err(err) = self.detach_route("client route lost") {
            debug!(target: "tether::job", job = %self.job_id, error = %err, "detach after route loss");
        }
    }

    /// Checks on a disconnected shell. Exited or gone shells finish the job;
    /// a shell unreachable past the recovery window counts as gone.
    pub(crate) fn probe_health(&self) {
        if self.current_status() != JobStatus::Disconnected {
            return;
        }
        let Some(shell) = self.shell() else {
            self.finish(DoneReason::Gone);
            return;
        };
        match shell.probe() {
            Liveness::Alive => {
                self.state.lock().unreachable_since = None;
            }
            Liveness::Exited(code) => self.on_exit(code),
            Liveness::Gone => self.finish(DoneReason::Gone),
            Liveness::Unreachable => {
                let since = *self
                    .state
                    .lock()
                    .unreachable_since
                    .get_or_insert_with(Instant::now);
                if since.elapsed() >= self.ctx.config.recovery_window() {
                    warn!(target: "tether::job", job = %self.job_id, "shell unreachable past recovery window");
                    self.finish(DoneReason::Gone);
                }
            }
        }
    }

    async fn handle_input(&self, envelope: Envelope) {
        if envelope.command() != Some(commands::JOB_INPUT) {
            debug!(target: "tether::job", job = %self.job_id, command = ?envelope.command(), "ignoring non-input envelope");
            return;
        }
        let payload: InputPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "tether::job", job = %self.job_id, error = %err, "malformed input payload");
                return;
            }
        };
        let accepted = self.reorder.lock().accept(
            envelope.input_session_id.as_deref(),
            envelope.seq_num,
            payload,
        );
        match accepted {
            Ok(Accepted::Released(batch)) => {
                if batch.is_empty() {
                    metrics::REORDER_EVENTS.with_label_values(&["held"]).inc();
                }
                for input in batch {
                    if let Err(err) = self.apply_input(input).await {
                        warn!(target: "tether::job", job = %self.job_id, error = %err, "applying input failed");
                    }
                }
            }
            Ok(Accepted::StaleSession) => {
                metrics::REORDER_EVENTS.with_label_values(&["stale"]).inc();
                debug!(target: "tether::job", job = %self.job_id, session = ?envelope.input_session_id, "input from retired session");
            }
            Err(err) => {
                metrics::REORDER_EVENTS.with_label_values(&["overflow"]).inc();
                warn!(target: "tether::job", job = %self.job_id, error = %err, "input session stalled");
                let route = self.state.lock().output_route.clone();
                let notice = Envelope::event(
                    route.clone(),
                    commands::MESSAGE,
                    json!({ "jobid": self.job_id, "message": err.to_string() }),
                );
                self.ctx.routes.send(&route, notice);
            }
        }
    }

    /// Data first, then signal, then size.
    async fn apply_input(&self, input: InputPayload) -> Result<(), JobError> {
        let shell = self
            .shell()
            .ok_or_else(|| JobError::NoShell(self.job_id.clone()))?;
        if let Some(bytes) = input.decode_data()? {
            if !bytes.is_empty() {
                shell.write(&bytes).await?;
            }
        }
        if let Some(name) = &input.signame {
            shell.signal(name)?;
        }
        if let Some(size) = input.termsize {
            let size = size.normalized();
            shell.resize(size)?;
            self.state.lock().term_size = size;
        }
        Ok(())
    }

    fn forward_output(&self, chunk: &[u8]) {
        let route = self.state.lock().output_route.clone();
        let data = InputPayload::data(chunk).data64;
        let envelope = Envelope::event(
            route.clone(),
            commands::JOB_OUTPUT,
            json!({ "jobid": self.job_id, "data64": data }),
        );
        self.ctx.routes.send(&route, envelope);
    }

    async fn terminate_shell(&self, graceful: bool) -> Option<i32> {
        let shell = self.shell()?;
        let grace = self.ctx.config.stop_grace();
        if graceful && shell.terminate(true).is_ok() {
            if let Ok(code) = tokio::time::timeout(grace, shell.wait()).await {
                return code;
            }
            debug!(target: "tether::job", job = %self.job_id, "shell ignored hangup, killing");
        }
        if let Err(err) = shell.terminate(false) {
            warn!(target: "tether::job", job = %self.job_id, error = %err, "killing shell failed");
        }
        tokio::time::timeout(grace, shell.wait()).await.ok().flatten()
    }

    /// Releases everything the job holds: workers, input state and routes.
    fn release(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.sinks.lock().take();
        self.shell.lock().take();
        if let Some(session) = self.reorder.lock().reset() {
            debug!(target: "tether::job", job = %self.job_id, session = %session, "input session cancelled");
        }
        self.ctx.routes.remove_route(&self.route);
        let output_route = self.state.lock().output_route.clone();
        if output_route == self.placeholder {
            self.ctx.routes.remove_route(&output_route);
        }
    }
}

#[async_trait]
impl BlockController for ShellJob {
    fn block_id(&self) -> &str {
        &self.job_id
    }

    fn status(&self) -> JobStatusEvent {
        self.snapshot()
    }

    async fn attach(&self, route: RouteId) -> Result<(), JobError> {
        self.attach_route(route)
    }

    fn detach(&self) -> Result<(), JobError> {
        self.detach_route("detached")
    }

    fn send_input(&self, mut envelope: Envelope) -> Result<bool, JobError> {
        self.ensure_live()?;
        envelope.route_id = Some(self.route.clone());
        Ok(self.ctx.routes.send(&self.route, envelope))
    }

    fn resize(&self, size: TermSize) -> Result<(), JobError> {
        self.ensure_live()?;
        let size = size.normalized();
        self.state.lock().term_size = size;
        let payload = serde_json::to_value(InputPayload::resize(size)).unwrap_or_default();
        let envelope = Envelope::event(self.route.clone(), commands::JOB_INPUT, payload);
        self.ctx.routes.send(&self.route, envelope);
        self.announce();
        Ok(())
    }

    fn reset_input(&self) -> Result<Option<String>, JobError> {
        self.ensure_live()?;
        let retired = self.reorder.lock().reset();
        info!(target: "tether::job", job = %self.job_id, session = ?retired, "input session reset");
        Ok(retired)
    }

    async fn stop(&self, intent: StopIntent) -> Result<(), JobError> {
        match intent {
            StopIntent::Detach => self.detach_route("detached"),
            StopIntent::Terminate { graceful } => {
                self.ensure_live()?;
                let code = self.terminate_shell(graceful).await;
                self.on_exit(code);
                Ok(())
            }
            StopIntent::Destroy { graceful } => {
                if !self.current_status().is_done() {
                    let code = self.terminate_shell(graceful).await;
                    self.on_exit(code);
                }
                self.release();
                Ok(())
            }
        }
    }
}

impl Drop for ShellJob {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Applies input from whichever channel the job route is bound to. A new
/// channel arrives on every attach; the previous one is drained first.
async fn run_input(job: Weak<ShellJob>, mut sinks: mpsc::UnboundedReceiver<ChannelTransport>) {
    while let Some(sink) = sinks.recv().await {
        loop {
            let envelope = match sink.recv().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(err) => {
                    debug!(target: "tether::job", error = %err, "input channel failed");
                    break;
                }
            };
            let Some(job) = job.upgrade() else {
                return;
            };
            job.handle_input(envelope).await;
        }
    }
}

async fn pump_output(job: Weak<ShellJob>, shell: Arc<dyn ShellProcess>) {
    loop {
        match shell.read_chunk().await {
            Ok(Some(chunk)) => {
                let Some(job) = job.upgrade() else {
                    return;
                };
                job.forward_output(&chunk);
            }
            Ok(None) => return,
            Err(err) => {
                debug!(target: "tether::job", error = %err, "shell output ended");
                return;
            }
        }
    }
}

async fn wait_exit(job: Weak<ShellJob>, shell: Arc<dyn ShellProcess>) {
    let code = shell.wait().await;
    if let Some(job) = job.upgrade() {
        info!(target: "tether::job", job = %job.job_id, code = ?code, "shell exited");
        job.on_exit(code);
    }
}

async fn monitor_health(job: Weak<ShellJob>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(job) = job.upgrade() else {
            return;
        };
        if job.current_status().is_done() {
            return;
        }
        job.probe_health();
    }
}
