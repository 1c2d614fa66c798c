//! `tether serve`: the daemon that owns routes, jobs and connections.
//!
//! Peers connect over a unix socket (or the daemon's own stdio when it was
//! started by a remote `ssh`). The first envelope from a peer must be a
//! `hello`; the peer is then bound to a route and everything it sends is
//! either a request for the daemon (`sys` route) or routed onwards.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::net::UnixListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::conn::{CONNS_TOPIC, ConnError, ConnManager};
use crate::job::{JobError, JobManager, JobSpec, StopIntent};
use crate::protocol::{
    Envelope, HelloRequest, HelloResponse, InputPayload, ProtocolError, RouteId, TermSize, commands,
};
use crate::router::{RouteError, RouteTable};
use crate::shell::ShellLauncher;
use crate::transport::{StreamConfig, StreamTransport, Transport};

#[derive(Debug, Error)]
enum SysError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{0}")]
    Invalid(&'static str),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
}

#[derive(Deserialize)]
struct JobRef {
    jobid: String,
}

#[derive(Deserialize)]
struct JobAttachRequest {
    jobid: String,
    #[serde(rename = "routeid", default)]
    route_id: Option<RouteId>,
}

#[derive(Deserialize)]
struct JobInputRequest {
    jobid: String,
    #[serde(flatten)]
    input: InputPayload,
}

#[derive(Deserialize)]
struct JobResizeRequest {
    jobid: String,
    termsize: TermSize,
}

#[derive(Deserialize)]
struct JobStopRequest {
    jobid: String,
    #[serde(flatten)]
    intent: StopIntent,
}

#[derive(Deserialize)]
struct ConnRef {
    #[serde(default)]
    conn: Option<String>,
}

impl ConnRef {
    fn name(self) -> Result<String, SysError> {
        self.conn.ok_or(SysError::Invalid("missing conn"))
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, SysError> {
    serde_json::to_value(value).map_err(|err| SysError::Protocol(err.into()))
}

/// Shared daemon state: one route table, job manager and connection
/// manager for every peer.
pub struct Service {
    client_id: String,
    routes: Arc<RouteTable>,
    jobs: Arc<JobManager>,
    conns: Arc<ConnManager>,
    stream: StreamConfig,
    handshake_timeout: Duration,
}

impl Service {
    /// Must be called inside a tokio runtime.
    pub fn new(config: &Config, launcher: Arc<dyn ShellLauncher>) -> Result<Arc<Self>> {
        let routes = Arc::new(RouteTable::new(config.router.clone()));
        let socket_path = config.socket_path().context("resolve daemon socket path")?;
        let jobs = JobManager::new(
            Arc::clone(&routes),
            launcher,
            config.jobs.clone(),
            Some(socket_path),
        );
        let conns = ConnManager::new(Arc::clone(&routes), config.conn.clone());
        conns.register_from_config(&config.connections, &config.transport);
        jobs.spawn_conn_listener(conns.subscribe(CONNS_TOPIC));
        let client_id = Uuid::new_v4().to_string();
        info!(target: "tether::server", client_id = %client_id, "daemon state ready");
        Ok(Arc::new(Self {
            client_id,
            routes,
            jobs,
            conns,
            stream: StreamConfig::from(&config.transport),
            handshake_timeout: config.conn.handshake_timeout(),
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn conns(&self) -> &Arc<ConnManager> {
        &self.conns
    }

    /// Runs one peer from `hello` until its transport ends.
    pub async fn serve_peer(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let route = match self.greet(&transport).await {
            Ok(route) => route,
            Err(err) => {
                warn!(target: "tether::server", transport = %transport.id(), error = %err, "peer handshake failed");
                transport.close();
                return;
            }
        };
        loop {
            let envelope = match transport.recv().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(err) => {
                    debug!(target: "tether::server", route = %route, error = %err, "peer read failed");
                    break;
                }
            };
            let for_daemon = envelope.command().is_some()
                && envelope.route_id.as_ref().is_none_or(RouteId::is_sys);
            if for_daemon {
                self.handle_request(&route, envelope).await;
            } else {
                self.routes.dispatch(&route, envelope);
            }
        }
        if self.routes.mark_down(&route, transport.id(), "peer disconnected") {
            tokio::spawn(expire_when_idle(
                Arc::clone(&self.routes),
                Arc::clone(&self.jobs),
                route.clone(),
            ));
        }
        info!(target: "tether::server", route = %route, "peer disconnected");
    }

    /// Answers the peer's `hello` on the raw transport, then binds the route
    /// so the reply goes out ahead of anything queued for it.
    async fn greet(&self, transport: &Arc<dyn Transport>) -> Result<RouteId> {
        let first = tokio::time::timeout(self.handshake_timeout, transport.recv())
            .await
            .map_err(|_| anyhow!("no hello within {:?}", self.handshake_timeout))??
            .ok_or_else(|| anyhow!("peer closed before hello"))?;
        if first.command() != Some(commands::HELLO) {
            if let Some(reqid) = &first.reqid {
                let _ = transport
                    .send(Envelope::error_response(reqid, None, "expected hello"))
                    .await;
            }
            bail!("first envelope was {:?}, not hello", first.command());
        }
        let request: HelloRequest = first.payload_as()?;
        let route = match &request.route_id {
            Some(route) => match self
                .routes
                .verify_route(route, request.proc_identity.as_deref())
            {
                Ok(()) => route.clone(),
                // Nothing to resume: the route predates this daemon.
                Err(RouteError::UnknownRoute(_)) if !route.is_proc() => {
                    info!(target: "tether::server", offered = %route, "offered route unknown, issuing a fresh one");
                    self.routes.generate_route_id()
                }
                Err(err) => {
                    if let Some(reqid) = &first.reqid {
                        let _ = transport
                            .send(Envelope::error_response(reqid, None, err.to_string()))
                            .await;
                    }
                    return Err(err.into());
                }
            },
            None => match &request.proc_identity {
                Some(identity) => self.routes.generate_proc_route(identity),
                None => self.routes.generate_route_id(),
            },
        };

        let hello = HelloResponse {
            route_id: route.clone(),
            client_id: self.client_id.clone(),
        };
        let reply = Envelope::response_to(&first, serde_json::to_value(&hello)?);
        transport.send(reply).await?;

        match &request.proc_identity {
            Some(identity) if route.is_proc() => {
                self.routes
                    .register_proc_route(&route, identity, Arc::clone(transport))?
            }
            _ => self.routes.register_route(&route, Arc::clone(transport))?,
        }
        info!(
            target: "tether::server",
            route = %route,
            transport = %transport.id(),
            peer_client = ?request.client_id,
            "peer registered"
        );
        Ok(route)
    }

    async fn handle_request(self: &Arc<Self>, from: &RouteId, envelope: Envelope) {
        let slow = matches!(
            envelope.command(),
            Some(
                commands::JOB_START
                    | commands::JOB_STOP
                    | commands::CONN_CONNECT
                    | commands::CONN_DISCONNECT
                    | commands::CONN_ENSURE
            )
        );
        if slow {
            let service = Arc::clone(self);
            let from = from.clone();
            tokio::spawn(async move { service.respond(&from, envelope).await });
        } else {
            self.respond(from, envelope).await;
        }
    }

    async fn respond(&self, from: &RouteId, mut envelope: Envelope) {
        envelope.source = Some(from.clone());
        let result = self.handle_sys(from, &envelope).await;
        let Some(reqid) = envelope.reqid.clone() else {
            if let Err(err) = result {
                debug!(target: "tether::server", route = %from, command = ?envelope.command(), error = %err, "request without reqid failed");
            }
            return;
        };
        let response = match result {
            Ok(payload) => Envelope::response_to(&envelope, payload),
            Err(err) => {
                debug!(target: "tether::server", route = %from, command = ?envelope.command(), error = %err, "request failed");
                Envelope::error_response(&reqid, Some(from.clone()), err.to_string())
            }
        };
        self.routes.send(from, response);
    }

    async fn handle_sys(&self, from: &RouteId, envelope: &Envelope) -> Result<Value, SysError> {
        let command = envelope.command().unwrap_or_default();
        match command {
            commands::JOB_START => {
                let mut spec: JobSpec = envelope.payload_as()?;
                if spec.route.is_none() {
                    spec.route = Some(from.clone());
                }
                let job_id = self.jobs.start_remote_shell_job(spec).await?;
                Ok(json!({ "jobid": job_id }))
            }
            commands::JOB_ATTACH => {
                let request: JobAttachRequest = envelope.payload_as()?;
                let route = request.route_id.unwrap_or_else(|| from.clone());
                self.jobs.attach(&request.jobid, route).await?;
                to_payload(&self.jobs.status(&request.jobid)?)
            }
            commands::JOB_DETACH => {
                let request: JobRef = envelope.payload_as()?;
                self.jobs.detach(&request.jobid)?;
                to_payload(&self.jobs.status(&request.jobid)?)
            }
            commands::JOB_INPUT => {
                let request: JobInputRequest = envelope.payload_as()?;
                let mut input = Envelope::event(
                    RouteId::job(&request.jobid),
                    commands::JOB_INPUT,
                    to_payload(&request.input)?,
                );
                input.source = Some(from.clone());
                input.input_session_id = envelope.input_session_id.clone();
                input.seq_num = envelope.seq_num;
                let delivered = self.jobs.send_input(&request.jobid, input)?;
                Ok(json!({ "delivered": delivered }))
            }
            commands::JOB_RESIZE => {
                let request: JobResizeRequest = envelope.payload_as()?;
                self.jobs.resize(&request.jobid, request.termsize)?;
                to_payload(&self.jobs.status(&request.jobid)?)
            }
            commands::JOB_RESET_INPUT => {
                let request: JobRef = envelope.payload_as()?;
                let retired = self.jobs.reset_input(&request.jobid)?;
                Ok(json!({ "inputsessionid": retired }))
            }
            commands::JOB_STOP => {
                let request: JobStopRequest = envelope.payload_as()?;
                self.jobs.stop(&request.jobid, request.intent).await?;
                Ok(Value::Null)
            }
            commands::JOB_STATUS => {
                let request: JobRef = envelope.payload_as()?;
                to_payload(&self.jobs.status(&request.jobid)?)
            }
            commands::CONN_CONNECT => {
                let name = envelope.payload_as::<ConnRef>()?.name()?;
                to_payload(&self.conns.connect(&name).await?)
            }
            commands::CONN_DISCONNECT => {
                let name = envelope.payload_as::<ConnRef>()?.name()?;
                to_payload(&self.conns.disconnect(&name).await?)
            }
            commands::CONN_ENSURE => {
                let name = envelope.payload_as::<ConnRef>()?.name()?;
                to_payload(&self.conns.ensure_connected(&name).await?)
            }
            commands::CONN_STATUS => {
                let conn = if envelope.payload.is_null() {
                    None
                } else {
                    envelope.payload_as::<ConnRef>()?.conn
                };
                match conn {
                    Some(name) => to_payload(&self.conns.status(&name)?),
                    None => to_payload(&self.conns.statuses()),
                }
            }
            commands::HELLO => Err(SysError::Invalid("peer already said hello")),
            other => Err(SysError::UnknownCommand(other.to_string())),
        }
    }

    /// Destroys jobs, tears down connections and closes every route.
    pub async fn shutdown(&self, graceful: bool) {
        info!(target: "tether::server", graceful, "shutting down");
        self.jobs.shutdown(graceful).await;
        self.conns.shutdown().await;
        self.routes.shutdown();
    }
}

struct SocketCleanup(PathBuf);

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.0) {
            if err.kind() != ErrorKind::NotFound {
                warn!(target: "tether::server", path = %self.0.display(), error = %err, "failed to clean daemon socket");
            }
        }
    }
}

pub struct Server {
    service: Arc<Service>,
    socket: PathBuf,
    use_stdio: bool,
}

impl Server {
    pub fn new(service: Arc<Service>, socket: PathBuf, use_stdio: bool) -> Self {
        Self {
            service,
            socket,
            use_stdio,
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Serves until interrupted (or, in stdio mode, until the peer leaves),
    /// then destroys jobs gracefully.
    pub async fn run(self) -> Result<()> {
        let result = if self.use_stdio {
            self.run_stdio().await
        } else {
            self.run_socket().await
        };
        self.service.shutdown(true).await;
        result
    }

    async fn run_stdio(&self) -> Result<()> {
        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::spawn(
            tokio::io::stdin(),
            tokio::io::stdout(),
            self.service.stream.clone(),
            "stdio",
        ));
        info!(target: "tether::server", "serving peer on stdio");
        tokio::select! {
            _ = Arc::clone(&self.service).serve_peer(transport) => {
                info!(target: "tether::server", "stdio peer ended");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for interrupt")?;
                info!(target: "tether::server", "interrupt received");
            }
        }
        Ok(())
    }

    async fn run_socket(&self) -> Result<()> {
        let path = &self.socket;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create socket dir {parent:?}"))?;
        }
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("remove existing socket {path:?}"))?;
        }
        let listener =
            UnixListener::bind(path).with_context(|| format!("bind daemon socket at {path:?}"))?;
        let _cleanup = SocketCleanup(path.clone());
        info!(target: "tether::server", socket = %path.display(), "daemon listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted.context("accept peer")?;
                    let transport = Arc::new(StreamTransport::from_unix(
                        stream,
                        self.service.stream.clone(),
                        "peer",
                    ));
                    debug!(target: "tether::server", transport = %transport.id(), "accepted peer");
                    tokio::spawn(Arc::clone(&self.service).serve_peer(transport));
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listen for interrupt")?;
                    info!(target: "tether::server", "interrupt received");
                    return Ok(());
                }
            }
        }
    }
}

/// Forgets a peer route that stays down for the configured ttl with no job
/// holding it. A rebind ends the wait.
async fn expire_when_idle(routes: Arc<RouteTable>, jobs: Arc<JobManager>, route: RouteId) {
    let Some(generation) = routes.down_generation(&route) else {
        return;
    };
    let ttl = routes.config().down_route_ttl();
    loop {
        tokio::time::sleep(ttl).await;
        if routes.down_generation(&route) != Some(generation) {
            return;
        }
        if jobs.holds_route(&route) {
            continue;
        }
        if routes.expire_if_down(&route, generation) {
            debug!(target: "tether::server", route = %route, "idle peer route forgotten");
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvelopeKind;
    use crate::shell::RecordingLauncher;
    use crate::transport::ChannelTransport;

    fn service() -> Arc<Service> {
        let config = Config {
            socket_path: Some(PathBuf::from("/run/tether-test.sock")),
            ..Config::default()
        };
        Service::new(&config, Arc::new(RecordingLauncher::new())).unwrap()
    }

    async fn hello(peer: &ChannelTransport, request: HelloRequest) -> Envelope {
        let envelope = Envelope::request(
            RouteId::sys(),
            commands::HELLO,
            serde_json::to_value(request).unwrap(),
        );
        peer.send(envelope).await.unwrap();
        peer.recv().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn hello_assigns_a_route_and_reports_daemon_id() {
        let service = service();
        let (near, far) = ChannelTransport::pair(16);
        tokio::spawn(Arc::clone(&service).serve_peer(Arc::new(near)));

        let reply = hello(&far, HelloRequest::default()).await;
        assert_eq!(reply.kind, EnvelopeKind::Response);
        let hello: HelloResponse = reply.payload_as().unwrap();
        assert_eq!(hello.client_id, service.client_id());
        assert!(service.routes().contains(&hello.route_id));
    }

    #[tokio::test]
    async fn proc_route_with_wrong_identity_is_refused() {
        let service = service();
        let route = service.routes().generate_proc_route("right");
        let (near, far) = ChannelTransport::pair(16);
        let peer = tokio::spawn(Arc::clone(&service).serve_peer(Arc::new(near)));

        let reply = hello(
            &far,
            HelloRequest {
                route_id: Some(route),
                proc_identity: Some("wrong".into()),
                client_id: None,
            },
        )
        .await;
        assert!(reply.error.is_some());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_sys_command_gets_error_response() {
        let service = service();
        let (near, far) = ChannelTransport::pair(16);
        tokio::spawn(Arc::clone(&service).serve_peer(Arc::new(near)));
        hello(&far, HelloRequest::default()).await;

        let request = Envelope::request(RouteId::sys(), "job.frobnicate", Value::Null);
        let reqid = request.reqid.clone();
        far.send(request).await.unwrap();
        let reply = far.recv().await.unwrap().unwrap();
        assert_eq!(reply.resid, reqid);
        assert!(reply.error.unwrap().contains("job.frobnicate"));
    }

    #[tokio::test]
    async fn peers_cannot_claim_a_jobs_input_route() {
        let launcher = Arc::new(RecordingLauncher::new());
        let config = Config {
            socket_path: Some(PathBuf::from("/run/tether-test.sock")),
            ..Config::default()
        };
        let service = Service::new(&config, Arc::clone(&launcher) as Arc<dyn ShellLauncher>).unwrap();
        let (near, owner) = ChannelTransport::pair(64);
        tokio::spawn(Arc::clone(&service).serve_peer(Arc::new(near)));
        let owner_route: HelloResponse = hello(&owner, HelloRequest::default())
            .await
            .payload_as()
            .unwrap();
        service
            .jobs()
            .start_remote_shell_job(JobSpec {
                jobid: Some("j1".into()),
                route: Some(owner_route.route_id),
                ..JobSpec::default()
            })
            .await
            .unwrap();

        for claimed in [RouteId::job("j1"), RouteId::controller("j1"), RouteId::sys()] {
            let (near, intruder) = ChannelTransport::pair(16);
            let peer = tokio::spawn(Arc::clone(&service).serve_peer(Arc::new(near)));
            let reply = hello(
                &intruder,
                HelloRequest {
                    route_id: Some(claimed.clone()),
                    ..HelloRequest::default()
                },
            )
            .await;
            assert!(reply.error.unwrap().contains("reserved"), "{claimed} was accepted");
            peer.await.unwrap();
        }

        let mut input = serde_json::to_value(InputPayload::data(b"secret")).unwrap();
        input["jobid"] = json!("j1");
        let request = Envelope::request(RouteId::sys(), commands::JOB_INPUT, input);
        owner.send(request).await.unwrap();
        let shell = launcher.last().unwrap();
        shell.wait_for_ops(2, Duration::from_secs(2)).await;
        assert_eq!(shell.written(), b"secret");
    }

    #[tokio::test]
    async fn down_peer_route_expires_unless_a_job_holds_it() {
        let mut config = Config {
            socket_path: Some(PathBuf::from("/run/tether-test.sock")),
            ..Config::default()
        };
        config.router.down_route_ttl_ms = 30;
        let service = Service::new(&config, Arc::new(RecordingLauncher::new())).unwrap();

        let (near, idle) = ChannelTransport::pair(16);
        tokio::spawn(Arc::clone(&service).serve_peer(Arc::new(near)));
        let idle_route = hello(&idle, HelloRequest::default())
            .await
            .payload_as::<HelloResponse>()
            .unwrap()
            .route_id;

        let (near, owner) = ChannelTransport::pair(16);
        tokio::spawn(Arc::clone(&service).serve_peer(Arc::new(near)));
        let owner_route = hello(&owner, HelloRequest::default())
            .await
            .payload_as::<HelloResponse>()
            .unwrap()
            .route_id;
        service
            .jobs()
            .start_remote_shell_job(JobSpec {
                jobid: Some("kept".into()),
                route: Some(owner_route.clone()),
                ..JobSpec::default()
            })
            .await
            .unwrap();

        idle.close();
        owner.close();
        let routes = service.routes();
        for _ in 0..200 {
            if routes.snapshot(&idle_route).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(routes.snapshot(&idle_route).is_none(), "idle route never expired");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(routes.contains(&owner_route));
        assert_eq!(routes.down_generation(&owner_route), Some(1));
    }

    #[tokio::test]
    async fn unknown_offered_route_gets_a_fresh_one() {
        let service = service();
        let (near, far) = ChannelTransport::pair(16);
        tokio::spawn(Arc::clone(&service).serve_peer(Arc::new(near)));
        let stale = RouteId::new("from-a-previous-daemon");
        let reply = hello(
            &far,
            HelloRequest {
                route_id: Some(stale.clone()),
                ..HelloRequest::default()
            },
        )
        .await;
        let hello: HelloResponse = reply.payload_as().unwrap();
        assert_ne!(hello.route_id, stale);
        assert!(service.routes().contains(&hello.route_id));
        assert!(!service.routes().contains(&stale));
    }
}

