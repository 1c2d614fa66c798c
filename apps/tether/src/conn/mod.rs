//! Connection lifecycle manager.
//!
//! Every named connection has a lifecycle lock. Connect, disconnect and
//! reconnect take it for the whole transition and give up with
//! [`ConnError::LifecycleBusy`] when it cannot be had within the configured
//! timeout. The lock is never held across anything but a transition.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use status_bus::{LocalBus, StatusBus, StatusMessage};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConnConfig, ConnectionSpec, TransportConfig};
use crate::metrics;
use crate::protocol::{Envelope, HelloRequest, HelloResponse, ProtocolError, RouteId, commands};
use crate::router::{RouteError, RouteTable};
use crate::transport::{StreamConfig, Transport, TransportError};

pub mod socket;
pub mod ssh;

pub use socket::SocketConnector;
pub use ssh::SshConnector;

pub const CONNS_TOPIC: &str = "conns";

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("unknown connection {0}")]
    Unknown(String),
    #[error("connection {name} is busy: lifecycle lock not acquired within {waited:?}")]
    LifecycleBusy { name: String, waited: Duration },
    #[error("failed to open connection {name}: {message}")]
    Open { name: String, message: String },
    #[error("handshake with {name} failed: {message}")]
    Handshake { name: String, message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    Up { name: String, client_id: String },
    Down { name: String, reason: String },
    Error { name: String, message: String },
}

impl ConnEvent {
    pub fn name(&self) -> &str {
        match self {
            ConnEvent::Up { name, .. } | ConnEvent::Down { name, .. } | ConnEvent::Error { name, .. } => {
                name
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnStatus {
    pub name: String,
    pub state: ConnState,
    #[serde(rename = "clientid", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opens the raw transport for a named connection. The manager runs the
/// handshake on top.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn Transport>, ConnError>;
}

struct ConnInner {
    state: ConnState,
    client_id: Option<String>,
    /// Route id the peer assigned us, offered again on reconnect.
    remote_route: Option<RouteId>,
    error: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    watcher: Option<JoinHandle<()>>,
    epoch: u64,
}

struct ConnRecord {
    name: String,
    route: RouteId,
    lifecycle: AsyncMutex<()>,
    inner: Mutex<ConnInner>,
}

impl ConnRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            route: RouteId::conn(name),
            lifecycle: AsyncMutex::new(()),
            inner: Mutex::new(ConnInner {
                state: ConnState::Disconnected,
                client_id: None,
                remote_route: None,
                error: None,
                transport: None,
                watcher: None,
                epoch: 0,
            }),
        }
    }

    fn status(&self) -> ConnStatus {
        let inner = self.inner.lock();
        ConnStatus {
            name: self.name.clone(),
            state: inner.state,
            client_id: inner.client_id.clone(),
            error: inner.error.clone(),
        }
    }

    fn set_state(&self, state: ConnState) {
        let mut inner = self.inner.lock();
        if inner.state != state {
            debug!(target: "tether::conn", conn = %self.name, from = inner.state.as_str(), to = state.as_str(), "connection state");
            inner.state = state;
            metrics::CONN_TRANSITIONS
                .with_label_values(&[state.as_str()])
                .inc();
        }
    }
}

pub struct ConnManager {
    routes: Arc<RouteTable>,
    config: ConnConfig,
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
    conns: Mutex<HashMap<String, Arc<ConnRecord>>>,
    bus: Arc<LocalBus<ConnEvent>>,
    weak: Weak<ConnManager>,
}

impl ConnManager {
    pub fn new(routes: Arc<RouteTable>, config: ConnConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            routes,
            config,
            connectors: RwLock::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            bus: Arc::new(LocalBus::new()),
            weak: weak.clone(),
        })
    }

    /// Registers a connector for every configured connection.
    pub fn register_from_config(
        &self,
        connections: &BTreeMap<String, ConnectionSpec>,
        transport: &TransportConfig,
    ) {
        for (name, spec) in connections {
            let stream = StreamConfig::from(transport);
            let connector: Arc<dyn Connector> = match spec {
                ConnectionSpec::Ssh {
                    target,
                    ssh_binary,
                    ssh_flags,
                    remote_command,
                } => Arc::new(SshConnector {
                    target: target.clone(),
                    ssh_binary: ssh_binary.clone(),
                    ssh_flags: ssh_flags.clone(),
                    remote_command: remote_command.clone(),
                    stream,
                }),
                ConnectionSpec::Socket { path } => Arc::new(SocketConnector::new(path.clone(), stream)),
            };
            self.register_connector(name, connector);
        }
    }

    pub fn register_connector(&self, name: &str, connector: Arc<dyn Connector>) {
        debug!(target: "tether::conn", conn = name, "connector registered");
        self.connectors.write().insert(name.to_string(), connector);
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<StatusMessage<ConnEvent>> {
        self.bus.subscribe(topic)
    }

    fn publish(&self, event: ConnEvent) {
        let _ = self.bus.publish(&format!("conn:{}", event.name()), event.clone());
        let _ = self.bus.publish(CONNS_TOPIC, event);
    }

    fn connector(&self, name: &str) -> Result<Arc<dyn Connector>, ConnError> {
        self.connectors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConnError::Unknown(name.to_string()))
    }

    fn record(&self, name: &str) -> Arc<ConnRecord> {
        Arc::clone(
            self.conns
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ConnRecord::new(name))),
        )
    }

    async fn lock_lifecycle<'a>(&self, record: &'a ConnRecord) -> Result<MutexGuard<'a, ()>, ConnError> {
        let waited = self.config.lifecycle_timeout();
        tokio::time::timeout(waited, record.lifecycle.lock())
            .await
            .map_err(|_| {
                warn!(target: "tether::conn", conn = %record.name, ?waited, "lifecycle lock busy");
                ConnError::LifecycleBusy {
                    name: record.name.clone(),
                    waited,
                }
            })
    }

    pub fn status(&self, name: &str) -> Result<ConnStatus, ConnError> {
        if let Some(record) = self.conns.lock().get(name) {
            return Ok(record.status());
        }
        self.connector(name)?;
        Ok(ConnRecord::new(name).status())
    }

    pub fn statuses(&self) -> Vec<ConnStatus> {
        let mut names: Vec<String> = self.connectors.read().keys().cloned().collect();
        names.sort();
        names
            .iter()
            .filter_map(|name| self.status(name).ok())
            .collect()
    }

    pub async fn connect(&self, name: &str) -> Result<ConnStatus, ConnError> {
        let connector = self.connector(name)?;
        let record = self.record(name);
        let _guard = self.lock_lifecycle(&record).await?;
        if record.inner.lock().state == ConnState::Connected {
            return Ok(record.status());
        }
        self.connect_locked(&record, connector).await?;
        Ok(record.status())
    }

    /// Connects only when not already connected. The connected check skips
    /// the lifecycle lock.
    pub async fn ensure_connected(&self, name: &str) -> Result<ConnStatus, ConnError> {
        if let Some(record) = self.conns.lock().get(name).cloned() {
            if record.inner.lock().state == ConnState::Connected {
                return Ok(record.status());
            }
        }
        self.connect(name).await
    }

    pub async fn disconnect(&self, name: &str) -> Result<ConnStatus, ConnError> {
        let record = self
            .conns
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ConnError::Unknown(name.to_string()))?;
        let _guard = self.lock_lifecycle(&record).await?;
        self.disconnect_locked(&record, "disconnect requested").await;
        Ok(record.status())
    }

    /// Teardown and connect under one lock hold.
    pub async fn reconnect(&self, name: &str) -> Result<ConnStatus, ConnError> {
        let connector = self.connector(name)?;
        let record = self.record(name);
        let _guard = self.lock_lifecycle(&record).await?;
        self.disconnect_locked(&record, "reconnecting").await;
        self.connect_locked(&record, connector).await?;
        Ok(record.status())
    }

    pub async fn shutdown(&self) {
        let records: Vec<Arc<ConnRecord>> = self.conns.lock().values().cloned().collect();
        let teardowns = records.iter().map(|record| async move {
            match self.lock_lifecycle(record).await {
                Ok(_guard) => self.disconnect_locked(record, "shutdown").await,
                Err(err) => warn!(target: "tether::conn", conn = %record.name, error = %err, "skipping teardown"),
            }
        });
        futures::future::join_all(teardowns).await;
    }

    async fn connect_locked(
        &self,
        record: &Arc<ConnRecord>,
        connector: Arc<dyn Connector>,
    ) -> Result<(), ConnError> {
        record.set_state(ConnState::Connecting);
        info!(target: "tether::conn", conn = %record.name, "connecting");
        match self.open_and_greet(record, connector).await {
            Ok((transport, hello)) => {
                self.routes.register_route(&record.route, Arc::clone(&transport))?;
                let epoch = {
                    let mut inner = record.inner.lock();
                    inner.epoch += 1;
                    inner.client_id = Some(hello.client_id.clone());
                    inner.remote_route = Some(hello.route_id.clone());
                    inner.error = None;
                    inner.transport = Some(Arc::clone(&transport));
                    inner.epoch
                };
                let watcher = tokio::spawn(watch_transport(
                    self.weak.clone(),
                    Arc::clone(record),
                    transport,
                    epoch,
                ));
                record.inner.lock().watcher = Some(watcher);
                record.set_state(ConnState::Connected);
                info!(target: "tether::conn", conn = %record.name, client_id = %hello.client_id, "connected");
                self.publish(ConnEvent::Up {
                    name: record.name.clone(),
                    client_id: hello.client_id,
                });
                Ok(())
            }
            Err(err) => {
                warn!(target: "tether::conn", conn = %record.name, error = %err, "connect failed");
                record.inner.lock().error = Some(err.to_string());
                record.set_state(ConnState::Error);
                self.publish(ConnEvent::Error {
                    name: record.name.clone(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn open_and_greet(
        &self,
        record: &ConnRecord,
        connector: Arc<dyn Connector>,
    ) -> Result<(Arc<dyn Transport>, HelloResponse), ConnError> {
        let transport = connector.open(&record.name).await?;
        let request = {
            let inner = record.inner.lock();
            HelloRequest {
                route_id: inner.remote_route.clone(),
                proc_identity: None,
                client_id: inner.client_id.clone(),
            }
        };
        let timeout = self.config.handshake_timeout();
        match tokio::time::timeout(timeout, handshake(&record.name, transport.as_ref(), &request)).await {
            Ok(Ok(hello)) => Ok((transport, hello)),
            Ok(Err(err)) => {
                transport.close();
                Err(err)
            }
            Err(_) => {
                transport.close();
                Err(ConnError::Handshake {
                    name: record.name.clone(),
                    message: format!("no hello response within {timeout:?}"),
                })
            }
        }
    }

    /// Marks the connection disconnected once its transport confirms it has
    /// closed. The cached client id survives.
    async fn disconnect_locked(&self, record: &ConnRecord, reason: &str) {
        let (transport, watcher) = {
            let mut inner = record.inner.lock();
            inner.epoch += 1;
            (inner.transport.take(), inner.watcher.take())
        };
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        let Some(transport) = transport else {
            record.set_state(ConnState::Disconnected);
            return;
        };
        self.routes.mark_down(&record.route, transport.id(), reason);
        transport.close();
        self.settle(record, transport.as_ref(), reason).await;
    }

    /// Transport ended on its own. Ignored if a newer transition already
    /// replaced it.
    async fn on_transport_lost(&self, record: &ConnRecord, epoch: u64) {
        let Ok(_guard) = self.lock_lifecycle(record).await else {
            return;
        };
        let transport = {
            let mut inner = record.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.epoch += 1;
            inner.watcher = None;
            inner.transport.take()
        };
        match transport {
            Some(transport) => {
                self.routes.mark_down(&record.route, transport.id(), "transport closed");
                self.settle(record, transport.as_ref(), "transport closed").await;
            }
            None => record.set_state(ConnState::Disconnected),
        }
    }

    /// Waits, bounded by the lifecycle timeout, for the transport to confirm
    /// closure. Disconnected only on confirmation; otherwise the connection
    /// is left in the error state.
    async fn settle(&self, record: &ConnRecord, transport: &dyn Transport, reason: &str) {
        let waited = self.config.lifecycle_timeout();
        if tokio::time::timeout(waited, transport.closed()).await.is_err() {
            let message = format!("transport did not confirm close within {waited:?}");
            warn!(target: "tether::conn", conn = %record.name, reason, "{message}");
            record.inner.lock().error = Some(message.clone());
            record.set_state(ConnState::Error);
            self.publish(ConnEvent::Error {
                name: record.name.clone(),
                message,
            });
            return;
        }
        record.set_state(ConnState::Disconnected);
        info!(target: "tether::conn", conn = %record.name, reason, "disconnected");
        self.publish(ConnEvent::Down {
            name: record.name.clone(),
            reason: reason.to_string(),
        });
    }
}

async fn handshake(
    name: &str,
    transport: &dyn Transport,
    request: &HelloRequest,
) -> Result<HelloResponse, ConnError> {
    let payload = serde_json::to_value(request).map_err(ProtocolError::from)?;
    let hello = Envelope::request(RouteId::sys(), commands::HELLO, payload);
    let reqid = hello.reqid.clone();
    transport.send(hello).await?;
    loop {
        let Some(envelope) = transport.recv().await? else {
            return Err(TransportError::Closed.into());
        };
        if envelope.resid != reqid {
            debug!(target: "tether::conn", "ignoring envelope before hello response");
            continue;
        }
        if let Some(error) = envelope.error {
            return Err(ConnError::Handshake {
                name: name.to_string(),
                message: error,
            });
        }
        return Ok(envelope.payload_as()?);
    }
}

/// Feeds envelopes from the peer into the route table until the transport
/// ends.
async fn watch_transport(
    manager: Weak<ConnManager>,
    record: Arc<ConnRecord>,
    transport: Arc<dyn Transport>,
    epoch: u64,
) {
    loop {
        match transport.recv().await {
            Ok(Some(envelope)) => {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                manager.routes.dispatch(&record.route, envelope);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(target: "tether::conn", conn = %record.name, error = %err, "connection read failed");
                break;
            }
        }
    }
    if let Some(manager) = manager.upgrade() {
        manager.on_transport_lost(&record, epoch).await;
    }
}
