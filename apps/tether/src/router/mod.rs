//! Route table: maps route ids to transports and keeps per-route delivery
//! order across transport loss.
//!
//! Each route owns at most one transport and a bounded backlog. Callers hand
//! envelopes to [`RouteTable::send`], which never waits: the envelope goes
//! straight to the transport's outbound buffer when the route is active and
//! nothing is queued ahead of it, otherwise it joins the backlog. A writer
//! task per route generation drains the backlog in order. It is the only
//! place that awaits a transport.
//!
//! Rebinding a route bumps its generation. The previous writer finishes (or
//! fails) its in-flight send while holding the route's write gate, so the new
//! writer cannot overtake an envelope the old one hands back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use status_bus::{LocalBus, StatusBus, StatusMessage};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{OverflowPolicy, RouterConfig};
use crate::metrics;
use crate::protocol::{Envelope, RouteId};
use crate::transport::{Transport, TransportId, TrySendError};

pub mod backlog;
mod dispatch;

pub use backlog::{Backlog, PushOutcome};
pub use dispatch::DispatchOutcome;
use dispatch::RpcRoutes;

pub const ROUTES_TOPIC: &str = "routes";

pub fn route_topic(route_id: &RouteId) -> String {
    format!("route:{route_id}")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {0} is a proc route and requires its identity")]
    ProcIdentityRequired(RouteId),
    #[error("identity does not match proc route {0}")]
    ProcIdentityMismatch(RouteId),
    #[error("unknown route {0}")]
    UnknownRoute(RouteId),
    #[error("route {0} is reserved for the daemon")]
    Reserved(RouteId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    /// Transport bound and nothing queued: sends go straight through.
    Active,
    /// No transport, or the writer is draining the backlog.
    Backlogged,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    Up {
        route_id: RouteId,
        generation: u64,
    },
    Down {
        route_id: RouteId,
        reason: String,
    },
    BacklogOverflow {
        route_id: RouteId,
        policy: OverflowPolicy,
        capacity: usize,
    },
    Closed {
        route_id: RouteId,
    },
}

impl RouteEvent {
    pub fn route_id(&self) -> &RouteId {
        match self {
            RouteEvent::Up { route_id, .. }
            | RouteEvent::Down { route_id, .. }
            | RouteEvent::BacklogOverflow { route_id, .. }
            | RouteEvent::Closed { route_id } => route_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSnapshot {
    pub state: RouteState,
    pub backlog_len: usize,
    pub dropped: u64,
    pub generation: u64,
    pub transport: Option<TransportId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendOutcome {
    Delivered,
    Queued,
    Dropped,
}

struct RouteSlot {
    state: RouteState,
    transport: Option<Arc<dyn Transport>>,
    backlog: Backlog,
    generation: u64,
    wake: Arc<Notify>,
}

struct RouteEntry {
    id: RouteId,
    proc_identity: Option<String>,
    slot: Mutex<RouteSlot>,
    write_gate: AsyncMutex<()>,
}

impl RouteEntry {
    fn new(id: RouteId, proc_identity: Option<String>, config: &RouterConfig) -> Self {
        Self {
            id,
            proc_identity,
            slot: Mutex::new(RouteSlot {
                state: RouteState::Backlogged,
                transport: None,
                backlog: Backlog::new(config.backlog_capacity, config.overflow_policy),
                generation: 0,
                wake: Arc::new(Notify::new()),
            }),
            write_gate: AsyncMutex::new(()),
        }
    }
}

struct Shared {
    bus: Arc<LocalBus<RouteEvent>>,
    config: RouterConfig,
}

impl Shared {
    fn publish(&self, event: RouteEvent) {
        let topic = route_topic(event.route_id());
        let _ = self.bus.publish(&topic, event.clone());
        let _ = self.bus.publish(ROUTES_TOPIC, event);
    }

    fn publish_all(&self, events: Vec<RouteEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    fn overflow_event(&self, route_id: &RouteId, outcome: PushOutcome) -> Option<RouteEvent> {
        match outcome {
            PushOutcome::Queued => None,
            PushOutcome::Dropped { episode_started } => {
                metrics::ROUTE_ENVELOPES.with_label_values(&["dropped"]).inc();
                if !episode_started {
                    return None;
                }
                metrics::ROUTE_OVERFLOW_EPISODES
                    .with_label_values(&[self.config.overflow_policy.as_str()])
                    .inc();
                warn!(
                    target: "tether::router",
                    route = %route_id,
                    capacity = self.config.backlog_capacity,
                    policy = self.config.overflow_policy.as_str(),
                    "route backlog overflow"
                );
                Some(RouteEvent::BacklogOverflow {
                    route_id: route_id.clone(),
                    policy: self.config.overflow_policy,
                    capacity: self.config.backlog_capacity,
                })
            }
        }
    }
}

fn adjust_depth(route_id: &RouteId, before: usize, after: usize) {
    let delta = after as i64 - before as i64;
    if delta != 0 {
        metrics::ROUTE_BACKLOG_DEPTH
            .with_label_values(&[route_id.kind()])
            .add(delta);
    }
}

/// Takes the transport off a route whose delivery path failed.
fn mark_down_locked(
    route_id: &RouteId,
    slot: &mut RouteSlot,
    reason: &str,
) -> Option<(Arc<dyn Transport>, RouteEvent)> {
    let transport = slot.transport.take()?;
    slot.state = RouteState::Backlogged;
    info!(
        target: "tether::router",
        route = %route_id,
        transport = %transport.id(),
        reason,
        "route down"
    );
    Some((
        transport,
        RouteEvent::Down {
            route_id: route_id.clone(),
            reason: reason.to_string(),
        },
    ))
}

pub struct RouteTable {
    routes: Mutex<HashMap<RouteId, Arc<RouteEntry>>>,
    rpc: Mutex<RpcRoutes>,
    shared: Arc<Shared>,
}

impl RouteTable {
    pub fn new(config: RouterConfig) -> Self {
        Self::with_bus(config, Arc::new(LocalBus::new()))
    }

    pub fn with_bus(config: RouterConfig, bus: Arc<LocalBus<RouteEvent>>) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            rpc: Mutex::new(RpcRoutes::new(config.rpc_capacity)),
            shared: Arc::new(Shared { bus, config }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.shared.config
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<StatusMessage<RouteEvent>> {
        self.shared.bus.subscribe(topic)
    }

    pub fn subscribe_route(&self, route_id: &RouteId) -> broadcast::Receiver<StatusMessage<RouteEvent>> {
        self.shared.bus.subscribe(&route_topic(route_id))
    }

    fn entry(&self, route_id: &RouteId) -> Option<Arc<RouteEntry>> {
        self.routes.lock().get(route_id).cloned()
    }

    fn entry_or_create(&self, route_id: &RouteId) -> Arc<RouteEntry> {
        let mut routes = self.routes.lock();
        Arc::clone(routes.entry(route_id.clone()).or_insert_with(|| {
            debug!(target: "tether::router", route = %route_id, "route created");
            Arc::new(RouteEntry::new(route_id.clone(), None, &self.shared.config))
        }))
    }

    /// Fresh route id. The route exists, backlogged, before any transport
    /// is bound.
    pub fn generate_route_id(&self) -> RouteId {
        let route_id = RouteId::generate();
        self.entry_or_create(&route_id);
        route_id
    }

    /// Fresh `proc:` route that only `identity` may bind.
    pub fn generate_proc_route(&self, identity: &str) -> RouteId {
        let route_id = RouteId::proc(&Uuid::new_v4().to_string());
        let entry = RouteEntry::new(
            route_id.clone(),
            Some(identity.to_string()),
            &self.shared.config,
        );
        self.routes.lock().insert(route_id.clone(), Arc::new(entry));
        route_id
    }

    /// Makes sure a well-known route (`conn:`, `job:`) exists so envelopes
    /// for it queue until a transport arrives.
    pub fn ensure_route(&self, route_id: &RouteId) {
        self.entry_or_create(route_id);
    }

    /// True when the route exists and has not been closed.
    pub fn contains(&self, route_id: &RouteId) -> bool {
        self.entry(route_id)
            .is_some_and(|entry| entry.slot.lock().state != RouteState::Closed)
    }

    pub fn route_ids(&self) -> Vec<RouteId> {
        self.routes.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self, route_id: &RouteId) -> Option<RouteSnapshot> {
        let entry = self.entry(route_id)?;
        let slot = entry.slot.lock();
        Some(RouteSnapshot {
            state: slot.state,
            backlog_len: slot.backlog.len(),
            dropped: slot.backlog.dropped(),
            generation: slot.generation,
            transport: slot.transport.as_ref().map(|t| t.id()),
        })
    }

    pub fn register_route(
        &self,
        route_id: &RouteId,
        transport: Arc<dyn Transport>,
    ) -> Result<(), RouteError> {
        if route_id.is_proc() {
            return Err(RouteError::ProcIdentityRequired(route_id.clone()));
        }
        let entry = self.entry_or_create(route_id);
        self.bind(entry, transport);
        Ok(())
    }

    pub fn register_proc_route(
        &self,
        route_id: &RouteId,
        identity: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<(), RouteError> {
        let entry = self
            .entry(route_id)
            .ok_or_else(|| RouteError::UnknownRoute(route_id.clone()))?;
        if entry.proc_identity.as_deref() != Some(identity) {
            warn!(target: "tether::router", route = %route_id, "proc route identity mismatch");
            return Err(RouteError::ProcIdentityMismatch(route_id.clone()));
        }
        self.bind(entry, transport);
        Ok(())
    }

    /// Checks, without binding anything, that a peer may claim `route_id`.
    /// Reserved routes are refused, `proc:` routes need their identity,
    /// `tab:` routes are free to claim and any other id must be one this
    /// table generated.
    pub fn verify_route(&self, route_id: &RouteId, identity: Option<&str>) -> Result<(), RouteError> {
        if route_id.is_reserved() {
            warn!(target: "tether::router", route = %route_id, "peer offered a reserved route");
            return Err(RouteError::Reserved(route_id.clone()));
        }
        if route_id.kind() == "tab" {
            return Ok(());
        }
        let entry = self
            .entry(route_id)
            .ok_or_else(|| RouteError::UnknownRoute(route_id.clone()))?;
        if !route_id.is_proc() {
            return Ok(());
        }
        let identity = identity.ok_or_else(|| RouteError::ProcIdentityRequired(route_id.clone()))?;
        if entry.proc_identity.as_deref() != Some(identity) {
            return Err(RouteError::ProcIdentityMismatch(route_id.clone()));
        }
        Ok(())
    }

    /// Swaps in `transport` and starts a writer for the new generation. The
    /// retired transport is closed after the swap.
    fn bind(&self, entry: Arc<RouteEntry>, transport: Arc<dyn Transport>) {
        let transport_id = transport.id();
        let (generation, wake, retired) = {
            let mut slot = entry.slot.lock();
            slot.generation += 1;
            slot.state = RouteState::Backlogged;
            let retired = slot.transport.replace(transport);
            let old_wake = std::mem::replace(&mut slot.wake, Arc::new(Notify::new()));
            old_wake.notify_one();
            (slot.generation, Arc::clone(&slot.wake), retired)
        };
        if let Some(old) = retired {
            if old.id() != transport_id {
                debug!(target: "tether::router", route = %entry.id, transport = %old.id(), "retiring transport");
                old.close();
            }
        }
        info!(
            target: "tether::router",
            route = %entry.id,
            transport = %transport_id,
            generation,
            "route registered"
        );
        tokio::spawn(run_writer(
            Arc::clone(&self.shared),
            Arc::clone(&entry),
            generation,
            wake,
        ));
        self.shared.publish(RouteEvent::Up {
            route_id: entry.id.clone(),
            generation,
        });
    }

    /// Never waits. `true` when the envelope reached the transport's
    /// outbound buffer; `false` when it was queued or dropped.
    pub fn send(&self, route_id: &RouteId, envelope: Envelope) -> bool {
        self.send_outcome(route_id, envelope) == SendOutcome::Delivered
    }

    fn send_outcome(&self, route_id: &RouteId, mut envelope: Envelope) -> SendOutcome {
        let Some(entry) = self.entry(route_id) else {
            debug!(target: "tether::router", route = %route_id, "dropping envelope for unknown route");
            metrics::ROUTE_ENVELOPES.with_label_values(&["dropped"]).inc();
            return SendOutcome::Dropped;
        };
        if envelope.route_id.is_none() {
            envelope.route_id = Some(route_id.clone());
        }

        let mut events = Vec::new();
        let mut retired = None;
        let (outcome, wake) = {
            let mut slot = entry.slot.lock();
            let state = slot.state;
            if state == RouteState::Closed {
                metrics::ROUTE_ENVELOPES.with_label_values(&["dropped"]).inc();
                return SendOutcome::Dropped;
            }
            if state == RouteState::Active && slot.backlog.is_empty() {
                if let Some(transport) = slot.transport.clone() {
                    match transport.try_send(envelope) {
                        Ok(()) => {
                            metrics::ROUTE_ENVELOPES.with_label_values(&["delivered"]).inc();
                            return SendOutcome::Delivered;
                        }
                        Err(TrySendError::Full(env)) => {
                            slot.state = RouteState::Backlogged;
                            envelope = env;
                        }
                        Err(TrySendError::Closed(env)) => {
                            envelope = env;
                            if let Some((transport, event)) =
                                mark_down_locked(route_id, &mut slot, "transport closed")
                            {
                                retired = Some(transport);
                                events.push(event);
                            }
                        }
                    }
                }
            }
            let before = slot.backlog.len();
            let push = slot.backlog.push(envelope);
            adjust_depth(route_id, before, slot.backlog.len());
            events.extend(self.shared.overflow_event(route_id, push));
            let outcome = match push {
                PushOutcome::Queued => SendOutcome::Queued,
                PushOutcome::Dropped { .. } => SendOutcome::Dropped,
            };
            let wake = slot.transport.is_some().then(|| Arc::clone(&slot.wake));
            (outcome, wake)
        };
        if outcome == SendOutcome::Queued {
            metrics::ROUTE_ENVELOPES.with_label_values(&["backlogged"]).inc();
        }
        if let Some(wake) = wake {
            wake.notify_one();
        }
        if let Some(transport) = retired {
            transport.close();
        }
        self.shared.publish_all(events);
        outcome
    }

    /// Nudges the route's writer to drain its backlog. Returns false when no
    /// transport is bound, in which case the backlog stays put.
    pub fn flush_backlog(&self, route_id: &RouteId) -> bool {
        let Some(entry) = self.entry(route_id) else {
            return false;
        };
        let slot = entry.slot.lock();
        if slot.transport.is_none() {
            return false;
        }
        slot.wake.notify_one();
        true
    }

    /// Unbinds the route's transport and closes it, keeping the route and
    /// its backlog. Later sends queue until a transport is registered again.
    pub fn detach_route(&self, route_id: &RouteId, reason: &str) -> Option<Arc<dyn Transport>> {
        let entry = self.entry(route_id)?;
        let (transport, event) = {
            let mut slot = entry.slot.lock();
            let down = mark_down_locked(route_id, &mut slot, reason)?;
            slot.wake.notify_one();
            down
        };
        transport.close();
        self.shared.publish(event);
        Some(transport)
    }

    /// Like [`RouteTable::detach_route`], but only when `transport_id` is
    /// still the bound transport. Used when a peer connection ends on its own.
    pub fn mark_down(&self, route_id: &RouteId, transport_id: TransportId, reason: &str) -> bool {
        let Some(entry) = self.entry(route_id) else {
            return false;
        };
        let down = {
            let mut slot = entry.slot.lock();
            if slot.transport.as_ref().map(|t| t.id()) != Some(transport_id) {
                return false;
            }
            slot.wake.notify_one();
            mark_down_locked(route_id, &mut slot, reason)
        };
        match down {
            Some((transport, event)) => {
                transport.close();
                self.shared.publish(event);
                true
            }
            None => false,
        }
    }

    /// Closes the route for good: the transport is closed, the backlog
    /// discarded and later sends are dropped. Returns how many queued
    /// envelopes were discarded.
    pub fn close_route(&self, route_id: &RouteId) -> usize {
        let Some(entry) = self.entry(route_id) else {
            return 0;
        };
        self.close_entry(route_id, &entry)
    }

    fn close_entry(&self, route_id: &RouteId, entry: &RouteEntry) -> usize {
        let (transport, discarded) = {
            let mut slot = entry.slot.lock();
            if slot.state == RouteState::Closed {
                return 0;
            }
            slot.state = RouteState::Closed;
            slot.generation += 1;
            let before = slot.backlog.len();
            let discarded = slot.backlog.clear();
            adjust_depth(route_id, before, 0);
            slot.wake.notify_one();
            (slot.transport.take(), discarded)
        };
        if let Some(transport) = transport {
            transport.close();
        }
        self.rpc.lock().forget_route(route_id);
        info!(target: "tether::router", route = %route_id, discarded, "route closed");
        self.shared.publish(RouteEvent::Closed {
            route_id: route_id.clone(),
        });
        discarded
    }

    /// Forgets a closed route entirely.
    pub fn remove_route(&self, route_id: &RouteId) {
        self.close_route(route_id);
        self.routes.lock().remove(route_id);
    }

    /// Generation of a route that exists, is not closed and has no transport
    /// bound. `None` otherwise.
    pub fn down_generation(&self, route_id: &RouteId) -> Option<u64> {
        let entry = self.entry(route_id)?;
        let slot = entry.slot.lock();
        (slot.transport.is_none() && slot.state != RouteState::Closed).then_some(slot.generation)
    }

    /// Forgets the route if it is still down in `generation`, meaning no
    /// transport was bound since. Returns whether it was removed.
    pub fn expire_if_down(&self, route_id: &RouteId, generation: u64) -> bool {
        let entry = {
            let mut routes = self.routes.lock();
            let Some(entry) = routes.get(route_id) else {
                return false;
            };
            {
                let slot = entry.slot.lock();
                if slot.transport.is_some()
                    || slot.generation != generation
                    || slot.state == RouteState::Closed
                {
                    return false;
                }
            }
            match routes.remove(route_id) {
                Some(entry) => entry,
                None => return false,
            }
        };
        let discarded = self.close_entry(route_id, &entry);
        info!(target: "tether::router", route = %route_id, discarded, "down route expired");
        true
    }

    /// Moves everything queued on `from` in front of `to`'s backlog, in
    /// order. Returns how many envelopes moved; nothing moves when `to` is
    /// unknown.
    pub fn transfer_backlog(&self, from: &RouteId, to: &RouteId) -> usize {
        if from == to {
            return 0;
        }
        let Some(from_entry) = self.entry(from) else {
            return 0;
        };
        let Some(to_entry) = self.entry(to) else {
            debug!(target: "tether::router", from = %from, to = %to, "backlog transfer to unknown route");
            return 0;
        };
        let moved = {
            let mut slot = from_entry.slot.lock();
            let before = slot.backlog.len();
            let moved = slot.backlog.take_all();
            adjust_depth(from, before, 0);
            moved
        };
        if moved.is_empty() {
            return 0;
        }
        let count = moved.len();
        let moved = moved
            .into_iter()
            .map(|mut env| {
                if env.route_id.as_ref() == Some(from) {
                    env.route_id = Some(to.clone());
                }
                env
            })
            .collect();

        let mut events = Vec::new();
        {
            let mut slot = to_entry.slot.lock();
            if slot.state == RouteState::Closed {
                metrics::ROUTE_ENVELOPES
                    .with_label_values(&["dropped"])
                    .inc_by(count as u64);
                return 0;
            }
            let before = slot.backlog.len();
            let push = slot.backlog.prepend(moved);
            adjust_depth(to, before, slot.backlog.len());
            events.extend(self.shared.overflow_event(to, push));
            if slot.state == RouteState::Active {
                slot.state = RouteState::Backlogged;
            }
            slot.wake.notify_one();
        }
        info!(target: "tether::router", from = %from, to = %to, count, "backlog transferred");
        self.shared.publish_all(events);
        count
    }

    /// Closes every route. Used on daemon shutdown.
    pub fn shutdown(&self) {
        for route_id in self.route_ids() {
            self.close_route(&route_id);
        }
    }
}

enum WriterStep {
    Send(Envelope, Arc<dyn Transport>),
    Idle,
    Exit,
}

async fn run_writer(shared: Arc<Shared>, entry: Arc<RouteEntry>, generation: u64, wake: Arc<Notify>) {
    debug!(target: "tether::router", route = %entry.id, generation, "writer started");
    loop {
        let gate = entry.write_gate.lock().await;
        let step = {
            let mut slot = entry.slot.lock();
            if slot.generation != generation || slot.state == RouteState::Closed {
                WriterStep::Exit
            } else {
                match slot.transport.clone() {
                    None => WriterStep::Exit,
                    Some(transport) => match slot.backlog.pop_front() {
                        Some(envelope) => {
                            adjust_depth(&entry.id, slot.backlog.len() + 1, slot.backlog.len());
                            WriterStep::Send(envelope, transport)
                        }
                        None => {
                            if slot.state != RouteState::Active {
                                debug!(target: "tether::router", route = %entry.id, generation, "route active");
                                slot.state = RouteState::Active;
                            }
                            slot.backlog.note_drained();
                            WriterStep::Idle
                        }
                    },
                }
            }
        };

        match step {
            WriterStep::Exit => break,
            WriterStep::Idle => {
                drop(gate);
                wake.notified().await;
            }
            WriterStep::Send(envelope, transport) => {
                match transport.send(envelope.clone()).await {
                    Ok(()) => {
                        metrics::ROUTE_ENVELOPES.with_label_values(&["flushed"]).inc();
                    }
                    Err(err) => {
                        let mut events = Vec::new();
                        let retired = {
                            let mut slot = entry.slot.lock();
                            if slot.state == RouteState::Closed {
                                None
                            } else {
                                let before = slot.backlog.len();
                                let push = slot.backlog.push_front(envelope);
                                adjust_depth(&entry.id, before, slot.backlog.len());
                                events.extend(shared.overflow_event(&entry.id, push));
                                let current = slot.transport.as_ref().map(|t| t.id());
                                if slot.generation == generation && current == Some(transport.id()) {
                                    let reason = format!("send failed: {err}");
                                    mark_down_locked(&entry.id, &mut slot, &reason).map(
                                        |(transport, event)| {
                                            events.push(event);
                                            transport
                                        },
                                    )
                                } else {
                                    None
                                }
                            }
                        };
                        drop(gate);
                        if let Some(transport) = retired {
                            transport.close();
                        }
                        shared.publish_all(events);
                        break;
                    }
                }
            }
        }
    }
    debug!(target: "tether::router", route = %entry.id, generation, "writer stopped");
}
