use std::collections::{BTreeMap, HashMap};

use serde_json::json;
use tracing::{debug, warn};

use super::{RouteTable, SendOutcome};
use crate::protocol::{Envelope, RouteId, commands};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Queued,
    Dropped,
    /// Destination unknown; the source was told so.
    NoRoute,
    /// A reqid/resid with no correlation record, or an envelope that is
    /// neither request nor response.
    Unroutable,
}

impl DispatchOutcome {
    fn from_send(outcome: SendOutcome) -> Self {
        match outcome {
            SendOutcome::Delivered => DispatchOutcome::Delivered,
            SendOutcome::Queued => DispatchOutcome::Queued,
            SendOutcome::Dropped => DispatchOutcome::Dropped,
        }
    }
}

#[derive(Debug, Clone)]
pub(super) struct RpcRoute {
    pub source: RouteId,
    pub dest: RouteId,
    order: u64,
}

/// Correlation records by reqid, bounded: past `capacity` the oldest record
/// is evicted and a late response to it becomes unroutable.
pub(super) struct RpcRoutes {
    records: HashMap<String, RpcRoute>,
    order: BTreeMap<u64, String>,
    next: u64,
    capacity: usize,
}

impl RpcRoutes {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            order: BTreeMap::new(),
            next: 0,
            capacity: capacity.max(1),
        }
    }

    pub(super) fn len(&self) -> usize {
        self.records.len()
    }

    fn insert(&mut self, reqid: String, source: RouteId, dest: RouteId) {
        self.remove(&reqid);
        let order = self.next;
        self.next += 1;
        self.order.insert(order, reqid.clone());
        self.records.insert(reqid, RpcRoute { source, dest, order });
        while self.records.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.records.remove(&oldest);
            debug!(target: "tether::router", reqid = %oldest, "evicted request correlation");
        }
    }

    fn get(&self, reqid: &str) -> Option<RpcRoute> {
        self.records.get(reqid).cloned()
    }

    fn remove(&mut self, reqid: &str) -> Option<RpcRoute> {
        let record = self.records.remove(reqid)?;
        self.order.remove(&record.order);
        Some(record)
    }

    /// Drops every record that touches `route_id`.
    pub(super) fn forget_route(&mut self, route_id: &RouteId) {
        let order = &mut self.order;
        self.records.retain(|_, info| {
            let keep = &info.source != route_id && &info.dest != route_id;
            if !keep {
                order.remove(&info.order);
            }
            keep
        });
    }
}

impl RouteTable {
    /// Routes an envelope that arrived on `from`.
    ///
    /// Commands go to their `routeid` and, when they carry a `reqid`, leave a
    /// correlation record behind. Follow-up requests reuse the record's
    /// destination; responses go back to its source, and the record is
    /// dropped with the last response (`cont` unset).
    pub fn dispatch(&self, from: &RouteId, mut envelope: Envelope) -> DispatchOutcome {
        if !from.is_sys() || envelope.source.is_none() {
            envelope.source = Some(from.clone());
        }

        if envelope.command.is_some() {
            let Some(dest) = envelope.route_id.clone().filter(|dest| self.contains(dest)) else {
                self.handle_no_route(&envelope);
                return DispatchOutcome::NoRoute;
            };
            if let Some(reqid) = &envelope.reqid {
                self.rpc.lock().insert(reqid.clone(), from.clone(), dest.clone());
            }
            return DispatchOutcome::from_send(self.send_outcome(&dest, envelope));
        }

        if let Some(reqid) = envelope.reqid.clone() {
            let Some(info) = self.rpc.lock().get(&reqid) else {
                debug!(target: "tether::router", reqid = %reqid, "no correlation for request");
                return DispatchOutcome::Unroutable;
            };
            envelope.route_id = Some(info.dest.clone());
            return DispatchOutcome::from_send(self.send_outcome(&info.dest, envelope));
        }

        if let Some(resid) = envelope.resid.clone() {
            let info = {
                let mut rpc = self.rpc.lock();
                if envelope.cont {
                    rpc.get(&resid)
                } else {
                    rpc.remove(&resid)
                }
            };
            let Some(info) = info else {
                debug!(target: "tether::router", resid = %resid, "no correlation for response");
                return DispatchOutcome::Unroutable;
            };
            envelope.route_id = Some(info.source.clone());
            return DispatchOutcome::from_send(self.send_outcome(&info.source, envelope));
        }

        warn!(target: "tether::router", from = %from, "envelope has no command, reqid or resid");
        DispatchOutcome::Unroutable
    }

    pub fn pending_rpcs(&self) -> usize {
        self.rpc.lock().len()
    }

    fn handle_no_route(&self, envelope: &Envelope) {
        let message = match &envelope.route_id {
            Some(dest) => format!("no route for {:?}", dest.as_str()),
            None => "no default route".to_string(),
        };
        let Some(source) = envelope.source.clone().filter(|source| self.contains(source)) else {
            return;
        };
        match &envelope.reqid {
            Some(reqid) => {
                let response = Envelope::error_response(reqid, Some(source.clone()), message);
                self.send_outcome(&source, response);
            }
            None => {
                // a notice about a notice would bounce forever
                if envelope.command() == Some(commands::MESSAGE) {
                    return;
                }
                let notice =
                    Envelope::event(source.clone(), commands::MESSAGE, json!({ "message": message }));
                self.send_outcome(&source, notice);
            }
        }
    }
}
