use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};

use super::{Transport, TransportError, TransportId, TransportKind, TrySendError, next_transport_id};
use crate::protocol::Envelope;

/// In-process transport. Both ends share one closed flag, so closing either
/// side closes the pair.
pub struct ChannelTransport {
    id: TransportId,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
    closed: Arc<watch::Sender<bool>>,
}

impl ChannelTransport {
    pub fn pair(depth: usize) -> (Self, Self) {
        let depth = depth.max(1);
        let (a_tx, a_rx) = mpsc::channel(depth);
        let (b_tx, b_rx) = mpsc::channel(depth);
        let closed = Arc::new(watch::channel(false).0);
        let left = Self {
            id: next_transport_id(),
            tx: a_tx,
            rx: Mutex::new(b_rx),
            closed: Arc::clone(&closed),
        };
        let right = Self {
            id: next_transport_id(),
            tx: b_tx,
            rx: Mutex::new(a_rx),
            closed,
        };
        (left, right)
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }

    fn try_send(&self, envelope: Envelope) -> Result<(), TrySendError> {
        if self.is_closed() {
            return Err(TrySendError::Closed(envelope));
        }
        self.tx.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(env) => TrySendError::Full(env),
            mpsc::error::TrySendError::Closed(env) => TrySendError::Closed(env),
        })
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            res = self.tx.send(envelope) => res.map_err(|_| TransportError::Closed),
            _ = self.wait_closed() => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Envelope>, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => Ok(msg),
            _ = self.wait_closed() => Ok(rx.try_recv().ok()),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed(&self) {
        self.wait_closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RouteId;
    use serde_json::Value;

    fn env(n: u64) -> Envelope {
        let mut env = Envelope::event(RouteId::new("r"), "test", Value::from(n));
        env.seq_num = n;
        env
    }

    #[tokio::test]
    async fn envelopes_cross_the_pair() {
        let (a, b) = ChannelTransport::pair(4);
        a.try_send(env(1)).unwrap();
        a.send(env(2)).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap().seq_num, 1);
        assert_eq!(b.recv().await.unwrap().unwrap().seq_num, 2);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn full_buffer_hands_envelope_back() {
        let (a, _b) = ChannelTransport::pair(1);
        a.try_send(env(1)).unwrap();
        match a.try_send(env(2)) {
            Err(TrySendError::Full(returned)) => assert_eq!(returned.seq_num, 2),
            other => panic!("expected full, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_drains_then_ends_both_sides() {
        let (a, b) = ChannelTransport::pair(4);
        a.try_send(env(1)).unwrap();
        a.close();
        b.closed().await;
        assert!(b.is_closed());
        assert_eq!(b.recv().await.unwrap().unwrap().seq_num, 1);
        assert!(b.recv().await.unwrap().is_none());
        assert!(a.try_send(env(2)).unwrap_err().is_closed());
        assert!(matches!(b.send(env(3)).await, Err(TransportError::Closed)));
    }
}
