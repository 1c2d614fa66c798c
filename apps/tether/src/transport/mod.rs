use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{Envelope, ProtocolError};

pub mod channel;
pub mod stream;

pub use channel::ChannelTransport;
pub use stream::{StreamConfig, StreamTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_transport_id() -> TransportId {
    TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Channel,
    Stream,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("peer stopped reading for {0:?}")]
    Stalled(std::time::Duration),
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Why a non-blocking send could not hand the envelope over. The envelope
/// comes back so the caller can queue it.
#[derive(Debug)]
pub enum TrySendError {
    Full(Envelope),
    Closed(Envelope),
}

impl TrySendError {
    pub fn into_inner(self) -> Envelope {
        match self {
            TrySendError::Full(env) | TrySendError::Closed(env) => env,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TrySendError::Closed(_))
    }
}

/// A bidirectional envelope pipe owned by exactly one route.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    fn kind(&self) -> TransportKind;

    /// Hands the envelope to the outbound buffer without waiting.
    fn try_send(&self, envelope: Envelope) -> Result<(), TrySendError>;

    /// Waits for room in the outbound buffer.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Next inbound envelope, or `None` once the transport has closed.
    async fn recv(&self) -> Result<Option<Envelope>, TransportError>;

    /// Starts closing. Idempotent; completion is observed through [`Transport::closed`].
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the transport has finished closing.
    async fn closed(&self);
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}
