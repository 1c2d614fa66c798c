use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Level, debug, trace, warn};

use super::{Transport, TransportError, TransportId, TransportKind, TrySendError, next_transport_id};
use crate::config::TransportConfig;
use crate::protocol::{self, Envelope, ProtocolError};
use crate::telemetry::logging::hexdump;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub outbound_depth: usize,
    pub inbound_depth: usize,
    pub max_frame_bytes: usize,
    /// How long a closing transport keeps writing what is already queued.
    pub close_grace: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for StreamConfig {
    fn from(config: &TransportConfig) -> Self {
        Self {
            outbound_depth: config.outbound_depth.max(1),
            inbound_depth: config.outbound_depth.max(1),
            max_frame_bytes: config.max_frame_bytes,
            close_grace: config.close_grace(),
        }
    }
}

/// Envelopes as length-prefixed JSON frames (u32 big-endian length, then
/// the body) over any byte stream: a unix socket or an ssh child's stdio.
///
/// Closing wakes every pending [`Transport::send`]. The writer then gets
/// `close_grace` to flush what was queued; a peer that stopped reading
/// cannot hold the transport open past that.
pub struct StreamTransport {
    id: TransportId,
    label: String,
    outbound: mpsc::Sender<Envelope>,
    inbound: Mutex<mpsc::Receiver<Envelope>>,
    closing: Arc<watch::Sender<bool>>,
    closed: Arc<watch::Sender<bool>>,
}

impl StreamTransport {
    pub fn spawn<R, W>(reader: R, writer: W, config: StreamConfig, label: impl Into<String>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = next_transport_id();
        let label = label.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_depth.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_depth.max(1));
        let closing = Arc::new(watch::channel(false).0);
        let closed = Arc::new(watch::channel(false).0);

        let reader_task = tokio::spawn(read_loop(reader, inbound_tx, config.max_frame_bytes, id));
        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            WriterSignals {
                closing: Arc::clone(&closing),
                closed: Arc::clone(&closed),
                reader_task,
            },
            config.clone(),
            id,
        ));
        debug!(target: "tether::transport", transport = %id, label = %label, "stream transport up");

        Self {
            id,
            label,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            closing,
            closed,
        }
    }

    pub fn from_unix(stream: UnixStream, config: StreamConfig, label: impl Into<String>) -> Self {
        let (reader, writer) = stream.into_split();
        Self::spawn(reader, writer, config, label)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow() || *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn try_send(&self, envelope: Envelope) -> Result<(), TrySendError> {
        if self.is_closing() {
            return Err(TrySendError::Closed(envelope));
        }
        self.outbound.try_send(envelope).map_err(|err| match err {
            mpsc::error::TrySendError::Full(env) => TrySendError::Full(env),
            mpsc::error::TrySendError::Closed(env) => TrySendError::Closed(env),
        })
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut closing = self.closing.subscribe();
        if self.is_closing() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            permit = self.outbound.reserve() => {
                permit.map_err(|_| TransportError::Closed)?.send(envelope);
                Ok(())
            }
            _ = closing.wait_for(|closing| *closing) => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Envelope>, TransportError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    fn close(&self) {
        self.closing.send_if_modified(|closing| !std::mem::replace(closing, true));
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: usize) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max,
        }
        .into());
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > max {
        return Err(ProtocolError::FrameTooLarge { len, max }.into());
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn read_loop<R>(mut reader: R, inbound: mpsc::Sender<Envelope>, max: usize, id: TransportId)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader, max).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(target: "tether::transport", transport = %id, "peer closed stream");
                return;
            }
            Err(err) => {
                warn!(target: "tether::transport", transport = %id, error = %err, "read failed");
                return;
            }
        };
        if tracing::enabled!(target: "tether::transport", Level::TRACE) {
            trace!(target: "tether::transport", transport = %id, len = frame.len(), "frame in\n{}", hexdump(&frame));
        }
        match protocol::decode(&frame) {
            Ok(envelope) => {
                if inbound.send(envelope).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(target: "tether::transport", transport = %id, error = %err, "dropping malformed frame");
            }
        }
    }
}

struct WriterSignals {
    closing: Arc<watch::Sender<bool>>,
    closed: Arc<watch::Sender<bool>>,
    reader_task: JoinHandle<()>,
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Envelope>,
    signals: WriterSignals,
    config: StreamConfig,
    id: TransportId,
) where
    W: AsyncWrite + Unpin,
{
    let WriterSignals {
        closing,
        closed,
        mut reader_task,
    } = signals;
    let mut closing_rx = closing.subscribe();
    let grace = config.close_grace;
    // Set once close() is seen; every later write must finish by then.
    let mut deadline: Option<Instant> = None;

    let result: Result<(), TransportError> = async {
        loop {
            let envelope = match deadline {
                Some(at) => match tokio::time::timeout_at(at, outbound.recv()).await {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => return Ok(()),
                    Err(_) => return Err(TransportError::Stalled(grace)),
                },
                None => tokio::select! {
                    msg = outbound.recv() => match msg {
                        Some(envelope) => envelope,
                        None => return Ok(()),
                    },
                    _ = closing_rx.wait_for(|closing| *closing) => {
                        outbound.close();
                        deadline = Some(Instant::now() + grace);
                        continue;
                    }
                    _ = &mut reader_task => return Ok(()),
                },
            };

            let bytes = protocol::encode(&envelope)?;
            let mut write = std::pin::pin!(write_frame(&mut writer, &bytes, config.max_frame_bytes));
            let at = match deadline {
                Some(at) => at,
                None => tokio::select! {
                    res = &mut write => {
                        res?;
                        continue;
                    }
                    _ = closing_rx.wait_for(|closing| *closing) => {
                        outbound.close();
                        let at = Instant::now() + grace;
                        deadline = Some(at);
                        at
                    }
                },
            };
            tokio::time::timeout_at(at, write)
                .await
                .map_err(|_| TransportError::Stalled(grace))??;
        }
    }
    .await;

    if let Err(err) = result {
        warn!(target: "tether::transport", transport = %id, error = %err, "write failed");
    }
    closing.send_replace(true);
    if tokio::time::timeout(grace, writer.shutdown()).await.is_err() {
        debug!(target: "tether::transport", transport = %id, "shutdown did not complete");
    }
    reader_task.abort();
    closed.send_replace(true);
    debug!(target: "tether::transport", transport = %id, "stream transport closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RouteId;
    use serde_json::json;

    fn pair() -> (StreamTransport, StreamTransport) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        (
            StreamTransport::spawn(lr, lw, StreamConfig::default(), "left"),
            StreamTransport::spawn(rr, rw, StreamConfig::default(), "right"),
        )
    }

    #[tokio::test]
    async fn frames_round_trip_in_order() {
        let (left, right) = pair();
        for n in 1..=5u64 {
            let mut env = Envelope::event(RouteId::new("r"), "tick", json!({ "n": n }));
            env.seq_num = n;
            left.try_send(env).unwrap();
        }
        for n in 1..=5u64 {
            let env = right.recv().await.unwrap().expect("envelope");
            assert_eq!(env.seq_num, n);
            assert_eq!(env.payload["n"], n);
        }
        assert_eq!(left.label(), "left");
    }

    #[tokio::test]
    async fn close_flushes_then_peer_observes_end() {
        let (left, right) = pair();
        left.send(Envelope::event(RouteId::new("r"), "last", json!(null)))
            .await
            .unwrap();
        left.close();
        left.closed().await;
        assert!(left.is_closed());
        let env = right.recv().await.unwrap().expect("flushed before close");
        assert_eq!(env.command(), Some("last"));
        assert!(right.recv().await.unwrap().is_none());
        right.closed().await;
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &[0u8; 32], 16).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::FrameTooLarge { len: 32, max: 16 })
        ));

        let mut raw: &[u8] = &[0, 0, 1, 0];
        assert!(read_frame(&mut raw, 16).await.is_err());
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_releases_a_send_stuck_behind_a_silent_peer() {
        let (near, _silent) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(near);
        let config = StreamConfig {
            outbound_depth: 1,
            close_grace: std::time::Duration::from_millis(50),
            ..StreamConfig::default()
        };
        let transport = Arc::new(StreamTransport::spawn(reader, writer, config, "silent"));
        let big = json!({ "pad": "x".repeat(256) });
        // The writer takes the first frame and blocks on it; the second fills
        // the outbound buffer.
        for _ in 0..2 {
            transport
                .try_send(Envelope::event(RouteId::new("r"), "fill", big.clone()))
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let blocked = {
            let transport = Arc::clone(&transport);
            let envelope = Envelope::event(RouteId::new("r"), "stuck", big);
            tokio::spawn(async move { transport.send(envelope).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        transport.close();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), blocked)
            .await
            .expect("send returns once closed")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        tokio::time::timeout(std::time::Duration::from_secs(2), transport.closed())
            .await
            .expect("writer gives up after the grace period");
    }
}
