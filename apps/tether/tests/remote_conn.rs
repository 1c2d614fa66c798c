mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tether::conn::{ConnError, ConnState, Connector};
use tether::server::Service;
use tether::shell::RecordingLauncher;
use tether::transport::{ChannelTransport, Transport};

use common::service;

/// Opens a channel straight into another daemon's peer loop.
struct InProcessConnector {
    remote: Arc<Service>,
    opens: AtomicUsize,
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn open(&self, _name: &str) -> Result<Arc<dyn Transport>, ConnError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = ChannelTransport::pair(64);
        tokio::spawn(Arc::clone(&self.remote).serve_peer(Arc::new(remote)));
        Ok(Arc::new(local))
    }
}

fn pair() -> (Arc<Service>, Arc<Service>, Arc<InProcessConnector>) {
    let local = service(&Arc::new(RecordingLauncher::new()));
    let remote = service(&Arc::new(RecordingLauncher::new()));
    let connector = Arc::new(InProcessConnector {
        remote: Arc::clone(&remote),
        opens: AtomicUsize::new(0),
    });
    local
        .conns()
        .register_connector("devbox", Arc::clone(&connector) as Arc<dyn Connector>);
    (local, remote, connector)
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn concurrent_connects_open_one_session() {
    let (local, remote, connector) = pair();
    let conns = Arc::clone(local.conns());

    let attempts = (0..4).map(|_| {
        let conns = Arc::clone(&conns);
        tokio::spawn(async move { conns.ensure_connected("devbox").await })
    });
    for attempt in futures::future::join_all(attempts).await {
        let status = attempt.unwrap().unwrap();
        assert_eq!(status.state, ConnState::Connected);
        assert_eq!(status.client_id.as_deref(), Some(remote.client_id()));
    }
    assert_eq!(connector.opens.load(Ordering::SeqCst), 1);
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn reconnect_replaces_the_session() {
    let (local, remote, connector) = pair();
    let conns = local.conns();
    conns.connect("devbox").await.unwrap();

    let status = conns.reconnect("devbox").await.unwrap();
    assert_eq!(status.state, ConnState::Connected);
    assert_eq!(status.client_id.as_deref(), Some(remote.client_id()));
    assert_eq!(connector.opens.load(Ordering::SeqCst), 2);

    let status = conns.disconnect("devbox").await.unwrap();
    assert_eq!(status.state, ConnState::Disconnected);
}
