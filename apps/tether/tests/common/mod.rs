#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tether::config::Config;
use tether::protocol::{Envelope, HelloRequest, HelloResponse, InputPayload, RouteId, commands};
use tether::server::Service;
use tether::shell::{RecordingLauncher, ShellLauncher};
use tether::transport::{ChannelTransport, Transport};

pub fn config() -> Config {
    let mut config = Config {
        socket_path: Some(PathBuf::from("/run/tether-it.sock")),
        ..Config::default()
    };
    config.jobs.probe_interval_ms = 50;
    config.conn.lifecycle_timeout_ms = 2_000;
    config.conn.handshake_timeout_ms = 2_000;
    config
}

pub fn service(launcher: &Arc<RecordingLauncher>) -> Arc<Service> {
    let launcher: Arc<dyn ShellLauncher> = Arc::clone(launcher) as Arc<dyn ShellLauncher>;
    Service::new(&config(), launcher).expect("service")
}

/// A peer talking to the daemon over an in-process channel. Envelopes
/// skipped while waiting for something else stay queued for later waits.
pub struct Peer {
    pub transport: ChannelTransport,
    pub route: RouteId,
    skipped: Mutex<VecDeque<Envelope>>,
}

impl Peer {
    pub async fn connect(service: &Arc<Service>) -> Self {
        let (near, far) = ChannelTransport::pair(256);
        tokio::spawn(Arc::clone(service).serve_peer(Arc::new(near)));
        let mut peer = Self {
            transport: far,
            route: RouteId::new("pending"),
            skipped: Mutex::new(VecDeque::new()),
        };
        let hello = peer
            .request(
                commands::HELLO,
                serde_json::to_value(HelloRequest::default()).expect("hello payload"),
            )
            .await;
        let hello: HelloResponse = hello.payload_as().expect("hello response");
        peer.route = hello.route_id;
        peer
    }

    /// Sends a sys request and waits for its response.
    pub async fn request(&self, command: &str, payload: Value) -> Envelope {
        self.request_with(Envelope::request(RouteId::sys(), command, payload))
            .await
    }

    pub async fn request_with(&self, request: Envelope) -> Envelope {
        let reqid = request.reqid.clone();
        self.transport.send(request).await.expect("send request");
        self.next_matching(|env| env.resid == reqid).await
    }

    pub async fn input(&self, job_id: &str, session: &str, seq: u64, data: &str) -> Envelope {
        let mut payload = serde_json::to_value(InputPayload::data(data.as_bytes()))
            .expect("input payload");
        payload["jobid"] = json!(job_id);
        let mut request = Envelope::request(RouteId::sys(), commands::JOB_INPUT, payload);
        request.input_session_id = Some(session.to_string());
        request.seq_num = seq;
        self.request_with(request).await
    }

    pub async fn next_command(&self, command: &str) -> Envelope {
        self.next_matching(|env| env.command() == Some(command)).await
    }

    pub async fn next_matching<F>(&self, mut matches: F) -> Envelope
    where
        F: FnMut(&Envelope) -> bool,
    {
        {
            let mut skipped = self.skipped.lock();
            if let Some(index) = skipped.iter().position(&mut matches) {
                return skipped.remove(index).expect("indexed envelope");
            }
        }
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(5), self.transport.recv())
                .await
                .expect("envelope in time")
                .expect("recv")
                .expect("transport open");
            if matches(&envelope) {
                return envelope;
            }
            self.skipped.lock().push_back(envelope);
        }
    }
}

/// Polls until `check` holds or the deadline passes.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
