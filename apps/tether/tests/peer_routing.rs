mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether::protocol::{Envelope, RouteId};
use tether::shell::RecordingLauncher;
use tether::transport::Transport;

use common::{Peer, eventually, service};

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn requests_between_peers_are_correlated() {
    let service = service(&Arc::new(RecordingLauncher::new()));
    let a = Peer::connect(&service).await;
    let b = Peer::connect(&service).await;

    let request = Envelope::request(b.route.clone(), "app.ping", json!({ "n": 1 }));
    let reqid = request.reqid.clone();
    a.transport.send(request).await.unwrap();

    let received = b.next_command("app.ping").await;
    assert_eq!(received.source.as_ref(), Some(&a.route));
    b.transport
        .send(Envelope::response_to(&received, json!({ "pong": 1 })))
        .await
        .unwrap();

    let reply = a.next_matching(|env| env.resid == reqid).await;
    assert_eq!(reply.payload["pong"], 1);
    let routes = Arc::clone(service.routes());
    eventually(|| routes.pending_rpcs() == 0).await;
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn request_to_unknown_route_is_answered_with_an_error() {
    let service = service(&Arc::new(RecordingLauncher::new()));
    let a = Peer::connect(&service).await;

    let request = Envelope::request(RouteId::new("nobody-home"), "app.ping", json!({}));
    let reqid = request.reqid.clone();
    a.transport.send(request).await.unwrap();

    let reply = a.next_matching(|env| env.resid == reqid).await;
    assert!(reply.error.expect("no-route error").contains("nobody-home"));
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn a_silent_peer_does_not_stall_the_others() {
    let service = service(&Arc::new(RecordingLauncher::new()));
    let sender = Peer::connect(&service).await;
    let stalled = Peer::connect(&service).await;
    let live = Peer::connect(&service).await;

    // `stalled` never reads; its outbound buffer fills and the rest backlogs.
    for n in 0..600 {
        let event = Envelope::event(stalled.route.clone(), "app.tick", json!({ "n": n }));
        sender.transport.send(event).await.unwrap();
    }
    for n in 0..5 {
        let event = Envelope::event(live.route.clone(), "app.tick", json!({ "n": n }));
        sender.transport.send(event).await.unwrap();
    }
    for n in 0..5 {
        let tick = live.next_command("app.tick").await;
        assert_eq!(tick.payload["n"], n);
    }

    let backlog = service
        .routes()
        .snapshot(&stalled.route)
        .map(|s| s.backlog_len)
        .unwrap_or_default();
    assert!(backlog > 0);

    for n in 0..600 {
        let tick = tokio::time::timeout(Duration::from_secs(5), stalled.next_command("app.tick"))
            .await
            .expect("backlog drains once the peer reads");
        assert_eq!(tick.payload["n"], n);
    }
}
