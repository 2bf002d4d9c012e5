mod support;

use console_relay_core::ConsoleKind;
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use support::{rejection_status, start_relay, Harness, UpstreamEvent, USER_TOKEN};
use tokio_tungstenite::tungstenite::{http::StatusCode, Message};

async fn start() -> Harness {
    start_relay(detached_metrics()).await
}

fn detached_metrics() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

#[test_timeout::tokio_timeout_test(30)]
async fn relays_frames_in_order_both_ways() {
    let mut harness = start().await;
    let session = harness.create_session("101").await;
    assert_eq!(session.display.console_kind, ConsoleKind::Graphical);
    assert_eq!(harness.cluster.ticket_calls(), 1);

    let mut client = harness.connect(&session.relay_path).await.unwrap();
    assert_eq!(
        harness.cluster.next_event().await,
        UpstreamEvent::Connected {
            path: "pve1/qemu/101".into(),
            authorization: Some(support::expected_authorization()),
            ticket: Some(support::TICKET.into()),
            port: Some("5900".into()),
        }
    );

    let greeting = client.next().await.unwrap().unwrap();
    assert_eq!(greeting, Message::Text(support::GREETING.into()));

    for payload in [b"A".to_vec(), b"B".to_vec(), b"C".to_vec()] {
        client.send(Message::Binary(payload)).await.unwrap();
    }
    client.send(Message::Text("keys".into())).await.unwrap();

    assert_eq!(harness.cluster.next_event().await, UpstreamEvent::Binary(b"A".to_vec()));
    assert_eq!(harness.cluster.next_event().await, UpstreamEvent::Binary(b"B".to_vec()));
    assert_eq!(harness.cluster.next_event().await, UpstreamEvent::Binary(b"C".to_vec()));
    assert_eq!(harness.cluster.next_event().await, UpstreamEvent::Text("keys".into()));

    client.close(None).await.unwrap();
    assert_eq!(harness.cluster.next_event().await, UpstreamEvent::Closed);
}

#[test_timeout::tokio_timeout_test(30)]
async fn upstream_close_closes_browser_socket() {
    let mut harness = start().await;
    let session = harness.create_session("101").await;
    let mut client = harness.connect(&session.relay_path).await.unwrap();
    assert!(matches!(
        harness.cluster.next_event().await,
        UpstreamEvent::Connected { .. }
    ));
    let _greeting = client.next().await.unwrap().unwrap();

    client
        .send(Message::Text(support::CLOSE_UPSTREAM.into()))
        .await
        .unwrap();
    loop {
        match client.next().await {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("unexpected frame after upstream close: {other:?}"),
        }
    }
    assert_eq!(harness.cluster.next_event().await, UpstreamEvent::Closed);
}

#[test_timeout::tokio_timeout_test(30)]
async fn session_is_redeemable_once() {
    let harness = start().await;
    let session = harness.create_session("101").await;

    let _client = harness.connect(&session.relay_path).await.unwrap();
    let second = harness.connect(&session.relay_path).await;
    assert_eq!(rejection_status(second), StatusCode::NOT_FOUND);
}

#[test_timeout::tokio_timeout_test(30)]
async fn rejects_malformed_and_unknown_ids() {
    let harness = start().await;
    let malformed = harness.connect("/ws/console/not-a-session").await;
    assert_eq!(rejection_status(malformed), StatusCode::BAD_REQUEST);

    let unknown = format!("/ws/console/{}", console_relay_core::SessionId::generate());
    assert_eq!(
        rejection_status(harness.connect(&unknown).await),
        StatusCode::NOT_FOUND
    );
}

#[test_timeout::tokio_timeout_test(30)]
async fn upstream_handshake_failure_is_bad_gateway() {
    let mut harness = start().await;
    let session = harness.create_session(support::REFUSING_GUEST).await;

    let result = harness.connect(&session.relay_path).await;
    assert_eq!(rejection_status(result), StatusCode::BAD_GATEWAY);
    assert!(harness.cluster.events.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(30)]
async fn unknown_guest_is_not_found() {
    let harness = start().await;
    let response = harness
        .http
        .post(format!(
            "http://{}/api/connections/lab/nodes/pve1/qemu/{}/console",
            harness.relay_addr,
            support::MISSING_GUEST
        ))
        .bearer_auth(USER_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}
