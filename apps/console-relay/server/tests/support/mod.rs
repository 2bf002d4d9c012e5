//! In-process stand-in for a cluster manager (REST ticket endpoints, cluster
//! membership, and a console WebSocket that records what it receives) plus a
//! relay server wired against it.

#![allow(dead_code)]

mod harness;

pub use harness::{rejection_status, start_relay, BrowserSocket, Harness, USER_TOKEN};

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use console_relay_server::credentials::{CredentialError, CredentialStore, ServiceCredential};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc};

pub const TOKEN_ID: &str = "relay@pve!console";
pub const SECRET: &str = "s3cret";
pub const TICKET: &str = "PVEVNC:abc+/=";
pub const GREETING: &str = "RFB 003.008\n";
/// Browser text that makes the console hang up with a Close frame.
pub const CLOSE_UPSTREAM: &str = "close-upstream";
/// Browser text that makes the console drop its connection without one.
pub const ABORT_UPSTREAM: &str = "abort-upstream";
/// Guest id whose ticket request fails as an unknown guest.
pub const MISSING_GUEST: &str = "404";
/// Guest id whose console WebSocket refuses the handshake.
pub const REFUSING_GUEST: &str = "999";

pub fn expected_authorization() -> String {
    format!("PVEAPIToken={TOKEN_ID}={SECRET}")
}

pub struct StaticCredentials;

impl CredentialStore for StaticCredentials {
    fn reveal(&self, _connection_id: &str) -> Result<ServiceCredential, CredentialError> {
        Ok(ServiceCredential::new(TOKEN_ID, SECRET))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Connected {
        path: String,
        authorization: Option<String>,
        ticket: Option<String>,
        port: Option<String>,
    },
    Text(String),
    Binary(Vec<u8>),
    Closed,
    Aborted,
}

#[derive(Clone)]
struct ClusterState {
    members: Vec<Value>,
    status_calls: Arc<AtomicUsize>,
    ticket_calls: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<UpstreamEvent>,
}

pub struct FakeCluster {
    pub addr: SocketAddr,
    pub status_calls: Arc<AtomicUsize>,
    pub ticket_calls: Arc<AtomicUsize>,
    pub events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

impl FakeCluster {
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn ticket_calls(&self) -> usize {
        self.ticket_calls.load(Ordering::SeqCst)
    }

    pub async fn next_event(&mut self) -> UpstreamEvent {
        self.events.recv().await.expect("fake cluster dropped")
    }
}

pub fn node_member(name: &str, ip: &str, online: bool) -> Value {
    json!({ "type": "node", "name": name, "ip": ip, "online": u8::from(online) })
}

pub async fn spawn_cluster(bind: &str, members: Vec<Value>) -> FakeCluster {
    let (events_tx, events) = mpsc::unbounded_channel();
    let state = ClusterState {
        members,
        status_calls: Arc::new(AtomicUsize::new(0)),
        ticket_calls: Arc::new(AtomicUsize::new(0)),
        events: events_tx,
    };
    let guest = "/api2/json/nodes/:node/:kind/:id";
    let router = Router::new()
        .route("/api2/json/version", get(version))
        .route("/api2/json/cluster/status", get(cluster_status))
        .route(&format!("{guest}/vncproxy"), post(issue_ticket))
        .route(&format!("{guest}/termproxy"), post(issue_ticket))
        .route(&format!("{guest}/vncwebsocket"), get(console_socket))
        .with_state(state.clone());

    let listener = TcpListener::bind(bind).await.expect("bind fake cluster");
    let addr = listener.local_addr().expect("fake cluster address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    FakeCluster {
        addr,
        status_calls: state.status_calls,
        ticket_calls: state.ticket_calls,
        events,
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(expected_authorization().as_str())
}

async fn version() -> Json<Value> {
    Json(json!({ "data": { "version": "8.2.4" } }))
}

async fn cluster_status(State(state): State<ClusterState>, headers: HeaderMap) -> Response {
    state.status_calls.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut data = vec![json!({ "type": "cluster", "name": "lab", "quorate": 1 })];
    data.extend(state.members.iter().cloned());
    Json(json!({ "data": data })).into_response()
}

async fn issue_ticket(
    State(state): State<ClusterState>,
    Path((node, kind, id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    state.ticket_calls.fetch_add(1, Ordering::SeqCst);
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if id == MISSING_GUEST {
        let message = format!("Configuration file 'nodes/{node}/{kind}/{id}.conf' does not exist");
        let body = Json(json!({ "data": null, "message": message }));
        return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
    }
    Json(json!({ "data": { "ticket": TICKET, "port": "5900", "user": TOKEN_ID } })).into_response()
}

async fn console_socket(
    State(state): State<ClusterState>,
    Path((node, kind, id)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if id == REFUSING_GUEST {
        return StatusCode::FORBIDDEN.into_response();
    }
    let _ = state.events.send(UpstreamEvent::Connected {
        path: format!("{node}/{kind}/{id}"),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
        ticket: query.get("vncticket").cloned(),
        port: query.get("port").cloned(),
    });
    let events = state.events.clone();
    ws.protocols(["binary"])
        .on_upgrade(move |socket| console_session(socket, events))
}

/// Greets the relay, then records frames until told to hang up.
async fn console_session(mut socket: WebSocket, events: mpsc::UnboundedSender<UpstreamEvent>) {
    if socket.send(Message::Text(GREETING.into())).await.is_err() {
        return;
    }
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) if text == CLOSE_UPSTREAM => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            Message::Text(text) if text == ABORT_UPSTREAM => {
                let _ = events.send(UpstreamEvent::Aborted);
                // Dropping the socket ends the TCP stream with no closing
                // handshake.
                return;
            }
            Message::Text(text) => {
                let _ = events.send(UpstreamEvent::Text(text));
            }
            Message::Binary(bytes) => {
                let _ = events.send(UpstreamEvent::Binary(bytes));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    let _ = events.send(UpstreamEvent::Closed);
}
