use std::{net::SocketAddr, path::PathBuf, time::Duration};

use console_relay_core::ConsoleSessionResponse;
use console_relay_server::{
    access::token_digest,
    build_state,
    cluster::ClusterClientConfig,
    config::ServerConfig,
    credentials::SealingKey,
    inventory::Inventory,
    routes::build_router,
    session::SessionConfig,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderValue, StatusCode},
        Error as WsError,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::{spawn_cluster, FakeCluster, SECRET, TOKEN_ID};

pub const USER_TOKEN: &str = "alice-token";

pub type BrowserSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Harness {
    pub relay_addr: SocketAddr,
    pub cluster: FakeCluster,
    pub http: reqwest::Client,
}

/// Serves the relay on an ephemeral port with one connection, `lab`, that
/// points at a fresh fake cluster. `alice` may open anything on `pve1`.
pub async fn start_relay(metrics: PrometheusHandle) -> Harness {
    let cluster = spawn_cluster("127.0.0.1:0", Vec::new()).await;
    let key = SealingKey::generate();
    let sealed = key.seal("lab", SECRET).unwrap();
    let inventory = Inventory::from_toml(&format!(
        r#"
        [[connections]]
        id = "lab"
        base_url = "http://{addr}"
        token_id = "{token_id}"
        sealed_secret = "{sealed}"

        [[users]]
        name = "alice"
        token_sha256 = "{digest}"

        [[users.grants]]
        connection = "lab"
        node = "pve1"
        "#,
        addr = cluster.addr,
        token_id = TOKEN_ID,
        digest = token_digest(USER_TOKEN),
    ))
    .unwrap();

    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        inventory_path: PathBuf::new(),
        credential_key: key,
        session: SessionConfig::default(),
        cluster: ClusterClientConfig::default(),
        upstream_connect_timeout: Duration::from_secs(5),
        node_cache_ttl: Duration::from_secs(300),
        failover_lock_ttl: Duration::from_secs(30),
        shutdown_grace: Duration::ZERO,
    };
    let state = build_state(&config, &inventory, metrics).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    let router = build_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Harness {
        relay_addr,
        cluster,
        http: reqwest::Client::new(),
    }
}

impl Harness {
    pub async fn create_session(&self, guest_id: &str) -> ConsoleSessionResponse {
        let response = self
            .http
            .post(format!(
                "http://{}/api/connections/lab/nodes/pve1/qemu/{guest_id}/console",
                self.relay_addr
            ))
            .bearer_auth(USER_TOKEN)
            .json(&serde_json::json!({ "kind": "graphical" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        response.json().await.unwrap()
    }

    pub async fn connect(&self, relay_path: &str) -> Result<BrowserSocket, WsError> {
        let mut request = format!("ws://{}{}", self.relay_addr, relay_path)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("binary"));
        let (stream, response) = connect_async(request).await?;
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "binary"
        );
        Ok(stream)
    }
}

pub fn rejection_status<T>(result: Result<T, WsError>) -> StatusCode {
    match result {
        Err(WsError::Http(response)) => response.status(),
        Err(other) => panic!("unexpected websocket error: {other}"),
        Ok(_) => panic!("upgrade unexpectedly accepted"),
    }
}
