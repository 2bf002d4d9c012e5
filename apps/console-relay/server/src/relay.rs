//! Browser-facing console WebSocket and the bidirectional frame relay.

use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use console_relay_core::{ConsoleError, SessionId, SessionIdError};
use futures_util::{stream::SplitSink, Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use thiserror::Error;
use tokio::{sync::Mutex, time::timeout};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{debug, info, warn};

use crate::{
    session::{ConsoleSession, SessionStore},
    upstream::{UpstreamConnector, UpstreamStream, CONSOLE_SUBPROTOCOL},
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on closing one side of a finished relay.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct RelayState {
    store: SessionStore,
    connector: Arc<dyn UpstreamConnector>,
    connect_timeout: Duration,
}

impl RelayState {
    pub fn new(store: SessionStore, connector: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            store,
            connector,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Validates the id, consumes the session and dials upstream. The browser
    /// upgrade is only accepted after this succeeds.
    pub async fn prepare(
        &self,
        raw_id: &str,
    ) -> Result<(ConsoleSession, UpstreamStream), RelayRejection> {
        let session_id = SessionId::parse(raw_id)?;
        let session = self
            .store
            .consume(&session_id)
            .ok_or(RelayRejection::SessionInvalid)?;

        let upstream = timeout(self.connect_timeout, self.connector.connect(&session))
            .await
            .map_err(|_| RelayRejection::ConnectTimeout(self.connect_timeout))??;
        Ok((session, upstream))
    }
}

#[derive(Debug, Error)]
pub enum RelayRejection {
    #[error("malformed session id: {0}")]
    Malformed(#[from] SessionIdError),
    #[error(transparent)]
    Upstream(#[from] ConsoleError),
    #[error("console session missing, expired, or already used")]
    SessionInvalid,
    #[error("upstream console did not answer within {0:?}")]
    ConnectTimeout(Duration),
}

impl RelayRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayRejection::Malformed(_) => StatusCode::BAD_REQUEST,
            RelayRejection::SessionInvalid => StatusCode::NOT_FOUND,
            RelayRejection::Upstream(_) | RelayRejection::ConnectTimeout(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    fn metric_label(&self) -> &'static str {
        match self {
            RelayRejection::Malformed(_) => "malformed_id",
            RelayRejection::SessionInvalid => "session_invalid",
            RelayRejection::Upstream(err) => err.metric_label(),
            RelayRejection::ConnectTimeout(_) => "connect_timeout",
        }
    }
}

impl IntoResponse for RelayRejection {
    fn into_response(self) -> Response {
        (self.status(), [(header::CONNECTION, "close")]).into_response()
    }
}

pub async fn console_ws_handler(
    State(relay): State<RelayState>,
    Path(raw_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match relay.prepare(&raw_id).await {
        Ok((session, upstream)) => {
            info!(
                session_id = %session.session_id,
                resource = %session.resource,
                endpoint = %session.endpoint,
                "upstream console connected; accepting browser upgrade"
            );
            ws.protocols([CONSOLE_SUBPROTOCOL])
                .on_upgrade(move |socket| run_relay(socket, upstream, session))
        }
        Err(rejection) => {
            counter!(
                "console_relay_upgrades_rejected_total",
                1,
                "reason" => rejection.metric_label()
            );
            warn!(error = %rejection, status = %rejection.status(), "rejecting console upgrade");
            rejection.into_response()
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToUpstream,
    ToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ToUpstream => "to_upstream",
            Direction::ToClient => "to_client",
        }
    }
}

/// Payload-bearing frame, carried across without inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }
}

enum Received {
    Frame(Frame),
    Close,
    Ignore,
}

trait WireMessage: Sized {
    fn classify(self) -> Received;
    fn from_frame(frame: Frame) -> Self;
    fn close() -> Self;
}

// Ping and pong are answered by each socket implementation.
impl WireMessage for Message {
    fn classify(self) -> Received {
        match self {
            Message::Text(text) => Received::Frame(Frame::Text(text)),
            Message::Binary(bytes) => Received::Frame(Frame::Binary(bytes)),
            Message::Close(_) => Received::Close,
            Message::Ping(_) | Message::Pong(_) => Received::Ignore,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        }
    }

    fn close() -> Self {
        Message::Close(None)
    }
}

impl WireMessage for UpstreamMessage {
    fn classify(self) -> Received {
        match self {
            UpstreamMessage::Text(text) => Received::Frame(Frame::Text(text)),
            UpstreamMessage::Binary(bytes) => Received::Frame(Frame::Binary(bytes)),
            UpstreamMessage::Close(_) => Received::Close,
            UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => {
                Received::Ignore
            }
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => UpstreamMessage::Text(text),
            Frame::Binary(bytes) => UpstreamMessage::Binary(bytes),
        }
    }

    fn close() -> Self {
        UpstreamMessage::Close(None)
    }
}

#[derive(Debug)]
enum PumpExit {
    Closed,
    EndOfStream,
    ReadError(String),
    WriteError,
}

async fn pump<In, Out, St, Si, E>(
    mut source: St,
    sink: Arc<Mutex<Si>>,
    direction: Direction,
) -> PumpExit
where
    In: WireMessage,
    Out: WireMessage,
    St: Stream<Item = Result<In, E>> + Unpin,
    Si: Sink<Out> + Unpin,
    E: Display,
{
    while let Some(next) = source.next().await {
        let frame = match next {
            Ok(message) => match message.classify() {
                Received::Frame(frame) => frame,
                Received::Close => return PumpExit::Closed,
                Received::Ignore => continue,
            },
            Err(err) => return PumpExit::ReadError(err.to_string()),
        };

        let bytes = frame.len();
        if sink.lock().await.send(Out::from_frame(frame)).await.is_err() {
            return PumpExit::WriteError;
        }
        counter!("console_relay_frames_forwarded_total", 1, "direction" => direction.as_str());
        counter!(
            "console_relay_bytes_forwarded_total",
            bytes as u64,
            "direction" => direction.as_str()
        );
    }
    PumpExit::EndOfStream
}

type ClientSink = SplitSink<WebSocket, Message>;
type UpstreamSink = SplitSink<UpstreamStream, UpstreamMessage>;

/// Closes both sockets exactly once; errors from an already gone peer are
/// swallowed.
struct Teardown {
    done: AtomicBool,
    client: Arc<Mutex<ClientSink>>,
    upstream: Arc<Mutex<UpstreamSink>>,
}

impl Teardown {
    fn new(client: ClientSink, upstream: UpstreamSink) -> Self {
        Self {
            done: AtomicBool::new(false),
            client: Arc::new(Mutex::new(client)),
            upstream: Arc::new(Mutex::new(upstream)),
        }
    }

    async fn close_both(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if !close_sink::<Message, _>(&self.client, TEARDOWN_TIMEOUT).await {
            debug!("browser socket did not close in time; dropping it");
        }
        if !close_sink::<UpstreamMessage, _>(&self.upstream, TEARDOWN_TIMEOUT).await {
            debug!("upstream socket did not close in time; dropping it");
        }
    }
}

/// Sends a Close frame and flushes. Returns false when the peer stalls past
/// `limit`.
async fn close_sink<M, Si>(sink: &Mutex<Si>, limit: Duration) -> bool
where
    M: WireMessage,
    Si: Sink<M> + Unpin,
{
    let closing = async {
        let mut sink = sink.lock().await;
        let _ = sink.send(M::close()).await;
        let _ = sink.close().await;
    };
    timeout(limit, closing).await.is_ok()
}

async fn run_relay(socket: WebSocket, upstream: UpstreamStream, session: ConsoleSession) {
    let session_id = session.session_id.clone();
    increment_gauge!("console_relay_relays_active", 1.0);
    counter!("console_relay_relays_opened_total", 1);

    let (client_tx, client_rx) = socket.split();
    let (upstream_tx, upstream_rx) = upstream.split();
    let teardown = Teardown::new(client_tx, upstream_tx);

    let mut to_upstream = tokio::spawn(pump::<Message, UpstreamMessage, _, _, _>(
        client_rx,
        Arc::clone(&teardown.upstream),
        Direction::ToUpstream,
    ));
    let mut to_client = tokio::spawn(pump::<UpstreamMessage, Message, _, _, _>(
        upstream_rx,
        Arc::clone(&teardown.client),
        Direction::ToClient,
    ));

    let (direction, exit) = tokio::select! {
        exit = &mut to_upstream => {
            to_client.abort();
            let _ = (&mut to_client).await;
            (Direction::ToUpstream, exit)
        }
        exit = &mut to_client => {
            to_upstream.abort();
            let _ = (&mut to_upstream).await;
            (Direction::ToClient, exit)
        }
    };
    teardown.close_both().await;

    match exit {
        Ok(PumpExit::ReadError(err)) => warn!(
            session_id = %session_id,
            direction = direction.as_str(),
            error = %err,
            "console relay read failed"
        ),
        Ok(exit) => info!(
            session_id = %session_id,
            direction = direction.as_str(),
            exit = ?exit,
            "console relay closed"
        ),
        Err(err) => warn!(session_id = %session_id, error = %err, "console relay task failed"),
    }
    decrement_gauge!("console_relay_relays_active", 1.0);
    counter!("console_relay_relays_closed_total", 1);
}
