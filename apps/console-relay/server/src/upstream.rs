//! Outbound console WebSocket towards the cluster manager.

use std::sync::{Arc, Once};

use async_trait::async_trait;
use console_relay_core::ConsoleError;
use reqwest::Url;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error};

use crate::{credentials::CredentialStore, session::ConsoleSession};

pub type UpstreamStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const CONSOLE_SUBPROTOCOL: &str = "binary";

static RUSTLS_PROVIDER_INIT: Once = Once::new();

/// Installs the ring provider as the process default once; later calls are
/// no-ops.
pub fn ensure_rustls_provider() {
    RUSTLS_PROVIDER_INIT.call_once(|| {
        if let Err(err) = rustls::crypto::ring::default_provider().install_default() {
            error!(?err, "rustls crypto provider install failed");
        }
    });
}

/// Opens the upstream half of a relay for a consumed session.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, session: &ConsoleSession) -> Result<UpstreamStream, ConsoleError>;
}

pub struct TungsteniteConnector {
    credentials: Arc<dyn CredentialStore>,
    insecure_tls: Arc<ClientConfig>,
}

impl TungsteniteConnector {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        ensure_rustls_provider();
        let insecure_tls = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        Self {
            credentials,
            insecure_tls: Arc::new(insecure_tls),
        }
    }
}

#[async_trait]
impl UpstreamConnector for TungsteniteConnector {
    async fn connect(&self, session: &ConsoleSession) -> Result<UpstreamStream, ConsoleError> {
        let credential = self
            .credentials
            .reveal(&session.target.id)
            .map_err(|err| ConsoleError::UpstreamHandshakeFailed(err.to_string()))?;
        let url = console_url(session)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| ConsoleError::UpstreamHandshakeFailed(err.to_string()))?;
        let authorization = HeaderValue::from_str(&credential.authorization_header())
            .map_err(|err| ConsoleError::UpstreamHandshakeFailed(err.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(header::AUTHORIZATION, authorization);
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(CONSOLE_SUBPROTOCOL),
        );

        let connector = session
            .target
            .tls
            .accepts_invalid_certs()
            .then(|| Connector::Rustls(Arc::clone(&self.insecure_tls)));

        debug!(
            session_id = %session.session_id,
            endpoint = %session.endpoint,
            resource = %session.resource,
            "dialing upstream console"
        );
        let (stream, _response) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|err| ConsoleError::UpstreamHandshakeFailed(err.to_string()))?;
        Ok(stream)
    }
}

/// `.../nodes/{path}/vncwebsocket?port=..&vncticket=..` on the issuing endpoint.
pub fn console_url(session: &ConsoleSession) -> Result<Url, ConsoleError> {
    let raw = format!(
        "{}/nodes/{}/vncwebsocket",
        session.endpoint.websocket_base(),
        session.resource.cluster_path()
    );
    let mut url =
        Url::parse(&raw).map_err(|err| ConsoleError::UpstreamHandshakeFailed(err.to_string()))?;
    url.query_pairs_mut()
        .append_pair("port", &session.proxy_port.to_string())
        .append_pair("vncticket", session.ticket());
    Ok(url)
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
