//! REST calls to the cluster manager.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use console_relay_core::{ConsoleError, ConsoleKind, ResourceKind, ResourceRef};
use futures_util::future::join_all;
use metrics::counter;
use reqwest::{header::AUTHORIZATION, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    credentials::{CredentialError, CredentialStore, ServiceCredential},
    failover::{DiscoveryError, DiscoveryResult, EndpointResolver, ResolvedEndpoint},
    inventory::{ConnectionTarget, Endpoint},
};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("credential unavailable: {0}")]
    Credential(#[from] CredentialError),
    #[error("not found on cluster: {0}")]
    NotFound(String),
    #[error("cluster manager refused the request with status {0}")]
    Rejected(StatusCode),
    #[error("cluster manager unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected response from cluster manager: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

impl From<ClusterError> for ConsoleError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(what) => ConsoleError::ResourceNotFound(what),
            other => ConsoleError::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ClusterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ClusterError::Unreachable(err.to_string())
        } else {
            ClusterError::InvalidResponse(err.to_string())
        }
    }
}

/// One-time console ticket plus the address that issued it.
#[derive(Clone)]
pub struct ConsoleTicket {
    pub ticket: String,
    pub port: u16,
    pub endpoint: Endpoint,
}

impl fmt::Debug for ConsoleTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleTicket")
            .field("ticket", &"<redacted>")
            .field("port", &self.port)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub name: String,
    pub address: String,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn issue_ticket(
        &self,
        target: &ConnectionTarget,
        resource: &ResourceRef,
        kind: ConsoleKind,
    ) -> Result<ConsoleTicket, ClusterError>;

    async fn enumerate_addresses(
        &self,
        target: &ConnectionTarget,
        endpoint: &Endpoint,
    ) -> Result<Vec<ClusterMember>, ClusterError>;
}

#[derive(Debug, Clone)]
pub struct ClusterClientConfig {
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for ClusterClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Cluster manager client that recovers from a dead primary address through
/// the node endpoint cache and single-flight discovery.
#[derive(Clone)]
pub struct HttpClusterClient {
    credentials: Arc<dyn CredentialStore>,
    resolver: EndpointResolver,
    verified: reqwest::Client,
    insecure: reqwest::Client,
    config: ClusterClientConfig,
}

impl HttpClusterClient {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        resolver: EndpointResolver,
        config: ClusterClientConfig,
    ) -> Result<Self, reqwest::Error> {
        let verified = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.probe_timeout)
            .build()?;
        let insecure = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.probe_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            credentials,
            resolver,
            verified,
            insecure,
            config,
        })
    }

    fn http_for(&self, target: &ConnectionTarget) -> reqwest::Client {
        if target.tls.accepts_invalid_certs() {
            self.insecure.clone()
        } else {
            self.verified.clone()
        }
    }

    /// Runs `op` against the primary address, then against cached member
    /// addresses, then against a freshly discovered one. Only connectivity
    /// failures move on to the next step.
    async fn with_failover<T, F, Fut>(
        &self,
        target: &Arc<ConnectionTarget>,
        credential: &ServiceCredential,
        op: F,
    ) -> Result<(T, Endpoint), ClusterError>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        match op(target.primary.clone()).await {
            Err(ClusterError::Unreachable(reason)) => {
                warn!(
                    connection_id = %target.id,
                    endpoint = %target.primary,
                    error = %reason,
                    "primary cluster address unreachable; failing over"
                );
            }
            other => return other.map(|value| (value, target.primary.clone())),
        }

        if let Some(entry) = self.resolver.cache().get(&target.id) {
            for endpoint in entry.endpoints().filter(|e| *e != target.primary) {
                match op(endpoint.clone()).await {
                    Err(ClusterError::Unreachable(reason)) => {
                        debug!(
                            endpoint = %endpoint,
                            error = %reason,
                            "cached cluster address unreachable"
                        );
                    }
                    other => return other.map(|value| (value, endpoint)),
                }
            }
            self.resolver.cache().invalidate(Some(&target.id));
        }

        let client = self.clone();
        let discovery_target = Arc::clone(target);
        let discovery_credential = credential.clone();
        let resolved = self
            .resolver
            .resolve(&target.id, move || {
                discover(client, discovery_target, discovery_credential)
            })
            .await?;

        let endpoint = resolved.endpoint;
        op(endpoint.clone()).await.map(|value| (value, endpoint))
    }
}

#[async_trait]
impl ClusterApi for HttpClusterClient {
    async fn issue_ticket(
        &self,
        target: &ConnectionTarget,
        resource: &ResourceRef,
        kind: ConsoleKind,
    ) -> Result<ConsoleTicket, ClusterError> {
        let credential = self.credentials.reveal(&target.id)?;
        let http = self.http_for(target);
        let target = Arc::new(target.clone());
        let path = format!("nodes/{}/{}", resource.cluster_path(), ticket_action(resource, kind));

        let (grant, endpoint) = self
            .with_failover(&target, &credential, |endpoint| {
                let http = http.clone();
                let credential = credential.clone();
                let path = path.clone();
                async move {
                    let response = http
                        .post(format!("{}/{}", endpoint.api_base(), path))
                        .header(AUTHORIZATION, credential.authorization_header())
                        .json(&json!({ "websocket": 1 }))
                        .send()
                        .await?;
                    let envelope: DataEnvelope<TicketGrant> =
                        read_json(response, &path).await?;
                    Ok(envelope.data)
                }
            })
            .await?;

        counter!("console_relay_tickets_issued_total", 1, "kind" => kind.as_str());
        Ok(ConsoleTicket {
            ticket: grant.ticket,
            port: grant.port.as_u16()?,
            endpoint,
        })
    }

    async fn enumerate_addresses(
        &self,
        target: &ConnectionTarget,
        endpoint: &Endpoint,
    ) -> Result<Vec<ClusterMember>, ClusterError> {
        let credential = self.credentials.reveal(&target.id)?;
        fetch_members(&self.http_for(target), endpoint, &credential).await
    }
}

fn ticket_action(resource: &ResourceRef, kind: ConsoleKind) -> &'static str {
    match (resource.resource_type, kind) {
        (_, ConsoleKind::Terminal) => "termproxy",
        (ResourceKind::Node, ConsoleKind::Graphical) => "vncshell",
        (_, ConsoleKind::Graphical) => "vncproxy",
    }
}

/// Asks each seed address for the member list, then probes every member in
/// parallel. Reachable members come first in the result.
async fn discover(
    client: HttpClusterClient,
    target: Arc<ConnectionTarget>,
    credential: ServiceCredential,
) -> DiscoveryResult {
    let seeds = std::iter::once(target.primary.clone()).chain(
        target
            .seed_hosts
            .iter()
            .map(|host| target.primary.with_host(host.clone())),
    );

    let mut members = None;
    let mut last_error = String::from("no seed addresses configured");
    for seed in seeds {
        match client.enumerate_addresses(&target, &seed).await {
            Ok(found) if !found.is_empty() => {
                members = Some(found);
                break;
            }
            Ok(_) => last_error = format!("{seed} reported no online members"),
            Err(err) => last_error = format!("{seed}: {err}"),
        }
    }
    let members = members.ok_or(DiscoveryError::MembershipUnavailable(last_error))?;

    let http = client.http_for(&target);
    let probe_timeout = client.config.probe_timeout;
    let probes = members.iter().map(|member| {
        let endpoint = target.primary.with_host(member.address.clone());
        probe(&http, endpoint, &credential, probe_timeout)
    });
    let results = join_all(probes).await;

    let (reachable, unreachable): (Vec<_>, Vec<_>) = members
        .into_iter()
        .zip(results)
        .partition(|(_, reachable)| *reachable);
    let selected = reachable
        .first()
        .map(|(member, _)| member.address.clone())
        .ok_or(DiscoveryError::NoReachableMember)?;

    let known_addresses = reachable
        .into_iter()
        .chain(unreachable)
        .map(|(member, _)| member.address)
        .collect();
    Ok(ResolvedEndpoint {
        endpoint: target.primary.with_host(selected),
        known_addresses,
    })
}

async fn fetch_members(
    http: &reqwest::Client,
    endpoint: &Endpoint,
    credential: &ServiceCredential,
) -> Result<Vec<ClusterMember>, ClusterError> {
    let response = http
        .get(format!("{}/cluster/status", endpoint.api_base()))
        .header(AUTHORIZATION, credential.authorization_header())
        .send()
        .await?;
    let envelope: DataEnvelope<Vec<StatusEntry>> = read_json(response, "cluster/status").await?;
    Ok(envelope
        .data
        .into_iter()
        .filter(|entry| entry.kind == "node" && entry.online.unwrap_or(1) != 0)
        .filter_map(|entry| {
            entry.ip.map(|address| ClusterMember {
                name: entry.name,
                address,
            })
        })
        .collect())
}

/// Any HTTP answer counts as reachable, authentication failures included.
async fn probe(
    http: &reqwest::Client,
    endpoint: Endpoint,
    credential: &ServiceCredential,
    timeout: Duration,
) -> bool {
    http.get(format!("{}/version", endpoint.api_base()))
        .header(AUTHORIZATION, credential.authorization_header())
        .timeout(timeout)
        .send()
        .await
        .is_ok()
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T, ClusterError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| ClusterError::InvalidResponse(err.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND || body.contains("does not exist") {
        return Err(ClusterError::NotFound(what.to_string()));
    }
    Err(ClusterError::Rejected(status))
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketGrant {
    ticket: String,
    port: PortValue,
}

/// The cluster manager reports console ports as either numbers or strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

impl PortValue {
    fn as_u16(&self) -> Result<u16, ClusterError> {
        match self {
            PortValue::Number(port) => Ok(*port),
            PortValue::Text(raw) => raw
                .trim()
                .parse()
                .map_err(|_| ClusterError::InvalidResponse(format!("invalid console port {raw}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    online: Option<u8>,
}
