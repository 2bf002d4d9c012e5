use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::{cluster::ClusterClientConfig, credentials::SealingKey, session::SessionConfig};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub inventory_path: PathBuf,
    pub credential_key: SealingKey,
    pub session: SessionConfig,
    pub cluster: ClusterClientConfig,
    pub upstream_connect_timeout: Duration,
    pub node_cache_ttl: Duration,
    pub failover_lock_ttl: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "console-relay-server",
    author,
    version,
    about = "Console session broker and WebSocket relay for cluster manager consoles"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to bind the HTTP and WebSocket listener to.
    #[arg(long, env = "CONSOLE_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8443")]
    pub listen_addr: String,

    /// Inventory of cluster connections, users, and grants.
    #[arg(long, env = "CONSOLE_RELAY_INVENTORY", default_value = "inventory.toml")]
    pub inventory: PathBuf,

    /// Base64 key (32 bytes) that opens sealed connection secrets.
    #[arg(
        long,
        env = "CONSOLE_RELAY_CREDENTIAL_KEY",
        hide = true,
        hide_env_values = true
    )]
    pub credential_key: Option<String>,

    /// Lifetime of an issued console session before it must be redeemed.
    #[arg(long, env = "CONSOLE_RELAY_SESSION_TTL_SECS", default_value_t = 30)]
    pub session_ttl_secs: u64,

    /// How often expired sessions are swept from memory.
    #[arg(long, env = "CONSOLE_RELAY_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Bound on the upstream console WebSocket handshake.
    #[arg(
        long,
        env = "CONSOLE_RELAY_UPSTREAM_CONNECT_TIMEOUT_SECS",
        default_value_t = 10
    )]
    pub upstream_connect_timeout_secs: u64,

    /// Bound on each cluster REST request.
    #[arg(long, env = "CONSOLE_RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 15)]
    pub request_timeout_secs: u64,

    /// Bound on each reachability probe during discovery.
    #[arg(long, env = "CONSOLE_RELAY_PROBE_TIMEOUT_SECS", default_value_t = 3)]
    pub probe_timeout_secs: u64,

    /// How long discovered cluster addresses stay usable.
    #[arg(long, env = "CONSOLE_RELAY_NODE_CACHE_TTL_SECS", default_value_t = 300)]
    pub node_cache_ttl_secs: u64,

    /// Upper bound on how long one discovery blocks others for a connection.
    #[arg(long, env = "CONSOLE_RELAY_FAILOVER_LOCK_TTL_SECS", default_value_t = 30)]
    pub failover_lock_ttl_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CONSOLE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a fresh base64 credential key.
    GenerateKey,
    /// Seal a connection secret read from stdin for the inventory file.
    Seal {
        /// Connection id the sealed secret will be bound to.
        #[arg(long)]
        connection: String,
    },
}

impl Cli {
    pub fn sealing_key(&self) -> anyhow::Result<SealingKey> {
        let raw = self
            .credential_key
            .as_deref()
            .context("CONSOLE_RELAY_CREDENTIAL_KEY is not set")?;
        SealingKey::from_base64(raw.trim()).context("invalid CONSOLE_RELAY_CREDENTIAL_KEY")
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let credential_key = cli.sealing_key()?;

        for (name, value) in [
            ("session ttl", cli.session_ttl_secs),
            ("sweep interval", cli.sweep_interval_secs),
            ("upstream connect timeout", cli.upstream_connect_timeout_secs),
            ("probe timeout", cli.probe_timeout_secs),
            ("failover lock ttl", cli.failover_lock_ttl_secs),
        ] {
            if value == 0 {
                bail!("{name} must be at least one second");
            }
        }

        Ok(ServerConfig {
            listen_addr,
            inventory_path: cli.inventory,
            credential_key,
            session: SessionConfig {
                ttl: Duration::from_secs(cli.session_ttl_secs),
                sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            },
            cluster: ClusterClientConfig {
                request_timeout: Duration::from_secs(cli.request_timeout_secs),
                probe_timeout: Duration::from_secs(cli.probe_timeout_secs),
            },
            upstream_connect_timeout: Duration::from_secs(cli.upstream_connect_timeout_secs),
            node_cache_ttl: Duration::from_secs(cli.node_cache_ttl_secs),
            failover_lock_ttl: Duration::from_secs(cli.failover_lock_ttl_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
