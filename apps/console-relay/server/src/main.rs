use std::io::Read;

use anyhow::{Context, Result};
use clap::Parser;
use console_relay_server::{
    config::{Cli, Command, ServerConfig},
    credentials::SealingKey,
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Some(Command::GenerateKey) => {
            println!("{}", SealingKey::generate().to_base64());
            return Ok(());
        }
        Some(Command::Seal { connection }) => {
            let key = cli.sealing_key()?;
            let mut secret = String::new();
            std::io::stdin()
                .read_to_string(&mut secret)
                .context("failed to read secret from stdin")?;
            println!("{}", key.seal(connection, secret.trim_end())?);
            return Ok(());
        }
        None => {}
    }

    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        inventory = %config.inventory_path.display(),
        session_ttl_secs = config.session.ttl.as_secs(),
        "starting console-relay server"
    );

    console_relay_server::run(config, telemetry.metrics_handle()).await
}
