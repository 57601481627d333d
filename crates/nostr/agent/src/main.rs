mod config;
mod handler;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::AgentConfig;
use nostr::PublicKey;
use nostr_client::{
    Filter, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_GIFT_WRAP, KIND_TEXT_NOTE, RelayGateway,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(
    name = "nostr-agent",
    about = "OpenAgents Nostr agent (relay gateway client)",
    version
)]
struct Opts {
    /// Path to the TOML config file
    #[arg(long, default_value = "nostr-agent.toml")]
    config: PathBuf,

    /// Secret key, hex or nsec; overrides the config file
    #[arg(long, env = "NOSTR_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    /// Relay URL; repeat to use several. Overrides the config file.
    #[arg(long = "relay")]
    relays: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log notes, direct messages and private messages addressed to this agent
    Listen,
    /// Send a private message
    Send {
        /// Recipient public key, hex or npub
        recipient: String,
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let opts = Opts::parse();

    let mut config = AgentConfig::load(&opts.config)?;
    if let Some(key) = opts.private_key {
        config.nostr.private_key = Some(key);
    }
    if !opts.relays.is_empty() {
        config.nostr.relays = opts.relays;
    }

    let keys = config.nostr.keys()?;
    info!(pubkey = %keys.public_key(), "agent identity loaded");
    let gateway = RelayGateway::new(keys, config.nostr.gateway_config());

    let result = match opts.command.unwrap_or(Command::Listen) {
        Command::Listen => listen(&gateway).await,
        Command::Send { recipient, message } => send(&gateway, &recipient, &message).await,
    };

    gateway.disconnect().await;
    result
}

async fn listen(gateway: &RelayGateway) -> anyhow::Result<()> {
    if !gateway.connect(&[]).await {
        anyhow::bail!("could not reach any relay");
    }

    let me = gateway.public_key().to_hex();
    let filters = [
        Filter::new()
            .kinds([KIND_TEXT_NOTE])
            .pubkey_refs([me.clone()]),
        Filter::new()
            .kinds([KIND_ENCRYPTED_DIRECT_MESSAGE])
            .pubkey_refs([me.clone()]),
        Filter::new().kinds([KIND_GIFT_WRAP]).pubkey_refs([me]),
    ];
    for filter in filters {
        let id = gateway
            .subscribe(Some(filter), Some(handler::logging_handler(gateway.clone())))
            .await?;
        info!(subscription = %id, "listening");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutting down");
    Ok(())
}

async fn send(gateway: &RelayGateway, recipient: &str, message: &str) -> anyhow::Result<()> {
    let recipient = PublicKey::parse(recipient).context("invalid recipient public key")?;
    let receipt = gateway.publish(&recipient, message).await?;

    println!(
        "sent {} via {} relay(s)",
        receipt.direct.event_id,
        receipt.direct.success.len()
    );
    match receipt.archive {
        Some(archive) => println!("archived copy {}", archive.event_id),
        None => println!("archived copy not stored"),
    }
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
