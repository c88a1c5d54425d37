//! Software enclave host
//!
//! Serves one software enclave per chain on the configured Unix sockets so
//! a coordinator can run end to end without enclave hardware.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trinity_coordinator::{ChainId, EnclaveServer, SoftwareEnclave, TrinityConfig};

#[derive(Debug, Parser)]
#[command(author, version, about = "Host Trinity software enclaves on Unix sockets", long_about = None)]
struct Cli {
    /// JSON coordinator configuration; socket paths are read from its `enclave` section
    #[arg(long)]
    config: Option<PathBuf>,

    /// Chains to host (arbitrum, solana, ton); all three when omitted
    #[arg(long = "chain", value_parser = parse_chain)]
    chains: Vec<ChainId>,
}

fn parse_chain(value: &str) -> Result<ChainId, String> {
    ChainId::parse(value).ok_or_else(|| format!("unknown chain '{value}'"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<TrinityConfig> {
    let Some(path) = path else {
        return Ok(TrinityConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    TrinityConfig::from_json_str(&json).map_err(|e| anyhow!("invalid config {}: {e}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_ref())?;
    let chains = if cli.chains.is_empty() {
        ChainId::ALL.to_vec()
    } else {
        cli.chains
    };

    let cancel = CancellationToken::new();
    let mut servers = Vec::with_capacity(chains.len());
    for chain in chains {
        let path = config
            .enclave
            .socket_paths
            .get(&chain)
            .cloned()
            .ok_or_else(|| anyhow!("no socket path configured for {chain}"))?;
        let enclave = Arc::new(
            SoftwareEnclave::new(chain).map_err(|e| anyhow!("failed to create {chain} enclave: {e}"))?,
        );
        info!(
            "[{}] Software enclave ready, public key {}",
            chain,
            enclave.public_key().to_hex()
        );
        let server = EnclaveServer::new(enclave, path);
        servers.push(tokio::spawn(server.serve(cancel.child_token())));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    cancel.cancel();

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Enclave server failed: {}", e),
            Err(e) => error!("Enclave server task panicked: {}", e),
        }
    }
    Ok(())
}
