//! 'main' for the Bulwark block replayer

use anyhow::Result;
use bulwark_module_consensus::in_memory_coin_view::InMemoryCoinView;
use bulwark_module_consensus::in_memory_stake_store::InMemoryStakeStore;
use bulwark_module_consensus::memory_block_source::MemoryBlockSource;
use bulwark_module_consensus::script_checks::AcceptAllScriptVerifier;
use bulwark_module_consensus::{build_validator, ConsensusLoop, ConsensusSettings, StakeStore};
use config::{Config, Environment, File};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

mod playback;
mod replayer_config;

use replayer_config::ReplayerConfig;

#[tokio::main]
pub async fn main() -> Result<()> {
    // Standard logging using RUST_LOG for log levels
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());
    Registry::default().with(fmt_layer).init();

    info!("Bulwark block replayer");

    // Read the config
    let config = Config::builder()
        .add_source(File::with_name("replayer").required(false))
        .add_source(Environment::with_prefix("BULWARK"))
        .build()?;

    let settings = ConsensusSettings::from_config(&config);
    let replayer = ReplayerConfig::new(&config);
    let network = Arc::new(settings.resolve_network()?);
    let blocks = playback::load_blocks(Path::new(&replayer.blocks))?;

    let stake_store: Option<Arc<dyn StakeStore>> = if network.is_proof_of_stake() {
        Some(Arc::new(InMemoryStakeStore::new(&network.genesis)))
    } else {
        None
    };
    let coin_view = Arc::new(InMemoryCoinView::new(network.genesis_hash()));
    let source = Arc::new(MemoryBlockSource::new(network.genesis_hash(), blocks));
    let validator = build_validator(
        network.clone(),
        &settings,
        Arc::new(AcceptAllScriptVerifier),
        stake_store.clone(),
    )?;

    let mut consensus = ConsensusLoop::new(network, validator, coin_view, source.clone(), stake_store, &settings);
    consensus.initialize().await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping");
                cancel.cancel();
            }
        });
    }

    let summary = playback::replay(&mut consensus, &source, &cancel, replayer.stop_on_rejection).await?;
    if let Some((hash, rule)) = summary.rejected {
        error!(%hash, code = rule.code(), "Replay rejected a block: {rule}");
    }

    let tip = consensus.tip();
    info!(
        height = tip.height,
        hash = %tip.hash,
        connected = summary.connected,
        skipped = summary.skipped,
        "Replay finished"
    );
    Ok(())
}
