mod cli;

use anyhow::Result;
use clap::Parser;

use cli::Cli;
use shard_cache::core::{logging::setup_logging, settings::SettingsManager};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level());

    let settings_manager = match &cli.config {
        Some(path) => SettingsManager::at(path),
        None => SettingsManager::new()?,
    };
    let mut settings = settings_manager.read();
    cli.apply(&mut settings);
    tracing::debug!(
        endpoint = %settings.models_endpoint,
        config = %settings_manager.path().display(),
        "settings loaded"
    );

    cli::run(cli.command, &settings_manager, &settings).await
}
