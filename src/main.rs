//! CrossClip command-line entry point

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crossclip::cli::{Cli, CliHandler};
use crossclip::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose, which wins over log_level; a bad file is reported by the command itself
    let filter = Config::load_config(cli.config.as_deref())
        .unwrap_or_default()
        .log_filter(cli.verbose);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    debug!("CrossClip v{}", crossclip::VERSION);

    let handler = CliHandler::new(cli.config);
    handler.handle_command(cli.command).await?;

    Ok(())
}
