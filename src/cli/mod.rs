use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::clipboard::{ClipboardProvider, MemoryClipboard, SystemClipboard};
use crate::config::{generate_device_id, Config, ConfigError, StaticPeer};
use crate::discovery::DiscoveryService;
use crate::sync::{EngineSettings, EngineStatus, SyncEngine};
use crate::transport::TcpChannel;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TARGET"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

/// How often headless mode checks for applied remote updates
const HEADLESS_ECHO_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "crossclip")]
#[command(about = "Peer-to-peer clipboard synchronization over the local network")]
#[command(version, long_version = LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Run the sync engine until Ctrl-C")]
    Start {
        /// TCP port to accept peers on (0 picks a free one)
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        device_id: Option<String>,

        /// Use an in-memory clipboard fed from stdin instead of the desktop clipboard
        #[arg(long)]
        headless: bool,

        /// Disable mDNS announcement and browsing
        #[arg(long)]
        no_mdns: bool,

        /// Extra peer to connect to, as ID=HOST:PORT
        #[arg(long = "peer", value_name = "ID=HOST:PORT")]
        peers: Vec<StaticPeer>,
    },

    #[command(about = "Configuration management")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    #[command(about = "Print the device id this host would announce")]
    Id,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Generate example configuration")]
    Init {
        #[arg(long)]
        force: bool,
    },

    #[command(about = "Validate configuration")]
    Validate,
}

pub struct CliHandler {
    config_path: Option<PathBuf>,
}

impl CliHandler {
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }

    fn load_config(&self) -> Result<Config> {
        Config::load_config(self.config_path.as_deref()).context("failed to load configuration")
    }

    fn target_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Config::default_path().ok_or_else(|| ConfigError::NoConfigDir.into()),
        }
    }

    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Start {
                port,
                device_id,
                headless,
                no_mdns,
                peers,
            } => {
                let mut config = self.load_config()?;
                apply_overrides(&mut config, port, device_id, no_mdns, peers)?;
                self.run(config, headless).await
            }
            Commands::Config { action } => self.handle_config_action(action),
            Commands::Id => {
                let config = self.load_config()?;
                match config.device_id {
                    Some(id) => println!("{}", id),
                    None => println!("{} (generated, changes every start)", generate_device_id()),
                }
                Ok(())
            }
        }
    }

    async fn run(&self, config: Config, headless: bool) -> Result<()> {
        let device_id = config.resolve_device_id();
        let settings = EngineSettings::from_config(&config, device_id.clone());

        let memory = headless.then(|| Arc::new(MemoryClipboard::new()));
        let clipboard: Arc<dyn ClipboardProvider> = match &memory {
            Some(memory) => memory.clone(),
            None => Arc::new(
                SystemClipboard::new(config.sync.poll_interval()).context("failed to open the system clipboard")?,
            ),
        };
        let discovery = Arc::new(DiscoveryService::from_config(&config.discovery)?);
        if discovery.backend_count() == 0 {
            warn!("no discovery backends enabled; only inbound peers will connect");
        }

        let engine = SyncEngine::new(settings, clipboard, discovery, Arc::new(TcpChannel));
        let addr = engine.start().await?;
        println!("crossclip {} listening on {} as '{}'", crate::VERSION, addr, device_id);

        if let Some(memory) = memory {
            tokio::spawn(headless_console(engine.clone(), memory));
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        info!("received Ctrl-C");

        let status = engine.status().await;
        engine.shutdown().await;
        print_status(&status);
        Ok(())
    }

    fn handle_config_action(&self, action: ConfigAction) -> Result<()> {
        match action {
            ConfigAction::Show => {
                let config = self.load_config()?;
                print!("{}", toml::to_string_pretty(&config).map_err(ConfigError::from)?);
            }
            ConfigAction::Init { force } => {
                let path = self.target_path()?;
                Config::generate_example_config(&path, force)?;
                println!("Example configuration written to {}", path.display());
            }
            ConfigAction::Validate => {
                let path = self.target_path()?;
                validate_file(&path)?;
                println!("Configuration {} is valid", path.display());
            }
        }
        Ok(())
    }
}

fn validate_file(path: &Path) -> Result<()> {
    Config::validate(path).with_context(|| format!("invalid configuration {}", path.display()))
}

/// Fold command-line flags into the loaded configuration
pub fn apply_overrides(
    config: &mut Config,
    port: Option<u16>,
    device_id: Option<String>,
    no_mdns: bool,
    peers: Vec<StaticPeer>,
) -> Result<(), ConfigError> {
    if let Some(port) = port {
        config.listen_port = port;
    }
    if device_id.is_some() {
        config.device_id = device_id;
    }
    if no_mdns {
        config.discovery.mdns = false;
    }
    config.discovery.peers.extend(peers);
    config.validate_config()
}

/// Stdin lines become local copies; applied remote text is echoed to stdout
///
/// A line reading `/status` prints the engine status instead.
async fn headless_console(engine: SyncEngine, clipboard: Arc<MemoryClipboard>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown = clipboard.contents();
    let mut ticker = tokio::time::interval(HEADLESS_ECHO_INTERVAL);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim() == "/status" => print_status(&engine.status().await),
                Ok(Some(line)) => {
                    shown = line.clone();
                    clipboard.copy(line);
                }
                Ok(None) => break,
                Err(err) => {
                    warn!("failed to read stdin: {}", err);
                    break;
                }
            },
            _ = ticker.tick() => {
                let current = clipboard.contents();
                if current != shown {
                    println!("< {}", current);
                    shown = current;
                }
            }
        }
    }
}

fn print_status(status: &EngineStatus) {
    println!("Device: {}", status.device_id);
    if let Some(addr) = status.listen_addr {
        println!("  Listening: {}", addr);
    }

    println!("  Connected Peers ({}):", status.peers.len());
    for peer in &status.peers {
        println!(
            "    {} - {} ({}, since {})",
            peer.device_id,
            peer.address,
            peer.direction,
            peer.connected_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    for (device_id, state) in &status.devices {
        println!("    {}: {:?}", device_id, state);
    }

    let stats = &status.stats;
    println!(
        "  Sent: {}  Applied: {}  Suppressed: {}  Echoes: {}  Rejected: {}",
        stats.local_broadcasts, stats.remote_applied, stats.suppressed, stats.echoes_dropped, stats.rejected
    );
}
