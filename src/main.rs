use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tickwatch::config::{Config, SettingsStore};
use tickwatch::engine::{LogObserver, TickerEngine};
use tickwatch::error::ConfigError;
use tickwatch::sources::HttpFetcher;
use tickwatch::value_log::ValueLog;
use tokio_util::sync::CancellationToken;

/// Command-line arguments for tickwatch
#[derive(Parser)]
#[command(
    name = "tickwatch",
    about = "Polls JSON endpoints, tracks value trends and raises threshold alarms",
    long_about = "Polls a list of JSON HTTP endpoints on per-source intervals, extracts one value \
                  from each response by key search, tracks whether it went up or down and fires \
                  one-shot threshold alarms. Sources that share a URL are fetched once."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Path to the settings document, overriding the configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Settings document path (JSON format)"
    )]
    settings: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Refresh every source once and exit
    #[arg(long, help = "Refresh every source once, then exit")]
    once: bool,
}

impl Cli {
    /// Reject paths that can never be opened
    ///
    /// A config file that does not exist yet is fine; defaults are used.
    fn validate(&self) -> Result<(), String> {
        if let Some(path) = self.config.as_deref().filter(|p| p.exists()) {
            if !path.is_file() {
                return Err(format!("{} is not a file", path.display()));
            }
            if path.extension().is_some_and(|ext| ext != "toml") {
                warn!("{} is read as TOML", path.display());
            }
        }

        match self.settings.as_deref() {
            Some(path) if path.is_dir() => Err(format!(
                "settings path {} is a directory",
                path.display()
            )),
            _ => Ok(()),
        }
    }
}

/// Read the runtime config; an unreadable or invalid file means defaults
fn load_config(path: Option<&Path>) -> Config {
    let Some(path) = path else {
        debug!("No config file given, using defaults");
        return Config::default();
    };

    match Config::from_file(path) {
        Ok(config) => {
            info!("Loaded config from {}", path.display());
            config
        }
        Err(ConfigError::ReadError(e)) => {
            warn!("Cannot read config {}, using defaults", e);
            Config::default()
        }
        Err(e) => {
            error!("Invalid config {}: {}; using defaults", path.display(), e);
            Config::default()
        }
    }
}

/// Open the settings, build the engine and poll until interrupted
async fn run(config: Config, once: bool, shutdown: CancellationToken) -> anyhow::Result<()> {
    let store = SettingsStore::open(&config.settings_path).with_context(|| {
        format!(
            "Failed to open settings file {}",
            config.settings_path.display()
        )
    })?;
    let fetcher = HttpFetcher::new(&config.http).context("Failed to build HTTP client")?;

    let engine = TickerEngine::load(
        Arc::new(store),
        Arc::new(fetcher),
        Arc::new(LogObserver),
        Some(ValueLog::new(&config.log_dir)),
    );

    if once {
        engine.refresh_all().await;
        info!("Refreshed {} source(s)", engine.snapshot().len());
        return Ok(());
    }

    engine.start();
    info!("tickwatch is running. Press Ctrl+C to stop.");
    shutdown.cancelled().await;

    engine.shutdown();
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let mut config = load_config(cli.config.as_deref());
    if let Some(settings) = cli.settings.clone() {
        config.settings_path = settings;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        signal.cancel();
    }) {
        error!("Failed to set SIGINT handler: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = runtime.block_on(run(config, cli.once, shutdown)) {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("tickwatch shutdown complete");
}
