//! Transparent volume bot fleet - Entry Point

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Transparent volume bot fleet
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via TVB_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Run only the named bots (repeatable)
    #[arg(long = "bot")]
    bots: Vec<String>,

    /// Ignore the token cache age on the first cycle
    #[arg(long)]
    force_refresh: bool,

    /// Load the token list once, print cache stats and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tvb_telemetry::init_logging()?;

    info!("Starting TVB fleet v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > TVB_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("TVB_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");

    let mut config = tvb_bot::AppConfig::from_file(&config_path)?;
    config.retain_bots(&args.bots)?;
    info!(
        bots = ?config.bots.iter().map(|b| &b.name).collect::<Vec<_>>(),
        factory = %config.factory_address,
        "Configuration loaded"
    );

    let app = tvb_bot::Application::new(config)?.with_force_refresh(args.force_refresh);

    if args.dry_run {
        let stats = app.dry_run().await;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    app.run().await?;

    Ok(())
}
