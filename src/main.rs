//! Mocker - CLI Entry Point

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use mocker::watcher::FileSignature;
use mocker::{server, Dispatcher, MockerConfig, ReloadWatcher, RouteTable};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mocker",
    about = "Configuration-driven HTTP mock server",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mocker.yaml")]
    config: PathBuf,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// How often to check the configuration file for changes
    #[arg(long, default_value_t = 1000, value_name = "MS")]
    reload_interval_ms: u64,

    /// Do not watch the configuration file
    #[arg(long)]
    no_watch: bool,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let sample = include_str!("../demos/mocker.yaml");
        println!("{}", sample);
        return Ok(());
    }

    // A mock server without routes is useless: any load failure is fatal.
    info!(path = ?args.config, "Loading configuration");
    let baseline = FileSignature::read(&args.config).await.ok();
    let config = MockerConfig::read(&args.config)
        .await
        .with_context(|| format!("cannot start without a route table ({})", args.config.display()))?;

    if args.validate {
        println!(
            "Configuration is valid ({} patterns, {} routes)",
            config.routes.len(),
            config.route_count()
        );
        return Ok(());
    }

    mocker::watcher::log_routes(&config);
    let configured_port = config.port().to_string();
    let port = match args.port {
        Some(port) => port.to_string(),
        None => configured_port.clone(),
    };
    let routes = Arc::new(ArcSwap::from_pointee(RouteTable::new(config.routes)));

    if !args.no_watch {
        ReloadWatcher::new(&args.config, routes.clone(), &configured_port)
            .with_baseline(baseline)
            .with_interval(Duration::from_millis(args.reload_interval_ms.max(1)))
            .spawn();
    }

    let addr = format!("{}:{}", args.host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(address = %addr, "Server starting");

    server::serve(listener, Dispatcher::new(routes)).await?;

    Ok(())
}
