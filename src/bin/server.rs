use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use gullveig::{
    alerts::AlertManager,
    analytics::AnalyticsManager,
    config::{DEFAULT_CONFIG_PATH, read_config_file},
    context::ServerContext,
    lifecycle::Lifecycle,
    storage,
    workers::WorkerSchedule,
};
use tracing::{debug, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
#[command(name = "gullveig-server", disable_version_flag = true)]
struct Args {
    /// Config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("gullveig", LevelFilter::INFO),
        ("gullveig_server", LevelFilter::INFO),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.version {
        println!("gullveig-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init();
    trace!("started with args: {args:?}");

    run(&args).await
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let config = read_config_file(&args.config)?;
    debug!("loaded configuration from {}", args.config);

    let backend = storage::open(&config.storage, &config.server.data_dir)
        .await
        .context("failed to open storage")?;

    let reports = Arc::new(AnalyticsManager::new(backend.clone()));
    let alerts = Arc::new(AlertManager::from_config(&config)?);

    let context = ServerContext::new(
        backend,
        reports,
        alerts,
        config.server.client_key.as_str(),
        config.server.service_timeout(),
    );

    Lifecycle::new(context, WorkerSchedule::default())
        .run(&config.server)
        .await
}
