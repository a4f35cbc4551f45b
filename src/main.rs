use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

use sd_poster_proxy::{
    backoff::BackoffGate,
    blocklist::Blocklist,
    config::Config,
    download::DownloadCoordinator,
    evictor::StaleFileEvictor,
    index::ProgramImageIndex,
    metadata::MetadataCache,
    overrides::OverrideList,
    resolver::PosterResolver,
    selector::SelectionConfig,
    token::TokenManager,
    upstream::{SchedulesDirectClient, SdMetadataService},
    web::WebServer,
};

#[derive(Parser)]
#[command(name = "sd-poster-proxy")]
#[command(version = "0.1.0")]
#[command(about = "A lazy poster-art proxy and cache for Schedules Direct guide data")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("sd_poster_proxy={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sd-poster-proxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    // The only fatal phase: without these directories nothing can be cached.
    std::fs::create_dir_all(&config.storage.cache_dir)
        .with_context(|| format!("creating cache dir {}", config.storage.cache_dir.display()))?;
    std::fs::create_dir_all(&config.storage.state_dir)
        .with_context(|| format!("creating state dir {}", config.storage.state_dir.display()))?;

    let client = Arc::new(SchedulesDirectClient::new(&config.upstream)?);
    let base_url: Url = client.base_url().clone();

    let gate = Arc::new(BackoffGate::new());
    let tokens = Arc::new(TokenManager::load(
        config.token_path(),
        client.clone(),
        gate.clone(),
    ));
    let index = Arc::new(ProgramImageIndex::load(config.index_path()));
    let overrides = Arc::new(OverrideList::load(&config.overrides_path()));
    let blocklist = Arc::new(Blocklist::new(config.blocklist_path()));
    let metadata = Arc::new(MetadataCache::new(Arc::new(SdMetadataService::new(
        client.clone(),
        tokens.clone(),
    ))));
    let downloads = Arc::new(DownloadCoordinator::new());

    let resolver = Arc::new(PosterResolver::new(
        config.storage.cache_dir.clone(),
        base_url,
        SelectionConfig {
            desired_aspect: config.images.poster_aspect.clone(),
        },
        config.images.max_age_days,
        index.clone(),
        metadata,
        downloads,
        tokens,
        gate.clone(),
        client,
        overrides.clone(),
        blocklist,
    ));

    let evictor = Arc::new(StaleFileEvictor::new(
        config.storage.cache_dir.clone(),
        config.images.max_age_days,
        index.clone(),
        overrides,
    ));
    let removed = evictor.purge().await;
    info!(removed, "startup eviction sweep finished");

    if config.images.sweep_interval_hours > 0 {
        let interval = std::time::Duration::from_secs(config.images.sweep_interval_hours * 3600);
        let evictor = evictor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; the startup sweep covered it
            loop {
                ticker.tick().await;
                evictor.purge().await;
            }
        });
    }

    let web_server = WebServer::new(&config, resolver, gate, index)?;
    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );
    web_server.serve().await?;

    Ok(())
}
