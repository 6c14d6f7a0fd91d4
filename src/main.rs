use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use friend_circle::config::{Config, DEFAULT_CONFIG_PATH};
use friend_circle::crawler::Crawler;
use friend_circle::fetcher::FeedFetcher;
use friend_circle::ratelimit::{spawn_sweeper, RateGovernor, SWEEP_INTERVAL};
use friend_circle::routes::{self, AppState};
use friend_circle::scheduler::{start_background_refresh, Pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path =
        std::env::var("FRIEND_CIRCLE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::from_file_and_env(&config_path)?;

    init_logging(config.log.file.as_deref())?;
    info!("Configuration loaded, friend list at {}", config.crawl.friends_url);

    // Start rate limiter cleanup
    let governor = Arc::new(RateGovernor::new());
    spawn_sweeper(governor.clone(), SWEEP_INTERVAL);

    // Create pipeline and start background refresh task
    let fetcher = FeedFetcher::new()?;
    let pipeline = Arc::new(Pipeline::new(
        Crawler::new(Arc::new(fetcher)),
        config.crawl.friends_url.clone(),
        config.crawl.output_file.clone(),
    ));

    let bg_pipeline = pipeline.clone();
    let refresh_interval = config.crawl.refresh_interval;
    tokio::spawn(async move {
        start_background_refresh(bg_pipeline, refresh_interval).await;
    });

    let state = Arc::new(AppState {
        pipeline,
        governor,
        secret_key: config.server.secret_key.clone(),
    });
    let app = routes::router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server starting on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "friend_circle=info,tower_http=info".into()),
        )
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(())
}
