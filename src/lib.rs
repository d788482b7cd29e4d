pub mod core;
pub mod fetch;
pub mod providers;
pub mod rate_limit;
pub mod server;
pub mod store;

use crate::core::cache::Store;
use crate::core::clock::SystemClock;
use crate::core::config::AppConfig;
use crate::core::{FetchParams, PriceResult};
use crate::fetch::FetchService;
use crate::providers::ScraperSource;
use crate::rate_limit::RateLimitStore;
use crate::server::lifecycle::{ServerLifecycle, ShutdownOutcome, shutdown_signal};
use crate::store::KeyValueStore;
use anyhow::{Context, Result};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const PRICE_COLLECTION: &str = "prices";

/// Writes the default configuration to `config_path`, or to the platform
/// config location when no path is given. Refuses to overwrite.
pub fn write_default_config(config_path: Option<&str>) -> Result<PathBuf> {
    let path = match config_path {
        Some(path) => PathBuf::from(path),
        None => AppConfig::default_config_path()?,
    };

    if path.exists() {
        anyhow::bail!("Configuration file already exists at {}", path.display());
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    std::fs::write(&path, AppConfig::default().to_yaml()?)
        .with_context(|| format!("Failed to write config file to {}", path.display()))?;
    Ok(path)
}

pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");
    Ok(config)
}

fn open_store(config: &AppConfig) -> Result<Arc<KeyValueStore>> {
    if !config.cache.persist {
        return Ok(Arc::new(KeyValueStore::in_memory()));
    }
    let data_path = config.data_path()?;
    Ok(Arc::new(KeyValueStore::open(&data_path)))
}

/// Everything a request needs, wired from configuration.
pub struct Services {
    pub store: Arc<KeyValueStore>,
    pub source: Arc<ScraperSource>,
    pub fetch: Arc<FetchService>,
}

impl Services {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let store = open_store(config)?;
        let cache = store
            .get_collection(PRICE_COLLECTION, config.cache.persist, true)
            .context("Could not create price cache")?;
        let source = Arc::new(ScraperSource::from_config(&config.source)?);
        let fetch = Arc::new(
            FetchService::new(Arc::clone(&source) as _, cache, config.cache.ttl())
                .with_timeout(config.source.timeout()),
        );
        Ok(Self {
            store,
            source,
            fetch,
        })
    }

    /// Releases the scraper session and syncs the cache. Failures are logged.
    pub async fn release(&self) {
        use crate::core::PriceSource;

        if let Err(e) = self.source.close().await {
            warn!("Failed to release price source: {}", e);
        }
        if let Err(e) = self.store.flush() {
            warn!("Failed to flush cache: {}", e);
        }
    }
}

/// Runs the HTTP service on `listener` until `signal` resolves, then drains.
pub async fn serve_on<F>(
    config: &AppConfig,
    listener: TcpListener,
    signal: F,
) -> Result<ShutdownOutcome>
where
    F: Future<Output = ()>,
{
    info!("Price service starting...");
    let services = Services::from_config(config)?;
    let limiter = Arc::new(RateLimitStore::from_config(
        &config.rate_limit,
        Arc::new(SystemClock),
    ));
    let lifecycle = ServerLifecycle::from_config(config, Arc::clone(&limiter))
        .with_cache(Arc::clone(services.fetch.cache()));

    let state = server::AppState {
        fetch: Arc::clone(&services.fetch),
        limiter,
        lifecycle: lifecycle.subscribe(),
    };
    let server = server::serve(listener, state, lifecycle.draining());

    lifecycle.run(server, signal, services.release()).await
}

/// Runs the HTTP service until SIGINT or SIGTERM.
pub async fn serve(config: &AppConfig) -> Result<ShutdownOutcome> {
    let listener = server::bind(&config.server.bind_address).await?;
    serve_on(config, listener, shutdown_signal()).await
}

/// Fetches a single price through the same cache the service uses.
pub async fn fetch_once(config: &AppConfig, params: &FetchParams) -> Result<PriceResult> {
    let services = Services::from_config(config)?;
    let result = services.fetch.fetch(params).await;
    services.release().await;
    Ok(result)
}
