//! Wires the cache, the durable store, the bus subscriber and the HTTP
//! server into one process with a single shutdown signal.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::BusSubscriber;
use crate::cache::{CacheConfig, ExpiringCache};
use crate::http;
use crate::service::{OrderService, ServiceConfig};
use crate::store::SqliteOrderStore;

/// Everything `serve` needs to start.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub db_path: PathBuf,
    pub http_addr: String,
    pub bus_addr: String,
    pub cache: CacheConfig,
    pub service: ServiceConfig,
    /// Preload half of the stored orders before accepting traffic.
    pub warm_up: bool,
}

impl ServeConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            http_addr: "0.0.0.0:3000".to_string(),
            bus_addr: "0.0.0.0:4222".to_string(),
            cache: CacheConfig::default(),
            service: ServiceConfig::default(),
            warm_up: true,
        }
    }
}

/// A bound but not yet running server.
pub struct Server {
    service: Arc<OrderService<SqliteOrderStore>>,
    cache: Arc<ExpiringCache<crate::types::Order>>,
    bus: BusSubscriber<OrderService<SqliteOrderStore>>,
    http: TcpListener,
    shutdown: CancellationToken,
}

impl Server {
    /// Open the store, build the cache (starting its sweeper), optionally warm
    /// it, and bind both listeners.
    pub async fn bind(config: ServeConfig, shutdown: CancellationToken) -> Result<Self> {
        let store = Arc::new(
            SqliteOrderStore::open(&config.db_path)
                .with_context(|| format!("cannot open {}", config.db_path.display()))?,
        );
        let cache = Arc::new(ExpiringCache::new(config.cache.clone())?);
        let service = Arc::new(OrderService::new(
            Arc::clone(&cache),
            store,
            config.service.clone(),
        ));

        info!(
            db = %config.db_path.display(),
            default_ttl_s = config.cache.default_ttl.as_secs(),
            sweep_interval_s = config.cache.sweep_interval.as_secs(),
            entry_ttl_s = config.service.entry_ttl.as_secs(),
            "order cache starting"
        );

        if config.warm_up {
            let svc = Arc::clone(&service);
            if let Err(e) = tokio::task::spawn_blocking(move || svc.warm_up()).await? {
                warn!(error = %format!("{e:#}"), "cache warm-up failed");
            }
        }

        let bus = BusSubscriber::bind(&config.bus_addr, Arc::clone(&service), shutdown.clone())
            .await?;
        let http = TcpListener::bind(&config.http_addr)
            .await
            .with_context(|| format!("failed to bind http listener on {}", config.http_addr))?;

        Ok(Self {
            service,
            cache,
            bus,
            http,
            shutdown,
        })
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http.local_addr()?)
    }

    pub fn bus_addr(&self) -> Result<SocketAddr> {
        self.bus.local_addr()
    }

    pub fn service(&self) -> Arc<OrderService<SqliteOrderStore>> {
        Arc::clone(&self.service)
    }

    /// Run until the shutdown token is cancelled, then drain both listeners
    /// and stop the cache sweeper.
    pub async fn run(self) -> Result<()> {
        let Server {
            service,
            cache,
            bus,
            http,
            shutdown,
        } = self;
        info!(addr = %http.local_addr()?, "http listening");

        let bus_task = tokio::spawn(bus.run());

        let http_shutdown = shutdown.clone();
        let app = http::router(service);
        let http_task = tokio::spawn(async move {
            axum::serve(http, app)
                .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
                .await
        });

        shutdown.cancelled().await;
        info!("shutting down");

        finish(bus_task, http_task, &cache).await
    }
}

/// Wait for both listeners, then stop the sweeper whatever they returned.
async fn finish<V>(
    bus_task: JoinHandle<Result<()>>,
    http_task: JoinHandle<std::io::Result<()>>,
    cache: &ExpiringCache<V>,
) -> Result<()>
where
    V: Clone + Send + Sync + 'static,
{
    let bus_result = bus_task
        .await
        .context("bus task panicked")
        .and_then(|result| result);
    let http_result = http_task
        .await
        .context("http task panicked")
        .and_then(|result| result.context("http server failed"));

    cache.shutdown();
    info!("order cache stopped");
    bus_result.and(http_result)
}

/// Cancel `token` on Ctrl+C.
pub fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl+C"),
        }
        token.cancel();
    });
}
