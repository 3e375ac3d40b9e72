pub mod config;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tarry_broker::{Broker, observer::BrokerObserver};
use tarry_http::HttpServer;
use tarry_metrics::{Metrics, MetricsHandle, QueueDepths};
use tokio::net::TcpListener;

pub use config::ServerConfig;

// seconds of per-second rate history kept for the stats log line
const RATE_BUCKETS: usize = 120;

/// A fully wired server with its listener already bound.
pub struct Server {
    broker: Arc<Broker>,
    stats: MetricsHandle,
    http: HttpServer,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let metrics = Metrics::new(RATE_BUCKETS, config.stats_history);
        let observer: Arc<dyn BrokerObserver> = metrics.broker();
        let broker = Arc::new(Broker::with_observer(config.broker.clone(), observer));

        let depths: Arc<dyn QueueDepths> = broker.clone();
        let stats = metrics.clone().start(config.stats.clone(), depths);

        let listener = TcpListener::bind(config.http_bind)
            .await
            .with_context(|| format!("bind http listener on {}", config.http_bind))?;

        let http = HttpServer::new(broker.clone(), metrics);

        tracing::info!(
            reservation_timeout_ms = config.broker.reservation_timeout_ms,
            max_backlog = config.broker.max_backlog_per_client,
            "broker started"
        );

        Ok(Self {
            broker,
            stats,
            http,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    pub fn metrics(&self) -> Metrics {
        self.stats.metrics().clone()
    }

    /// Serves until `shutdown` resolves, then stops the broker and the
    /// stats runtime.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let served = self.http.serve(self.listener, shutdown).await;

        // already done by the http layer on a clean shutdown
        if !self.broker.is_shutdown() {
            self.broker.shutdown();
        }
        self.stats.shutdown().await;
        tracing::info!("server stopped");

        served
    }
}

pub async fn run_with_shutdown<F>(config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    Server::bind(config).await?.run(shutdown).await
}
