use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tarry_broker::Broker;
use tarry_metrics::Metrics;
use tokio::net::TcpListener;

use crate::routes;

pub struct HttpServer {
    pub broker: Arc<Broker>,
    pub metrics: Metrics,
}

impl HttpServer {
    pub fn new(broker: Arc<Broker>, metrics: Metrics) -> Self {
        Self { broker, metrics }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/poll", get(routes::poll).post(routes::poll))
            .route("/ack", get(routes::ack).post(routes::ack))
            .route("/publish", post(routes::publish))
            .route("/stats", get(routes::stats))
            .route("/stats.html", get(routes::stats_page))
            .route("/live", get(routes::live))
            .fallback(routes::not_found)
            .with_state(self)
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    ///
    /// The broker is shut down before draining so parked long polls are
    /// answered instead of holding the graceful shutdown open.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let broker = self.broker.clone();
        let app = Arc::new(self).router();

        tracing::info!("listening on {}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("http shutting down");
                broker.shutdown();
            })
            .await?;
        Ok(())
    }
}
