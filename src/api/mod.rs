//! HTTP API server for the Outpost gateway

pub mod commands;
pub mod devices;
pub mod error;
pub mod health;
pub mod live;
pub mod rate_limit;
pub mod requests;

use std::sync::Arc;

use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::ApiError;

use crate::broker::Broker;
use crate::Result;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub broker: Broker,
    pub rate_limiter: Option<rate_limit::SharedLimiter>,
}

/// Body member naming the target device
///
/// Shared by every route that takes the device in the JSON body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBody {
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Require a non-empty body member
///
/// # Errors
///
/// Returns `ApiError` (400) naming the missing member
pub fn required(value: Option<String>, name: &str) -> std::result::Result<String, ApiError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ApiError(crate::Error::Validation(format!("{name} required"))))
}

/// Builder for API server
pub struct ApiServerBuilder {
    broker: Broker,
    host: String,
    port: u16,
    rate_limit_per_minute: Option<u32>,
}

impl ApiServerBuilder {
    /// Create a new builder serving `broker`
    #[must_use]
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            host: "0.0.0.0".to_string(),
            port: crate::config::DEFAULT_PORT,
            rate_limit_per_minute: None,
        }
    }

    /// Set the bind address
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Throttle the API to `per_minute` requests (`None` disables)
    #[must_use]
    pub const fn rate_limit(mut self, per_minute: Option<u32>) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let rate_limiter = self.rate_limit_per_minute.map(rate_limit::create_limiter);

        ApiServer {
            state: Arc::new(ApiState {
                broker: self.broker,
                rate_limiter,
            }),
            host: self.host,
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let router = Router::new()
            .nest(
                "/api",
                devices::router(self.state.clone())
                    .merge(commands::router(self.state.clone()))
                    .merge(requests::router(self.state.clone()))
                    .merge(live::router(self.state.clone())),
            )
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        let router = router.layer(axum::middleware::from_fn_with_state(
            self.state.clone(),
            rate_limit::rate_limit_middleware,
        ));

        // CORS layer for cross-origin requests from web panels
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(addr = %addr, "API server listening");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    ///
    /// Once `shutdown` resolves the broker is shut down before open
    /// connections are drained, which ends every live view stream.
    ///
    /// # Errors
    ///
    /// Returns error if the server fails while running
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let broker = self.state.broker.clone();
        let shutdown = async move {
            shutdown.await;
            broker.shutdown().await;
        };

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
