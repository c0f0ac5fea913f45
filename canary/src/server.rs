//! Liveness endpoint
//!
//! Any request on any path gets `200 OK` with an empty body for as long as
//! the process is up. `--healthcheck` calls it from inside the container.

use crate::error::{CanaryError, Result};
use axum::http::StatusCode;
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

const CHECK_TIMEOUT: Duration = Duration::from_secs(1);

pub struct LivenessServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    serving: JoinHandle<std::io::Result<()>>,
}

async fn alive() -> StatusCode {
    StatusCode::OK
}

impl LivenessServer {
    /// Binds on all interfaces and starts serving; port `0` picks a free port
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let app = Router::new().fallback(alive);
        let signal = shutdown.clone().cancelled_owned();
        let serving = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
        });

        info!("HTTP server listening on port {}", local_addr.port());
        Ok(Self {
            local_addr,
            shutdown,
            serving,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        match self.serving.await {
            Ok(served) => served.map_err(CanaryError::from),
            Err(e) => Err(CanaryError::Io(std::io::Error::other(e.to_string()))),
        }
    }
}

/// Returns whether the liveness endpoint on `port` answers `200 OK`
pub async fn check_liveness(port: u16) -> Result<bool> {
    let client = reqwest::Client::builder()
        .timeout(CHECK_TIMEOUT)
        .build()
        .map_err(|e| CanaryError::Connection(e.to_string()))?;
    let response = client
        .get(format!("http://127.0.0.1:{}/", port))
        .send()
        .await
        .map_err(|e| CanaryError::Connection(e.to_string()))?;
    Ok(response.status() == reqwest::StatusCode::OK)
}
