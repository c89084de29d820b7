use std::net::SocketAddr;
use std::sync::Arc;

use showrunner_core::Engine;
use tracing::info;

mod http;

pub use http::build_router;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

/// Serve the control surface until the listener fails or the process
/// stops. The engine's background loops are the caller's to start.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control surface listening");
    axum::serve(listener, router).await?;
    Ok(())
}
