pub mod handlers;

use std::future::Future;

use axum::routing::{delete, get};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use handlers::{ApiError, ApiState};

/// Build the signaling router. All routes live under `/api`.
pub fn router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/nodes",
            get(handlers::handle_list_peers).post(handlers::handle_register),
        )
        .route("/nodes/{node_id}", delete(handlers::handle_deregister))
        .route("/status", get(handlers::handle_status))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve_with_listener<F>(
    listener: TcpListener,
    state: ApiState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "signaling API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
