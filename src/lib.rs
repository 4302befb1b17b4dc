use std::{future::Future, io, sync::Arc};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;

pub mod backend;
pub mod client;
pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod rpc;

use rpc::{Dispatcher, ServerMeta};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub server: Arc<ServerMeta>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, server: ServerMeta) -> Self {
        Self {
            dispatcher,
            server: Arc::new(server),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let mut router = Router::new()
        .route(state.dispatcher.path(), post(http::handlers::rpc_endpoint))
        .route("/health", get(http::handlers::health))
        .route("/.well-known/jsonrpc", get(http::handlers::discovery));

    if !state.dispatcher.raise_404() {
        router = router.fallback(http::handlers::rpc_endpoint);
    }

    router
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

/// Serves `state` on `listener` until `shutdown` resolves, then drains
/// in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, build_app(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}
