//! RPC HTTP Server
//!
//! Axum-based HTTP server that handles JSON-RPC requests on `POST /`.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use log::info;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::node::Node;
use crate::rpc::methods::{handle_request, JsonRpcRequest, JsonRpcResponse, RpcState};

/// Build the RPC router for `node`
pub fn router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", post(handle_rpc))
        .layer(cors)
        .with_state(Arc::new(RpcState { node }))
}

/// Serve JSON-RPC on `addr` until the node is asked to stop
pub async fn start_rpc_server(node: Arc<Node>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("RPC server listening on http://{}", listener.local_addr()?);

    let stop = node.clone();
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move { stop.wait_for_stop().await })
        .await
}

/// Handle incoming JSON-RPC requests
async fn handle_rpc(
    State(state): State<Arc<RpcState>>,
    Json(request): Json<JsonRpcRequest>,
) -> (StatusCode, Json<JsonRpcResponse>) {
    let response = handle_request(&state, request).await;
    (StatusCode::OK, Json(response))
}
