use std::io;
use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{body::Bytes, Json, Router};
use tracing::{error, info};

use crate::kv::{KvCommand, KvQuery, KvResult, KvStore};
use crate::server::{ServerHandle, SubmitError};
use crate::types::{ClientRequest, ClientResponse};

/// How long an HTTP request waits for the node to answer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Handle = ServerHandle<KvStore>;

/// Spawn a background thread that runs an axum HTTP server and feeds
/// requests into the node's event queue through `handle`.
pub fn start(addr: SocketAddr, handle: Handle) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("http".into()).spawn(move || {
        match tokio::runtime::Runtime::new() {
            Ok(rt) => rt.block_on(serve(addr, handle)),
            Err(e) => error!(error = %e, "client api: failed to start tokio runtime"),
        }
    })
}

fn router(handle: Handle) -> Router {
    Router::new()
        .route("/kv/{key}", get(handle_get).put(handle_put).delete(handle_delete))
        .route("/leader", get(handle_leader))
        .with_state(handle)
}

async fn serve(addr: SocketAddr, handle: Handle) {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "client api: bind failed");
            return;
        }
    };

    info!(%addr, "client api listening");

    if let Err(e) = axum::serve(listener, router(handle)).await {
        error!(error = %e, "client api: server error");
    }
}

async fn handle_get(State(handle): State<Handle>, Path(key): Path<String>) -> (StatusCode, String) {
    submit(&handle, ClientRequest::Query { query: KvQuery::Get { key } })
        .await
        .map_or_else(|status| status, render)
}

async fn handle_put(
    State(handle): State<Handle>,
    Path(key): Path<String>,
    body: Bytes,
) -> (StatusCode, String) {
    let value = String::from_utf8_lossy(&body).into_owned();
    submit(&handle, ClientRequest::Command { command: KvCommand::Set { key, value } })
        .await
        .map_or_else(|status| status, render)
}

async fn handle_delete(State(handle): State<Handle>, Path(key): Path<String>) -> (StatusCode, String) {
    submit(&handle, ClientRequest::Command { command: KvCommand::Delete { key } })
        .await
        .map_or_else(|status| status, render)
}

async fn handle_leader(
    State(handle): State<Handle>,
) -> Result<Json<ClientResponse<KvResult>>, (StatusCode, String)> {
    submit(&handle, ClientRequest::Leader).await.map(Json)
}

/// Queue a request without blocking the runtime and wait for its answer.
async fn submit(
    handle: &Handle,
    request: ClientRequest<KvCommand, KvQuery>,
) -> Result<ClientResponse<KvResult>, (StatusCode, String)> {
    let rx = handle.try_submit(request).map_err(|err| match err {
        SubmitError::Full => (StatusCode::SERVICE_UNAVAILABLE, "server busy".to_string()),
        SubmitError::Closed => (StatusCode::SERVICE_UNAVAILABLE, "server shutting down".to_string()),
    })?;

    match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) | Err(_) => Err((StatusCode::SERVICE_UNAVAILABLE, "timeout".into())),
    }
}

fn render(response: ClientResponse<KvResult>) -> (StatusCode, String) {
    match response {
        ClientResponse::Output { output: KvResult::Ok } => (StatusCode::OK, "ok".into()),
        ClientResponse::Output {
            output: KvResult::Value(Some(v)),
        } => (StatusCode::OK, v),
        ClientResponse::Output {
            output: KvResult::Value(None),
        } => (StatusCode::NOT_FOUND, String::new()),
        ClientResponse::NotLeader {
            leader_addr: Some(addr),
            ..
        } => (StatusCode::SERVICE_UNAVAILABLE, format!("not the leader, try {addr}")),
        ClientResponse::NotLeader { .. } => (StatusCode::SERVICE_UNAVAILABLE, "not the leader".into()),
        ClientResponse::TooLarge { size, limit } => (
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("command encodes to {size} bytes, limit is {limit}"),
        ),
        other => (StatusCode::INTERNAL_SERVER_ERROR, format!("unexpected response: {other:?}")),
    }
}
