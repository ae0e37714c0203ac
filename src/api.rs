//! Loopback control plane
//!
//! A small JSON-over-HTTP surface for lifecycle, configuration, capture
//! readout and the server-sent event stream. The listener only ever binds
//! the loopback interface; CORS is permissive for exactly that reason.

use crate::error::{Error, Result};
use crate::models::{ApiResponse, ProxyConfigPatch};
use crate::proxy::ProxyServer;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;

/// Default control-plane port
pub const DEFAULT_IPC_PORT: u16 = 9090;

type AppState = Arc<ProxyServer>;

/// Build the control-plane router
pub fn router(server: AppState) -> Router {
  Router::new()
    .route("/api/proxy/start", post(start))
    .route("/api/proxy/stop", post(stop))
    .route("/api/proxy/status", get(status))
    .route("/api/proxy/config", get(get_config).post(set_config))
    .route("/api/proxy/requests", get(requests))
    .route("/api/proxy/clear", post(clear))
    .route("/api/events", get(events))
    .layer(CorsLayer::permissive())
    .with_state(server)
}

/// Serve the control plane on the loopback interface until `shutdown`
/// resolves
pub async fn serve<F>(server: AppState, port: u16, shutdown: F) -> Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
    .await
    .map_err(|e| Error::connection_error(format!("failed to bind control plane: {}", e)))?;
  tracing::info!(port, "control plane listening");

  axum::serve(listener, router(server))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(Error::Io)
}

fn ok<T: Serialize>(data: T) -> Response {
  (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn fail(status: StatusCode, message: &str) -> Response {
  (status, Json(ApiResponse::<()>::err(message))).into_response()
}

fn lifecycle_error(error: Error) -> Response {
  fail(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string())
}

#[derive(Debug, Deserialize)]
struct StartRequest {
  #[serde(default)]
  port: u16,
}

async fn start(State(server): State<AppState>, body: Bytes) -> Response {
  let request: StartRequest = match serde_json::from_slice(&body) {
    Ok(request) => request,
    Err(_) => return fail(StatusCode::BAD_REQUEST, "invalid request body"),
  };
  if request.port == 0 {
    return fail(StatusCode::BAD_REQUEST, "invalid proxy port");
  }

  match server.clone().start(request.port).await {
    Ok(status) => ok(status),
    Err(e) => lifecycle_error(e),
  }
}

async fn stop(State(server): State<AppState>) -> Response {
  match server.stop().await {
    Ok(status) => ok(status),
    Err(e) => lifecycle_error(e),
  }
}

async fn status(State(server): State<AppState>) -> Response {
  ok(server.status().await)
}

async fn get_config(State(server): State<AppState>) -> Response {
  ok(server.config())
}

async fn set_config(State(server): State<AppState>, body: Bytes) -> Response {
  let patch: ProxyConfigPatch = match serde_json::from_slice(&body) {
    Ok(patch) => patch,
    Err(_) => return fail(StatusCode::BAD_REQUEST, "invalid request body"),
  };

  match server.update_config(patch).await {
    Ok(config) => ok(config),
    Err(Error::InvalidRequest(message)) => fail(StatusCode::BAD_REQUEST, &message),
    Err(e) => lifecycle_error(e),
  }
}

async fn requests(State(server): State<AppState>) -> Response {
  ok(server.store().snapshot())
}

async fn clear(State(server): State<AppState>) -> Response {
  server.store().clear();
  ok(serde_json::json!({ "success": true }))
}

/// Event stream; one SSE record per batch event. The observer subscription
/// is released by the guard when the client disconnects.
async fn events(State(server): State<AppState>) -> impl IntoResponse {
  let bus = server.events();
  let (guard, rx) = bus.subscribe();

  let stream = ReceiverStream::new(rx).map(move |event| {
    let _ = &guard;
    let payload = serde_json::to_string(&event).unwrap_or_else(|_| String::from("{}"));
    Ok::<Event, Infallible>(Event::default().data(payload))
  });

  (
    [
      (header::CACHE_CONTROL, "no-cache"),
      (header::CONNECTION, "keep-alive"),
    ],
    Sse::new(stream),
  )
}
