//! Local HTTP API: `GET /status` and `POST /run`.
//!
//! `POST /run` goes through the same [`CommandDispatcher`] as the broker path.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ConnectInfo;
use axum::extract::Query;
use axum::extract::Request;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::commands::CommandDispatcher;
use crate::commands::CommandResult;
use crate::commands::DispatchError;
use crate::commands::Origin;
use crate::commands::RunRequest;
use crate::engine::StatusAggregator;

/// Shared application state
pub struct AppState {
    pub aggregator: Arc<StatusAggregator>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub auth_token: Option<String>,
}

#[derive(Deserialize)]
struct AuthQuery {
    auth_token: Option<String>,
}

/// Handler for GET /status
#[tracing::instrument(skip(state))]
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /status request");
    Json(state.aggregator.snapshot().to_json())
}

/// Handler for POST /run
#[tracing::instrument(skip(state, body))]
async fn run(
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<RunRequest>, JsonRejection>,
) -> (StatusCode, Json<CommandResult>) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!("Rejected /run body: {}", rejection.body_text());
            return (
                StatusCode::BAD_REQUEST,
                Json(CommandResult::error(rejection.body_text())),
            );
        }
    };

    let request = request.into_request(Origin::Rest {
        peer: peer.map(|ConnectInfo(addr)| addr),
    });
    let result = state.dispatcher.dispatch(&request).await;
    let code = match &result {
        Ok(_) => StatusCode::OK,
        Err(DispatchError::UnknownCommand(_)) => StatusCode::NOT_FOUND,
        Err(DispatchError::PlatformNotSupported { .. })
        | Err(DispatchError::InvalidArguments { .. }) => StatusCode::BAD_REQUEST,
        Err(DispatchError::ExecutionTimeout { .. })
        | Err(DispatchError::ExecutionFailure { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if let Err(e) = &result {
        tracing::warn!("Command request over HTTP failed: {}", e);
    }
    (code, Json(CommandResult::from(&result)))
}

/// Compare without short-circuiting on the first differing byte.
fn tokens_match(given: &str, expected: &str) -> bool {
    let (given, expected) = (given.as_bytes(), expected.as_bytes());
    if given.len() != expected.len() {
        return false;
    }
    given
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Require the configured token as `Authorization: Bearer <token>` or `?auth_token=<token>`.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.auth_token else {
        return next.run(request).await;
    };

    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let given = bearer.or_else(|| {
        Query::<AuthQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(q)| q.auth_token)
    });

    match given {
        Some(token) if tokens_match(&token, expected) => next.run(request).await,
        Some(_) => {
            tracing::warn!("Rejected API request with an invalid token");
            (
                StatusCode::UNAUTHORIZED,
                Json(CommandResult::error("invalid token".to_string())),
            )
                .into_response()
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(CommandResult::error("missing token".to_string())),
        )
            .into_response(),
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/run", post(run))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `cancel` fires.
pub async fn serve(
    listen: &str,
    port: u16,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if state.auth_token.is_none() {
        tracing::warn!("HTTP API has no auth_token; any local process can run commands");
    }
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        cancel.cancelled().await;
        tracing::info!("HTTP API server shutting down gracefully");
    })
    .await?;

    Ok(())
}
