//! Administrative HTTP surface built on axum.
//!
//! `GET /health` is open. Every other route requires the shared secret in
//! the `x-admin-secret` header:
//! - `POST /reload`
//! - `POST /accounts/{id}/connect` and `/disconnect`
//! - `POST /accounts/{id}/send`, `/edit` and `/delete`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self as axum_middleware, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::accounts::{AccountError, AccountManager, ReloadSummary};
use crate::pipeline::queue::{shutdown_signalled, DeliveryQueue, QueueStats};
use crate::protocol::{Action, ActionResult};
use crate::registry::{AccountStatus, RegistryError};
use crate::types::ConnectionState;

/// Header carrying the admin secret.
pub const SECRET_HEADER: &str = "x-admin-secret";

/// Shared state of the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    manager: Arc<AccountManager>,
    queue: Arc<DeliveryQueue>,
    secret: Arc<str>,
    started: Instant,
}

impl std::fmt::Debug for AdminState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminState")
            .field("secret", &"[REDACTED]")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl AdminState {
    /// Create handler state.
    pub fn new(manager: Arc<AccountManager>, queue: Arc<DeliveryQueue>, secret: &str) -> Self {
        Self {
            manager,
            queue,
            secret: Arc::from(secret),
            started: Instant::now(),
        }
    }
}

/// Errors returned by admin handlers.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// Missing or wrong secret.
    #[error("unauthorized")]
    Unauthorized,

    /// Invalid request body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// No such account.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// Session unavailable or already present.
    #[error("{0}")]
    Conflict(String),

    /// The protocol or the backend failed.
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl AdminError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownAccount(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<AccountError> for AdminError {
    fn from(e: AccountError) -> Self {
        match e {
            AccountError::Registry(RegistryError::UnknownAccount(id)) => Self::UnknownAccount(id),
            AccountError::Registry(e @ RegistryError::AlreadyConnected(_)) => {
                Self::Conflict(e.to_string())
            }
            e @ (AccountError::NotConnected(_) | AccountError::Disabled(_)) => {
                Self::Conflict(e.to_string())
            }
            e @ (AccountError::Protocol(_) | AccountError::Roster(_)) => {
                Self::Upstream(e.to_string())
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `ok` when every enabled account is connected, else `degraded`.
    pub status: &'static str,
    /// Seconds since the admin surface started.
    pub uptime_secs: u64,
    /// Queue counters.
    pub queue: QueueStats,
    /// Per-account state.
    pub accounts: Vec<AccountStatus>,
}

/// Body of `POST /accounts/{id}/send`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Target chat.
    pub chat_id: String,
    /// Message text.
    pub text: String,
    /// Message to reply to.
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// Body of `POST /accounts/{id}/edit`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    /// Target chat.
    pub chat_id: String,
    /// Message to edit.
    pub message_id: String,
    /// New text.
    pub text: String,
}

/// Body of `POST /accounts/{id}/delete`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    /// Target chat.
    pub chat_id: String,
    /// Message to delete.
    pub message_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountReply {
    account_id: String,
    state: Option<ConnectionState>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SentReply {
    message_id: String,
}

#[derive(Serialize)]
struct OkReply {
    ok: bool,
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/reload", post(reload))
        .route("/accounts/{id}/connect", post(connect))
        .route("/accounts/{id}/disconnect", post(disconnect))
        .route("/accounts/{id}/send", post(send))
        .route("/accounts/{id}/edit", post(edit))
        .route("/accounts/{id}/delete", post(delete))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_secret,
        ))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

/// Serve the admin router on `addr` until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown_signalled(&mut shutdown).await })
        .await?;
    info!("admin server stopped");
    Ok(())
}

async fn require_secret(
    State(state): State<AdminState>,
    request: Request,
    next: Next,
) -> Result<Response, AdminError> {
    let provided = request
        .headers()
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(secret) if !state.secret.is_empty() && secret == &*state.secret => {
            Ok(next.run(request).await)
        }
        _ => {
            warn!(path = %request.uri().path(), "rejected admin request without valid secret");
            Err(AdminError::Unauthorized)
        }
    }
}

/// Build the health report from the current queue and registry.
pub fn health_report(state: &AdminState) -> HealthReport {
    let accounts = state.manager.registry().snapshot();
    let all_connected = accounts
        .iter()
        .filter(|a| a.enabled)
        .all(|a| a.state == ConnectionState::Connected);

    HealthReport {
        status: if all_connected { "ok" } else { "degraded" },
        uptime_secs: state.started.elapsed().as_secs(),
        queue: state.queue.stats(),
        accounts,
    }
}

async fn health(State(state): State<AdminState>) -> Json<HealthReport> {
    Json(health_report(&state))
}

async fn reload(State(state): State<AdminState>) -> Result<Json<ReloadSummary>, AdminError> {
    Ok(Json(state.manager.reload().await?))
}

async fn connect(
    State(state): State<AdminState>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountReply>, AdminError> {
    state.manager.connect_by_id(&account_id).await?;
    let reply = AccountReply {
        state: state.manager.registry().state(&account_id),
        account_id,
    };
    Ok(Json(reply))
}

async fn disconnect(
    State(state): State<AdminState>,
    Path(account_id): Path<String>,
) -> Result<Json<AccountReply>, AdminError> {
    state.manager.disconnect(&account_id).await?;
    let reply = AccountReply {
        state: state.manager.registry().state(&account_id),
        account_id,
    };
    Ok(Json(reply))
}

fn require_field(name: &str, value: &str) -> Result<(), AdminError> {
    if value.trim().is_empty() {
        return Err(AdminError::BadRequest(format!("{name} must not be empty")));
    }
    Ok(())
}

async fn send(
    State(state): State<AdminState>,
    Path(account_id): Path<String>,
    Json(body): Json<SendRequest>,
) -> Result<Json<SentReply>, AdminError> {
    require_field("chatId", &body.chat_id)?;
    require_field("text", &body.text)?;

    let action = Action::SendMessage {
        chat_id: body.chat_id,
        text: body.text,
        reply_to: body.reply_to,
    };
    match state.manager.perform(&account_id, action).await? {
        ActionResult::Sent { message_id } => Ok(Json(SentReply { message_id })),
        other => Err(AdminError::Upstream(format!("unexpected result: {other:?}"))),
    }
}

async fn edit(
    State(state): State<AdminState>,
    Path(account_id): Path<String>,
    Json(body): Json<EditRequest>,
) -> Result<Json<OkReply>, AdminError> {
    require_field("chatId", &body.chat_id)?;
    require_field("messageId", &body.message_id)?;
    require_field("text", &body.text)?;

    let action = Action::EditMessage {
        chat_id: body.chat_id,
        message_id: body.message_id,
        text: body.text,
    };
    state.manager.perform(&account_id, action).await?;
    Ok(Json(OkReply { ok: true }))
}

async fn delete(
    State(state): State<AdminState>,
    Path(account_id): Path<String>,
    Json(body): Json<DeleteRequest>,
) -> Result<Json<OkReply>, AdminError> {
    require_field("chatId", &body.chat_id)?;
    require_field("messageId", &body.message_id)?;

    let action = Action::DeleteMessage {
        chat_id: body.chat_id,
        message_id: body.message_id,
    };
    state.manager.perform(&account_id, action).await?;
    Ok(Json(OkReply { ok: true }))
}
