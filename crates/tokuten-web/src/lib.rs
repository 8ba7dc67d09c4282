//! Authenticated HTTP trigger for sync runs.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::net::TcpListener;
use tokuten_core::{ErrorKind, SyncReport};
use tokuten_sync::SyncService;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "tokuten-web";

/// Whatever actually performs a run; the trigger never calls itself over HTTP.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run(&self) -> anyhow::Result<SyncReport>;
}

#[async_trait]
impl SyncRunner for SyncService {
    async fn run(&self) -> anyhow::Result<SyncReport> {
        self.run_sync_once().await
    }
}

#[derive(Clone)]
pub struct AppState {
    trigger_secret: Option<String>,
    runner: Arc<dyn SyncRunner>,
}

impl AppState {
    pub fn new(trigger_secret: Option<String>, runner: Arc<dyn SyncRunner>) -> Self {
        Self {
            trigger_secret: trigger_secret.filter(|s| !s.trim().is_empty()),
            runner,
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("missing or invalid trigger credential")]
    Unauthorized,
    #[error("trigger secret is not configured")]
    NotConfigured,
    #[error("sync run failed: {0:#}")]
    Run(anyhow::Error),
}

impl TriggerError {
    fn kind(&self) -> ErrorKind {
        match self {
            TriggerError::Unauthorized => ErrorKind::Authorization,
            TriggerError::NotConfigured | TriggerError::Run(_) => ErrorKind::Configuration,
        }
    }
}

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        let status = match self {
            TriggerError::Unauthorized => StatusCode::UNAUTHORIZED,
            TriggerError::NotConfigured | TriggerError::Run(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "success": false,
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct TriggerQuery {
    secret: Option<String>,
}

/// The scheme name is matched case-insensitively.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
}

/// Fails closed: no configured secret rejects every caller.
fn authorize(
    expected: Option<&str>,
    headers: &HeaderMap,
    query_secret: Option<&str>,
) -> Result<(), TriggerError> {
    let expected = expected.ok_or(TriggerError::NotConfigured)?;
    let provided = bearer_token(headers)
        .or(query_secret)
        .ok_or(TriggerError::Unauthorized)?;
    if bool::from(provided.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(TriggerError::Unauthorized)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", get(sync_handler).post(sync_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "trigger endpoint listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TriggerQuery>,
) -> Result<Json<SyncReport>, TriggerError> {
    if let Err(err) = authorize(
        state.trigger_secret.as_deref(),
        &headers,
        query.secret.as_deref(),
    ) {
        match &err {
            TriggerError::NotConfigured => error!("sync trigger called but no secret is configured"),
            _ => warn!("rejected sync trigger"),
        }
        return Err(err);
    }

    let report = state.runner.run().await.map_err(|err| {
        let message = format!("{err:#}");
        error!(error = %message, "triggered sync failed");
        TriggerError::Run(err)
    })?;
    Ok(Json(report))
}
