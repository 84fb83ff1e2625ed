//! Axum + Askama HTTP surface: trajectory queries, manual sync trigger, health check.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use skytrack_core::Trajectory;
use skytrack_sync::{build_gap_filler, maybe_start_scheduler, GapFiller, SyncConfig};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "skytrack-web";

pub const HEALTH_CHECK_BODY: &str = "App Deployed Successfully";

#[derive(Clone)]
pub struct AppState {
    pub filler: Arc<GapFiller>,
}

impl AppState {
    pub fn new(filler: Arc<GapFiller>) -> Self {
        Self { filler }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    slot_count: usize,
    max_index: usize,
    latest_hour: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health_check", get(health_check_handler))
        .route("/trajectory/{balloon_index}", get(trajectory_handler))
        .route("/update", get(update_handler).post(update_handler))
        .with_state(Arc::new(state))
}

/// Serves until ctrl-c.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for ctrl-c");
            }
        })
        .await?;
    Ok(())
}

/// Process startup: bring the store up to date before accepting requests, then
/// keep it current on the configured cadence.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5000);
    let config = SyncConfig::from_env();
    let filler = Arc::new(build_gap_filler(&config).await?);

    let summary = filler.run_once().await?;
    info!(
        run_id = %summary.run_id,
        hours = summary.hours_committed,
        failed = summary.hours_failed,
        "initial sync finished"
    );

    let scheduler = maybe_start_scheduler(&config, Arc::clone(&filler)).await?;
    serve(AppState::new(Arc::clone(&filler)), port).await?;

    if let Some(mut scheduler) = scheduler {
        scheduler.shutdown().await?;
    }
    filler.store().close().await;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.filler.store();
    match store.latest_timestamp().await {
        Ok(latest) => render_html(IndexTemplate {
            slot_count: store.slot_count(),
            max_index: store.slot_count().saturating_sub(1),
            latest_hour: latest
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "no data yet".to_string()),
        }),
        Err(err) => server_error(err.into()),
    }
}

async fn health_check_handler() -> &'static str {
    HEALTH_CHECK_BODY
}

async fn trajectory_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(balloon_index): AxumPath<u32>,
) -> Response {
    let store = state.filler.store();
    if balloon_index as usize >= store.slot_count() {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!(
                    "balloon index {balloon_index} outside 0..{}",
                    store.slot_count()
                ),
            })),
        )
            .into_response();
    }

    match store.trajectory_for(balloon_index).await {
        Ok(trajectory) => Json(Trajectory {
            balloon_index,
            trajectory,
        })
        .into_response(),
        Err(err) => {
            error!(balloon_index, error = %err, "trajectory query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn update_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.filler.run_once().await {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                hours = summary.hours_committed,
                failed = summary.hours_failed,
                "manual sync finished"
            );
            (StatusCode::OK, "Update complete").into_response()
        }
        Err(err) => {
            error!(error = %err, "manual sync failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Update failed: {err}")).into_response()
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
