//! Read-only HTTP view of the latest analysis result.
//!
//! `GET /status` returns JSON, `GET /frame.png` the latest frame with region
//! boxes drawn on, `GET /graph.png` the change-score history.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::pipeline::{LoopState, TickReport};
use crate::region::Component;
use crate::render::{annotate_components, render_score_graph, GraphOptions};

pub type LatestReport = watch::Receiver<Option<Arc<TickReport>>>;

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

struct AppState {
    latest: LatestReport,
    graph: GraphOptions,
}

#[derive(Debug, Serialize)]
struct Status {
    state: LoopState,
    seq: u64,
    captured_at_ms: i64,
    score: f64,
    window_len: usize,
    window_span_ms: u64,
    dropped_frames: u64,
    analysis_fps: f64,
    regions_fresh: bool,
    components: Vec<Component>,
}

impl From<&TickReport> for Status {
    fn from(report: &TickReport) -> Self {
        Self {
            state: report.state,
            seq: report.seq,
            captured_at_ms: report.captured_at_ms,
            score: report.score,
            window_len: report.window_len,
            window_span_ms: report.window_span.as_millis() as u64,
            dropped_frames: report.dropped_frames,
            analysis_fps: report.analysis_fps,
            regions_fresh: report.regions_fresh,
            components: report.components.as_ref().clone(),
        }
    }
}

pub fn router(latest: LatestReport, graph: GraphOptions) -> Router {
    let state = Arc::new(AppState { latest, graph });
    Router::new()
        .route("/status", get(status))
        .route("/frame.png", get(frame_png))
        .route("/graph.png", get(graph_png))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the view on `bind` until `stop` flips to `true`.
pub async fn serve(
    bind: &str,
    latest: LatestReport,
    graph: GraphOptions,
    mut stop: watch::Receiver<bool>,
) -> Result<(), ViewError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| ViewError::Bind(bind.to_string(), e))?;
    info!(addr = bind, "view server listening");

    axum::serve(listener, router(latest, graph))
        .with_graceful_shutdown(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        })
        .await
        .map_err(ViewError::Serve)
}

fn latest(state: &AppState) -> Option<Arc<TickReport>> {
    state.latest.borrow().clone()
}

/// GET /status
async fn status(State(state): State<Arc<AppState>>) -> Response {
    match latest(&state) {
        Some(report) => Json(Status::from(report.as_ref())).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no frame analysed yet").into_response(),
    }
}

/// GET /frame.png
async fn frame_png(State(state): State<Arc<AppState>>) -> Response {
    let Some(report) = latest(&state) else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no frame analysed yet").into_response();
    };
    png_response(move || annotate_components(&report.frame, &report.components)).await
}

/// GET /graph.png
async fn graph_png(State(state): State<Arc<AppState>>) -> Response {
    let history = latest(&state)
        .map(|report| Arc::clone(&report.history))
        .unwrap_or_default();
    let options = state.graph;
    png_response(move || render_score_graph(&history, options)).await
}

/// Draw and encode off the async runtime.
async fn png_response<F>(draw: F) -> Response
where
    F: FnOnce() -> RgbImage + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || {
        let mut png = Vec::new();
        draw().write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok::<_, image::ImageError>(png)
    })
    .await;

    match result {
        Ok(Ok(png)) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "PNG encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
