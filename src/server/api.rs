//! Local HTTP API over the post and event repositories.
//!
//! - GET /health
//! - GET /metrics
//! - GET /v1/posts, GET /v1/posts/stream (SSE), POST /v1/posts (save)
//! - POST /v1/posts/refresh
//! - GET|DELETE /v1/posts/{id}
//! - POST|DELETE /v1/posts/{id}/likes
//! - GET /v1/posts/newer, POST /v1/posts/newer/show
//! - the same read/like routes under /v1/events, plus
//!   POST|DELETE /v1/events/{id}/participants

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::entity::{AttachmentType, Cursor, Entity, EntityId, EntityKind, Event, Post};
use crate::error::{MutationError, SyncError};
use crate::metrics::SyncMetrics;
use crate::mutation::PendingAttachment;
use crate::paging::{LoadState, LoadStates, MediatorResult, Page};
use crate::repository::Repository;
use crate::server::streaming::page_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub posts: Repository<Post>,
    pub events: Repository<Event>,
    pub metrics: Arc<SyncMetrics>,
    pub config: Arc<Config>,
    pub start_time: Instant,
    /// Cancelled on shutdown; parents every SSE stream.
    pub shutdown: CancellationToken,
}

/// Kinds served by the API.
pub trait Feed: Entity {
    fn repository(state: &AppState) -> &Repository<Self>;
}

impl Feed for Post {
    fn repository(state: &AppState) -> &Repository<Self> {
        &state.posts
    }
}

impl Feed for Event {
    fn repository(state: &AppState) -> &Repository<Self> {
        &state.events
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/posts", get(list::<Post>).post(save_post))
        .route("/v1/posts/stream", get(stream::<Post>))
        .route("/v1/posts/refresh", post(refresh::<Post>))
        .route("/v1/posts/newer", get(newer_count::<Post>))
        .route("/v1/posts/newer/show", post(show_new::<Post>))
        .route("/v1/posts/{id}", get(fetch::<Post>).delete(delete::<Post>))
        .route("/v1/posts/{id}/likes", post(like::<Post>).delete(unlike::<Post>))
        .route("/v1/events", get(list::<Event>))
        .route("/v1/events/stream", get(stream::<Event>))
        .route("/v1/events/refresh", post(refresh::<Event>))
        .route("/v1/events/{id}", get(fetch::<Event>).delete(delete::<Event>))
        .route("/v1/events/{id}/likes", post(like::<Event>).delete(unlike::<Event>))
        .route(
            "/v1/events/{id}/participants",
            post(participate).delete(unparticipate),
        )
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("metrics unavailable: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
    pub retryable: bool,
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::Network(_) => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::RemoteRejected { .. } => StatusCode::BAD_GATEWAY,
        SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
        SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SyncError::Cancelled => StatusCode::CONFLICT,
        SyncError::Unsupported { .. } => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, retryable) = match &self {
            ApiError::Sync(e) => (status_for(e), e.label(), e.is_retryable()),
            ApiError::Mutation(e) => (status_for(&e.source), e.source.label(), e.is_retryable()),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", false),
            ApiError::Metrics(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics", false),
        };
        let body = ErrorResponse {
            error: self.to_string(),
            kind,
            retryable,
        };
        (status, Json(body)).into_response()
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

/// Window query: an optional anchor and the number of rows to show.
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub anchor_key: Option<i64>,
    pub anchor_id: Option<EntityId>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadStateResponse {
    NotLoading { end_of_pagination_reached: bool },
    Loading,
    Error { error: String, retryable: bool },
}

impl From<&LoadState> for LoadStateResponse {
    fn from(state: &LoadState) -> Self {
        match state {
            LoadState::NotLoading {
                end_of_pagination_reached,
            } => LoadStateResponse::NotLoading {
                end_of_pagination_reached: *end_of_pagination_reached,
            },
            LoadState::Loading => LoadStateResponse::Loading,
            LoadState::Error(e) => LoadStateResponse::Error {
                error: e.to_string(),
                retryable: e.is_retryable(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoadStatesResponse {
    pub refresh: LoadStateResponse,
    pub prepend: LoadStateResponse,
    pub append: LoadStateResponse,
}

impl From<&LoadStates> for LoadStatesResponse {
    fn from(states: &LoadStates) -> Self {
        Self {
            refresh: (&states.refresh).into(),
            prepend: (&states.prepend).into(),
            append: (&states.append).into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PageResponse<E> {
    pub items: Vec<E>,
    pub items_before: usize,
    pub generation: u64,
    pub load_states: LoadStatesResponse,
}

impl<E> From<Page<E>> for PageResponse<E> {
    fn from(page: Page<E>) -> Self {
        Self {
            load_states: (&page.load_states).into(),
            items: page.items,
            items_before: page.items_before,
            generation: page.generation,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub ok: bool,
    pub end_of_pagination_reached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NewerResponse {
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ShowNewResponse {
    pub revealed: usize,
}

/// New or edited post plus an optional local file to attach.
#[derive(Debug, Deserialize)]
pub struct SavePostRequest {
    pub post: Post,
    #[serde(default)]
    pub attachment: Option<AttachmentRequest>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentRequest {
    pub path: std::path::PathBuf,
    #[serde(rename = "type")]
    pub kind: AttachmentType,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub stores: Vec<StoreStatsResponse>,
}

#[derive(Debug, Serialize)]
pub struct StoreStatsResponse {
    pub kind: EntityKind,
    pub rows: usize,
    pub hidden: usize,
    pub version: u64,
}

async fn store_stats<E: Feed>(repo: &Repository<E>) -> StoreStatsResponse {
    let store = repo.store();
    StoreStatsResponse {
        kind: E::KIND,
        rows: store.len().await,
        hidden: store.hidden_count().await,
        version: store.version(),
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        stores: vec![
            store_stats(&state.posts).await,
            store_stats(&state.events).await,
        ],
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    for stats in [
        store_stats(&state.posts).await,
        store_stats(&state.events).await,
    ] {
        state
            .metrics
            .set_store_rows(stats.kind, stats.rows - stats.hidden, stats.hidden);
    }
    Ok(state.metrics.gather_text()?)
}

async fn list<E: Feed>(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Json<PageResponse<E>> {
    let paging = state.config.paging;
    let limit = query.limit.unwrap_or(paging.initial_load_size);
    let mut window = E::repository(&state)
        .view()
        .open_window(limit.min(paging.page_size), limit);
    if let (Some(key), Some(id)) = (query.anchor_key, query.anchor_id) {
        window.anchor_at(Cursor::new(key, id));
    }
    Json(window.snapshot().await.into())
}

async fn stream<E: Feed>(
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let request_id = Uuid::new_v4().to_string();
    info!(request_id = request_id, kind = %E::KIND, "Window stream opened");
    let pages = E::repository(&state).stream(state.shutdown.child_token());
    Sse::new(page_to_sse_stream(pages, request_id)).keep_alive(KeepAlive::default())
}

async fn refresh<E: Feed>(State(state): State<Arc<AppState>>) -> Result<Json<RefreshResponse>, ApiError> {
    let response = match E::repository(&state).refresh().await? {
        MediatorResult::Success {
            end_of_pagination_reached,
        } => RefreshResponse {
            ok: true,
            end_of_pagination_reached,
            error: None,
        },
        MediatorResult::Error(e) => RefreshResponse {
            ok: false,
            end_of_pagination_reached: false,
            error: Some(e.to_string()),
        },
    };
    Ok(Json(response))
}

async fn fetch<E: Feed>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<Json<E>, ApiError> {
    E::repository(&state)
        .fetch(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{} {id}", E::KIND)))
}

async fn delete<E: Feed>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<StatusCode, ApiError> {
    E::repository(&state).delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn expect_record<E: Feed>(id: EntityId, record: Option<E>) -> Result<Json<E>, ApiError> {
    record
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{} {id}", E::KIND)))
}

async fn like<E: Feed>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<Json<E>, ApiError> {
    expect_record(id, E::repository(&state).like(id).await?)
}

async fn unlike<E: Feed>(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<Json<E>, ApiError> {
    expect_record(id, E::repository(&state).unlike(id).await?)
}

async fn participate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<Json<Event>, ApiError> {
    expect_record(id, state.events.participate(id).await?)
}

async fn unparticipate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<EntityId>,
) -> Result<Json<Event>, ApiError> {
    expect_record(id, state.events.unparticipate(id).await?)
}

async fn save_post(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SavePostRequest>,
) -> Result<(StatusCode, Json<Post>), ApiError> {
    let id = req.post.id;
    let attachment = req.attachment.map(|a| PendingAttachment {
        path: a.path,
        kind: a.kind,
    });
    let saved = expect_record(id, state.posts.save(req.post, attachment).await?)?;
    let status = if id == 0 {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, saved))
}

async fn newer_count<E: Feed>(State(state): State<Arc<AppState>>) -> Json<NewerResponse> {
    Json(NewerResponse {
        count: E::repository(&state).newer_count(),
    })
}

async fn show_new<E: Feed>(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ShowNewResponse>, ApiError> {
    let revealed = E::repository(&state).show_new().await?;
    Ok(Json(ShowNewResponse { revealed }))
}
