//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check (returns version) |
//! | `GET` `POST` | `/data-sources` | List / create data sources |
//! | `GET` `PUT` `DELETE` | `/data-sources/{id}` | Read / update / delete (cascades to chunks) |
//! | `POST` | `/data-sources/{id}/test-connection` | `{ok, message}` |
//! | `POST` | `/data-sources/{id}/sync` | Start a background sync (202) |
//! | `GET` | `/data-sources/{id}/sync-status` | Poll sync state |
//! | `GET` | `/data-sources/{id}/chunks` | Paginated chunks, `?page&page_size&q` |
//! | `POST` | `/qa/ask` | Single-shot answer |
//! | `POST` | `/qa/ask/stream` | Server-sent events, one JSON event per `data:` line |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "data source 3 is already syncing" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `not_found` | 404 |
//! | `conflict` | 409 |
//! | `connection_error` | 502 |
//! | `generation_error` | 502 |
//! | `model_service_error` | 503 |
//! | `internal` | 500 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use zerag_core::models::{ChunkPage, DataSource, DataSourceUpdate, NewDataSource};
use zerag_core::store::Removal;

use crate::config::Config;
use crate::error::RagError;
use crate::pipeline::{AskRequest, AskResponse};
use crate::services::Services;
use crate::sync::{SyncAck, SyncStatusView};

pub const MAX_PAGE_SIZE: i64 = 200;

/// Open services and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::open(config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "listening");
    axum::serve(listener, router(services)).await?;
    Ok(())
}

pub fn router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/data-sources", get(list_sources).post(create_source))
        .route(
            "/data-sources/{id}",
            get(get_source).put(update_source).delete(delete_source),
        )
        .route("/data-sources/{id}/test-connection", post(test_connection))
        .route("/data-sources/{id}/sync", post(trigger_sync))
        .route("/data-sources/{id}/sync-status", get(sync_status))
        .route("/data-sources/{id}/chunks", get(list_chunks))
        .route("/qa/ask", post(ask))
        .route("/qa/ask/stream", post(ask_stream))
        .layer(cors)
        .with_state(services)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError(RagError);

impl From<RagError> for AppError {
    fn from(e: RagError) -> Self {
        AppError(e)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError(RagError::Internal(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::UnknownDataSource(_) => StatusCode::NOT_FOUND,
            RagError::Conflict(_) => StatusCode::CONFLICT,
            RagError::Connection(_) | RagError::Generation(_) => StatusCode::BAD_GATEWAY,
            RagError::ModelService(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Data sources ============

/// Passwords never leave the server.
fn redacted(mut source: DataSource) -> DataSource {
    source.connection = source.connection.redacted();
    source
}

async fn load(services: &Services, id: i64) -> ApiResult<DataSource> {
    services
        .store
        .get_data_source(id)
        .await?
        .ok_or(AppError(RagError::UnknownDataSource(id)))
}

async fn list_sources(State(services): State<Services>) -> ApiResult<Json<Vec<DataSource>>> {
    let sources = services.store.list_data_sources().await?;
    Ok(Json(sources.into_iter().map(redacted).collect()))
}

async fn create_source(
    State(services): State<Services>,
    Json(new): Json<NewDataSource>,
) -> ApiResult<(StatusCode, Json<DataSource>)> {
    if new.name.trim().is_empty() {
        return Err(RagError::validation("name must not be empty").into());
    }
    let source = services.store.create_data_source(&new).await?;
    tracing::info!(id = source.id, kind = %source.kind, "data source created");
    Ok((StatusCode::CREATED, Json(redacted(source))))
}

async fn get_source(
    State(services): State<Services>,
    Path(id): Path<i64>,
) -> ApiResult<Json<DataSource>> {
    Ok(Json(redacted(load(&services, id).await?)))
}

async fn update_source(
    State(services): State<Services>,
    Path(id): Path<i64>,
    Json(update): Json<DataSourceUpdate>,
) -> ApiResult<Json<DataSource>> {
    if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return Err(RagError::validation("name must not be empty").into());
    }
    let updated = services
        .store
        .update_data_source(id, &update)
        .await?
        .ok_or(AppError(RagError::UnknownDataSource(id)))?;
    Ok(Json(redacted(updated)))
}

async fn delete_source(
    State(services): State<Services>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    match services.store.delete_data_source(id).await? {
        Removal::Deleted => {
            services.keyword_index.invalidate(id);
            tracing::info!(id, "data source deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        Removal::NotFound => Err(RagError::UnknownDataSource(id).into()),
        Removal::Syncing => Err(RagError::Conflict(format!(
            "data source {} is syncing and cannot be deleted",
            id
        ))
        .into()),
    }
}

#[derive(Serialize, Deserialize)]
struct ConnectionCheck {
    ok: bool,
    message: String,
}

async fn test_connection(
    State(services): State<Services>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ConnectionCheck>> {
    match services.sync.test_connection(id).await {
        Ok(()) => Ok(Json(ConnectionCheck {
            ok: true,
            message: "connection ok".to_string(),
        })),
        Err(e @ RagError::UnknownDataSource(_)) => Err(e.into()),
        Err(e) => Ok(Json(ConnectionCheck {
            ok: false,
            message: e.to_string(),
        })),
    }
}

// ============ Sync ============

async fn trigger_sync(
    State(services): State<Services>,
    Path(id): Path<i64>,
) -> ApiResult<(StatusCode, Json<SyncAck>)> {
    let ack = services.sync.trigger(id).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn sync_status(
    State(services): State<Services>,
    Path(id): Path<i64>,
) -> ApiResult<Json<SyncStatusView>> {
    Ok(Json(services.sync.status(id).await?))
}

#[derive(Deserialize)]
struct ChunkQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
    #[serde(default)]
    q: Option<String>,
}

fn default_page() -> i64 {
    1
}
fn default_page_size() -> i64 {
    20
}

async fn list_chunks(
    State(services): State<Services>,
    Path(id): Path<i64>,
    Query(query): Query<ChunkQuery>,
) -> ApiResult<Json<ChunkPage>> {
    load(&services, id).await?;
    if query.page < 1 || !(1..=MAX_PAGE_SIZE).contains(&query.page_size) {
        return Err(RagError::validation(format!(
            "page must be >= 1 and page_size between 1 and {}",
            MAX_PAGE_SIZE
        ))
        .into());
    }
    let filter = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty());
    let page = services
        .store
        .list_chunks(id, query.page, query.page_size, filter)
        .await?;
    Ok(Json(page))
}

// ============ Question answering ============

async fn ask(
    State(services): State<Services>,
    Json(req): Json<AskRequest>,
) -> ApiResult<Json<AskResponse>> {
    Ok(Json(services.pipeline.ask(req).await?))
}

/// Dropping the response body (client disconnect) drops the answer
/// stream, which cancels generation.
async fn ask_stream(
    State(services): State<Services>,
    Json(req): Json<AskRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let stream = services.pipeline.ask_stream(req).await?;
    let events = stream.map(|event| Event::default().json_data(event));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
