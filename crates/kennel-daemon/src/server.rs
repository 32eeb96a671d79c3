//! HTTP file server.
//!
//! | Method | Path                | Body / reply                              |
//! |--------|---------------------|-------------------------------------------|
//! | POST   | `/upload`           | multipart `file`, `sender` → `{cid, fid}` |
//! | GET    | `/download/:fid`    | raw file bytes                            |
//! | POST   | `/attest`           | `{cid}` → `{cid}`                         |
//! | GET    | `/version`          | `{version}`                               |
//! | GET    | `/`                 | `{status, address}`                       |
//! | GET    | `/api/client/list`  | `[{cid, fid}]`                            |
//!
//! Failures reply with `{"error": "..."}`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kennel_db::queries::contracts;
use kennel_db::DbError;
use kennel_engine::{upload, Context, EngineError, Intake};
use kennel_storage::StorageError;
use kennel_types::{Cid, Fid};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;

/// State shared by all handlers.
pub struct AppState {
    pub ctx: Context,
    pub max_file_size: u64,
}

/// Error reply carrying a status code and a message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn storage_status(e: &StorageError) -> StatusCode {
    match e {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
        StorageError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        StorageError::Empty => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Storage(s) => storage_status(s),
            EngineError::Db(DbError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::Db(DbError::Exists(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e).into()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        EngineError::Db(e).into()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/version", get(version))
        .route("/upload", post(upload_file))
        .route("/download/:fid", get(download))
        .route("/attest", post(attest))
        .route("/api/client/list", get(list_contracts))
        // Size is enforced while streaming into the archive.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "online", "address": state.ctx.address }))
}

async fn version() -> Json<serde_json::Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut sender: Option<String> = None;
    let mut received: Option<Intake> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("sender") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                sender = Some(text.trim().to_string());
            }
            Some("file") => {
                let mut intake = Intake::begin(&state.ctx, state.max_file_size).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?
                {
                    intake.write(&chunk).await?;
                }
                received = Some(intake);
            }
            _ => {}
        }
    }

    let sender = sender
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing sender"))?;
    let intake = received.ok_or_else(|| ApiError::bad_request("missing file"))?;
    let ingested = intake.finish().await?;

    let receipt = upload::accept(&state.ctx, &sender, ingested).await?;
    Ok(Json(receipt.to_json()))
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path(fid): Path<String>,
) -> ApiResult<Response> {
    let fid = Fid::parse(&fid).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let file = {
        let fid = fid.clone();
        state
            .ctx
            .blocking(move |archive| Ok(archive.retrieve_file(&fid)?))
            .await?
    };
    let len = file.metadata().map_err(StorageError::from)?.len();
    tracing::debug!(%fid, bytes = len, "serving download");

    let stream = ReaderStream::new(tokio::fs::File::from_std(file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct AttestRequest {
    cid: String,
}

async fn attest(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AttestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let cid = Cid::parse(&req.cid).map_err(|e| ApiError::bad_request(e.to_string()))?;
    upload::attest(&state.ctx, &cid).await?;
    Ok(Json(json!({ "cid": cid })))
}

#[derive(Debug, Serialize)]
struct ContractEntry {
    cid: Cid,
    fid: Fid,
}

async fn list_contracts(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ContractEntry>>> {
    let conn = state.ctx.db.lock().await;
    let entries = contracts::iterate_contracts(&conn)?
        .into_iter()
        .map(|(cid, fid)| ContractEntry { cid, fid })
        .collect();
    Ok(Json(entries))
}
