//! HTTP server for one-shot artifact sharing.
//!
//! `POST /upload` decodes a multipart body straight off the wire, stores the
//! file parts, registers the artifact with the broker and spawns the
//! one-shot listener. `GET /download/{code}` bridges the caller to that
//! listener and streams the bytes back with no length known in advance.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::broker::CodeBroker;
use crate::error::{IngestError, TransferError};
use crate::ingest;
use crate::multipart::MultipartDecoder;
use crate::transfer;

/// Upper bound on an upload request body (2GB)
const MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024 * 1024;

/// Shared state handed to every handler.
pub struct AppState {
    pub broker: Arc<CodeBroker>,
    pub upload_dir: PathBuf,
    pub base_url: String,
}

/// Response for a successful upload
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub invite_code: u16,
    pub file_count: usize,
    pub served_name: String,
    pub is_zip: bool,
}

/// Request body for `/share`
#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    pub method: String,
    pub code: u16,
}

/// Response for `/share`
#[derive(Debug, Serialize, Deserialize)]
pub struct ShareResponse {
    pub url: String,
}

/// Middleware to add security headers
async fn add_security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );

    response
}

/// Pull the boundary token out of a multipart/form-data content type.
/// Returns `None` for a missing/invalid content type or an empty boundary.
fn multipart_boundary(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    if !content_type
        .to_ascii_lowercase()
        .contains("multipart/form-data")
    {
        return None;
    }
    let boundary = content_type
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))?
        .trim_matches('"');
    (!boundary.is_empty()).then(|| boundary.to_string())
}

async fn upload_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let Some(boundary) = multipart_boundary(&parts.headers) else {
        return (
            StatusCode::BAD_REQUEST,
            "content type must be multipart/form-data with a boundary",
        )
            .into_response();
    };

    let body_reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let mut decoder = MultipartDecoder::new(body_reader, &boundary);

    let saved = match ingest::save_parts(&mut decoder, &state.upload_dir).await {
        Ok(saved) => saved,
        Err(e @ IngestError::Decode(_)) => {
            tracing::warn!(error = %e, "upload rejected");
            return (StatusCode::BAD_REQUEST, format!("upload failed: {e}")).into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "upload storage failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("upload failed: {e}"),
            )
                .into_response();
        }
    };

    if saved.is_empty() {
        return (StatusCode::BAD_REQUEST, "no file part found").into_response();
    }

    // One file is served as-is; several become a single zip bundle
    let (artifact, is_zip) = if saved.len() == 1 {
        (saved[0].path.clone(), false)
    } else {
        match ingest::bundle_artifacts(&saved, &state.upload_dir).await {
            Ok(path) => (path, true),
            Err(e) => {
                tracing::error!(error = %e, "bundling failed");
                ingest::discard_artifacts(&saved).await;
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to create bundle: {e}"),
                )
                    .into_response();
            }
        }
    };

    let served_name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown_file".to_string());

    let invite_code = match state.broker.register(&artifact) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "registration failed");
            ingest::discard_artifacts(&saved).await;
            // The bundle zip is not in `saved`; it dies here too
            if is_zip {
                let _ = tokio::fs::remove_file(&artifact).await;
            }
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to offer artifact: {e}"),
            )
                .into_response();
        }
    };

    // Launch the one-shot listener without blocking this request; the
    // sender gets the code back before the listener is necessarily up.
    let broker = state.broker.clone();
    tokio::spawn(async move {
        let _ = transfer::serve(&broker, invite_code).await;
    });

    Json(UploadResponse {
        invite_code,
        file_count: saved.len(),
        served_name,
        is_zip,
    })
    .into_response()
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<u16>,
) -> Response {
    match transfer::fetch(&state.broker, code).await {
        Ok(retrieval) => {
            let disposition = format!("attachment; filename=\"{}\"", retrieval.file_name);
            let disposition = HeaderValue::from_str(&disposition)
                .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
            let stream = ReaderStream::with_capacity(retrieval.stream, transfer::COPY_BUFFER_SIZE);
            (
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/octet-stream"),
                    ),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Err(e @ TransferError::NotRegistered { .. }) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        Err(e @ TransferError::ConnectTimeout { .. }) => {
            (StatusCode::GATEWAY_TIMEOUT, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn share_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ShareRequest>,
) -> Response {
    // Every share method resolves to a copyable link
    tracing::debug!(method = %req.method, code = req.code, "share link requested");
    let url = format!("{}/download/{}", state.base_url, req.code);
    Json(ShareResponse { url }).into_response()
}

async fn not_found_handler() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// Build the axum router for the share surface
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/upload", post(upload_handler))
        .route("/download/{code}", get(download_handler))
        .route("/share", post(share_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn(add_security_headers))
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Start the HTTP server, optionally with graceful shutdown
pub async fn start_http_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    cancel_token: Option<CancellationToken>,
) -> Result<()> {
    let router = create_router(state);
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("HTTP server starting on http://{}", addr);

    if let Some(ct) = cancel_token {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                ct.cancelled().await;
                tracing::info!("HTTP server shutting down gracefully");
            })
            .await?;
    } else {
        axum::serve(listener, router).await?;
    }

    Ok(())
}
