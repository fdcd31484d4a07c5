//! HTTP API Handlers
//!
//! Axum endpoints exposing a [`FileSystem`] over REST. Each handler translates
//! the HTTP shape (paths, query parameters, streaming bodies, the `Range`
//! header) into contract calls and maps [`FsError`] onto `500` plus the JSON
//! error code body. These handlers serve both roles of the node binary: a
//! single partition store and a whole cluster gateway.

use crate::fs::contract::FileSystem;
use crate::fs::error::FsError;
use crate::fs::metadata::FileMetadata;
use crate::http::protocol::{
    AppendQuery, DownloadQuery, ErrorBody, ListQuery, SourceTargetQuery, UploadQuery,
    ENDPOINT_APPEND, ENDPOINT_COPY, ENDPOINT_COPY_ALL, ENDPOINT_DELETE, ENDPOINT_DELETE_ALL,
    ENDPOINT_DOWNLOAD, ENDPOINT_INFO, ENDPOINT_INFO_ALL, ENDPOINT_LIST, ENDPOINT_MOVE,
    ENDPOINT_MOVE_ALL, ENDPOINT_PING, ENDPOINT_UPLOAD,
};
use axum::body::Body;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Assembles the complete REST surface over the given filesystem.
pub fn router(fs: Arc<dyn FileSystem>) -> Router {
    Router::new()
        .route(&format!("{}/*name", ENDPOINT_UPLOAD), post(handle_upload))
        .route(&format!("{}/*name", ENDPOINT_APPEND), post(handle_append))
        .route(&format!("{}/*name", ENDPOINT_DOWNLOAD), get(handle_download))
        .route(ENDPOINT_LIST, get(handle_list))
        .route(&format!("{}/*name", ENDPOINT_INFO), get(handle_info))
        .route(ENDPOINT_INFO_ALL, post(handle_info_all))
        .route(ENDPOINT_PING, get(handle_ping))
        .route(ENDPOINT_COPY, post(handle_copy))
        .route(ENDPOINT_COPY_ALL, post(handle_copy_all))
        .route(ENDPOINT_MOVE, post(handle_move))
        .route(ENDPOINT_MOVE_ALL, post(handle_move_all))
        .route(&format!("{}/*name", ENDPOINT_DELETE), delete(handle_delete))
        .route(ENDPOINT_DELETE_ALL, post(handle_delete_all))
        .layer(Extension(fs))
}

fn error_response(e: &FsError) -> Response {
    tracing::debug!("request failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error_code: e.code(),
        }),
    )
        .into_response()
}

async fn handle_upload(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Path(name): Path<String>,
    Query(params): Query<UploadQuery>,
    body: Body,
) -> Response {
    let opened = match params.size {
        Some(size) => fs.upload_sized(&name, size).await,
        None => fs.upload(&name).await,
    };
    let sink = match opened {
        Ok(sink) => sink,
        Err(e) => return error_response(&e),
    };
    stream_body_into(body, sink).await
}

async fn handle_append(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Path(name): Path<String>,
    Query(params): Query<AppendQuery>,
    body: Body,
) -> Response {
    let sink = match fs.append(&name, params.offset).await {
        Ok(sink) => sink,
        Err(e) => return error_response(&e),
    };
    stream_body_into(body, sink).await
}

/// Pumps a request body into a sink and answers with the commit verdict.
async fn stream_body_into(body: Body, mut sink: crate::fs::stream::ByteSink) -> Response {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if let Err(e) = sink.send(bytes).await {
                    return error_response(&e);
                }
            }
            Err(_) => {
                // Client aborted the body; the dropped sink cancels the
                // stream, nothing is committed.
                return error_response(&FsError::Io("request body aborted".into()));
            }
        }
    }
    match sink.finish().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_download(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Path(name): Path<String>,
    Query(params): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Response {
    let (offset, limit, partial) = match byte_range(&params, &headers) {
        Ok(range) => range,
        Err(e) => return error_response(&e),
    };

    match fs.download(&name, offset, limit).await {
        Ok(source) => {
            let status = if partial {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            (status, Body::from_stream(source.into_stream())).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Resolves the requested byte range: an explicit `Range` header wins over the
/// `offset`/`limit` query parameters.
fn byte_range(params: &DownloadQuery, headers: &HeaderMap) -> Result<(u64, u64, bool), FsError> {
    if let Some(range) = headers.get(axum::http::header::RANGE) {
        let raw = range.to_str().map_err(|_| FsError::BadRange)?;
        let spec = raw.strip_prefix("bytes=").ok_or(FsError::BadRange)?;
        let (from, to) = spec.split_once('-').ok_or(FsError::BadRange)?;
        let offset: u64 = from.parse().map_err(|_| FsError::BadRange)?;
        let limit = if to.is_empty() {
            u64::MAX
        } else {
            let end: u64 = to.parse().map_err(|_| FsError::BadRange)?;
            if end < offset {
                return Err(FsError::BadRange);
            }
            end - offset + 1
        };
        return Ok((offset, limit, true));
    }

    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(i64::MAX);
    if offset < 0 || limit < 0 {
        return Err(FsError::BadRange);
    }
    Ok((offset as u64, limit as u64, false))
}

async fn handle_list(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Query(params): Query<ListQuery>,
) -> Response {
    let glob = params.glob.unwrap_or_else(|| "**".to_string());
    match fs.list(&glob).await {
        Ok(files) => Json(files).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_info(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Path(name): Path<String>,
) -> Response {
    match fs.info(&name).await {
        Ok(metadata) => Json::<Option<FileMetadata>>(metadata).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_info_all(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Json(names): Json<HashSet<String>>,
) -> Response {
    match fs.info_all(&names).await {
        Ok(files) => Json(files).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_ping(Extension(fs): Extension<Arc<dyn FileSystem>>) -> Response {
    match fs.ping().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_copy(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Query(params): Query<SourceTargetQuery>,
) -> Response {
    match fs.copy(&params.name, &params.target).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_copy_all(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Json(source_to_target): Json<HashMap<String, String>>,
) -> Response {
    match fs.copy_all(&source_to_target).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_move(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Query(params): Query<SourceTargetQuery>,
) -> Response {
    match fs.move_file(&params.name, &params.target).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_move_all(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Json(source_to_target): Json<HashMap<String, String>>,
) -> Response {
    match fs.move_all(&source_to_target).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_delete(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Path(name): Path<String>,
) -> Response {
    match fs.delete(&name).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn handle_delete_all(
    Extension(fs): Extension<Arc<dyn FileSystem>>,
    Json(names): Json<HashSet<String>>,
) -> Response {
    match fs.delete_all(&names).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e),
    }
}
