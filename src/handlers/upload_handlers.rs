//! HTTP handlers for the resumable-upload protocol (TUS 1.0 core).
//!
//! Creation, status, and append each map to one verb on `/uploads`. All
//! three run behind `require_tus_version`, which rejects version mismatches
//! with 412 and stamps `Tus-Resumable` on every response, success or error.

use crate::{errors::AppError, models::upload_session::UploadSession,
    services::upload_service::UploadService};
use axum::{
    body::{Body, to_bytes},
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use std::collections::HashMap;
use uuid::Uuid;

pub const TUS_PROTOCOL_VERSION: &str = "1.0.0";
const OFFSET_MEDIA_TYPE: &str = "application/offset+octet-stream";

const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
const TUS_VERSION: HeaderName = HeaderName::from_static("tus-version");
const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");

/// Identity header populated by the fronting authentication layer.
const CALLER_ID: HeaderName = HeaderName::from_static("x-caller-id");

/// Middleware for the upload routes: every response carries
/// `Tus-Resumable`, and requests without a matching protocol version are
/// rejected up front with 412 + `Tus-Version` before any handler runs.
pub async fn require_tus_version(request: Request, next: Next) -> Response {
    let version_matches = request
        .headers()
        .get(TUS_RESUMABLE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == TUS_PROTOCOL_VERSION);

    let mut response = if version_matches {
        next.run(request).await
    } else {
        let mut response =
            AppError::new(StatusCode::PRECONDITION_FAILED, "unsupported tus version")
                .into_response();
        response
            .headers_mut()
            .insert(TUS_VERSION, HeaderValue::from_static(TUS_PROTOCOL_VERSION));
        response
    };

    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_PROTOCOL_VERSION));
    response
}

/// Caller identity, as supplied by the external auth collaborator.
pub(crate) fn caller_identity(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(CALLER_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::bad_request("missing caller identity"))
}

/// Parse an `Upload-Metadata` header: comma-separated `key base64(value)`
/// items. Malformed items (wrong token count, bad base64, non-UTF-8 value)
/// are silently skipped so that unknown future metadata never fails a
/// request.
fn parse_upload_metadata(raw: &str) -> HashMap<String, String> {
    let mut metadata = HashMap::new();

    for item in raw.split(',') {
        let tokens: Vec<&str> = item.trim().split(' ').collect();
        if tokens.len() != 2 {
            continue;
        }
        let Ok(decoded) = general_purpose::STANDARD.decode(tokens[1]) else {
            continue;
        };
        let Ok(value) = String::from_utf8(decoded) else {
            continue;
        };
        metadata.insert(tokens[0].to_string(), value);
    }

    metadata
}

fn header_i64(headers: &HeaderMap, name: HeaderName) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
}

fn set_progress_headers(headers: &mut HeaderMap, session: &UploadSession) {
    headers.insert(
        UPLOAD_OFFSET,
        HeaderValue::from_str(&session.current_offset.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    headers.insert(
        UPLOAD_LENGTH,
        HeaderValue::from_str(&session.size.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}

/// POST `/uploads` — create a new upload session.
pub async fn create_upload(
    State(service): State<UploadService>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let owner = caller_identity(&headers)?;

    let size = header_i64(&headers, UPLOAD_LENGTH)
        .ok_or_else(|| AppError::bad_request("missing or invalid Upload-Length header"))?;

    let metadata = headers
        .get(UPLOAD_METADATA)
        .and_then(|v| v.to_str().ok())
        .map(parse_upload_metadata)
        .unwrap_or_default();
    let filename = metadata
        .get("filename")
        .ok_or_else(|| AppError::bad_request("missing filename in Upload-Metadata"))?;
    let mime_type = metadata
        .get("filetype")
        .ok_or_else(|| AppError::bad_request("missing filetype in Upload-Metadata"))?;

    let session = service
        .create_session(&owner, size, filename, mime_type)
        .await?;

    // TODO: derive the location base from the request Host header so one
    // deployment can answer under several public URLs.
    let location = format!("{}/uploads/{}", service.public_url(), session.id);

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::CREATED;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

/// HEAD `/uploads/{upload_id}` — report the current offset.
pub async fn upload_status(
    State(service): State<UploadService>,
    Path(upload_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    caller_identity(&headers)?;

    let session = service.session_status(upload_id).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_progress_headers(response.headers_mut(), &session);
    // The offset is mutable state; intermediaries must not cache it.
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    );
    Ok(response)
}

/// PATCH `/uploads/{upload_id}` — append one chunk at the claimed offset.
pub async fn append_chunk(
    State(service): State<UploadService>,
    Path(upload_id): Path<Uuid>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    caller_identity(&headers)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if content_type != Some(OFFSET_MEDIA_TYPE) {
        return Err(AppError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("Content-Type must be {}", OFFSET_MEDIA_TYPE),
        ));
    }

    let content_length = header_i64(&headers, header::CONTENT_LENGTH)
        .filter(|v| *v >= 0)
        .ok_or_else(|| AppError::bad_request("missing or invalid Content-Length header"))?;
    let upload_offset = header_i64(&headers, UPLOAD_OFFSET)
        .filter(|v| *v >= 0)
        .ok_or_else(|| AppError::bad_request("missing or invalid Upload-Offset header"))?;

    let chunk = to_bytes(body, usize::MAX)
        .await
        .map_err(|err| AppError::internal(format!("failed to read request body: {}", err)))?;

    let session = service
        .append_chunk(upload_id, upload_offset, content_length, chunk)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_progress_headers(response.headers_mut(), &session);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, middleware, routing::post};
    use tower::util::ServiceExt;

    #[test]
    fn metadata_parser_decodes_valid_entries() {
        let metadata =
            parse_upload_metadata("filename ZmlsZS50eHQ=,filetype dGV4dC9wbGFpbg==");
        assert_eq!(metadata.get("filename").map(String::as_str), Some("file.txt"));
        assert_eq!(
            metadata.get("filetype").map(String::as_str),
            Some("text/plain")
        );
    }

    #[test]
    fn metadata_parser_skips_malformed_entries() {
        // Wrong token count, bad base64, and a valid trailing entry.
        let metadata = parse_upload_metadata(
            "keyonly,too many tokens here,bad !!!notbase64!!!,filename ZmlsZS50eHQ=",
        );
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get("filename").map(String::as_str), Some("file.txt"));
    }

    #[test]
    fn metadata_parser_trims_items_before_splitting() {
        let metadata = parse_upload_metadata(" filename ZmlsZS50eHQ= , keyonly ");
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get("filename").map(String::as_str), Some("file.txt"));
    }

    #[test]
    fn caller_identity_requires_the_header() {
        let mut headers = HeaderMap::new();
        assert!(caller_identity(&headers).is_err());

        headers.insert(CALLER_ID, HeaderValue::from_static("alice"));
        assert_eq!(caller_identity(&headers).expect("identity"), "alice");
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected_with_412() {
        let app = Router::new()
            .route("/uploads", post(|| async { StatusCode::CREATED }))
            .layer(middleware::from_fn(require_tus_version));

        let request = Request::builder()
            .method("POST")
            .uri("/uploads")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(
            response.headers().get(TUS_VERSION).expect("tus-version"),
            TUS_PROTOCOL_VERSION
        );
        assert_eq!(
            response.headers().get(TUS_RESUMABLE).expect("tus-resumable"),
            TUS_PROTOCOL_VERSION
        );
    }

    #[tokio::test]
    async fn matching_version_passes_and_is_echoed() {
        let app = Router::new()
            .route("/uploads", post(|| async { StatusCode::CREATED }))
            .layer(middleware::from_fn(require_tus_version));

        let request = Request::builder()
            .method("POST")
            .uri("/uploads")
            .header(TUS_RESUMABLE, TUS_PROTOCOL_VERSION)
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(TUS_RESUMABLE).expect("tus-resumable"),
            TUS_PROTOCOL_VERSION
        );
    }
}
