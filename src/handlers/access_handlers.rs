//! HTTP handlers for access references.
//!
//! An access reference is the unit of shareable read access: resolving one
//! streams the finalized blob without consulting the upload's own ownership
//! rules. Creation and deletion stay owner-gated.

use crate::{
    errors::AppError, handlers::upload_handlers::caller_identity,
    services::upload_service::UploadService,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tower::util::ServiceExt;
use tower_http::services::ServeFile;
use uuid::Uuid;

/// Request body for `POST /accref`.
#[derive(Debug, Deserialize)]
pub struct CreateAccessRefReq {
    pub upload: Uuid,
}

/// POST `/accref` — create a reference to an upload the caller owns.
pub async fn create_access_ref(
    State(service): State<UploadService>,
    headers: HeaderMap,
    Json(payload): Json<CreateAccessRefReq>,
) -> Result<Response, AppError> {
    let owner = caller_identity(&headers)?;
    let access_ref = service.create_access_ref(&owner, payload.upload).await?;

    Ok((StatusCode::CREATED, Json(access_ref)).into_response())
}

/// DELETE `/accref/{access_ref_id}` — remove a reference the caller owns.
pub async fn delete_access_ref(
    State(service): State<UploadService>,
    Path(access_ref_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let owner = caller_identity(&headers)?;
    service.delete_access_ref(&owner, access_ref_id).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET `/accref/{access_ref_id}` — stream the referenced blob.
///
/// Range, conditional-request handling, and `Last-Modified` are delegated
/// to `ServeFile`; the session supplies the content type and filename.
pub async fn resolve_access_ref(
    State(service): State<UploadService>,
    Path(access_ref_id): Path<Uuid>,
    request: Request,
) -> Result<Response, AppError> {
    let (session, blob_path) = service.resolve_access_ref(access_ref_id).await?;

    let mime = session
        .mime_type
        .parse::<mime::Mime>()
        .unwrap_or(mime::APPLICATION_OCTET_STREAM);
    let response = ServeFile::new_with_mime(&blob_path, &mime)
        .oneshot(request)
        .await
        .map_err(|err| AppError::internal(format!("failed to serve blob: {}", err)))?;

    // The reference resolved but the file vanished underneath us.
    if response.status() == StatusCode::NOT_FOUND {
        return Err(AppError::not_found(format!(
            "stored file for upload `{}` is missing",
            session.id
        )));
    }

    let mut response = response.map(Body::new);
    let disposition = format!("inline; filename=\"{}\"", session.filename.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}
