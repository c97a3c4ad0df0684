//! Defines routes for the resumable-upload protocol and access references.
//!
//! ## Structure
//! - **Upload protocol** (all behind the tus version middleware; every
//!   response carries `Tus-Resumable: 1.0.0`)
//!   - `POST  /uploads` — create an upload session
//!   - `HEAD  /uploads/{upload_id}` — report the current offset
//!   - `PATCH /uploads/{upload_id}` — append one chunk
//!
//! - **Access references**
//!   - `POST   /accref` — create a reference to an owned upload
//!   - `GET    /accref/{access_ref_id}` — stream the referenced blob
//!   - `DELETE /accref/{access_ref_id}` — remove an owned reference

use crate::{
    handlers::{
        access_handlers::{create_access_ref, delete_access_ref, resolve_access_ref},
        health_handlers::{healthz, readyz},
        upload_handlers::{append_chunk, create_upload, require_tus_version, upload_status},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router, middleware,
    routing::{get, head, post},
};

/// Build and return the router for all endpoints.
///
/// The router carries shared state (`UploadService`) to all handlers.
pub fn routes() -> Router<UploadService> {
    let uploads = Router::new()
        .route("/uploads", post(create_upload))
        .route(
            "/uploads/{upload_id}",
            head(upload_status).patch(append_chunk),
        )
        .layer(middleware::from_fn(require_tus_version));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // access references
        .route("/accref", post(create_access_ref))
        .route(
            "/accref/{access_ref_id}",
            get(resolve_access_ref).delete(delete_access_ref),
        )
        .merge(uploads)
}
