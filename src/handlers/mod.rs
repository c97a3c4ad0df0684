//! HTTP handlers, grouped by surface: the upload protocol, access
//! references, and health probes.

pub mod access_handlers;
pub mod health_handlers;
pub mod upload_handlers;
