//! Core data models for the resumable upload service.
//!
//! These entities represent upload sessions and the access references that
//! point at their finalized files. They map cleanly to database tables via
//! `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod access_ref;
pub mod upload_session;
