//! Request extractors for per-job authorization.
//!
//! - [`auth::BearerSecret`] -- Extracts the capability secret from the `Authorization` header.

pub mod auth;
