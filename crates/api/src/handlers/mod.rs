//! Request handlers. Each submodule serves one resource and maps errors via
//! [`crate::error::AppError`].

pub mod jobs;
