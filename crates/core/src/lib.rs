//! Domain layer of the document conversion service.
//!
//! Holds the job record and its state machine, the capability-token
//! authority, upload admission rules and the converter capability. Nothing
//! here performs I/O; persistence lives in `docconv-store` and scheduling in
//! `docconv-worker`.

pub mod converter;
pub mod error;
pub mod hashing;
pub mod job;
pub mod token;
pub mod types;
pub mod upload;
