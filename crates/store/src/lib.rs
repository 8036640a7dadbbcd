//! Persistence for the document conversion service.
//!
//! [`storage::Storage`] is the byte-level capability (local disk in
//! production); [`job_store::JobStore`] maps job records and their inputs and
//! outputs onto it.

pub mod job_store;
pub mod storage;

pub use job_store::{JobStore, StoreError};
pub use storage::{LocalStorage, ObjectWriter, Storage, StorageError};
