//! Background execution of conversion jobs.
//!
//! [`engine::JobLifecycleEngine`] is the entry point: it owns the
//! [`queue::SubmissionQueue`], the [`execution::ExecutionPool`] that bounds
//! concurrent conversions, and the [`pool::WorkerPool`] that drains the
//! queue. [`converters::DocumentConverter`] is the built-in converter.

pub mod converters;
pub mod engine;
pub mod execution;
pub mod pool;
pub mod queue;

pub use converters::DocumentConverter;
pub use engine::{
    EngineConfig, JobLifecycleEngine, JobOutcome, JobResult, PendingUpload, RecoveryReport,
    Submission, Upload,
};
