//! Worker loops that drain the submission queue.
//!
//! Each worker owns one job at a time from dequeue to terminal status and is
//! the only writer of that job's record while it runs. Conversions execute on
//! the shared [`ExecutionPool`]; the worker stays on the async runtime,
//! persisting progress and racing the conversion against the job's deadline.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use docconv_core::converter::{
    ConversionContext, ConversionError, ConversionInput, ConversionOutput, Converter,
    ProgressSink,
};
use docconv_core::job::{Artifact, JobError, JobErrorKind, JobRecord, JobStatus};
use docconv_core::types::JobId;
use docconv_core::upload::sanitize_filename;
use docconv_store::job_store::{artifact_key, output_key};
use docconv_store::JobStore;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::execution::ExecutionPool;
use crate::queue::SubmissionQueue;

/// Everything a worker needs to process jobs.
pub struct WorkerContext {
    pub store: JobStore,
    pub queue: Arc<SubmissionQueue>,
    pub executor: Arc<ExecutionPool>,
    pub converter: Arc<dyn Converter>,
    /// Wall-clock budget per job, measured from the `running` transition.
    pub job_timeout: Duration,
    /// How long a timed-out job waits for its conversion to acknowledge
    /// cancellation before a warning is logged. The job keeps waiting after
    /// that; it is failed only once the conversion has returned.
    pub cancel_grace: Duration,
}

/// Fixed set of worker tasks.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    queue: Arc<SubmissionQueue>,
}

impl WorkerPool {
    /// Start `workers` loops on the current runtime.
    pub fn spawn(workers: usize, ctx: Arc<WorkerContext>) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..workers)
            .map(|index| {
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown.clone();
                tokio::spawn(
                    run_worker(ctx, shutdown).instrument(tracing::info_span!("worker", worker = index)),
                )
            })
            .collect();

        tracing::info!(workers, "Worker pool started");
        Self {
            handles,
            shutdown,
            queue: Arc::clone(&ctx.queue),
        }
    }

    /// Stop dequeuing and wait for every worker to exit.
    ///
    /// Jobs already picked up run to completion or to their timeout. Ids still
    /// in the queue stay `queued` on disk.
    pub async fn shutdown(self) {
        self.queue.close();
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn run_worker(ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    tracing::debug!("Worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            next = ctx.queue.pop() => next,
        };
        let Some(job_id) = next else {
            break;
        };

        process_job(&ctx, job_id)
            .instrument(tracing::info_span!("job", job_id = %job_id))
            .await;
    }
    tracing::debug!("Worker stopped");
}

// ---------------------------------------------------------------------------
// Per-job processing
// ---------------------------------------------------------------------------

async fn process_job(ctx: &WorkerContext, job_id: JobId) {
    let mut record = match ctx.store.load(job_id).await {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load dequeued job");
            return;
        }
    };

    if record.status() != JobStatus::Queued {
        tracing::warn!(status = %record.status(), "Dequeued job is not queued, skipping");
        return;
    }

    if let Err(e) = record.start() {
        tracing::error!(error = %e, "Job state invariant violated");
        return;
    }
    if let Err(e) = ctx.store.save(&record).await {
        // The stored record is still `queued`, so recovery picks it up again.
        tracing::error!(error = %e, "Failed to persist running status");
        return;
    }
    tracing::info!(
        filename = %record.filename(),
        content_type = %record.content_type(),
        "Job started",
    );

    match execute(ctx, &mut record).await {
        Ok(output) => complete(ctx, &mut record, output).await,
        Err(error) => fail(ctx, &mut record, error).await,
    }
}

/// Run the conversion under the job's deadline, persisting progress as it
/// increases.
async fn execute(
    ctx: &WorkerContext,
    record: &mut JobRecord,
) -> Result<ConversionOutput, JobError> {
    let deadline = Instant::now() + ctx.job_timeout;

    let bytes = ctx
        .store
        .storage()
        .get(record.input_location())
        .await
        .map_err(|e| JobError::new(JobErrorKind::Storage, format!("Failed to read input: {e}")))?;

    let input = ConversionInput {
        job_id: record.id(),
        filename: record.filename().to_string(),
        content_type: record.content_type().to_string(),
        bytes,
    };

    let cancel = CancellationToken::new();
    let (progress_tx, mut progress_rx) = watch::channel(record.progress());
    let converter = Arc::clone(&ctx.converter);
    let task_cancel = cancel.clone();
    let task = move || {
        let sink = WatchProgress(progress_tx);
        let conversion = ConversionContext::new(&sink, &task_cancel);
        converter.convert(&input, &conversion)
    };

    let mut handle = tokio::select! {
        spawned = ctx.executor.spawn(task) => spawned.map_err(|e| {
            JobError::new(JobErrorKind::Conversion, format!("Conversion could not start: {e}"))
        })?,
        _ = sleep_until(deadline) => {
            tracing::warn!("Job timed out waiting for an execution slot");
            return Err(JobError::new(
                JobErrorKind::Timeout,
                format!(
                    "No execution slot became free within the {}s time limit",
                    ctx.job_timeout.as_secs_f64()
                ),
            ));
        }
    };

    let mut progress_open = true;
    let joined = loop {
        tokio::select! {
            joined = &mut handle => break joined,
            changed = progress_rx.changed(), if progress_open => {
                match changed {
                    Ok(()) => {
                        let percent = *progress_rx.borrow_and_update();
                        persist_progress(ctx, record, percent).await;
                    }
                    // Sender dropped: the conversion is returning.
                    Err(_) => progress_open = false,
                }
            }
            _ = sleep_until(deadline) => {
                cancel.cancel();
                // The job only fails once the conversion has returned its slot.
                if tokio::time::timeout(ctx.cancel_grace, &mut handle).await.is_err() {
                    tracing::warn!(
                        grace_secs = ctx.cancel_grace.as_secs_f64(),
                        "Conversion ignored cancellation, waiting for it to return",
                    );
                    let _ = (&mut handle).await;
                }
                tracing::debug!("Conversion stopped after cancellation");
                apply_last_progress(record, *progress_rx.borrow());
                return Err(timeout_error(ctx.job_timeout));
            }
        }
    };

    apply_last_progress(record, *progress_rx.borrow());
    match joined {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(classify_conversion_error(e)),
        Err(e) => Err(classify_join_error(e)),
    }
}

async fn complete(ctx: &WorkerContext, record: &mut JobRecord, output: ConversionOutput) {
    let job_id = record.id();
    let storage = ctx.store.storage();

    let output_location = output_key(job_id);
    if let Err(e) = storage.put(&output_location, output.markdown.as_bytes()).await {
        let error = JobError::new(JobErrorKind::Storage, format!("Failed to write result: {e}"));
        return fail(ctx, record, error).await;
    }

    let mut artifacts = Vec::with_capacity(output.artifacts.len());
    for artifact in output.artifacts {
        let name = sanitize_filename(&artifact.name);
        let location = artifact_key(job_id, &name);
        if let Err(e) = storage.put(&location, &artifact.bytes).await {
            let error = JobError::new(
                JobErrorKind::Storage,
                format!("Failed to write artifact {name}: {e}"),
            );
            return fail(ctx, record, error).await;
        }
        artifacts.push(Artifact {
            name,
            location,
            size_bytes: artifact.bytes.len() as u64,
        });
    }

    if let Err(e) = record.succeed(output_location, artifacts) {
        tracing::error!(error = %e, "Job state invariant violated");
        return;
    }
    match ctx.store.save(record).await {
        Ok(()) => tracing::info!(
            result_bytes = output.markdown.len(),
            "Job succeeded",
        ),
        Err(e) => tracing::error!(error = %e, "Failed to persist succeeded status"),
    }
}

async fn fail(ctx: &WorkerContext, record: &mut JobRecord, error: JobError) {
    let kind = error.kind;
    let message = error.message.clone();
    if let Err(e) = record.fail(error) {
        tracing::error!(error = %e, "Job state invariant violated");
        return;
    }
    match ctx.store.save(record).await {
        Ok(()) => tracing::warn!(
            kind = kind.as_str(),
            error = %message,
            progress = record.progress(),
            "Job failed",
        ),
        Err(e) => tracing::error!(error = %e, "Failed to persist failed status"),
    }
}

async fn persist_progress(ctx: &WorkerContext, record: &mut JobRecord, percent: u8) {
    match record.report_progress(percent) {
        Ok(true) => {
            tracing::debug!(progress = record.progress(), "Job progress");
            if let Err(e) = ctx.store.save(record).await {
                tracing::warn!(error = %e, "Failed to persist progress");
            }
        }
        Ok(false) => {}
        Err(e) => tracing::error!(error = %e, "Job state invariant violated"),
    }
}

/// Fold the final reported value into the record without a separate write;
/// the terminal save that follows persists it.
fn apply_last_progress(record: &mut JobRecord, percent: u8) {
    if let Err(e) = record.report_progress(percent) {
        tracing::error!(error = %e, "Job state invariant violated");
    }
}

// ---------------------------------------------------------------------------
// Progress channel
// ---------------------------------------------------------------------------

/// Coalescing progress sink: the worker only ever sees the latest value, and
/// values that do not increase are dropped at the source.
struct WatchProgress(watch::Sender<u8>);

impl ProgressSink for WatchProgress {
    fn report(&self, percent: u8) {
        self.0.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

fn timeout_error(budget: Duration) -> JobError {
    JobError::new(
        JobErrorKind::Timeout,
        format!("Conversion exceeded the {}s time limit", budget.as_secs_f64()),
    )
}

fn classify_conversion_error(err: ConversionError) -> JobError {
    match err {
        ConversionError::UnsupportedFormat(msg) => {
            JobError::new(JobErrorKind::UnsupportedFormat, msg)
        }
        ConversionError::Failed(msg) => JobError::new(JobErrorKind::Conversion, msg),
        ConversionError::Cancelled => {
            JobError::new(JobErrorKind::Conversion, "Conversion was cancelled")
        }
    }
}

fn classify_join_error(err: JoinError) -> JobError {
    if err.is_panic() {
        let message = panic_message(err.into_panic());
        JobError::new(JobErrorKind::Panic, format!("Converter panicked: {message}"))
    } else {
        JobError::new(JobErrorKind::Panic, "Conversion task was aborted")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
