//! Job lifecycle engine: the runtime context that owns the store, queue,
//! execution pool and worker pool.
//!
//! The engine is constructed once at startup and handed to the boundary
//! layer; tests build as many independent engines as they need. Every
//! per-job read goes through the same access check:
//!
//! 1. credential grammar, before anything else (401)
//! 2. job lookup (404)
//! 3. digest verification (403)
//! 4. result readiness, for result reads (404)

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use docconv_core::converter::Converter;
use docconv_core::error::CoreError;
use docconv_core::hashing::ChecksumBuilder;
use docconv_core::job::{JobError, JobErrorKind, JobRecord, JobStatus, NewJob};
use docconv_core::token::{CapabilitySecret, TokenAuthority, Verification};
use docconv_core::types::JobId;
use docconv_core::upload::{sanitize_filename, stored_extension, UploadPolicy};
use docconv_store::job_store::input_key;
use docconv_store::{JobStore, ObjectWriter, Storage};
use tokio::time::Instant;

use crate::execution::ExecutionPool;
use crate::pool::{WorkerContext, WorkerPool};
use crate::queue::SubmissionQueue;

/// Interval between store reads in [`JobLifecycleEngine::await_result`].
const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker loops.
    pub workers: usize,
    /// Maximum number of conversions executing at once.
    pub execution_slots: usize,
    /// Wall-clock budget per job.
    pub job_timeout: Duration,
    /// How long a timed-out job waits for its conversion to acknowledge
    /// cancellation before logging a warning. The slot is always reclaimed
    /// before the job is failed.
    pub cancel_grace: Duration,
    pub upload: UploadPolicy,
}

impl Default for EngineConfig {
    /// 4 workers, 4 slots, 30 minute timeout, 5 second grace.
    fn default() -> Self {
        Self {
            workers: 4,
            execution_slots: 4,
            job_timeout: Duration::from_secs(1800),
            cancel_grace: Duration::from_secs(5),
            upload: UploadPolicy::default(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), CoreError> {
        if self.workers == 0 {
            return Err(CoreError::Validation("workers must be at least 1".into()));
        }
        if self.execution_slots == 0 {
            return Err(CoreError::Validation(
                "execution_slots must be at least 1".into(),
            ));
        }
        if self.job_timeout.is_zero() {
            return Err(CoreError::Validation("job_timeout must be positive".into()));
        }
        if self.upload.allowed_content_types().is_empty() {
            return Err(CoreError::Validation(
                "at least one content type must be allowed".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// A whole upload held in memory, for [`JobLifecycleEngine::submit`].
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    /// Content type declared by the client, if any.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// An upload being streamed to storage, started by
/// [`JobLifecycleEngine::begin_upload`].
///
/// No job exists until [`JobLifecycleEngine::commit`] succeeds. Dropping a
/// pending upload discards the bytes written so far.
pub struct PendingUpload {
    id: JobId,
    filename: String,
    content_type: String,
    input_location: String,
    writer: Box<dyn ObjectWriter>,
    checksum: ChecksumBuilder,
    size_bytes: u64,
    policy: UploadPolicy,
}

impl PendingUpload {
    /// Append a chunk, enforcing the size limit before anything is written.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
        let size_bytes = self.size_bytes + chunk.len() as u64;
        self.policy.check_size(size_bytes)?;

        self.writer
            .write(chunk)
            .await
            .map_err(|e| CoreError::Internal(format!("Failed to store upload: {e}")))?;
        self.checksum.update(chunk);
        self.size_bytes = size_bytes;
        Ok(())
    }

    /// Id the job will carry once committed.
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// Result of a successful submission. `secret` is never shown again.
#[derive(Debug)]
pub struct Submission {
    pub record: JobRecord,
    pub secret: CapabilitySecret,
}

/// Markdown produced by a succeeded job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub record: JobRecord,
    pub markdown: String,
}

/// Outcome of [`JobLifecycleEngine::await_result`].
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(JobResult),
    /// The job failed; the record carries the classified error.
    Failed(JobRecord),
    /// The wait budget elapsed before the job became terminal.
    Pending(JobRecord),
}

/// What startup recovery did with the jobs found on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub interrupted: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct JobLifecycleEngine {
    store: JobStore,
    tokens: Arc<TokenAuthority>,
    queue: Arc<SubmissionQueue>,
    executor: Arc<ExecutionPool>,
    upload: UploadPolicy,
    workers: usize,
    pool: Mutex<Option<WorkerPool>>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for JobLifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLifecycleEngine")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl JobLifecycleEngine {
    /// Build the engine, recover jobs left by a previous process, then start
    /// the workers.
    pub async fn start(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        converter: Arc<dyn Converter>,
        tokens: Arc<TokenAuthority>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let store = JobStore::new(storage);
        let queue = Arc::new(SubmissionQueue::new());
        let executor = Arc::new(ExecutionPool::new(config.execution_slots));

        let recovery = recover(&store, &queue).await?;

        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            queue: Arc::clone(&queue),
            executor: Arc::clone(&executor),
            converter,
            job_timeout: config.job_timeout,
            cancel_grace: config.cancel_grace,
        });
        let pool = WorkerPool::spawn(config.workers, ctx);

        tracing::info!(
            workers = config.workers,
            execution_slots = config.execution_slots,
            job_timeout_secs = config.job_timeout.as_secs(),
            "Job lifecycle engine started",
        );

        Ok(Self {
            store,
            tokens,
            queue,
            executor,
            upload: config.upload,
            workers: config.workers,
            pool: Mutex::new(Some(pool)),
            recovery,
        })
    }

    // -- Submission ---------------------------------------------------------

    /// Validate an upload, persist it with a new `queued` record and enqueue
    /// the job. Rejected uploads leave no trace.
    pub async fn submit(&self, upload: Upload) -> Result<Submission, CoreError> {
        let mut pending = self
            .begin_upload(&upload.filename, upload.content_type.as_deref())
            .await?;
        pending.write(&upload.bytes).await?;
        self.commit(pending).await
    }

    /// Start a streamed submission. The name and type are checked here, the
    /// size as chunks arrive, and emptiness on [`commit`](Self::commit).
    pub async fn begin_upload(
        &self,
        filename: &str,
        content_type: Option<&str>,
    ) -> Result<PendingUpload, CoreError> {
        self.ensure_accepting()?;
        let filename = sanitize_filename(filename);
        let content_type = self.upload.resolve_content_type(content_type, &filename)?;

        let id = uuid::Uuid::new_v4();
        let input_location = input_key(id, &stored_extension(&filename));
        let writer = self
            .store
            .storage()
            .writer(&input_location)
            .await
            .map_err(|e| CoreError::Internal(format!("Failed to store upload: {e}")))?;

        Ok(PendingUpload {
            id,
            filename,
            content_type,
            input_location,
            writer,
            checksum: ChecksumBuilder::new(),
            size_bytes: 0,
            policy: self.upload.clone(),
        })
    }

    /// Turn a fully written upload into a `queued` job.
    ///
    /// If any step after the input lands fails, the job directory is removed
    /// again so that recovery never picks up a job nobody holds a secret for.
    pub async fn commit(&self, mut pending: PendingUpload) -> Result<Submission, CoreError> {
        if pending.size_bytes == 0 {
            return Err(CoreError::Validation("Uploaded file is empty".into()));
        }
        self.ensure_accepting()?;

        let tokens = Arc::clone(&self.tokens);
        let issued = tokio::task::spawn_blocking(move || tokens.issue())
            .await
            .map_err(|e| CoreError::Internal(format!("Token issuance task failed: {e}")))??;

        let id = pending.id;
        if let Err(e) = pending.writer.finish().await {
            self.discard(id).await;
            return Err(CoreError::Internal(format!("Failed to store upload: {e}")));
        }

        let size_bytes = pending.size_bytes;
        let record = JobRecord::new(NewJob {
            id,
            filename: pending.filename,
            content_type: pending.content_type,
            size_bytes,
            input_location: pending.input_location,
            checksum: pending.checksum.finish(),
            token_digest: issued.digest,
        });
        if let Err(e) = self.store.create(&record).await {
            self.discard(id).await;
            return Err(e.into());
        }

        // Only after the record is durable.
        if let Err(e) = self.queue.push(id) {
            self.discard(id).await;
            return Err(CoreError::Internal(format!("Job {id} could not be queued: {e}")));
        }

        tracing::info!(
            job_id = %id,
            filename = %record.filename(),
            content_type = %record.content_type(),
            size_bytes,
            "Job submitted",
        );

        Ok(Submission {
            record,
            secret: issued.secret,
        })
    }

    fn ensure_accepting(&self) -> Result<(), CoreError> {
        if self.queue.is_closed() {
            return Err(CoreError::Internal(
                "Job engine is shutting down and accepts no new jobs".into(),
            ));
        }
        Ok(())
    }

    async fn discard(&self, id: JobId) {
        if let Err(e) = self.store.discard(id).await {
            tracing::error!(job_id = %id, error = %e, "Failed to remove rejected job");
        }
    }

    // -- Reads -------------------------------------------------------------

    /// Current record of job `id`, if `secret` grants access to it.
    pub async fn get(&self, id: &str, secret: &str) -> Result<JobRecord, CoreError> {
        self.authorize(id, secret).await
    }

    /// The Markdown result, without waiting. Not-yet-succeeded jobs answer
    /// [`CoreError::ResultNotReady`].
    pub async fn result(&self, id: &str, secret: &str) -> Result<JobResult, CoreError> {
        let record = self.authorize(id, secret).await?;
        self.read_result(record).await
    }

    /// Wait up to `wait` for job `id` to reach a terminal state.
    pub async fn await_result(
        &self,
        id: &str,
        secret: &str,
        wait: Duration,
    ) -> Result<JobOutcome, CoreError> {
        let mut record = self.authorize(id, secret).await?;
        let deadline = Instant::now() + wait;

        while !record.is_terminal() && Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(AWAIT_POLL_INTERVAL.min(remaining)).await;
            record = self.store.load(record.id()).await?;
        }

        match record.status() {
            JobStatus::Succeeded => Ok(JobOutcome::Succeeded(self.read_result(record).await?)),
            JobStatus::Failed => Ok(JobOutcome::Failed(record)),
            JobStatus::Queued | JobStatus::Running => Ok(JobOutcome::Pending(record)),
        }
    }

    async fn authorize(&self, id: &str, presented: &str) -> Result<JobRecord, CoreError> {
        if !TokenAuthority::is_well_formed(presented) {
            return Err(CoreError::Unauthorized(
                "Missing or malformed credential".into(),
            ));
        }

        // Anything that is not a UUID cannot name a job directory.
        let job_id: JobId = id.parse().map_err(|_| CoreError::job_not_found(id))?;
        let record = self.store.load(job_id).await?;

        let tokens = Arc::clone(&self.tokens);
        let presented = presented.to_string();
        let digest = record.token_digest().to_string();
        let verdict = tokio::task::spawn_blocking(move || tokens.verify(&presented, &digest))
            .await
            .map_err(|e| CoreError::Internal(format!("Token verification task failed: {e}")))?;

        match verdict {
            Verification::Authorized => Ok(record),
            Verification::Unauthorized => Err(CoreError::Forbidden(
                "Credential does not grant access to this job".into(),
            )),
            Verification::Malformed => Err(CoreError::Unauthorized(
                "Missing or malformed credential".into(),
            )),
        }
    }

    async fn read_result(&self, record: JobRecord) -> Result<JobResult, CoreError> {
        if record.status() != JobStatus::Succeeded {
            return Err(CoreError::ResultNotReady {
                id: record.id().to_string(),
                status: record.status(),
            });
        }
        let location = record.output_location().ok_or_else(|| {
            CoreError::Internal(format!("Succeeded job {} has no output", record.id()))
        })?;
        let bytes = self
            .store
            .storage()
            .get(location)
            .await
            .map_err(|e| CoreError::Internal(format!("Failed to read result: {e}")))?;
        let markdown = String::from_utf8(bytes)
            .map_err(|e| CoreError::Internal(format!("Result is not UTF-8: {e}")))?;

        Ok(JobResult { record, markdown })
    }

    // -- Introspection -------------------------------------------------------

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn executions_in_flight(&self) -> usize {
        self.executor.in_use()
    }

    pub fn execution_slots(&self) -> usize {
        self.executor.slots()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn upload_policy(&self) -> &UploadPolicy {
        &self.upload
    }

    pub fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    // -- Shutdown ------------------------------------------------------------

    /// Stop the workers and wait for in-flight jobs to finish or time out.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            tracing::info!(queued = self.queue.len(), "Shutting down job lifecycle engine");
            pool.shutdown().await;
            self.executor.close();
        }
    }
}

/// Re-enqueue `queued` jobs in creation order and fail `running` jobs whose
/// worker died with the previous process.
async fn recover(store: &JobStore, queue: &SubmissionQueue) -> Result<RecoveryReport, CoreError> {
    let mut records = store.list().await?;
    records.sort_by_key(|r| r.created_at());

    let mut report = RecoveryReport::default();
    for mut record in records {
        match record.status() {
            JobStatus::Queued => {
                queue
                    .push(record.id())
                    .map_err(|e| CoreError::Internal(e.to_string()))?;
                report.requeued += 1;
            }
            JobStatus::Running => {
                record.fail(JobError::new(
                    JobErrorKind::Interrupted,
                    "Service stopped while the job was running",
                ))?;
                store.save(&record).await?;
                tracing::warn!(job_id = %record.id(), "Marked interrupted job as failed");
                report.interrupted += 1;
            }
            JobStatus::Succeeded | JobStatus::Failed => {}
        }
    }

    if report.requeued > 0 || report.interrupted > 0 {
        tracing::info!(
            requeued = report.requeued,
            interrupted = report.interrupted,
            "Recovered jobs from previous run",
        );
    }
    Ok(report)
}
