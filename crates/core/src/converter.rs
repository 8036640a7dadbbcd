//! Document conversion capability.
//!
//! A [`Converter`] turns one uploaded document into Markdown. Implementations
//! are blocking and CPU-bound; the worker runs them on the bounded execution
//! pool, never on the async runtime.
//!
//! Conversions receive a [`ConversionContext`] that carries the progress sink
//! and the job's cancellation token. Long conversions call
//! [`ConversionContext::checkpoint`] between units of work so a timeout can
//! stop them and free their execution slot.

use tokio_util::sync::CancellationToken;

use crate::types::JobId;

/// Bytes and metadata of the document being converted.
#[derive(Debug, Clone)]
pub struct ConversionInput {
    pub job_id: JobId,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Named extra output stored under the job's `artifacts/` directory.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// A successful conversion.
#[derive(Debug, Clone, Default)]
pub struct ConversionOutput {
    pub markdown: String,
    pub artifacts: Vec<OutputArtifact>,
}

impl ConversionOutput {
    pub fn markdown(markdown: impl Into<String>) -> Self {
        Self {
            markdown: markdown.into(),
            artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("Conversion failed: {0}")]
    Failed(String),

    #[error("Conversion cancelled")]
    Cancelled,
}

/// Receives progress updates from a running conversion.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8);
}

/// Per-conversion handle passed to [`Converter::convert`].
pub struct ConversionContext<'a> {
    progress: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
}

impl<'a> ConversionContext<'a> {
    pub fn new(progress: &'a dyn ProgressSink, cancel: &'a CancellationToken) -> Self {
        Self { progress, cancel }
    }

    /// Report progress in percent. Ignored once the job was cancelled.
    pub fn report(&self, percent: u8) {
        if !self.cancel.is_cancelled() {
            self.progress.report(percent.min(100));
        }
    }

    /// Report `done` out of `total` units of work.
    pub fn report_fraction(&self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let percent = (done.min(total) * 100 / total) as u8;
        self.report(percent);
    }

    /// Return [`ConversionError::Cancelled`] if the job was cancelled.
    pub fn checkpoint(&self) -> Result<(), ConversionError> {
        if self.cancel.is_cancelled() {
            Err(ConversionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Blocking document-to-Markdown conversion.
pub trait Converter: Send + Sync + 'static {
    fn convert(
        &self,
        input: &ConversionInput,
        ctx: &ConversionContext<'_>,
    ) -> Result<ConversionOutput, ConversionError>;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u8>>);

    impl ProgressSink for Recorder {
        fn report(&self, percent: u8) {
            self.0.lock().unwrap().push(percent);
        }
    }

    #[test]
    fn fractions_map_to_percent() {
        let sink = Recorder::default();
        let cancel = CancellationToken::new();
        let ctx = ConversionContext::new(&sink, &cancel);

        ctx.report_fraction(1, 4);
        ctx.report_fraction(4, 4);
        ctx.report_fraction(9, 4);
        ctx.report_fraction(1, 0);

        assert_eq!(*sink.0.lock().unwrap(), vec![25, 100, 100]);
    }

    #[test]
    fn cancellation_silences_progress_and_fails_checkpoint() {
        let sink = Recorder::default();
        let cancel = CancellationToken::new();
        let ctx = ConversionContext::new(&sink, &cancel);

        assert!(ctx.checkpoint().is_ok());
        cancel.cancel();
        ctx.report(50);

        assert!(sink.0.lock().unwrap().is_empty());
        assert!(matches!(ctx.checkpoint(), Err(ConversionError::Cancelled)));
    }
}
