//! FIFO hand-off of job ids from submitters to workers.
//!
//! Only ids travel through the queue; the record is already durable when an
//! id is pushed. The queue is unbounded and in-memory: anything still queued
//! at shutdown is found again on disk by startup recovery.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use docconv_core::types::JobId;
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
#[error("Submission queue is closed")]
pub struct QueueClosed;

#[derive(Default)]
struct QueueState {
    items: VecDeque<JobId>,
    closed: bool,
}

#[derive(Default)]
pub struct SubmissionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id`. Fails once the queue has been closed.
    pub fn push(&self, id: JobId) -> Result<(), QueueClosed> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            state.items.push_back(id);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the oldest id. Returns `None` once the queue is closed, even
    /// if ids are still waiting.
    pub async fn pop(&self) -> Option<JobId> {
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(id) = state.items.pop_front() {
                    return Some(id);
                }
            }

            notified.await;
        }
    }

    /// Stop handing out ids and wake every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
