//! Bounded pool for blocking conversion work.
//!
//! Conversions run on tokio's blocking thread pool, never on the async
//! workers that dequeue jobs and persist records. A semaphore caps how many
//! run at once; the permit moves into the blocking closure, so a slot is
//! only returned when the conversion has actually stopped running.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
#[error("Execution pool is closed")]
pub struct ExecutionPoolClosed;

pub struct ExecutionPool {
    permits: Arc<Semaphore>,
    slots: usize,
}

impl ExecutionPool {
    pub fn new(slots: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(slots)),
            slots,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Number of slots currently held by running conversions.
    pub fn in_use(&self) -> usize {
        self.slots.saturating_sub(self.permits.available_permits())
    }

    /// Wait for a free slot, then run `task` on the blocking thread pool.
    ///
    /// Dropping the returned future before a slot is granted leaves the pool
    /// untouched. Dropping the [`JoinHandle`] does not stop `task`.
    pub async fn spawn<F, R>(&self, task: F) -> Result<JoinHandle<R>, ExecutionPoolClosed>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ExecutionPoolClosed)?;

        Ok(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        }))
    }

    /// Refuse further work. Running tasks keep their slots until they return.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_runs_more_than_slots() {
        let pool = Arc::new(ExecutionPool::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.spawn(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap()
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn slot_is_held_until_task_returns() {
        let pool = ExecutionPool::new(1);
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let handle = pool
            .spawn(move || {
                let _ = release_rx.recv();
            })
            .await
            .unwrap();
        assert_eq!(pool.in_use(), 1);

        release_tx.send(()).unwrap();
        handle.await.unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn panicking_task_releases_its_slot() {
        let pool = ExecutionPool::new(1);
        let handle = pool.spawn(|| -> u8 { panic!("boom") }).await.unwrap();
        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn closed_pool_refuses_work() {
        let pool = ExecutionPool::new(1);
        pool.close();
        assert_matches!(pool.spawn(|| ()).await, Err(ExecutionPoolClosed));
    }
}
