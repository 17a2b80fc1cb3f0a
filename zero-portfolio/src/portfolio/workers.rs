//! Bounded pool of order-placement workers.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

/// Runs placement jobs concurrently, at most `max_workers` at a time.
///
/// Jobs are tracked until joined so `drain` can wait for every submission
/// started before it was called.
pub(crate) struct OrderWorkers {
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl OrderWorkers {
    pub(crate) fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Queue a job; returns immediately.
    pub(crate) fn spawn<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Order worker failed");
            }
        }

        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
    }

    /// Wait for every queued job to finish.
    pub(crate) async fn drain(&self) {
        loop {
            let mut batch = {
                let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *tasks)
            };
            if batch.is_empty() {
                return;
            }
            while let Some(finished) = batch.join_next().await {
                if let Err(e) = finished {
                    error!(error = %e, "Order worker failed");
                }
            }
        }
    }

    /// Jobs queued or running
    pub(crate) fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_waits_for_all_jobs() {
        let workers = OrderWorkers::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = done.clone();
            workers.spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        workers.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(workers.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let workers = OrderWorkers::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            workers.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        workers.drain().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
