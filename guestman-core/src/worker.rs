//! Named worker pools.
//!
//! A [`WorkerPool`] runs jobs on the tokio runtime while a semaphore bounds
//! how many of them execute at once. Jobs queue for a permit in submission
//! order. `guest-start` runs with capacity 1 so emulator launches never
//! overlap; `delay-task` carries everything else.

use crate::observability::metrics;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

pub const GUEST_START_WORKER: &str = "guest-start";
pub const DELAY_TASK_WORKER: &str = "delay-task";

#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs currently holding a permit.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Queue a job.
    pub fn submit<F>(&self, label: impl Into<String>, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_after(Duration::ZERO, label, job)
    }

    /// Queue a job that becomes eligible to run after `delay`.
    pub fn submit_after<F>(&self, delay: Duration, label: impl Into<String>, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let name = self.name;
        let semaphore = self.semaphore.clone();
        let active = self.active.clone();
        let span = tracing::info_span!("worker", worker = name, job = %label);
        tokio::spawn(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    warn!("Worker pool closed, dropping job");
                    return;
                };
                let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::set_worker_active(name, running);
                debug!("Job started");
                job.await;
                let running = active.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics::set_worker_active(name, running);
                debug!("Job finished");
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_concurrency_bound() {
        let pool = WorkerPool::new("test", 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                pool.submit(format!("job-{}", i), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_single_worker_serializes() {
        let pool = WorkerPool::new(GUEST_START_WORKER, 1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let order = order.clone();
            handles.push(pool.submit("start", async move {
                order.lock().unwrap().push(format!("begin-{}", i));
                tokio::time::sleep(Duration::from_millis(5)).await;
                order.lock().unwrap().push(format!("end-{}", i));
            }));
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap();
        }
        let order = order.lock().unwrap();
        for pair in order.chunks(2) {
            assert_eq!(pair[0].replace("begin", "end"), pair[1]);
        }
    }

    #[tokio::test]
    async fn test_submit_after_delays() {
        let pool = WorkerPool::new(DELAY_TASK_WORKER, 4);
        let start = tokio::time::Instant::now();
        pool.submit_after(Duration::from_millis(50), "delayed", async {}).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
