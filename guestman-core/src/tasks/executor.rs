use crate::error::{GuestError, Result};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub type BoxedJob = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'static>>;

/// Runs a batch of jobs with a fixed concurrency degree.
///
/// Permits are taken in submission order, so with a degree of 1 the jobs run
/// strictly one after another in the order given.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    semaphore: Arc<Semaphore>,
}

impl TaskExecutor {
    pub fn new(concurrency: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(concurrency.max(1))) }
    }

    /// Run every job and return results in submission order.
    pub async fn run_all(&self, jobs: Vec<BoxedJob>) -> Vec<Result<Value>> {
        let count = jobs.len();
        let mut set = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let permit = self.semaphore.clone().acquire_owned().await;
            set.spawn(async move {
                let _permit = permit;
                (index, job.await)
            });
        }

        let mut results: Vec<Option<Result<Value>>> = (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => {
                    // the slot stays empty and is reported below
                    tracing::error!(error = %e, "Executor job panicked");
                }
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(GuestError::Internal("job aborted".to_string()))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serial_degree_keeps_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let jobs: Vec<BoxedJob> = (0..4u64)
            .map(|i| {
                let log = log.clone();
                Box::pin(async move {
                    log.lock().unwrap().push(format!("start-{}", i));
                    // later jobs finish faster, so overlap would reorder the log
                    tokio::time::sleep(Duration::from_millis(20 - i * 5)).await;
                    log.lock().unwrap().push(format!("end-{}", i));
                    Ok(json!(i))
                }) as BoxedJob
            })
            .collect();
        let results = TaskExecutor::new(1).run_all(jobs).await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[3].as_ref().unwrap(), &json!(3));
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec!["start-0", "end-0", "start-1", "end-1", "start-2", "end-2", "start-3", "end-3"]
        );
    }

    #[tokio::test]
    async fn test_errors_stay_in_place() {
        let jobs: Vec<BoxedJob> = vec![
            Box::pin(async { Ok(json!("ok")) }),
            Box::pin(async { Err(GuestError::Internal("boom".into())) }),
        ];
        let results = TaskExecutor::new(2).run_all(jobs).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
