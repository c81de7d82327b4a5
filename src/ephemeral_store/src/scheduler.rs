use crate::{BandwidthConfiguration, CopyReason, EphemeralCacheConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerFailureCode {
    /// The admission gate itself timed out before the operation ran.
    Timeout,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSummary {
    pub queue_wait: Duration,
}

pub enum ScheduleResult<T> {
    Executed(T, SchedulerSummary),
    Failed(SchedulerFailureCode),
}

/// Admission control for outbound copies: bounded concurrency per
/// direction, with queue-wait accounting. The gate decides *when* an
/// operation runs; the operation result is handed back untouched.
pub struct CopyScheduler {
    pull_gate: Arc<Semaphore>,
    push_gate: Arc<Semaphore>,
    admission_timeout: Duration,
    bandwidth_configurations: Vec<BandwidthConfiguration>,
}

impl CopyScheduler {
    pub fn new(config: &EphemeralCacheConfig) -> Self {
        Self {
            pull_gate: Arc::new(Semaphore::new(config.max_concurrent_pulls.max(1))),
            push_gate: Arc::new(Semaphore::new(config.max_concurrent_pushes.max(1))),
            admission_timeout: config.scheduler_admission_timeout(),
            bandwidth_configurations: config.bandwidth_configurations.clone(),
        }
    }

    /// Bandwidth profile for an attempt. Index -1 (or any index past
    /// the table) yields the default profile.
    pub fn bandwidth_for_attempt(&self, attempt: i32) -> BandwidthConfiguration {
        if attempt < 0 {
            return BandwidthConfiguration::default();
        }
        self.bandwidth_configurations
            .get(attempt as usize)
            .copied()
            .unwrap_or_default()
    }

    pub async fn schedule_pull<T, F, Fut>(
        &self,
        reason: CopyReason,
        attempt: i32,
        operation: F,
    ) -> ScheduleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.schedule(&self.pull_gate, "pull", reason, attempt, operation)
            .await
    }

    pub async fn schedule_push<T, F, Fut>(
        &self,
        reason: CopyReason,
        attempt: i32,
        operation: F,
    ) -> ScheduleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.schedule(&self.push_gate, "push", reason, attempt, operation)
            .await
    }

    async fn schedule<T, F, Fut>(
        &self,
        gate: &Arc<Semaphore>,
        direction: &str,
        reason: CopyReason,
        attempt: i32,
        operation: F,
    ) -> ScheduleResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let enqueued = Instant::now();
        let permit = match tokio::time::timeout(self.admission_timeout, gate.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(
                    "scheduler: {} admission timed out, reason:{:?} attempt:{}",
                    direction, reason, attempt
                );
                return ScheduleResult::Failed(SchedulerFailureCode::Timeout);
            }
        };
        let queue_wait = enqueued.elapsed();

        let result = operation().await;
        drop(permit);
        ScheduleResult::Executed(result, SchedulerSummary { queue_wait })
    }
}
