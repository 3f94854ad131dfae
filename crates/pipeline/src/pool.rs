//! Fixed-size worker pool.
//!
//! Each worker is an independent Tokio task that polls the store for pending
//! jobs, races the other workers for a lease, and runs the winner through
//! [`executor::execute`]. Empty polls back off exponentially with jitter so
//! an idle pool does not hammer the database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audionorm_db::models::job::Job;
use audionorm_db::repositories::JobRepo;
use audionorm_db::StoreError;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::PipelineContext;
use crate::executor;

/// Candidates fetched per poll; a worker tries them in order until one lease wins.
const FETCH_BATCH: i64 = 16;

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Tracks how many workers are currently executing a job.
#[derive(Debug)]
pub struct PoolCapacity {
    busy: AtomicUsize,
    max_workers: usize,
}

impl PoolCapacity {
    pub fn new(max_workers: usize) -> Self {
        Self {
            busy: AtomicUsize::new(0),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub fn all_busy(&self) -> bool {
        self.busy() >= self.max_workers
    }

    /// Mark one worker busy until the returned guard is dropped.
    pub fn acquire(self: &Arc<Self>) -> BusyGuard {
        self.busy.fetch_add(1, Ordering::AcqRel);
        BusyGuard {
            capacity: Arc::clone(self),
        }
    }
}

/// Releases a busy slot on drop.
#[derive(Debug)]
pub struct BusyGuard {
    capacity: Arc<PoolCapacity>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.capacity.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential poll back-off between `min` and `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Delay to sleep now; doubles the base for the next call.
    ///
    /// The returned delay is drawn uniformly from `[base / 2, base]`, never
    /// below `min`, so that idle workers started together drift apart.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let factor = rand::rng().random_range(0.5..=1.0);
        base.mul_f64(factor).max(self.min.min(base))
    }

    /// Return to the minimum delay after a successful lease.
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Handles to the spawned worker tasks.
pub struct WorkerPool {
    workers: Vec<(String, JoinHandle<()>)>,
}

impl WorkerPool {
    /// Spawn `config.max_workers` workers. They run until `shutdown` fires.
    pub fn spawn(ctx: PipelineContext, shutdown: CancellationToken) -> Self {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let short = &run_id[..8];

        let workers = (0..ctx.config.max_workers)
            .map(|n| {
                let worker_id = format!("{}-w{n}-{short}", ctx.config.worker_prefix);
                let handle = tokio::spawn(run_worker(
                    ctx.clone(),
                    worker_id.clone(),
                    shutdown.clone(),
                ));
                (worker_id, handle)
            })
            .collect::<Vec<_>>();

        tracing::info!(
            workers = workers.len(),
            lease_secs = ctx.config.lease_duration.as_secs(),
            timeout_secs = ctx.config.per_job_timeout.as_secs(),
            "Worker pool started",
        );
        Self { workers }
    }

    /// Wait for every worker to exit (after `shutdown` has been cancelled).
    pub async fn join(self) {
        for (worker_id, handle) in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(worker_id, error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

/// One worker's poll-lease-execute loop.
async fn run_worker(ctx: PipelineContext, worker_id: String, shutdown: CancellationToken) {
    let mut backoff = Backoff::new(ctx.config.poll_interval_min, ctx.config.poll_interval_max);
    tracing::debug!(worker_id, "Worker started");

    while !shutdown.is_cancelled() {
        match lease_next(&ctx, &worker_id).await {
            Ok(Some(job)) => {
                backoff.reset();
                let _busy = ctx.capacity.acquire();
                executor::execute(&ctx, &worker_id, job, &shutdown).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Failed to poll for pending jobs");
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(worker_id, "Worker stopped");
}

/// Try to lease the oldest pending job.
///
/// Candidates are attempted in submission order; losing a race simply moves
/// on to the next one. Returns `None` when nothing could be leased.
pub async fn lease_next(ctx: &PipelineContext, worker_id: &str) -> Result<Option<Job>, StoreError> {
    let candidates = JobRepo::fetch_pending(&ctx.db, FETCH_BATCH).await?;

    for job in candidates {
        if JobRepo::try_lease(&ctx.db, job.id, worker_id, ctx.config.lease_duration).await? {
            return Ok(Some(job));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));

        for expected_base in [100, 200, 350, 350] {
            let base = backoff.current();
            assert_eq!(base, Duration::from_millis(expected_base));
            let delay = backoff.next_delay();
            assert!(delay <= base, "{delay:?} exceeds {base:?}");
            assert!(delay >= base / 2, "{delay:?} below half of {base:?}");
        }
    }

    #[test]
    fn backoff_reset_returns_to_minimum() {
        let mut backoff = Backoff::new(Duration::from_millis(50), Duration::from_secs(1));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(50));
    }

    #[test]
    fn busy_guard_releases_on_drop() {
        let capacity = Arc::new(PoolCapacity::new(2));
        let first = capacity.acquire();
        assert_eq!(capacity.busy(), 1);
        assert!(!capacity.all_busy());

        let second = capacity.acquire();
        assert!(capacity.all_busy());

        drop(first);
        drop(second);
        assert_eq!(capacity.busy(), 0);
    }
}
