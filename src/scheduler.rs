//! Bounded-concurrency fetch scheduler.
//!
//! A fixed pool of K workers pulls jobs from a shared intake of capacity K.
//! Results land in a per-batch map keyed by [`LayerId`], written once per key.
//! The map can only be read through a [`CompletedBatch`], which is obtained
//! by [`Scheduler::finish`] after every worker has drained the intake and
//! exited, so results are never read while downloads are still writing them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use layerpull_hub::{FetchError, FetchedLayer, LayerId, RepositoryData};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};

use crate::source::LayerSource;
use crate::{Error, Result};

/// A unit of work keyed by the layer it produces.
#[async_trait]
pub trait Job: Send + 'static {
    type Output: Send + 'static;

    fn id(&self) -> &LayerId;

    /// Run the job to completion, successfully or not.
    async fn run(self) -> std::result::Result<Self::Output, FetchError>;
}

/// Downloads one layer through a [`LayerSource`].
pub struct FetchJob {
    id: LayerId,
    source: Arc<dyn LayerSource>,
    repo: Arc<RepositoryData>,
}

impl FetchJob {
    pub fn new(id: LayerId, source: Arc<dyn LayerSource>, repo: Arc<RepositoryData>) -> Self {
        Self { id, source, repo }
    }
}

#[async_trait]
impl Job for FetchJob {
    type Output = FetchedLayer;

    fn id(&self) -> &LayerId {
        &self.id
    }

    async fn run(self) -> std::result::Result<FetchedLayer, FetchError> {
        self.source.fetch_layer(&self.id, &self.repo).await
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Live counters for one batch.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    enqueued: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub enqueued: usize,
    /// Jobs that reached a terminal state, failed ones included.
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    /// Highest number of jobs observed running at once.
    pub peak_in_flight: usize,
}

impl SchedulerStats {
    fn job_started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn job_finished(&self, ok: bool) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        if !ok {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

type Outcome<T> = std::result::Result<T, FetchError>;
type ResultMap<T> = Arc<Mutex<HashMap<LayerId, Outcome<T>>>>;

/// Runs an unbounded stream of jobs, at most `concurrency` at a time.
///
/// Must be created inside a tokio runtime.
pub struct Scheduler<J: Job> {
    intake: mpsc::Sender<J>,
    workers: Vec<JoinHandle<()>>,
    results: ResultMap<J::Output>,
    stats: Arc<SchedulerStats>,
}

impl<J: Job> Scheduler<J> {
    /// Spawn `concurrency` workers. An optional `job_timeout` bounds each
    /// job's run time; jobs that exceed it fail with [`FetchError::Timeout`].
    pub fn new(concurrency: usize, job_timeout: Option<Duration>) -> Result<Self> {
        if concurrency == 0 {
            return Err(Error::Config(
                "scheduler concurrency must be at least 1".to_string(),
            ));
        }

        let (intake, rx) = mpsc::channel::<J>(concurrency);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let results: ResultMap<J::Output> = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(SchedulerStats::default());

        let workers = (0..concurrency)
            .map(|index| {
                let rx = Arc::clone(&rx);
                let results = Arc::clone(&results);
                let stats = Arc::clone(&stats);
                tokio::spawn(
                    worker_loop(rx, results, stats, job_timeout)
                        .instrument(tracing::debug_span!("fetch_worker", index)),
                )
            })
            .collect();

        Ok(Self {
            intake,
            workers,
            results,
            stats,
        })
    }

    /// Hand a job to the worker pool.
    ///
    /// Suspends while the intake is full. Each job id must be unique within
    /// the batch.
    pub async fn enqueue(&self, job: J) {
        self.stats.enqueued.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(job)) = self.intake.send(job).await {
            let id = job.id().clone();
            warn!(layer = %id, "worker pool is gone; job abandoned");
            self.stats.job_started();
            self.stats.job_finished(false);
            record(&self.results, id.clone(), Err(FetchError::Abandoned { layer: id }));
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Close the intake and wait until every enqueued job has a terminal
    /// state.
    pub async fn finish(self) -> CompletedBatch<J::Output> {
        let Self {
            intake,
            workers,
            results,
            stats,
        } = self;
        drop(intake);

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "fetch worker exited abnormally");
            }
        }

        let results = std::mem::take(&mut *lock(&results));
        CompletedBatch {
            results,
            stats: stats.snapshot(),
        }
    }
}

async fn worker_loop<J: Job>(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<J>>>,
    results: ResultMap<J::Output>,
    stats: Arc<SchedulerStats>,
    job_timeout: Option<Duration>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        let id = job.id().clone();
        debug!(layer = %id, "job started");
        stats.job_started();
        let outcome = run_job(job, &id, job_timeout).await;
        stats.job_finished(outcome.is_ok());
        match &outcome {
            Ok(_) => debug!(layer = %id, "job finished"),
            Err(e) => warn!(layer = %id, error = %e, "job failed"),
        }
        record(&results, id, outcome);
    }
}

/// Run `job` on its own task so a panic or a deadline only takes down the
/// job, never the worker.
async fn run_job<J: Job>(job: J, id: &LayerId, job_timeout: Option<Duration>) -> Outcome<J::Output> {
    let mut handle = tokio::spawn(job.run());

    let joined = match job_timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(FetchError::Timeout {
                    layer: id.clone(),
                    limit,
                });
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(FetchError::Panicked { layer: id.clone() }),
        Err(_) => Err(FetchError::Abandoned { layer: id.clone() }),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record<T>(results: &Mutex<HashMap<LayerId, Outcome<T>>>, id: LayerId, outcome: Outcome<T>) {
    let previous = lock(results).insert(id.clone(), outcome);
    if previous.is_some() {
        warn!(layer = %id, "layer scheduled twice in one batch; keeping the latest result");
    }
}

// ---------------------------------------------------------------------------
// CompletedBatch
// ---------------------------------------------------------------------------

/// Why [`CompletedBatch::take`] produced no result.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// The id was never enqueued, or its result was already taken.
    #[error("layer {0} is not part of this batch")]
    NotFound(LayerId),

    /// The job ran and failed.
    #[error(transparent)]
    Failed(FetchError),
}

/// Terminal states of every job in a drained batch.
///
/// Results that are never taken are dropped with the batch, which releases
/// any open layer streams they hold.
pub struct CompletedBatch<T> {
    results: HashMap<LayerId, Outcome<T>>,
    stats: StatsSnapshot,
}

impl<T> CompletedBatch<T> {
    /// Move the result for `id` out of the batch.
    pub fn take(&mut self, id: &LayerId) -> std::result::Result<T, BatchError> {
        match self.results.remove(id) {
            Some(Ok(output)) => Ok(output),
            Some(Err(e)) => Err(BatchError::Failed(e)),
            None => Err(BatchError::NotFound(id.clone())),
        }
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.results.contains_key(id)
    }

    /// Ids whose job failed, in no particular order.
    pub fn failed(&self) -> Vec<&LayerId> {
        self.results
            .iter()
            .filter(|(_, outcome)| outcome.is_err())
            .map(|(id, _)| id)
            .collect()
    }

    /// Results not yet taken.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
