//! Batch balance aggregation.
//!
//! Two execution strategies share [`partition`] and [`combine`]:
//!
//! - **Threaded**: one scoped OS thread per chunk, blocking `fetch` calls.
//! - **Cooperative**: a single task on a current-thread runtime, suspending
//!   at every `fetch_async` and yielding between fetches.
//!
//! Chunks are always combined in ascending index order, so both strategies
//! return the same total, per-account balances, and chunk sums for the same
//! input.
//!
//! A failed lookup is recorded as an absent account and the batch carries on.
//! Cancellation is checked before every chunk (threaded) or every fetch
//! (cooperative); a cancelled job reports no partial sums.
//!
//! Sums are checked: a chunk or total that leaves the 4-place range fails the
//! job with [`AggregationError::Overflow`] under either strategy.

use crate::account::{AccountId, AccountRecord};
use crate::batch::{combine, partition, BatchJob, BatchResult, ChunkOutcome, Strategy};
use crate::config::BatchConfig;
use crate::decimal::Decimal4;
use crate::error::{AggregationError, LookupError};
use crate::events::{Event, EventKind, EventSink, LogSink};
use crate::source::{AccountSource, InMemorySource};
use log::{debug, warn};
use std::sync::Arc;
use std::thread;

/// Runs batch jobs against an account source.
///
/// Cloning is cheap; clones share the source and the event sink.
#[derive(Clone)]
pub struct Aggregator {
    source: Arc<dyn AccountSource>,
    sink: Arc<dyn EventSink>,
    worker_count: usize,
}

impl Aggregator {
    /// `worker_count` below 1 is treated as 1.
    pub fn new(source: Arc<dyn AccountSource>, worker_count: usize) -> Self {
        Aggregator {
            source,
            sink: Arc::new(LogSink),
            worker_count: worker_count.max(1),
        }
    }

    pub fn from_config(source: Arc<dyn AccountSource>, config: &BatchConfig) -> Self {
        Self::new(source, config.worker_count)
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Validates `account_ids`, then runs the job to completion on the
    /// calling thread.
    ///
    /// A cooperative job gets a private current-thread runtime, so this must
    /// not be called from inside an async runtime for that strategy; use
    /// [`Aggregator::submit_batch_async`] there.
    pub fn submit_batch(
        &self,
        account_ids: Vec<AccountId>,
        strategy: Strategy,
    ) -> Result<BatchResult, AggregationError> {
        let job = BatchJob::new(account_ids, strategy)?;
        self.run(&job)
    }

    /// Async counterpart of [`Aggregator::submit_batch`]. Threaded jobs run on
    /// the blocking pool.
    pub async fn submit_batch_async(
        &self,
        account_ids: Vec<AccountId>,
        strategy: Strategy,
    ) -> Result<BatchResult, AggregationError> {
        let job = BatchJob::new(account_ids, strategy)?;
        self.run_async(job).await
    }

    /// Runs an already created job. Keep a [`BatchJob::cancel_token`] to
    /// cancel it from another thread.
    pub fn run(&self, job: &BatchJob) -> Result<BatchResult, AggregationError> {
        let result = match job.strategy {
            Strategy::Threaded => self.run_threaded(job),
            Strategy::Cooperative => self.run_cooperative_blocking(job),
        };
        self.report(job, result)
    }

    pub async fn run_async(&self, job: BatchJob) -> Result<BatchResult, AggregationError> {
        let result = match job.strategy {
            Strategy::Threaded => {
                let aggregator = self.clone();
                let blocking_job = job.clone();
                tokio::task::spawn_blocking(move || aggregator.run_threaded(&blocking_job))
                    .await
                    .unwrap_or_else(|e| Err(join_failure(&job, e)))
            }
            Strategy::Cooperative => self.run_cooperative(&job).await,
        };
        self.report(&job, result)
    }

    fn run_threaded(&self, job: &BatchJob) -> Result<BatchResult, AggregationError> {
        let ranges = partition(job.account_ids.len(), self.worker_count);
        debug!(
            "Job {}: summing {} accounts in {} chunks on threads",
            job.job_id,
            job.account_ids.len(),
            ranges.len()
        );

        let source: &dyn AccountSource = self.source.as_ref();
        let joined = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(ranges.len());
            for (index, range) in ranges.into_iter().enumerate() {
                let ids = &job.account_ids[range];
                let handle = thread::Builder::new()
                    .name(format!("bms-batch-{}", index))
                    .spawn_scoped(scope, move || sum_chunk(job, index, ids, source))?;
                handles.push(handle);
            }

            // Join all workers explicitly; an implicit scope join re-panics.
            let joined: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
            Ok::<_, AggregationError>(joined)
        })?;

        let mut chunks = Vec::with_capacity(joined.len());
        for (index, outcome) in joined.into_iter().enumerate() {
            match outcome {
                Ok(Ok(Some(chunk))) => chunks.push(chunk),
                Ok(Ok(None)) => return Err(AggregationError::Cancelled),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(AggregationError::WorkerPanicked { chunk: index }),
            }
        }

        if job.is_cancelled() {
            return Err(AggregationError::Cancelled);
        }
        combine(job, chunks)
    }

    fn run_cooperative_blocking(&self, job: &BatchJob) -> Result<BatchResult, AggregationError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(AggregationError::NestedRuntime);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        runtime.block_on(self.run_cooperative(job))
    }

    async fn run_cooperative(&self, job: &BatchJob) -> Result<BatchResult, AggregationError> {
        let ranges = partition(job.account_ids.len(), self.worker_count);
        debug!(
            "Job {}: fetching {} accounts cooperatively in {} chunks",
            job.job_id,
            job.account_ids.len(),
            ranges.len()
        );

        let mut chunks = Vec::with_capacity(ranges.len());
        for (index, range) in ranges.into_iter().enumerate() {
            let mut chunk = ChunkOutcome::new(index);
            for id in &job.account_ids[range] {
                if job.is_cancelled() {
                    return Err(AggregationError::Cancelled);
                }
                let fetched = self.source.fetch_async(id).await;
                chunk.record(id.clone(), balance_or_warn(job, id, fetched))?;
                tokio::task::yield_now().await;
            }
            chunks.push(chunk);
        }

        if job.is_cancelled() {
            return Err(AggregationError::Cancelled);
        }
        combine(job, chunks)
    }

    fn report(
        &self,
        job: &BatchJob,
        result: Result<BatchResult, AggregationError>,
    ) -> Result<BatchResult, AggregationError> {
        match &result {
            Ok(batch) => {
                for id in &batch.failed {
                    self.sink.record(Event::job(
                        EventKind::LookupFailed,
                        job.job_id,
                        format!("account={}", id),
                    ));
                }
                self.sink.record(Event::job(
                    EventKind::BatchCompleted,
                    job.job_id,
                    format!(
                        "strategy={} count={} failed={} total={}",
                        batch.strategy,
                        batch.count,
                        batch.failed.len(),
                        batch.total
                    ),
                ));
            }
            Err(e) => {
                self.sink.record(Event::job(
                    EventKind::BatchFailed,
                    job.job_id,
                    format!("strategy={} error={}", job.strategy, e),
                ));
            }
        }
        result
    }
}

/// Sums one chunk on a worker thread. `None` means the job was cancelled
/// before the chunk started.
fn sum_chunk(
    job: &BatchJob,
    index: usize,
    ids: &[AccountId],
    source: &dyn AccountSource,
) -> Result<Option<ChunkOutcome>, AggregationError> {
    if job.is_cancelled() {
        debug!("Job {}: chunk {} skipped after cancellation", job.job_id, index);
        return Ok(None);
    }

    let mut chunk = ChunkOutcome::new(index);
    for id in ids {
        let fetched = source.fetch(id);
        chunk.record(id.clone(), balance_or_warn(job, id, fetched))?;
    }
    Ok(Some(chunk))
}

fn balance_or_warn(
    job: &BatchJob,
    id: &AccountId,
    fetched: Result<AccountRecord, LookupError>,
) -> Option<Decimal4> {
    match fetched {
        Ok(record) => Some(record.balance),
        Err(e) => {
            warn!("Job {}: lookup of {} failed: {}", job.job_id, id, e);
            None
        }
    }
}

/// A panic in the blocking task is reported as such; an aborted task
/// (runtime shutting down) counts as a cancellation.
fn join_failure(job: &BatchJob, e: tokio::task::JoinError) -> AggregationError {
    if e.is_panic() {
        let message = panic_message(e.into_panic());
        warn!("Job {}: aggregation task panicked: {}", job.job_id, message);
        AggregationError::TaskPanicked(message)
    } else {
        warn!("Job {}: aggregation task was aborted", job.job_id);
        AggregationError::Cancelled
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic payload".to_string(),
        },
    }
}

/// Aggregates balances of in-hand records.
///
/// Fails on an empty slice or a repeated id. Records are served from an
/// in-memory source, so every lookup succeeds.
pub fn aggregate(
    records: &[AccountRecord],
    strategy: Strategy,
    worker_count: usize,
) -> Result<BatchResult, AggregationError> {
    let ids = records.iter().map(|record| record.id.clone()).collect();
    let job = BatchJob::new(ids, strategy)?;
    let source = InMemorySource::from_records(records.iter().cloned());
    Aggregator::new(Arc::new(source), worker_count).run(&job)
}
