//! Batch jobs, results, and the chunk combination shared by both strategies.
//!
//! Both execution strategies split the account ids with [`partition`], sum each
//! chunk into a [`ChunkOutcome`], and hand the outcomes to [`combine`]. Because
//! the partition and the combination order depend only on the input, the
//! result is the same whichever strategy produced the chunks.

use crate::account::AccountId;
use crate::decimal::Decimal4;
use crate::error::{AggregationError, Error};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::ops::Range;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Execution model for a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Contiguous chunks summed in parallel on OS threads.
    #[default]
    Threaded,
    /// Single-threaded, suspending at every account fetch.
    Cooperative,
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "threaded" | "threads" => Ok(Strategy::Threaded),
            "cooperative" | "async" => Ok(Strategy::Cooperative),
            other => Err(Error::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Threaded => f.write_str("threaded"),
            Strategy::Cooperative => f.write_str("cooperative"),
        }
    }
}

/// Unique token identifying one batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One request to aggregate balances over a set of accounts.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub job_id: JobId,
    pub account_ids: Vec<AccountId>,
    pub strategy: Strategy,
    cancel: CancellationToken,
}

impl BatchJob {
    /// Validates the id list and creates a job.
    ///
    /// Fails with [`AggregationError::Empty`] for no ids and
    /// [`AggregationError::DuplicateId`] for the first repeated id.
    pub fn new(account_ids: Vec<AccountId>, strategy: Strategy) -> Result<Self, AggregationError> {
        if account_ids.is_empty() {
            return Err(AggregationError::Empty);
        }

        let mut seen = HashSet::with_capacity(account_ids.len());
        for id in &account_ids {
            if !seen.insert(id) {
                return Err(AggregationError::DuplicateId(id.clone()));
            }
        }

        Ok(BatchJob {
            job_id: JobId::new(),
            account_ids,
            strategy,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that cancels this job when triggered. Cloning is cheap.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Balance of one account inside a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountBalance {
    pub id: AccountId,
    pub balance: Decimal4,
}

/// Outcome of a completed aggregation.
///
/// # Invariants
///
/// - `total` equals the sum of `per_account` balances
/// - `count == per_account.len()` and `count + failed.len()` is the job size
/// - `per_account` and `failed` preserve the job's input order
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub job_id: JobId,
    pub strategy: Strategy,
    pub total: Decimal4,
    pub count: usize,
    pub per_account: Vec<AccountBalance>,
    /// Ids whose lookup failed, in input order.
    pub failed: Vec<AccountId>,
    /// Partial sum of every chunk, in chunk order.
    pub chunk_sums: Vec<Decimal4>,
    pub computed_at: DateTime<Utc>,
}

impl BatchResult {
    /// Balance recorded for `id`, `None` if absent or failed.
    pub fn balance_of(&self, id: &AccountId) -> Option<Decimal4> {
        self.per_account
            .iter()
            .find(|entry| &entry.id == id)
            .map(|entry| entry.balance)
    }

    /// Ids present in the result, in input order.
    pub fn account_ids(&self) -> Vec<&AccountId> {
        self.per_account.iter().map(|entry| &entry.id).collect()
    }

    /// True when totals, counts, and per-account balances are identical.
    /// Job ids, strategies, and timestamps are ignored.
    pub fn same_balances(&self, other: &BatchResult) -> bool {
        self.total == other.total
            && self.count == other.count
            && self.per_account == other.per_account
            && self.failed == other.failed
            && self.chunk_sums == other.chunk_sums
    }

    /// Writes `account,balance` rows in input order followed by a `total` row.
    pub fn write_csv<W: Write>(&self, writer: W) -> crate::error::Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["account", "balance"])?;
        for entry in &self.per_account {
            csv_writer.write_record([entry.id.as_str(), &entry.balance.to_string()])?;
        }
        csv_writer.write_record(["total", &self.total.to_string()])?;

        csv_writer.flush()?;
        Ok(())
    }
}

/// Splits `len` items into `min(workers, len)` contiguous ranges.
///
/// Range sizes differ by at most one; earlier ranges take the remainder.
/// `workers` below 1 is treated as 1.
pub fn partition(len: usize, workers: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }

    let chunks = workers.max(1).min(len);
    let base = len / chunks;
    let remainder = len % chunks;

    let mut ranges = Vec::with_capacity(chunks);
    let mut start = 0;
    for index in 0..chunks {
        let size = base + usize::from(index < remainder);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// Partial result for one chunk of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub index: usize,
    pub sum: Decimal4,
    /// Every id of the chunk in input order, with `None` for failed lookups.
    pub entries: Vec<(AccountId, Option<Decimal4>)>,
}

impl ChunkOutcome {
    pub fn new(index: usize) -> Self {
        ChunkOutcome {
            index,
            sum: Decimal4::ZERO,
            entries: Vec::new(),
        }
    }

    /// Adds one lookup result to the chunk. Fails with
    /// [`AggregationError::Overflow`] if the running sum leaves the 4-place range.
    pub fn record(
        &mut self,
        id: AccountId,
        balance: Option<Decimal4>,
    ) -> Result<(), AggregationError> {
        if let Some(balance) = balance {
            self.sum = self
                .sum
                .checked_add(balance)
                .ok_or(AggregationError::Overflow { chunk: self.index })?;
        }
        self.entries.push((id, balance));
        Ok(())
    }
}

/// Merges chunk outcomes into a result, combining partial sums by ascending
/// chunk index.
///
/// An overflow of the combined total is reported against the last chunk.
pub fn combine(
    job: &BatchJob,
    mut chunks: Vec<ChunkOutcome>,
) -> Result<BatchResult, AggregationError> {
    chunks.sort_by_key(|chunk| chunk.index);

    let mut per_account = Vec::with_capacity(job.account_ids.len());
    let mut failed = Vec::new();
    let mut chunk_sums = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        chunk_sums.push(chunk.sum);
        for (id, balance) in chunk.entries {
            match balance {
                Some(balance) => per_account.push(AccountBalance { id, balance }),
                None => failed.push(id),
            }
        }
    }

    if per_account.is_empty() {
        return Err(AggregationError::AllFailed {
            attempted: job.account_ids.len(),
        });
    }

    let total = Decimal4::checked_sum(chunk_sums.iter().copied()).ok_or(
        AggregationError::Overflow {
            chunk: chunk_sums.len().saturating_sub(1),
        },
    )?;
    Ok(BatchResult {
        job_id: job.job_id,
        strategy: job.strategy,
        total,
        count: per_account.len(),
        per_account,
        failed,
        chunk_sums,
        computed_at: Utc::now(),
    })
}
