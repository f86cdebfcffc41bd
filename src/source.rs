//! Account snapshot sources.
//!
//! The aggregator only ever sees accounts through [`AccountSource`]. The
//! blocking `fetch` is used by worker threads; `fetch_async` is the
//! suspension point for cooperative aggregation.

use crate::account::{AccountId, AccountRecord};
use crate::error::{LookupError, Result};
use async_trait::async_trait;
use csv::{ReaderBuilder, Trim};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::time::Duration;

/// Supplies account snapshots by id.
#[async_trait]
pub trait AccountSource: Send + Sync {
    /// Blocking lookup.
    fn fetch(&self, id: &AccountId) -> std::result::Result<AccountRecord, LookupError>;

    /// Lookup that yields to the scheduler before returning.
    async fn fetch_async(&self, id: &AccountId) -> std::result::Result<AccountRecord, LookupError> {
        tokio::task::yield_now().await;
        self.fetch(id)
    }
}

/// Source backed by a map of records, with optional simulated latency.
#[derive(Debug, Default, Clone)]
pub struct InMemorySource {
    records: HashMap<AccountId, AccountRecord>,
    /// Ids in insertion order.
    order: Vec<AccountId>,
    latency: Option<Duration>,
    unavailable: HashSet<AccountId>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a source from records. A repeated id keeps the first record.
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = AccountRecord>,
    {
        let mut source = Self::new();
        for record in records {
            source.insert(record);
        }
        source
    }

    /// Loads `id,owner_name,balance` rows from CSV.
    ///
    /// Malformed rows are logged at warn level and skipped; an I/O failure
    /// aborts the load.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);

        let mut source = Self::new();
        for (row_idx, result) in csv_reader.deserialize::<AccountRecord>().enumerate() {
            let row_num = row_idx + 2; // 1-indexed, after the header row

            match result {
                Ok(record) => {
                    if !source.insert(record) {
                        warn!("Row {}: duplicate account id, keeping first row", row_num);
                    }
                }
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(e) => warn!("Row {}: skipping malformed account: {}", row_num, e),
            }
        }

        debug!("Loaded {} accounts from CSV", source.len());
        Ok(source)
    }

    /// Inserts a record, returning `false` if the id was already present.
    pub fn insert(&mut self, record: AccountRecord) -> bool {
        if self.records.contains_key(&record.id) {
            return false;
        }
        self.order.push(record.id.clone());
        self.records.insert(record.id.clone(), record);
        true
    }

    /// Every lookup sleeps for `latency` first, simulating a remote fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes lookups of `id` fail with [`LookupError::Unavailable`].
    pub fn mark_unavailable(&mut self, id: impl Into<AccountId>) {
        self.unavailable.insert(id.into());
    }

    /// Account ids in the order they were inserted.
    pub fn ids(&self) -> &[AccountId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lookup(&self, id: &AccountId) -> std::result::Result<AccountRecord, LookupError> {
        if self.unavailable.contains(id) {
            return Err(LookupError::Unavailable {
                id: id.clone(),
                reason: "source offline".to_string(),
            });
        }
        self.records
            .get(id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(id.clone()))
    }
}

#[async_trait]
impl AccountSource for InMemorySource {
    fn fetch(&self, id: &AccountId) -> std::result::Result<AccountRecord, LookupError> {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        self.lookup(id)
    }

    async fn fetch_async(&self, id: &AccountId) -> std::result::Result<AccountRecord, LookupError> {
        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }
        self.lookup(id)
    }
}
