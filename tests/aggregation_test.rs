//! Integration tests for batch aggregation across both strategies.

use async_trait::async_trait;
use bms_batch::{
    aggregate, AccountId, AccountRecord, AccountSource, AggregationError, Aggregator, BatchJob,
    Decimal4, EventKind, InMemorySource, LookupError, MemorySink, Strategy,
};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn dec(s: &str) -> Decimal4 {
    Decimal4::from_str(s).unwrap()
}

/// `n` accounts with mixed-sign fractional balances.
fn accounts(n: usize) -> Vec<AccountRecord> {
    (0..n)
        .map(|i| {
            let cents = (i as i64 * 7919) % 100_000 - 40_000;
            AccountRecord::new(
                format!("ACC{:04}", i),
                format!("Owner {}", i),
                dec(&format!("{}.{:04}", cents / 100, (cents % 100).abs() * 37)),
            )
        })
        .collect()
}

fn ids_of(records: &[AccountRecord]) -> Vec<AccountId> {
    records.iter().map(|r| r.id.clone()).collect()
}

/// Wraps a source and logs the id of every async fetch, in the order the
/// fetches start.
struct RecordingSource {
    inner: InMemorySource,
    fetched: Mutex<Vec<AccountId>>,
}

impl RecordingSource {
    fn new(inner: InMemorySource) -> Self {
        RecordingSource {
            inner,
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn fetched(&self) -> Vec<AccountId> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccountSource for RecordingSource {
    fn fetch(&self, id: &AccountId) -> Result<AccountRecord, LookupError> {
        self.inner.fetch(id)
    }

    async fn fetch_async(&self, id: &AccountId) -> Result<AccountRecord, LookupError> {
        self.fetched.lock().unwrap().push(id.clone());
        self.inner.fetch_async(id).await
    }
}

// ==================== STRATEGY EQUIVALENCE ====================

#[test]
fn test_strategies_agree_across_sizes_and_worker_counts() {
    for n in [1, 2, 3, 7, 16, 61] {
        let records = accounts(n);
        let expected: Decimal4 = records.iter().map(|r| r.balance).sum();

        for workers in [1, 2, 3, 8, 100] {
            let threaded = aggregate(&records, Strategy::Threaded, workers).unwrap();
            let cooperative = aggregate(&records, Strategy::Cooperative, workers).unwrap();

            assert!(
                threaded.same_balances(&cooperative),
                "strategies disagree for n={} workers={}",
                n,
                workers
            );
            assert_eq!(threaded.total, expected);
            assert_eq!(threaded.count, n);
            assert_eq!(threaded.chunk_sums.len(), workers.min(n));

            let order: Vec<AccountId> = threaded.per_account.iter().map(|e| e.id.clone()).collect();
            assert_eq!(order, ids_of(&records));
        }
    }
}

#[test]
fn test_total_equals_sum_of_per_account() {
    let result = aggregate(&accounts(25), Strategy::Threaded, 4).unwrap();
    let summed: Decimal4 = result.per_account.iter().map(|e| e.balance).sum();
    assert_eq!(result.total, summed);
    let chunk_total: Decimal4 = result.chunk_sums.iter().sum();
    assert_eq!(result.total, chunk_total);
}

#[test]
fn test_documented_scenario() {
    let records = vec![
        AccountRecord::new("A1", "Alice", Decimal4::from_units(100)),
        AccountRecord::new("A2", "Bob", Decimal4::from_units(250)),
        AccountRecord::new("A3", "Carol", Decimal4::from_units(-30)),
    ];

    for strategy in [Strategy::Threaded, Strategy::Cooperative] {
        let result = aggregate(&records, strategy, 2).unwrap();
        assert_eq!(result.total.to_string(), "320.0000");
        assert_eq!(result.count, 3);
        let order: Vec<&str> = result.per_account.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["A1", "A2", "A3"]);
    }
}

// ==================== VALIDATION ====================

#[test]
fn test_empty_batch_fails() {
    let aggregator = Aggregator::new(Arc::new(InMemorySource::new()), 2);
    assert!(matches!(
        aggregator.submit_batch(Vec::new(), Strategy::Threaded),
        Err(AggregationError::Empty)
    ));
}

#[test]
fn test_duplicate_id_fails_before_any_lookup() {
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::new(Arc::new(InMemorySource::from_records(accounts(2))), 2)
        .with_sink(sink.clone());

    let a = AccountId::from("ACC0000");
    let result = aggregator.submit_batch(vec![a.clone(), a], Strategy::Cooperative);
    assert!(matches!(result, Err(AggregationError::DuplicateId(ref id)) if id.as_str() == "ACC0000"));
    assert!(sink.events().is_empty());
}

// ==================== PARTIAL FAILURE ====================

#[test]
fn test_one_failed_lookup_out_of_n() {
    let records = accounts(6);
    let mut source = InMemorySource::from_records(records.clone());
    source.mark_unavailable("ACC0003");
    let aggregator = Aggregator::new(Arc::new(source), 3);

    let expected: Decimal4 = records
        .iter()
        .filter(|r| r.id.as_str() != "ACC0003")
        .map(|r| r.balance)
        .sum();

    let threaded = aggregator
        .submit_batch(ids_of(&records), Strategy::Threaded)
        .unwrap();
    let cooperative = aggregator
        .submit_batch(ids_of(&records), Strategy::Cooperative)
        .unwrap();

    for result in [&threaded, &cooperative] {
        assert_eq!(result.count, 5);
        assert_eq!(result.total, expected);
        assert_eq!(result.failed, vec![AccountId::from("ACC0003")]);
    }
    assert!(threaded.same_balances(&cooperative));
}

#[test]
fn test_unknown_id_counts_as_failed_lookup() {
    let records = accounts(2);
    let aggregator = Aggregator::new(Arc::new(InMemorySource::from_records(records.clone())), 2);

    let mut ids = ids_of(&records);
    ids.push(AccountId::from("MISSING"));
    let result = aggregator.submit_batch(ids, Strategy::Threaded).unwrap();
    assert_eq!(result.count, 2);
    assert_eq!(result.failed, vec![AccountId::from("MISSING")]);
}

#[test]
fn test_all_failed_lookups() {
    let records = accounts(3);
    let mut source = InMemorySource::from_records(records.clone());
    for record in &records {
        source.mark_unavailable(record.id.clone());
    }
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::new(Arc::new(source), 2).with_sink(sink.clone());

    for strategy in [Strategy::Threaded, Strategy::Cooperative] {
        assert!(matches!(
            aggregator.submit_batch(ids_of(&records), strategy),
            Err(AggregationError::AllFailed { attempted: 3 })
        ));
    }
    assert_eq!(sink.count(EventKind::BatchFailed), 2);
}

// ==================== ASYNC AND CANCELLATION ====================

#[tokio::test]
async fn test_async_submission_for_both_strategies() {
    let records = accounts(12);
    let aggregator = Aggregator::new(Arc::new(InMemorySource::from_records(records.clone())), 4);

    let threaded = aggregator
        .submit_batch_async(ids_of(&records), Strategy::Threaded)
        .await
        .unwrap();
    let cooperative = aggregator
        .submit_batch_async(ids_of(&records), Strategy::Cooperative)
        .await
        .unwrap();
    assert!(threaded.same_balances(&cooperative));
}

#[tokio::test]
async fn test_concurrent_cooperative_jobs_interleave_on_one_thread() {
    let records = accounts(10);
    let source = Arc::new(RecordingSource::new(InMemorySource::from_records(
        records.clone(),
    )));
    let aggregator = Aggregator::new(source.clone(), 3);
    let first_ids = ids_of(&records[..5]);
    let second_ids = ids_of(&records[5..]);

    let (first, second) = tokio::join!(
        aggregator.submit_batch_async(first_ids.clone(), Strategy::Cooperative),
        aggregator.submit_batch_async(second_ids.clone(), Strategy::Cooperative),
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.count + second.count, 10);
    let expected: Decimal4 = records.iter().map(|r| r.balance).sum();
    assert_eq!(first.total + second.total, expected);

    // Positions of each job's fetches in the shared log.
    let fetched = source.fetched();
    assert_eq!(fetched.len(), 10);
    let positions = |ids: &[AccountId]| -> Vec<usize> {
        fetched
            .iter()
            .enumerate()
            .filter(|(_, id)| ids.contains(id))
            .map(|(pos, _)| pos)
            .collect()
    };
    let first_at = positions(&first_ids);
    let second_at = positions(&second_ids);
    assert_eq!(first_at.len(), 5);
    assert_eq!(second_at.len(), 5);

    // Neither job ran to completion before the other started.
    assert!(second_at[0] < first_at[4], "log: {:?}", fetched);
    assert!(first_at[0] < second_at[4], "log: {:?}", fetched);
    // Each job fetches its own ids in input order.
    let first_order: Vec<&AccountId> = first_at.iter().map(|&pos| &fetched[pos]).collect();
    assert_eq!(first_order, first_ids.iter().collect::<Vec<_>>());
}

#[test]
fn test_overflowing_balances_fail_the_same_way_for_both_strategies() {
    let largest = dec("7922816251426433759354395.0335");
    let records = vec![
        AccountRecord::new("BIG1", "Alice", largest),
        AccountRecord::new("BIG2", "Bob", largest),
        AccountRecord::new("NEG", "Carol", -largest),
    ];
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::new(Arc::new(InMemorySource::from_records(records.clone())), 2)
        .with_sink(sink.clone());

    for strategy in [Strategy::Threaded, Strategy::Cooperative] {
        assert!(matches!(
            aggregator.submit_batch(ids_of(&records[..2]), strategy),
            Err(AggregationError::Overflow { .. })
        ));
        // Order matters: the same balances in another order stay in range.
        let result = aggregator
            .submit_batch(ids_of(&[records[0].clone(), records[2].clone(), records[1].clone()]), strategy)
            .unwrap();
        assert_eq!(result.total, largest);
    }
    assert_eq!(sink.count(EventKind::BatchFailed), 2);
}

#[tokio::test]
async fn test_overflow_under_async_submission_is_not_a_cancellation() {
    let largest = dec("7922816251426433759354395.0335");
    let records = vec![
        AccountRecord::new("BIG1", "Alice", largest),
        AccountRecord::new("BIG2", "Bob", largest),
    ];
    let aggregator = Aggregator::new(Arc::new(InMemorySource::from_records(records.clone())), 2);

    for strategy in [Strategy::Threaded, Strategy::Cooperative] {
        let result = aggregator.submit_batch_async(ids_of(&records), strategy).await;
        assert!(
            matches!(result, Err(AggregationError::Overflow { .. })),
            "{}: {:?}",
            strategy,
            result
        );
    }
}

#[tokio::test]
async fn test_cooperative_job_cancelled_mid_run() {
    let records = accounts(20);
    let source = InMemorySource::from_records(records.clone()).with_latency(Duration::from_millis(10));
    let aggregator = Aggregator::new(Arc::new(source), 2);

    let job = BatchJob::new(ids_of(&records), Strategy::Cooperative).unwrap();
    let token = job.cancel_token();
    let running = tokio::spawn({
        let aggregator = aggregator.clone();
        async move { aggregator.run_async(job).await }
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    assert!(matches!(
        running.await.unwrap(),
        Err(AggregationError::Cancelled)
    ));
}

#[test]
fn test_threaded_job_cancelled_while_workers_run() {
    let records = accounts(8);
    let source = InMemorySource::from_records(records.clone()).with_latency(Duration::from_millis(20));
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::new(Arc::new(source), 2).with_sink(sink.clone());

    let job = BatchJob::new(ids_of(&records), Strategy::Threaded).unwrap();
    let token = job.cancel_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        token.cancel();
    });

    let result = aggregator.run(&job);
    canceller.join().unwrap();

    assert!(matches!(result, Err(AggregationError::Cancelled)));
    assert_eq!(sink.count(EventKind::BatchCompleted), 0);
}
