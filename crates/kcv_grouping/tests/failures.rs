mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use common::{point, range, row, seed};
use kcv_grouping::{
    collect_keys, GroupingConfig, GroupingExecutor, KeysQueriesGroup, MemoryClient,
    MultiKeysQueryGroups, PhysicalClient, PhysicalRequest, RawRow, RequestKind,
    SemaphoreBackPressure, SliceError,
};

fn chunked() -> GroupingConfig {
    GroupingConfig {
        keys_grouping_allowed: true,
        keys_grouping_class: "chunked".to_string(),
        ..GroupingConfig::default()
    }
}

fn build(client: Arc<MemoryClient>, config: GroupingConfig) -> GroupingExecutor<MemoryClient> {
    GroupingExecutor::builder(client)
        .config(config)
        .build()
        .expect("build executor")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn futures_of_one_call_share_its_failure() -> Result<()> {
    let client = MemoryClient::new().fail_when(|request| request.kind() == RequestKind::MultiKeySlice);
    seed(&client, 4, 4);
    let executor = build(Arc::new(client), chunked());

    let grouped = executor.execute_multi_key_single_slice(&[row(0), row(1), row(2)], range(0, 3), &0);
    let independent = executor.execute_single_key_single_slice(row(3), range(0, 3), &0);

    let mut errors = Vec::new();
    for (_, pending) in grouped {
        errors.push(pending.await.expect_err("grouped call failed"));
    }
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|err| err.same_cause(&errors[0])));
    let cause = errors[0].cause().expect("fetch failure");
    assert!(cause.to_string().contains("multi_key_slice"));

    assert_eq!(independent.await?.len(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_range_call_does_not_affect_column_batch() -> Result<()> {
    let client = MemoryClient::new().fail_when(|request| request.kind() == RequestKind::SingleKeySlice);
    seed(&client, 1, 8);
    let executor = build(Arc::new(client), GroupingConfig::default());
    let batch = [point(1), point(2)];
    let groups = MultiKeysQueryGroups::new(vec![KeysQueriesGroup::new(
        vec![row(0)],
        vec![batch[0].clone(), batch[1].clone(), range(3, 6)],
    )]);

    let mut results = executor.execute_multi_key_multi_slice(&groups, &0);

    for query in &batch {
        let pending = results
            .get_mut(query)
            .and_then(|per_key| per_key.remove(&row(0)))
            .expect("registered");
        assert_eq!(pending.await?.len(), 1);
    }
    let failed = results
        .get_mut(&range(3, 6))
        .and_then(|per_key| per_key.remove(&row(0)))
        .expect("registered");
    assert!(matches!(failed.await, Err(SliceError::Fetch(_))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backpressure_bounds_concurrent_fetches() -> Result<()> {
    let client = Arc::new(MemoryClient::new().with_latency(Duration::from_millis(20)));
    seed(&client, 12, 2);
    let limiter = Arc::new(SemaphoreBackPressure::new(2));
    let executor = GroupingExecutor::builder(client.clone())
        .config(GroupingConfig::disabled())
        .backpressure(limiter.clone())
        .build()?;

    let keys = (0..12).map(row).collect::<Vec<_>>();
    let results = collect_keys(executor.execute_multi_key_single_slice(&keys, range(0, 2), &0)).await?;

    assert_eq!(results.len(), 12);
    assert!(results.values().all(|entries| entries.len() == 2));
    assert!(client.peak_in_flight() <= 2, "peak {}", client.peak_in_flight());
    assert_eq!(limiter.available_permits(), 2);
    assert!(executor.stats().snapshot().permit_wait_us_total > 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_executor_fails_new_calls() -> Result<()> {
    let client = Arc::new(MemoryClient::new());
    seed(&client, 1, 2);
    let executor = GroupingExecutor::builder(client.clone())
        .backpressure(Arc::new(SemaphoreBackPressure::new(4)))
        .build()?;

    executor.close();
    let err = executor
        .execute_single_key_single_slice(row(0), range(0, 2), &0)
        .await
        .expect_err("closed limiter");

    assert!(err.to_string().contains("closed"));
    assert_eq!(client.request_count(), 0);
    assert_eq!(
        executor
            .stats()
            .snapshot()
            .kind(RequestKind::SingleKeySlice)
            .failures,
        1
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_futures_does_not_cancel_calls() -> Result<()> {
    let client = Arc::new(MemoryClient::new().with_latency(Duration::from_millis(10)));
    seed(&client, 3, 2);
    let executor = build(client.clone(), GroupingConfig::disabled());

    drop(executor.execute_multi_key_single_slice(&[row(0), row(1), row(2)], range(0, 2), &0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(client.request_count(), 3);
    assert_eq!(executor.stats().snapshot().total_calls(), 3);
    Ok(())
}

/// Client whose fetch task dies without answering.
struct PanickingClient;

#[async_trait]
impl PhysicalClient for PanickingClient {
    type Tx = ();

    async fn fetch(&self, request: PhysicalRequest, _tx: &()) -> anyhow::Result<Vec<RawRow>> {
        panic!("client crashed serving {:?}", request.kind());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_tasks_resolve_as_abandoned() -> Result<()> {
    let executor = GroupingExecutor::builder(Arc::new(PanickingClient))
        .config(chunked())
        .build()?;

    let keys = vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")];
    for (_, pending) in executor.execute_multi_key_single_slice(&keys, range(0, 1), &()) {
        assert!(matches!(pending.await, Err(SliceError::Abandoned)));
    }
    Ok(())
}

/// Multi-key client that drops the row key from every row it returns.
struct UntaggedClient {
    inner: MemoryClient,
}

#[async_trait]
impl PhysicalClient for UntaggedClient {
    type Tx = u64;

    async fn fetch(&self, request: PhysicalRequest, tx: &u64) -> anyhow::Result<Vec<RawRow>> {
        let mut rows = self.inner.fetch(request, tx).await?;
        for row in &mut rows {
            row.key = None;
        }
        Ok(rows)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rows_without_row_keys_fail_the_whole_multi_key_call() -> Result<()> {
    let inner = MemoryClient::new();
    seed(&inner, 2, 4);
    let executor = GroupingExecutor::builder(Arc::new(UntaggedClient { inner }))
        .config(chunked())
        .build()?;

    let pending = executor.execute_multi_key_single_slice(&[row(0), row(1)], range(0, 3), &0);
    assert_eq!(pending.len(), 2);
    let mut errors = Vec::new();
    for (_, result) in pending {
        errors.push(result.await.expect_err("untagged rows"));
    }
    assert!(errors.iter().all(|err| err.same_cause(&errors[0])));
    assert!(errors[0].to_string().contains("without a row key"));

    // Single-key calls are answered without a row key.
    let entries = executor
        .execute_single_key_single_slice(row(0), range(0, 3), &0)
        .await?;
    assert_eq!(entries.len(), 3);
    Ok(())
}
