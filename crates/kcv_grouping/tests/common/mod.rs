//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use kcv_grouping::{
    GroupingConfig, GroupingExecutor, MemoryClient, PartitionMap, ShardTopology, SliceQuery,
};

/// Row key `row-NNNN`.
pub fn row(idx: usize) -> Bytes {
    Bytes::from(format!("row-{idx:04}"))
}

/// Fixed-width two-byte column name.
pub fn column(idx: u16) -> Bytes {
    Bytes::copy_from_slice(&idx.to_be_bytes())
}

pub fn point(idx: u16) -> SliceQuery {
    SliceQuery::point(column(idx)).expect("fixed-width column has a successor")
}

pub fn range(start: u16, end: u16) -> SliceQuery {
    SliceQuery::new(column(start), column(end)).expect("ordered range")
}

pub fn limited(query: SliceQuery, limit: u32) -> SliceQuery {
    query.with_limit(limit).expect("positive limit")
}

/// Store with `rows` rows, each holding every column below `columns`.
pub fn seeded_client(rows: usize, columns: u16) -> MemoryClient {
    let client = MemoryClient::new();
    seed(&client, rows, columns);
    client
}

pub fn seed(client: &MemoryClient, rows: usize, columns: u16) {
    for idx in 0..rows {
        for col in 0..columns {
            client.insert(row(idx), column(col), Bytes::from(format!("v-{idx}-{col}")));
        }
    }
}

pub fn topology() -> Arc<dyn PartitionMap> {
    Arc::new(ShardTopology::uniform(4, &[1, 2, 3], 2).expect("build topology"))
}

/// Keys and slice grouping enabled with permissive thresholds.
pub fn grouped_config() -> GroupingConfig {
    GroupingConfig {
        keys_grouping_allowed: true,
        keys_grouping_limit: 10,
        keys_grouping_min: 2,
        ..GroupingConfig::default()
    }
}

pub fn executor(client: Arc<MemoryClient>, config: GroupingConfig) -> GroupingExecutor<MemoryClient> {
    GroupingExecutor::builder(client)
        .config(config)
        .partition_map(topology())
        .build()
        .expect("build executor")
}
