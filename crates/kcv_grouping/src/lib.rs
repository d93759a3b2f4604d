//! Grouped slice-query execution for a partitioned wide-column store.
//!
//! Many independent `(row key, column range)` reads are merged into fewer
//! physical requests: row keys with the same placement share a multi-key
//! request, and point-equivalent column ranges of the same limit share an
//! exact-column request. Every logical read still gets its own
//! [`PendingSlice`], completed with exactly the entries an ungrouped read
//! would have returned.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use bytes::Bytes;
//! # use kcv_grouping::{GroupingConfig, GroupingExecutor, MemoryClient, SliceQuery};
//! # async fn demo() -> anyhow::Result<()> {
//! let executor = GroupingExecutor::builder(Arc::new(MemoryClient::new()))
//!     .config(GroupingConfig::default())
//!     .build()?;
//! let query = SliceQuery::new(Bytes::from_static(b"a"), Bytes::from_static(b"z"))?;
//! let entries = executor
//!     .execute_single_key_single_slice(Bytes::from_static(b"row"), query, &0)
//!     .await?;
//! # let _ = entries;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod classify;
pub mod client;
pub mod collect;
pub mod config;
pub mod error;
pub mod executor;
pub mod functions;
pub mod memory;
pub mod pending;
pub mod stats;
pub mod strategy;
pub mod topology;
pub mod types;

pub use backpressure::{
    InflightBackPressure, PassAllBackPressure, QueryBackPressure, QueryPermit,
    SemaphoreBackPressure,
};
pub use classify::{classify, QueryGroups};
pub use client::{PhysicalClient, PhysicalRequest, RawRow, RequestKind};
pub use collect::{collect_keys, collect_multi_slices};
pub use config::{EffectiveGrouping, GroupingConfig, KeyGroupingClass};
pub use error::SliceError;
pub use executor::{GroupingExecutor, GroupingExecutorBuilder, KeyResults, SliceResults};
pub use functions::PhysicalFunctions;
pub use memory::MemoryClient;
pub use pending::{PendingSlice, SliceResult};
pub use stats::{GroupingStats, GroupingStatsSnapshot, KindSnapshot};
pub use strategy::{
    build_strategy, ChunkedKeyGrouping, KeyGroupingStrategy, KeyPartition,
    ReplicasAwareKeyGrouping, TokenRangeAwareKeyGrouping,
};
pub use topology::{
    hash_key, NodeId, PartitionMap, ReplicaSet, ShardTopology, Token, TokenRange, TopologyShard,
};
pub use types::{
    successor, Entry, EntryList, EntryMetadata, KeysGroup, KeysQueriesGroup, MultiKeysQueryGroups,
    RowKey, SliceQuery,
};
