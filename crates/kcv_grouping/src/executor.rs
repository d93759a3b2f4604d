//! Grouping orchestrator.
//!
//! Accepts logical `(key, slice query)` reads, reshapes them into the fewest
//! physical requests the configuration allows, issues those requests on the
//! runtime and routes every combined response back to one pending future per
//! requested pair.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::runtime::Handle;

use crate::backpressure::{PassAllBackPressure, QueryBackPressure};
use crate::classify::classify;
use crate::client::PhysicalClient;
use crate::config::{EffectiveGrouping, GroupingConfig};
use crate::functions::PhysicalFunctions;
use crate::pending::{pending, Demux, PendingSlice};
use crate::stats::GroupingStats;
use crate::strategy::{build_strategy, KeyGroupingStrategy, KeyPartition};
use crate::topology::PartitionMap;
use crate::types::{dedup_keys, KeysGroup, MultiKeysQueryGroups, RowKey, SliceQuery};

/// Pending results of a multi-key single-slice request.
pub type KeyResults = HashMap<RowKey, PendingSlice>;
/// Pending results of a multi-key multi-slice request.
pub type SliceResults = HashMap<SliceQuery, KeyResults>;

/// Keys side of one physical request.
#[derive(Clone, Debug)]
enum KeyUnit {
    Group(KeysGroup),
    Single(RowKey),
}

/// Queries side of one physical request.
#[derive(Clone, Debug)]
enum QueryUnit {
    Columns(ColumnBatch),
    Slice(SliceQuery),
}

/// Point-equivalent queries sharing one limit, served by exact-column lookup.
#[derive(Clone, Debug)]
struct ColumnBatch {
    limit: u32,
    queries: Vec<SliceQuery>,
}

impl ColumnBatch {
    fn columns(&self) -> Vec<Bytes> {
        self.queries.iter().map(|query| query.start().clone()).collect()
    }
}

/// Builder for [`GroupingExecutor`].
pub struct GroupingExecutorBuilder<C: PhysicalClient> {
    client: Arc<C>,
    config: GroupingConfig,
    backpressure: Option<Arc<dyn QueryBackPressure>>,
    partition_map: Option<Arc<dyn PartitionMap>>,
    strategy: Option<Arc<dyn KeyGroupingStrategy>>,
    runtime: Option<Handle>,
}

impl<C: PhysicalClient> GroupingExecutorBuilder<C> {
    pub fn config(mut self, config: GroupingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backpressure(mut self, backpressure: Arc<dyn QueryBackPressure>) -> Self {
        self.backpressure = Some(backpressure);
        self
    }

    /// Placement used by the affinity-aware built-in strategies.
    pub fn partition_map(mut self, partition_map: Arc<dyn PartitionMap>) -> Self {
        self.partition_map = Some(partition_map);
        self
    }

    /// Use `strategy` instead of the one named by `keys_grouping_class`.
    pub fn key_grouping_strategy(mut self, strategy: Arc<dyn KeyGroupingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Runtime the physical calls are spawned on. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<GroupingExecutor<C>> {
        let mut grouping = self.config.resolve();
        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => {
                let class = self
                    .config
                    .key_grouping_class()
                    .context("select keys grouping strategy")?;
                if grouping.keys_grouping
                    && class.needs_partition_map()
                    && self.partition_map.is_none()
                {
                    tracing::warn!(
                        class = class.as_str(),
                        "keys grouping disabled: strategy needs a partition map and none was supplied"
                    );
                    grouping.keys_grouping = false;
                }
                build_strategy(class, self.partition_map)
            }
        };
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().context("grouping executor needs a tokio runtime")?,
        };
        let backpressure = self
            .backpressure
            .unwrap_or_else(|| Arc::new(PassAllBackPressure));
        tracing::debug!(
            slice_grouping = grouping.slice_grouping,
            slice_grouping_limit = grouping.slice_grouping_limit,
            keys_grouping = grouping.keys_grouping,
            keys_grouping_limit = grouping.keys_grouping_limit,
            keys_grouping_min = grouping.keys_grouping_min,
            strategy = strategy.name(),
            "grouping executor configured"
        );
        Ok(GroupingExecutor {
            functions: PhysicalFunctions::new(
                self.client,
                backpressure,
                Arc::new(GroupingStats::default()),
            ),
            grouping,
            strategy,
            runtime,
        })
    }
}

/// Executes slice queries through grouped physical requests.
pub struct GroupingExecutor<C: PhysicalClient> {
    functions: PhysicalFunctions<C>,
    grouping: EffectiveGrouping,
    strategy: Arc<dyn KeyGroupingStrategy>,
    runtime: Handle,
}

impl<C: PhysicalClient> GroupingExecutor<C> {
    pub fn builder(client: Arc<C>) -> GroupingExecutorBuilder<C> {
        GroupingExecutorBuilder {
            client,
            config: GroupingConfig::default(),
            backpressure: None,
            partition_map: None,
            strategy: None,
            runtime: None,
        }
    }

    pub fn grouping(&self) -> EffectiveGrouping {
        self.grouping
    }

    pub fn stats(&self) -> Arc<GroupingStats> {
        self.functions.stats().clone()
    }

    pub fn client(&self) -> &Arc<C> {
        self.functions.client()
    }

    /// Close the backpressure limiter; later physical calls fail.
    pub fn close(&self) {
        self.functions.backpressure().close();
    }

    /// Read one column range of one key through a single physical call.
    pub fn execute_single_key_single_slice(
        &self,
        key: RowKey,
        query: SliceQuery,
        tx: &C::Tx,
    ) -> PendingSlice {
        self.spawn_single_key_slice(key, query, tx)
    }

    /// Read one column range of many keys, grouping keys when allowed.
    pub fn execute_multi_key_single_slice(
        &self,
        keys: &[RowKey],
        query: SliceQuery,
        tx: &C::Tx,
    ) -> KeyResults {
        let mut sink = SliceResults::new();
        for key_unit in self.plan_keys(keys) {
            self.dispatch(key_unit, QueryUnit::Slice(query.clone()), tx, &mut sink);
        }
        sink.remove(&query).unwrap_or_default()
    }

    /// Read several column ranges for several key sets, grouping keys and
    /// point-equivalent queries when allowed.
    ///
    /// A `(key, query)` pair requested by more than one group keeps the
    /// future registered last.
    pub fn execute_multi_key_multi_slice(
        &self,
        groups: &MultiKeysQueryGroups,
        tx: &C::Tx,
    ) -> SliceResults {
        let mut sink = SliceResults::with_capacity(groups.total_queries());
        for group in groups.groups() {
            if group.keys.is_empty() || group.queries.is_empty() {
                continue;
            }
            let key_units = self.plan_keys(&group.keys);
            let query_units = self.plan_queries(&group.queries);
            for key_unit in &key_units {
                for query_unit in &query_units {
                    self.dispatch(key_unit.clone(), query_unit.clone(), tx, &mut sink);
                }
            }
        }
        sink
    }

    fn dispatch(&self, keys: KeyUnit, queries: QueryUnit, tx: &C::Tx, sink: &mut SliceResults) {
        match (keys, queries) {
            (KeyUnit::Group(group), QueryUnit::Columns(batch)) => {
                self.fill_multi_key_columns(group, batch, tx, sink)
            }
            (KeyUnit::Group(group), QueryUnit::Slice(query)) => {
                self.fill_multi_key_slice(group, query, tx, sink)
            }
            (KeyUnit::Single(key), QueryUnit::Columns(batch)) => {
                self.fill_single_key_columns(key, batch, tx, sink)
            }
            (KeyUnit::Single(key), QueryUnit::Slice(query)) => {
                self.fill_single_key_slice(key, query, tx, sink)
            }
        }
    }

    fn fill_single_key_slice(
        &self,
        key: RowKey,
        query: SliceQuery,
        tx: &C::Tx,
        sink: &mut SliceResults,
    ) {
        let pending = self.spawn_single_key_slice(key.clone(), query.clone(), tx);
        sink.entry(query).or_default().insert(key, pending);
    }

    fn spawn_single_key_slice(&self, key: RowKey, query: SliceQuery, tx: &C::Tx) -> PendingSlice {
        let (completer, pending) = pending();
        let functions = self.functions.clone();
        let tx = tx.clone();
        self.spawn(async move {
            let result = functions.single_key_slice(&key, &query, &tx).await;
            Demux::Direct(completer).complete(result);
        });
        pending
    }

    fn fill_single_key_columns(
        &self,
        key: RowKey,
        batch: ColumnBatch,
        tx: &C::Tx,
        sink: &mut SliceResults,
    ) {
        let mut completers = HashMap::with_capacity(batch.queries.len());
        for query in &batch.queries {
            let (completer, pending) = pending();
            sink.entry(query.clone()).or_default().insert(key.clone(), pending);
            completers.insert(query.start().clone(), completer);
        }
        let columns = batch.columns();
        let functions = self.functions.clone();
        let tx = tx.clone();
        self.spawn(async move {
            let result = functions
                .single_key_columns(&key, columns, batch.limit, &tx)
                .await;
            Demux::ByColumn(completers).complete(result);
        });
    }

    fn fill_multi_key_slice(
        &self,
        group: KeysGroup,
        query: SliceQuery,
        tx: &C::Tx,
        sink: &mut SliceResults,
    ) {
        let slots = sink.entry(query.clone()).or_default();
        let mut completers = HashMap::with_capacity(group.len());
        for key in group.keys() {
            let (completer, pending) = pending();
            slots.insert(key.clone(), pending);
            completers.insert(key.clone(), completer);
        }
        let functions = self.functions.clone();
        let tx = tx.clone();
        self.spawn(async move {
            let result = functions.multi_key_slice(&group, &query, &tx).await;
            Demux::ByRowKey(completers).complete(result);
        });
    }

    fn fill_multi_key_columns(
        &self,
        group: KeysGroup,
        batch: ColumnBatch,
        tx: &C::Tx,
        sink: &mut SliceResults,
    ) {
        let mut completers = HashMap::with_capacity(group.len() * batch.queries.len());
        for query in &batch.queries {
            let slots = sink.entry(query.clone()).or_default();
            for key in group.keys() {
                let (completer, pending) = pending();
                slots.insert(key.clone(), pending);
                completers.insert((key.clone(), query.start().clone()), completer);
            }
        }
        let columns = batch.columns();
        let functions = self.functions.clone();
        let tx = tx.clone();
        self.spawn(async move {
            let result = functions
                .multi_key_columns(&group, columns, batch.limit, &tx)
                .await;
            Demux::ByRowKeyAndColumn(completers).complete(result);
        });
    }

    fn spawn<F>(&self, call: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Detached: dropping the pending futures does not cancel the call.
        drop(self.runtime.spawn(call));
    }

    /// Split keys into multi-key groups and individually executed keys.
    fn plan_keys(&self, keys: &[RowKey]) -> Vec<KeyUnit> {
        let keys = dedup_keys(keys);
        if !self.grouping.keys_groupable(keys.len()) {
            return keys.into_iter().map(KeyUnit::Single).collect();
        }
        let partition = self
            .strategy
            .partition(&keys, self.grouping.keys_grouping_limit);
        let partition = self.reconcile(&keys, partition);
        tracing::debug!(
            strategy = self.strategy.name(),
            keys = keys.len(),
            groups = partition.groups.len(),
            leftover = partition.leftover.len(),
            "partitioned keys"
        );
        partition
            .groups
            .into_iter()
            .map(KeyUnit::Group)
            .chain(partition.leftover.into_iter().map(KeyUnit::Single))
            .collect()
    }

    /// Make a strategy's partition exact: every requested key exactly once,
    /// groups within the limit and never a single key.
    fn reconcile(&self, keys: &[RowKey], partition: KeyPartition) -> KeyPartition {
        let requested = keys.iter().collect::<HashSet<_>>();
        let limit = self.grouping.keys_grouping_limit;
        let mut placed: HashSet<RowKey> = HashSet::with_capacity(keys.len());
        let mut exact = KeyPartition::default();
        let mut dropped = 0usize;

        for group in partition.groups {
            let routing_token = group.routing_token();
            let mut kept = Vec::with_capacity(group.len());
            for key in group.keys() {
                if requested.contains(key) && placed.insert(key.clone()) {
                    kept.push(key.clone());
                } else {
                    dropped += 1;
                }
            }
            for chunk in kept.chunks(limit.max(1)) {
                if chunk.len() < 2 {
                    exact.leftover.extend_from_slice(chunk);
                } else {
                    exact
                        .groups
                        .push(KeysGroup::new(chunk.to_vec(), routing_token));
                }
            }
        }
        for key in partition.leftover {
            if requested.contains(&key) && placed.insert(key.clone()) {
                exact.leftover.push(key);
            } else {
                dropped += 1;
            }
        }
        let mut missing = 0usize;
        for key in keys {
            if !placed.contains(key) {
                missing += 1;
                exact.leftover.push(key.clone());
            }
        }

        if dropped > 0 || missing > 0 {
            tracing::warn!(
                strategy = self.strategy.name(),
                dropped,
                missing,
                "key grouping strategy returned an inexact partition; executing missing keys individually"
            );
            self.functions
                .stats()
                .record_reconciled_keys(dropped + missing);
        }
        exact
    }

    /// Split queries into column batches and individually executed slices.
    fn plan_queries(&self, queries: &[SliceQuery]) -> Vec<QueryUnit> {
        if !self.grouping.slice_grouping {
            let mut seen = HashSet::with_capacity(queries.len());
            return queries
                .iter()
                .filter(|query| seen.insert(*query))
                .cloned()
                .map(QueryUnit::Slice)
                .collect();
        }
        let classified = classify(queries);
        let mut units = Vec::with_capacity(classified.len());
        for (limit, bucket) in classified.by_limit {
            for chunk in bucket.chunks(self.grouping.slice_grouping_limit) {
                match chunk {
                    [query] => units.push(QueryUnit::Slice(query.clone())),
                    _ => units.push(QueryUnit::Columns(ColumnBatch {
                        limit,
                        queries: chunk.to_vec(),
                    })),
                }
            }
        }
        units.extend(classified.separate.into_iter().map(QueryUnit::Slice));
        units
    }
}
