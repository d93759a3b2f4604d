//! The four physical query primitives.
//!
//! Each wrapper acquires a backpressure permit, issues exactly one physical
//! request, releases the permit once the fetch resolves and converts the raw
//! rows into entries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use bytes::Bytes;

use crate::backpressure::QueryBackPressure;
use crate::client::{PhysicalClient, PhysicalRequest, RawRow};
use crate::stats::GroupingStats;
use crate::types::{Entry, EntryMetadata, KeysGroup, RowKey, SliceQuery};

/// Physical query functions bound to one client, limiter and stats sink.
pub struct PhysicalFunctions<C: PhysicalClient> {
    client: Arc<C>,
    backpressure: Arc<dyn QueryBackPressure>,
    stats: Arc<GroupingStats>,
}

impl<C: PhysicalClient> Clone for PhysicalFunctions<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            backpressure: self.backpressure.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<C: PhysicalClient> PhysicalFunctions<C> {
    pub fn new(
        client: Arc<C>,
        backpressure: Arc<dyn QueryBackPressure>,
        stats: Arc<GroupingStats>,
    ) -> Self {
        Self {
            client,
            backpressure,
            stats,
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn backpressure(&self) -> &Arc<dyn QueryBackPressure> {
        &self.backpressure
    }

    pub fn stats(&self) -> &Arc<GroupingStats> {
        &self.stats
    }

    /// One key, one column range.
    pub async fn single_key_slice(
        &self,
        key: &RowKey,
        query: &SliceQuery,
        tx: &C::Tx,
    ) -> anyhow::Result<Vec<Entry>> {
        let request = PhysicalRequest::SingleKeySlice {
            key: key.clone(),
            start: query.start().clone(),
            end: query.end().clone(),
            limit: query.limit(),
        };
        self.submit(request, tx).await
    }

    /// One key, exact columns; `limit` applies per column.
    pub async fn single_key_columns(
        &self,
        key: &RowKey,
        columns: Vec<Bytes>,
        limit: u32,
        tx: &C::Tx,
    ) -> anyhow::Result<Vec<Entry>> {
        let request = PhysicalRequest::SingleKeyColumns {
            key: key.clone(),
            columns,
            limit,
        };
        self.submit(request, tx).await
    }

    /// Several keys, one column range; the query limit applies per key.
    ///
    /// Every returned row must carry its row key, or the call fails.
    pub async fn multi_key_slice(
        &self,
        group: &KeysGroup,
        query: &SliceQuery,
        tx: &C::Tx,
    ) -> anyhow::Result<Vec<Entry>> {
        let request = PhysicalRequest::MultiKeySlice {
            routing_token: group.routing_token(),
            keys: group.keys().to_vec(),
            start: query.start().clone(),
            end: query.end().clone(),
            limit: query.limit(),
        };
        self.submit(request, tx).await
    }

    /// Several keys, exact columns; `limit` applies per column.
    pub async fn multi_key_columns(
        &self,
        group: &KeysGroup,
        columns: Vec<Bytes>,
        limit: u32,
        tx: &C::Tx,
    ) -> anyhow::Result<Vec<Entry>> {
        let request = PhysicalRequest::MultiKeyColumns {
            routing_token: group.routing_token(),
            keys: group.keys().to_vec(),
            columns,
            limit,
        };
        self.submit(request, tx).await
    }

    async fn submit(&self, request: PhysicalRequest, tx: &C::Tx) -> anyhow::Result<Vec<Entry>> {
        let kind = request.kind();
        let slots = request.slots();

        let wait_start = Instant::now();
        let permit = match self.backpressure.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                self.stats.record_failure(kind, slots, Duration::ZERO);
                return Err(err);
            }
        };
        self.stats.record_permit_wait(wait_start.elapsed());

        let fetch_start = Instant::now();
        let result = self.client.fetch(request, tx).await;
        drop(permit);
        let latency = fetch_start.elapsed();

        let result = result.and_then(|rows| {
            let untagged = rows.iter().filter(|row| row.key.is_none()).count();
            if kind.is_multi_key() && untagged > 0 {
                return Err(anyhow!(
                    "{} response carried {untagged} of {} rows without a row key",
                    kind.as_str(),
                    rows.len()
                ));
            }
            Ok(rows)
        });
        match result {
            Ok(rows) => {
                self.stats.record_call(kind, slots, rows.len(), latency);
                Ok(rows
                    .into_iter()
                    .map(|row| into_entry(row, kind.is_multi_key()))
                    .collect())
            }
            Err(err) => {
                self.stats.record_failure(kind, slots, latency);
                tracing::debug!(kind = kind.as_str(), slots, error = %err, "physical fetch failed");
                Err(err)
            }
        }
    }
}

fn into_entry(row: RawRow, tag_row_key: bool) -> Entry {
    Entry {
        column: row.column,
        value: row.value,
        metadata: EntryMetadata {
            row_key: if tag_row_key { row.key } else { None },
            ttl: row.ttl,
            timestamp: row.write_time,
        },
    }
}
