//! In-memory wide-column store implementing [`PhysicalClient`].
//!
//! Serves all four request shapes over an ordered map, records every request
//! with its transaction id and tracks how many fetches overlap.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;

use crate::client::{PhysicalClient, PhysicalRequest, RawRow, RequestKind};
use crate::types::RowKey;

type FaultPredicate = Box<dyn Fn(&PhysicalRequest) -> bool + Send + Sync>;

#[derive(Clone, Debug)]
struct Cell {
    value: Bytes,
    ttl: Option<u32>,
    write_time: Option<i64>,
}

/// Ordered in-memory store with request logging and fault injection.
pub struct MemoryClient {
    rows: RwLock<BTreeMap<RowKey, BTreeMap<Bytes, Cell>>>,
    requests: Mutex<Vec<(u64, PhysicalRequest)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    latency: Option<Duration>,
    fault: Option<FaultPredicate>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            latency: None,
            fault: None,
        }
    }

    /// Delay every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every request for which `predicate` returns true.
    pub fn fail_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PhysicalRequest) -> bool + Send + Sync + 'static,
    {
        self.fault = Some(Box::new(predicate));
        self
    }

    pub fn insert(&self, key: impl Into<Bytes>, column: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.insert_cell(key, column, value, None, None);
    }

    pub fn insert_cell(
        &self,
        key: impl Into<Bytes>,
        column: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: Option<u32>,
        write_time: Option<i64>,
    ) {
        let mut rows = self.rows.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        rows.entry(key.into()).or_default().insert(
            column.into(),
            Cell {
                value: value.into(),
                ttl,
                write_time,
            },
        );
    }

    /// Every request served so far, with its transaction id.
    pub fn requests(&self) -> Vec<(u64, PhysicalRequest)> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn requests_of(&self, kind: RequestKind) -> Vec<PhysicalRequest> {
        self.requests()
            .into_iter()
            .filter_map(|(_, request)| (request.kind() == kind).then_some(request))
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Highest number of fetches observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn read(&self, request: &PhysicalRequest) -> Vec<RawRow> {
        let rows = self.rows.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut out = Vec::new();
        match request {
            PhysicalRequest::SingleKeySlice {
                key,
                start,
                end,
                limit,
            } => {
                if let Some(row) = rows.get(key) {
                    read_range(row, None, start, end, *limit, &mut out);
                }
            }
            PhysicalRequest::SingleKeyColumns {
                key,
                columns,
                limit,
            } => {
                if let Some(row) = rows.get(key) {
                    read_columns(row, None, columns, *limit, &mut out);
                }
            }
            PhysicalRequest::MultiKeySlice {
                keys,
                start,
                end,
                limit,
                ..
            } => {
                for key in keys {
                    if let Some(row) = rows.get(key) {
                        read_range(row, Some(key), start, end, *limit, &mut out);
                    }
                }
            }
            PhysicalRequest::MultiKeyColumns {
                keys,
                columns,
                limit,
                ..
            } => {
                for key in keys {
                    if let Some(row) = rows.get(key) {
                        read_columns(row, Some(key), columns, *limit, &mut out);
                    }
                }
            }
        }
        out
    }
}

fn raw_row(key: Option<&RowKey>, column: &Bytes, cell: &Cell) -> RawRow {
    RawRow {
        key: key.cloned(),
        column: column.clone(),
        value: cell.value.clone(),
        ttl: cell.ttl,
        write_time: cell.write_time,
    }
}

fn read_range(
    row: &BTreeMap<Bytes, Cell>,
    key: Option<&RowKey>,
    start: &Bytes,
    end: &Bytes,
    limit: u32,
    out: &mut Vec<RawRow>,
) {
    if start >= end {
        return;
    }
    let bounds: (Bound<&[u8]>, Bound<&[u8]>) =
        (Bound::Included(start.as_ref()), Bound::Excluded(end.as_ref()));
    out.extend(
        row.range::<[u8], _>(bounds)
            .take(limit as usize)
            .map(|(column, cell)| raw_row(key, column, cell)),
    );
}

fn read_columns(
    row: &BTreeMap<Bytes, Cell>,
    key: Option<&RowKey>,
    columns: &[Bytes],
    limit: u32,
    out: &mut Vec<RawRow>,
) {
    if limit == 0 {
        return;
    }
    // One cell per column, so the per-column limit never truncates.
    for column in columns {
        if let Some(cell) = row.get(column) {
            out.push(raw_row(key, column, cell));
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl PhysicalClient for MemoryClient {
    type Tx = u64;

    async fn fetch(&self, request: PhysicalRequest, tx: &u64) -> anyhow::Result<Vec<RawRow>> {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((*tx, request.clone()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fault.as_ref().is_some_and(|fault| fault(&request)) {
            return Err(anyhow!(
                "injected fault on {} request (tx {tx})",
                request.kind().as_str()
            ));
        }
        Ok(self.read(&request))
    }
}
