//! Lock-free counters for physical calls issued by the grouping executor.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::client::RequestKind;

/// Counters for one physical request kind.
#[derive(Debug, Default)]
struct KindCounters {
    /// Physical calls issued.
    calls: AtomicU64,
    /// Logical `(key, query)` slots served by those calls.
    slots: AtomicU64,
    /// Calls that failed (including failed permit acquisition).
    failures: AtomicU64,
    /// Raw rows returned.
    rows: AtomicU64,
    /// Sum of fetch latency in microseconds.
    latency_us_total: AtomicU64,
}

/// Aggregated statistics shared by every call of one executor.
#[derive(Debug, Default)]
pub struct GroupingStats {
    kinds: [KindCounters; 4],
    /// Sum of time spent waiting for backpressure permits, in microseconds.
    permit_wait_us_total: AtomicU64,
    /// Keys the partition reconciliation had to re-add or drop.
    reconciled_keys: AtomicU64,
}

/// Point-in-time copy of the counters of one request kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KindSnapshot {
    pub calls: u64,
    pub slots: u64,
    pub failures: u64,
    pub rows: u64,
    pub latency_us_total: u64,
}

/// Point-in-time copy of [`GroupingStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GroupingStatsSnapshot {
    pub by_kind: BTreeMap<&'static str, KindSnapshot>,
    pub permit_wait_us_total: u64,
    pub reconciled_keys: u64,
}

impl GroupingStatsSnapshot {
    pub fn kind(&self, kind: RequestKind) -> KindSnapshot {
        self.by_kind.get(kind.as_str()).copied().unwrap_or_default()
    }

    /// Physical calls across every request kind.
    pub fn total_calls(&self) -> u64 {
        self.by_kind.values().map(|kind| kind.calls).sum()
    }

    /// Logical slots served across every request kind.
    pub fn total_slots(&self) -> u64 {
        self.by_kind.values().map(|kind| kind.slots).sum()
    }
}

impl GroupingStats {
    fn counters(&self, kind: RequestKind) -> &KindCounters {
        &self.kinds[kind as usize]
    }

    pub(crate) fn record_call(&self, kind: RequestKind, slots: usize, rows: usize, latency: Duration) {
        let counters = self.counters(kind);
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.slots.fetch_add(slots as u64, Ordering::Relaxed);
        counters.rows.fetch_add(rows as u64, Ordering::Relaxed);
        counters
            .latency_us_total
            .fetch_add(duration_us(latency), Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, kind: RequestKind, slots: usize, latency: Duration) {
        let counters = self.counters(kind);
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.slots.fetch_add(slots as u64, Ordering::Relaxed);
        counters.failures.fetch_add(1, Ordering::Relaxed);
        counters
            .latency_us_total
            .fetch_add(duration_us(latency), Ordering::Relaxed);
    }

    pub(crate) fn record_permit_wait(&self, wait: Duration) {
        self.permit_wait_us_total
            .fetch_add(duration_us(wait), Ordering::Relaxed);
    }

    pub(crate) fn record_reconciled_keys(&self, count: usize) {
        self.reconciled_keys
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GroupingStatsSnapshot {
        let by_kind = RequestKind::ALL
            .into_iter()
            .map(|kind| {
                let counters = self.counters(kind);
                let snapshot = KindSnapshot {
                    calls: counters.calls.load(Ordering::Relaxed),
                    slots: counters.slots.load(Ordering::Relaxed),
                    failures: counters.failures.load(Ordering::Relaxed),
                    rows: counters.rows.load(Ordering::Relaxed),
                    latency_us_total: counters.latency_us_total.load(Ordering::Relaxed),
                };
                (kind.as_str(), snapshot)
            })
            .collect();
        GroupingStatsSnapshot {
            by_kind,
            permit_wait_us_total: self.permit_wait_us_total.load(Ordering::Relaxed),
            reconciled_keys: self.reconciled_keys.load(Ordering::Relaxed),
        }
    }

    /// Renders counters as `name=value` lines.
    pub fn render_text(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        for (kind, counters) in &snapshot.by_kind {
            let _ = write!(
                out,
                "{kind}_calls={}\n{kind}_slots={}\n{kind}_failures={}\n{kind}_rows={}\n{kind}_latency_us_total={}\n",
                counters.calls,
                counters.slots,
                counters.failures,
                counters.rows,
                counters.latency_us_total,
            );
        }
        let _ = write!(
            out,
            "permit_wait_us_total={}\nreconciled_keys={}\n",
            snapshot.permit_wait_us_total, snapshot.reconciled_keys
        );
        out
    }
}

fn duration_us(duration: Duration) -> u64 {
    duration.as_micros().min(u128::from(u64::MAX)) as u64
}
