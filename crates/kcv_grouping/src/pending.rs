//! Per-`(key, query)` pending results and the demultiplexing of one physical
//! call's combined response into them.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::SliceError;
use crate::types::{Entry, EntryList, RowKey};

/// Outcome of one logical `(key, query)` read.
pub type SliceResult = Result<EntryList, SliceError>;

/// Future of one `(key, query)` result.
///
/// Resolves exactly once. When the task owning the physical call ends
/// without completing it, the future resolves to [`SliceError::Abandoned`].
/// Dropping it does not cancel the physical call.
#[derive(Debug)]
pub struct PendingSlice {
    rx: oneshot::Receiver<SliceResult>,
}

impl PendingSlice {
    /// Take the result if it is already available.
    pub fn try_take(&mut self) -> Option<SliceResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SliceError::Abandoned)),
        }
    }
}

impl Future for PendingSlice {
    type Output = SliceResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SliceError::Abandoned)))
    }
}

/// Sending half of a [`PendingSlice`].
#[derive(Debug)]
pub(crate) struct SliceCompleter {
    tx: oneshot::Sender<SliceResult>,
}

impl SliceCompleter {
    pub(crate) fn complete(self, result: SliceResult) {
        // The receiver may already be gone; the call is not cancelled.
        let _ = self.tx.send(result);
    }
}

/// Create a connected completer/future pair.
pub(crate) fn pending() -> (SliceCompleter, PendingSlice) {
    let (tx, rx) = oneshot::channel();
    (SliceCompleter { tx }, PendingSlice { rx })
}

/// Futures registered against one physical call and how its entries map
/// onto them.
#[derive(Debug)]
pub(crate) enum Demux {
    /// Single-key range call: every entry belongs to the one future.
    Direct(SliceCompleter),
    /// Multi-key range call: entries are routed by row key.
    ByRowKey(HashMap<RowKey, SliceCompleter>),
    /// Single-key column call: entries are routed by column.
    ByColumn(HashMap<Bytes, SliceCompleter>),
    /// Multi-key column call: entries are routed by row key and column.
    ByRowKeyAndColumn(HashMap<(RowKey, Bytes), SliceCompleter>),
}

impl Demux {
    /// Number of futures waiting on the call.
    pub(crate) fn slots(&self) -> usize {
        match self {
            Self::Direct(_) => 1,
            Self::ByRowKey(completers) => completers.len(),
            Self::ByColumn(completers) => completers.len(),
            Self::ByRowKeyAndColumn(completers) => completers.len(),
        }
    }

    /// Complete every registered future from the call's result.
    ///
    /// On success each future receives its bucket (or `EntryList::EMPTY`);
    /// on failure every future receives the same shared error.
    pub(crate) fn complete(self, result: anyhow::Result<Vec<Entry>>) {
        let entries = match result {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(slots = self.slots(), "failing every future of the call");
                self.fail(SliceError::fetch(err));
                return;
            }
        };
        match self {
            Self::Direct(completer) => completer.complete(Ok(EntryList::from(entries))),
            Self::ByRowKey(completers) => {
                route(completers, entries, |entry| entry.row_key().cloned())
            }
            Self::ByColumn(completers) => route(completers, entries, |entry| Some(entry.column.clone())),
            Self::ByRowKeyAndColumn(completers) => route(completers, entries, |entry| {
                Some((entry.row_key()?.clone(), entry.column.clone()))
            }),
        }
    }

    fn fail(self, err: SliceError) {
        match self {
            Self::Direct(completer) => completer.complete(Err(err)),
            Self::ByRowKey(completers) => fail_all(completers, err),
            Self::ByColumn(completers) => fail_all(completers, err),
            Self::ByRowKeyAndColumn(completers) => fail_all(completers, err),
        }
    }
}

/// Bucket entries in one scan and complete every completer with its bucket.
fn route<K, F>(completers: HashMap<K, SliceCompleter>, entries: Vec<Entry>, slot_of: F)
where
    K: Eq + Hash,
    F: Fn(&Entry) -> Option<K>,
{
    let mut buckets: HashMap<K, Vec<Entry>> = HashMap::with_capacity(completers.len());
    let mut unmatched = 0usize;
    for entry in entries {
        match slot_of(&entry) {
            Some(slot) if completers.contains_key(&slot) => {
                buckets.entry(slot).or_default().push(entry)
            }
            _ => unmatched += 1,
        }
    }
    if unmatched > 0 {
        tracing::debug!(unmatched, "dropping entries that match no registered query");
    }
    for (slot, completer) in completers {
        let list = buckets
            .remove(&slot)
            .map(EntryList::from)
            .unwrap_or(EntryList::EMPTY);
        completer.complete(Ok(list));
    }
}

fn fail_all<K>(completers: HashMap<K, SliceCompleter>, err: SliceError) {
    for completer in completers.into_values() {
        completer.complete(Err(err.clone()));
    }
}
