//! Value types shared by the classifier, the key-grouping strategies and the
//! executor.
//!
//! Row keys, columns and values are `Bytes` so they can be cloned into
//! per-call tasks without copying the underlying buffers.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

use anyhow::{ensure, Result};
use bytes::Bytes;

use crate::topology::Token;

/// Row key of one partition in the wide-column store.
pub type RowKey = Bytes;

/// Half-open column range `[start, end)` with a result-count limit.
///
/// `start <= end` and `limit > 0` hold for every constructed query.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceQuery {
    start: Bytes,
    end: Bytes,
    limit: u32,
}

impl SliceQuery {
    /// Unlimited slice over `[start, end)`. Fails when `start > end`.
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Result<Self> {
        let (start, end) = (start.into(), end.into());
        ensure!(
            start <= end,
            "slice query start {:?} sorts after end {:?}",
            HexBytes(&start),
            HexBytes(&end)
        );
        Ok(Self {
            start,
            end,
            limit: u32::MAX,
        })
    }

    /// Slice over exactly one column: `[column, successor(column))`.
    ///
    /// Returns `None` when the column has no successor (empty or all `0xFF`).
    pub fn point(column: impl Into<Bytes>) -> Option<Self> {
        let start = column.into();
        let end = successor(&start)?;
        Some(Self {
            start,
            end,
            limit: u32::MAX,
        })
    }

    /// Return this query with a different result limit. Fails when `limit`
    /// is zero.
    pub fn with_limit(mut self, limit: u32) -> Result<Self> {
        ensure!(limit > 0, "slice query limit must be positive");
        self.limit = limit;
        Ok(self)
    }

    pub fn start(&self) -> &Bytes {
        &self.start
    }

    pub fn end(&self) -> &Bytes {
        &self.end
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn has_limit(&self) -> bool {
        self.limit != u32::MAX
    }

    /// True when the range covers exactly one column, so the query can be
    /// answered by an exact-column lookup instead of a range scan.
    pub fn is_point(&self) -> bool {
        successor(&self.start).is_some_and(|next| next == self.end)
    }

    /// True when `column` falls inside `[start, end)`.
    pub fn contains(&self, column: &[u8]) -> bool {
        column >= self.start.as_ref() && column < self.end.as_ref()
    }
}

impl fmt::Debug for SliceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("SliceQuery");
        out.field("start", &HexBytes(&self.start))
            .field("end", &HexBytes(&self.end));
        if self.has_limit() {
            out.field("limit", &self.limit);
        }
        out.finish()
    }
}

/// Next byte string of the same length in lexicographic order.
///
/// Increments the last byte and carries into preceding bytes. Returns `None`
/// for the empty string and for a string made only of `0xFF` bytes.
pub fn successor(bytes: &[u8]) -> Option<Bytes> {
    let mut next = bytes.to_vec();
    for byte in next.iter_mut().rev() {
        let (incremented, overflow) = byte.overflowing_add(1);
        *byte = incremented;
        if !overflow {
            return Some(Bytes::from(next));
        }
    }
    None
}

/// Metadata attached to an entry by the physical functions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Row key of the partition the entry was read from (multi-key reads only).
    pub row_key: Option<RowKey>,
    /// Remaining time-to-live in seconds, when the store reports it.
    pub ttl: Option<u32>,
    /// Write timestamp in microseconds, when the store reports it.
    pub timestamp: Option<i64>,
}

/// One column/value pair read from a row.
///
/// Equality and hashing consider the column and the value only.
#[derive(Clone)]
pub struct Entry {
    pub column: Bytes,
    pub value: Bytes,
    pub metadata: EntryMetadata,
}

impl Entry {
    pub fn new(column: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            metadata: EntryMetadata::default(),
        }
    }

    pub fn row_key(&self) -> Option<&RowKey> {
        self.metadata.row_key.as_ref()
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.column == other.column && self.value == other.value
    }
}

impl Eq for Entry {}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.column.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("column", &HexBytes(&self.column))
            .field("value", &HexBytes(&self.value))
            .field("row_key", &self.metadata.row_key.as_deref().map(HexBytes))
            .finish()
    }
}

/// Ordered entries returned for one `(key, query)` pair.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryList {
    entries: Vec<Entry>,
}

impl EntryList {
    /// Result of a query that matched nothing.
    pub const EMPTY: EntryList = EntryList {
        entries: Vec::new(),
    };

    pub fn into_vec(self) -> Vec<Entry> {
        self.entries
    }
}

impl Deref for EntryList {
    type Target = [Entry];

    fn deref(&self) -> &[Entry] {
        &self.entries
    }
}

impl From<Vec<Entry>> for EntryList {
    fn from(entries: Vec<Entry>) -> Self {
        Self { entries }
    }
}

impl FromIterator<Entry> for EntryList {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for EntryList {
    type Item = Entry;
    type IntoIter = std::vec::IntoIter<Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Row keys served together by one multi-key physical request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeysGroup {
    keys: Vec<RowKey>,
    routing_token: Option<Token>,
}

impl KeysGroup {
    /// Build a group from non-empty, duplicate-free keys.
    pub fn new(keys: Vec<RowKey>, routing_token: Option<Token>) -> Self {
        debug_assert!(!keys.is_empty(), "keys group must not be empty");
        Self {
            keys,
            routing_token,
        }
    }

    pub fn keys(&self) -> &[RowKey] {
        &self.keys
    }

    /// Token the physical client may use to route the request to a replica.
    pub fn routing_token(&self) -> Option<Token> {
        self.routing_token
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Keys that all need the same set of slice queries.
#[derive(Clone, Debug, Default)]
pub struct KeysQueriesGroup {
    pub keys: Vec<RowKey>,
    pub queries: Vec<SliceQuery>,
}

impl KeysQueriesGroup {
    pub fn new(keys: Vec<RowKey>, queries: Vec<SliceQuery>) -> Self {
        Self { keys, queries }
    }
}

/// Input of a multi-key, multi-slice execution.
///
/// Key sets of different groups are expected to be disjoint; a `(key, query)`
/// pair requested by two groups keeps only the last registered future.
#[derive(Clone, Debug, Default)]
pub struct MultiKeysQueryGroups {
    groups: Vec<KeysQueriesGroup>,
}

impl MultiKeysQueryGroups {
    pub fn new(groups: Vec<KeysQueriesGroup>) -> Self {
        Self { groups }
    }

    pub fn push(&mut self, group: KeysQueriesGroup) {
        self.groups.push(group);
    }

    pub fn groups(&self) -> &[KeysQueriesGroup] {
        &self.groups
    }

    /// Distinct slice queries across all groups.
    pub fn total_queries(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|group| group.queries.iter())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Remove duplicate keys while keeping first-seen order.
pub(crate) fn dedup_keys(keys: &[RowKey]) -> Vec<RowKey> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter()
        .filter(|key| seen.insert(*key))
        .cloned()
        .collect()
}

/// Hex rendering for byte strings in debug output.
struct HexBytes<'a>(&'a [u8]);

impl fmt::Debug for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
