//! Physical client seam: one call, one round trip to the store.

use async_trait::async_trait;
use bytes::Bytes;

use crate::topology::Token;
use crate::types::RowKey;

/// Connection to the partitioned wide-column store.
///
/// Retries, timeouts and connection pooling live behind this trait.
#[async_trait]
pub trait PhysicalClient: Send + Sync + 'static {
    /// Transaction handle passed through uninterpreted from the caller.
    type Tx: Clone + Send + Sync + 'static;

    /// Issue one physical request and return its raw rows.
    ///
    /// Rows of multi-key requests must carry their row key in `RawRow::key`.
    async fn fetch(&self, request: PhysicalRequest, tx: &Self::Tx) -> anyhow::Result<Vec<RawRow>>;
}

/// Shape of one physical request.
///
/// Column ranges are half-open `[start, end)`. Limits of multi-key requests
/// apply per partition; limits of column requests apply per column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhysicalRequest {
    SingleKeySlice {
        key: RowKey,
        start: Bytes,
        end: Bytes,
        limit: u32,
    },
    SingleKeyColumns {
        key: RowKey,
        columns: Vec<Bytes>,
        limit: u32,
    },
    MultiKeySlice {
        routing_token: Option<Token>,
        keys: Vec<RowKey>,
        start: Bytes,
        end: Bytes,
        limit: u32,
    },
    MultiKeyColumns {
        routing_token: Option<Token>,
        keys: Vec<RowKey>,
        columns: Vec<Bytes>,
        limit: u32,
    },
}

impl PhysicalRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::SingleKeySlice { .. } => RequestKind::SingleKeySlice,
            Self::SingleKeyColumns { .. } => RequestKind::SingleKeyColumns,
            Self::MultiKeySlice { .. } => RequestKind::MultiKeySlice,
            Self::MultiKeyColumns { .. } => RequestKind::MultiKeyColumns,
        }
    }

    /// Row keys addressed by the request.
    pub fn keys(&self) -> &[RowKey] {
        match self {
            Self::SingleKeySlice { key, .. } | Self::SingleKeyColumns { key, .. } => {
                std::slice::from_ref(key)
            }
            Self::MultiKeySlice { keys, .. } | Self::MultiKeyColumns { keys, .. } => keys,
        }
    }

    /// Logical `(key, column-or-range)` slots the request answers.
    pub fn slots(&self) -> usize {
        match self {
            Self::SingleKeySlice { .. } => 1,
            Self::SingleKeyColumns { columns, .. } => columns.len(),
            Self::MultiKeySlice { keys, .. } => keys.len(),
            Self::MultiKeyColumns { keys, columns, .. } => keys.len() * columns.len(),
        }
    }

    pub fn limit(&self) -> u32 {
        match self {
            Self::SingleKeySlice { limit, .. }
            | Self::SingleKeyColumns { limit, .. }
            | Self::MultiKeySlice { limit, .. }
            | Self::MultiKeyColumns { limit, .. } => *limit,
        }
    }
}

/// The four physical request shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    SingleKeySlice,
    SingleKeyColumns,
    MultiKeySlice,
    MultiKeyColumns,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::SingleKeySlice,
        RequestKind::SingleKeyColumns,
        RequestKind::MultiKeySlice,
        RequestKind::MultiKeyColumns,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleKeySlice => "single_key_slice",
            Self::SingleKeyColumns => "single_key_columns",
            Self::MultiKeySlice => "multi_key_slice",
            Self::MultiKeyColumns => "multi_key_columns",
        }
    }

    pub fn is_multi_key(self) -> bool {
        matches!(self, Self::MultiKeySlice | Self::MultiKeyColumns)
    }
}

/// One row returned by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawRow {
    /// Partition the row belongs to; required for multi-key requests.
    pub key: Option<RowKey>,
    pub column: Bytes,
    pub value: Bytes,
    pub ttl: Option<u32>,
    pub write_time: Option<i64>,
}
