//! Resolve pending result maps into plain maps.

use std::collections::HashMap;

use futures_util::future::try_join_all;

use crate::error::SliceError;
use crate::executor::{KeyResults, SliceResults};
use crate::types::{EntryList, RowKey, SliceQuery};

/// Await every key's result; fails with the first error observed.
pub async fn collect_keys(pending: KeyResults) -> Result<HashMap<RowKey, EntryList>, SliceError> {
    let (keys, futures): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
    let lists = try_join_all(futures).await?;
    Ok(keys.into_iter().zip(lists).collect())
}

/// Await every `(query, key)` result; fails with the first error observed.
pub async fn collect_multi_slices(
    pending: SliceResults,
) -> Result<HashMap<SliceQuery, HashMap<RowKey, EntryList>>, SliceError> {
    let (queries, per_key): (Vec<_>, Vec<_>) = pending.into_iter().unzip();
    let resolved = try_join_all(per_key.into_iter().map(collect_keys)).await?;
    Ok(queries.into_iter().zip(resolved).collect())
}
