//! Split slice queries into column-groupable and range-only sets.

use std::collections::{BTreeMap, HashSet};

use crate::types::SliceQuery;

/// Queries of one request after classification.
///
/// Every distinct input query appears in exactly one place: point-equivalent
/// queries under their limit in `by_limit`, everything else in `separate`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryGroups {
    pub by_limit: BTreeMap<u32, Vec<SliceQuery>>,
    pub separate: Vec<SliceQuery>,
}

impl QueryGroups {
    /// Number of classified queries.
    pub fn len(&self) -> usize {
        self.by_limit.values().map(Vec::len).sum::<usize>() + self.separate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classify queries into point-equivalent buckets keyed by limit and ranges.
///
/// Duplicate queries collapse into one entry; input order is otherwise kept.
pub fn classify(queries: &[SliceQuery]) -> QueryGroups {
    let mut seen = HashSet::with_capacity(queries.len());
    let mut groups = QueryGroups::default();
    for query in queries {
        if !seen.insert(query) {
            continue;
        }
        if query.is_point() {
            groups
                .by_limit
                .entry(query.limit())
                .or_default()
                .push(query.clone());
        } else {
            groups.separate.push(query.clone());
        }
    }
    groups
}
