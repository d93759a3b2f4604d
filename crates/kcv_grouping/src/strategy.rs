//! Key-grouping strategies: decide which row keys may share one multi-key
//! physical request.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::config::KeyGroupingClass;
use crate::topology::{PartitionMap, Token};
use crate::types::{KeysGroup, RowKey};

/// Result of partitioning a key set.
///
/// `groups` and `leftover` together hold every input key exactly once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyPartition {
    pub groups: Vec<KeysGroup>,
    pub leftover: Vec<RowKey>,
}

/// Pluggable capability that partitions row keys into multi-key groups.
pub trait KeyGroupingStrategy: Send + Sync + 'static {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Partition duplicate-free `keys` into groups of at most `group_limit`
    /// keys plus the keys that must be executed individually.
    fn partition(&self, keys: &[RowKey], group_limit: usize) -> KeyPartition;
}

/// Build one of the built-in strategies.
pub fn build_strategy(
    class: KeyGroupingClass,
    partition_map: Option<Arc<dyn PartitionMap>>,
) -> Arc<dyn KeyGroupingStrategy> {
    match class {
        KeyGroupingClass::Chunked => Arc::new(ChunkedKeyGrouping),
        KeyGroupingClass::TokenRangeAware => Arc::new(TokenRangeAwareKeyGrouping::new(partition_map)),
        KeyGroupingClass::ReplicasAware => Arc::new(ReplicasAwareKeyGrouping::new(partition_map)),
    }
}

/// Fixed-size chunks in input order, without placement awareness.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkedKeyGrouping;

impl KeyGroupingStrategy for ChunkedKeyGrouping {
    fn name(&self) -> &'static str {
        KeyGroupingClass::Chunked.as_str()
    }

    fn partition(&self, keys: &[RowKey], group_limit: usize) -> KeyPartition {
        let mut partition = KeyPartition::default();
        chunk_bucket(keys.to_vec(), None, group_limit, &mut partition);
        partition
    }
}

/// Keys whose tokens fall into the same token range share a group.
#[derive(Clone, Default)]
pub struct TokenRangeAwareKeyGrouping {
    partition_map: Option<Arc<dyn PartitionMap>>,
}

impl TokenRangeAwareKeyGrouping {
    pub fn new(partition_map: Option<Arc<dyn PartitionMap>>) -> Self {
        Self { partition_map }
    }
}

impl KeyGroupingStrategy for TokenRangeAwareKeyGrouping {
    fn name(&self) -> &'static str {
        KeyGroupingClass::TokenRangeAware.as_str()
    }

    fn partition(&self, keys: &[RowKey], group_limit: usize) -> KeyPartition {
        let Some(map) = self.partition_map.as_deref() else {
            return all_leftover(keys);
        };
        bucket_by(keys, group_limit, map, |token| map.token_range_of(token))
    }
}

/// Keys whose tokens are replicated on the same node set share a group.
///
/// Coarser than token-range grouping: several ranges replicated on the same
/// nodes collapse into one bucket.
#[derive(Clone, Default)]
pub struct ReplicasAwareKeyGrouping {
    partition_map: Option<Arc<dyn PartitionMap>>,
}

impl ReplicasAwareKeyGrouping {
    pub fn new(partition_map: Option<Arc<dyn PartitionMap>>) -> Self {
        Self { partition_map }
    }
}

impl KeyGroupingStrategy for ReplicasAwareKeyGrouping {
    fn name(&self) -> &'static str {
        KeyGroupingClass::ReplicasAware.as_str()
    }

    fn partition(&self, keys: &[RowKey], group_limit: usize) -> KeyPartition {
        let Some(map) = self.partition_map.as_deref() else {
            return all_leftover(keys);
        };
        bucket_by(keys, group_limit, map, |token| map.replicas_of(token))
    }
}

fn all_leftover(keys: &[RowKey]) -> KeyPartition {
    KeyPartition {
        groups: Vec::new(),
        leftover: keys.to_vec(),
    }
}

/// Bucket keys by a placement attribute of their token, then chunk buckets.
///
/// Buckets are emitted in order of their first key; keys without a token or
/// without a placement go to leftover.
fn bucket_by<B, F>(
    keys: &[RowKey],
    group_limit: usize,
    map: &dyn PartitionMap,
    placement: F,
) -> KeyPartition
where
    B: Eq + Hash,
    F: Fn(Token) -> Option<B>,
{
    let mut partition = KeyPartition::default();
    let mut slots: HashMap<B, usize> = HashMap::new();
    let mut buckets: Vec<(Token, Vec<RowKey>)> = Vec::new();
    for key in keys {
        let Some(token) = map.token_of(key) else {
            partition.leftover.push(key.clone());
            continue;
        };
        let Some(bucket) = placement(token) else {
            partition.leftover.push(key.clone());
            continue;
        };
        let slot = *slots.entry(bucket).or_insert_with(|| {
            buckets.push((token, Vec::new()));
            buckets.len() - 1
        });
        buckets[slot].1.push(key.clone());
    }
    for (token, keys) in buckets {
        chunk_bucket(keys, Some(token), group_limit, &mut partition);
    }
    partition
}

/// Split one bucket into groups of at most `group_limit` keys. A chunk with a
/// single key is demoted to leftover.
fn chunk_bucket(
    keys: Vec<RowKey>,
    routing_token: Option<Token>,
    group_limit: usize,
    partition: &mut KeyPartition,
) {
    for chunk in keys.chunks(group_limit.max(1)) {
        if chunk.len() < 2 {
            partition.leftover.extend_from_slice(chunk);
        } else {
            partition
                .groups
                .push(KeysGroup::new(chunk.to_vec(), routing_token));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{ReplicaSet, ShardTopology, TokenRange, TopologyShard};
    use bytes::Bytes;
    use std::collections::HashSet;

    fn keys(count: usize) -> Vec<RowKey> {
        (0..count)
            .map(|idx| Bytes::from(format!("key-{idx:04}")))
            .collect()
    }

    fn assert_exact(keys: &[RowKey], partition: &KeyPartition, group_limit: usize) {
        let mut seen = HashSet::new();
        for group in &partition.groups {
            assert!(group.len() >= 2, "singleton group {group:?}");
            assert!(group.len() <= group_limit, "oversized group {group:?}");
            for key in group.keys() {
                assert!(seen.insert(key.clone()), "duplicate key {key:?}");
            }
        }
        for key in &partition.leftover {
            assert!(seen.insert(key.clone()), "duplicate key {key:?}");
        }
        assert_eq!(seen, keys.iter().cloned().collect::<HashSet<_>>());
    }

    /// Tokens are the first byte of the key; ranges are `[0, 127]` and
    /// `[128, 255]`, both replicated on the same node. Keys starting with
    /// `b'!'` have no token.
    struct ByteMap;

    impl PartitionMap for ByteMap {
        fn token_of(&self, key: &[u8]) -> Option<Token> {
            match key.first() {
                Some(b'!') | None => None,
                Some(byte) => Some(u64::from(*byte)),
            }
        }

        fn token_range_of(&self, token: Token) -> Option<TokenRange> {
            if token < 128 {
                Some(TokenRange { start: 0, end: 127 })
            } else {
                Some(TokenRange { start: 128, end: 255 })
            }
        }

        fn replicas_of(&self, _token: Token) -> Option<ReplicaSet> {
            Some(ReplicaSet::from([1]))
        }
    }

    #[test]
    fn chunked_splits_in_order_and_demotes_singletons() {
        let input = keys(5);
        let partition = ChunkedKeyGrouping.partition(&input, 2);
        assert_eq!(partition.groups.len(), 2);
        assert_eq!(partition.groups[0].keys(), &input[0..2]);
        assert_eq!(partition.groups[1].keys(), &input[2..4]);
        assert_eq!(partition.leftover, vec![input[4].clone()]);
        assert_eq!(partition.groups[0].routing_token(), None);
    }

    #[test]
    fn limit_of_one_groups_nothing() {
        let input = keys(4);
        let partition = ChunkedKeyGrouping.partition(&input, 1);
        assert!(partition.groups.is_empty());
        assert_eq!(partition.leftover, input);
    }

    #[test]
    fn token_range_strategy_separates_ranges() {
        let input = vec![
            Bytes::from_static(&[0x10, 1]),
            Bytes::from_static(&[0x90, 1]),
            Bytes::from_static(&[0x11, 2]),
            Bytes::from_static(&[0x91, 2]),
            Bytes::from_static(b"!nowhere"),
        ];
        let strategy = TokenRangeAwareKeyGrouping::new(Some(Arc::new(ByteMap)));
        let partition = strategy.partition(&input, 10);
        assert_eq!(partition.groups.len(), 2);
        assert_eq!(partition.groups[0].keys(), &[input[0].clone(), input[2].clone()]);
        assert_eq!(partition.groups[0].routing_token(), Some(0x10));
        assert_eq!(partition.groups[1].keys(), &[input[1].clone(), input[3].clone()]);
        assert_eq!(partition.leftover, vec![input[4].clone()]);
    }

    #[test]
    fn replicas_strategy_merges_ranges_on_the_same_nodes() {
        let input = vec![
            Bytes::from_static(&[0x10]),
            Bytes::from_static(&[0x90]),
            Bytes::from_static(&[0x11]),
        ];
        let strategy = ReplicasAwareKeyGrouping::new(Some(Arc::new(ByteMap)));
        let partition = strategy.partition(&input, 10);
        assert_eq!(partition.groups.len(), 1);
        assert_eq!(partition.groups[0].len(), 3);
        assert!(partition.leftover.is_empty());
    }

    #[test]
    fn affinity_strategies_without_map_leave_everything_over() {
        let input = keys(6);
        for strategy in [
            build_strategy(KeyGroupingClass::ReplicasAware, None),
            build_strategy(KeyGroupingClass::TokenRangeAware, None),
        ] {
            let partition = strategy.partition(&input, 4);
            assert!(partition.groups.is_empty(), "{}", strategy.name());
            assert_eq!(partition.leftover, input);
        }
    }

    #[test]
    fn partitions_are_exact_for_every_strategy() {
        let topology: Arc<dyn PartitionMap> =
            Arc::new(ShardTopology::uniform(8, &[1, 2, 3, 4], 2).expect("build topology"));
        let gapped: Arc<dyn PartitionMap> = Arc::new(
            ShardTopology::new(vec![TopologyShard {
                shard_id: 1,
                start_hash: 0,
                end_hash: u64::MAX / 2,
                replicas: vec![1],
                leaseholder: None,
            }])
            .expect("build topology"),
        );
        for count in [0, 1, 2, 3, 17, 64, 200] {
            let input = keys(count);
            for limit in [1, 2, 3, 10, 50] {
                for strategy in [
                    build_strategy(KeyGroupingClass::Chunked, None),
                    build_strategy(KeyGroupingClass::TokenRangeAware, Some(topology.clone())),
                    build_strategy(KeyGroupingClass::ReplicasAware, Some(topology.clone())),
                    build_strategy(KeyGroupingClass::TokenRangeAware, Some(gapped.clone())),
                    build_strategy(KeyGroupingClass::ReplicasAware, Some(gapped.clone())),
                ] {
                    let partition = strategy.partition(&input, limit);
                    assert_exact(&input, &partition, limit);
                }
            }
        }
    }
}
