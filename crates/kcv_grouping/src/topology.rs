//! Partition placement used by the affinity-aware key-grouping strategies.
//!
//! A row key hashes to a token; tokens are owned by shards, each shard covers
//! an inclusive token range and is replicated on a set of nodes. Two keys can
//! share one multi-key request when they land on the same token range (or the
//! same replica set, for the coarser strategy).

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Position of a row key on the partitioner ring.
pub type Token = u64;
/// Node identifier inside the storage cluster.
pub type NodeId = u64;
/// Nodes holding a copy of one token range.
pub type ReplicaSet = BTreeSet<NodeId>;

/// Inclusive range of tokens owned by one shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenRange {
    pub start: Token,
    pub end: Token,
}

impl TokenRange {
    pub fn contains(&self, token: Token) -> bool {
        token >= self.start && token <= self.end
    }
}

/// Placement lookups consumed by the key-grouping strategies.
///
/// Any lookup may return `None` when placement is unknown; keys without a
/// placement are executed individually.
pub trait PartitionMap: Send + Sync + 'static {
    fn token_of(&self, key: &[u8]) -> Option<Token>;
    fn token_range_of(&self, token: Token) -> Option<TokenRange>;
    fn replicas_of(&self, token: Token) -> Option<ReplicaSet>;
}

/// One shard: an inclusive hash range and the nodes that replicate it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TopologyShard {
    pub shard_id: u64,
    pub start_hash: u64,
    pub end_hash: u64,
    pub replicas: Vec<NodeId>,
    #[serde(default)]
    pub leaseholder: Option<NodeId>,
}

/// Static shard map implementing [`PartitionMap`] with [`hash_key`] tokens.
#[derive(Clone, Debug)]
pub struct ShardTopology {
    /// Shards sorted by `start_hash`.
    shards: Vec<TopologyShard>,
}

impl ShardTopology {
    /// Build a topology from shard descriptors.
    ///
    /// Shards must be non-empty, have `start_hash <= end_hash`, list at least
    /// one replica and must not overlap. Gaps are allowed; tokens in a gap
    /// have no placement.
    pub fn new(mut shards: Vec<TopologyShard>) -> Result<Self> {
        if shards.is_empty() {
            return Err(anyhow!("partition topology has no shards"));
        }
        shards.sort_by_key(|shard| shard.start_hash);
        for shard in &shards {
            if shard.start_hash > shard.end_hash {
                return Err(anyhow!(
                    "shard {} has inverted hash range {}..={}",
                    shard.shard_id,
                    shard.start_hash,
                    shard.end_hash
                ));
            }
            if shard.replicas.is_empty() {
                return Err(anyhow!("shard {} has no replicas", shard.shard_id));
            }
        }
        for pair in shards.windows(2) {
            if pair[1].start_hash <= pair[0].end_hash {
                return Err(anyhow!(
                    "shards {} and {} overlap",
                    pair[0].shard_id,
                    pair[1].shard_id
                ));
            }
        }
        Ok(Self { shards })
    }

    /// Split the full token space into `shard_count` equal ranges and place
    /// `replication_factor` consecutive nodes (round-robin) on each.
    pub fn uniform(shard_count: usize, nodes: &[NodeId], replication_factor: usize) -> Result<Self> {
        if shard_count == 0 {
            return Err(anyhow!("shard count must be > 0"));
        }
        if nodes.is_empty() {
            return Err(anyhow!("topology needs at least one node"));
        }
        let replication_factor = replication_factor.clamp(1, nodes.len());
        let width = u64::MAX / shard_count as u64;
        let mut shards = Vec::with_capacity(shard_count);
        for idx in 0..shard_count {
            let start_hash = width * idx as u64;
            // The last shard absorbs the division remainder.
            let end_hash = if idx + 1 == shard_count {
                u64::MAX
            } else {
                width * (idx as u64 + 1) - 1
            };
            let replicas = (0..replication_factor)
                .map(|offset| nodes[(idx + offset) % nodes.len()])
                .collect::<Vec<_>>();
            shards.push(TopologyShard {
                shard_id: idx as u64,
                start_hash,
                end_hash,
                leaseholder: replicas.first().copied(),
                replicas,
            });
        }
        Self::new(shards)
    }

    /// Parse a topology from JSON: `{"shards": [{"shard_id": .., "start_hash": ..,
    /// "end_hash": .., "replicas": [..]}]}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: TopologyView =
            serde_json::from_str(raw).context("parse partition topology json")?;
        Self::new(parsed.shards)
    }

    pub fn shards(&self) -> &[TopologyShard] {
        &self.shards
    }

    fn shard_for_token(&self, token: Token) -> Option<&TopologyShard> {
        // Shards are sorted and disjoint: the candidate is the last shard
        // starting at or before the token.
        let idx = self
            .shards
            .partition_point(|shard| shard.start_hash <= token);
        let shard = self.shards.get(idx.checked_sub(1)?)?;
        (token <= shard.end_hash).then_some(shard)
    }
}

impl PartitionMap for ShardTopology {
    fn token_of(&self, key: &[u8]) -> Option<Token> {
        Some(hash_key(key))
    }

    fn token_range_of(&self, token: Token) -> Option<TokenRange> {
        self.shard_for_token(token).map(|shard| TokenRange {
            start: shard.start_hash,
            end: shard.end_hash,
        })
    }

    fn replicas_of(&self, token: Token) -> Option<ReplicaSet> {
        self.shard_for_token(token)
            .map(|shard| shard.replicas.iter().copied().collect())
    }
}

/// Wire model for topology files.
#[derive(Debug, Deserialize)]
struct TopologyView {
    shards: Vec<TopologyShard>,
}

/// Computes a stable u64 hash for key-based shard routing.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_topology_covers_every_token() {
        let topology = ShardTopology::uniform(4, &[1, 2, 3], 2).expect("build topology");
        assert_eq!(topology.shards().len(), 4);
        for token in [0, 1, u64::MAX / 4, u64::MAX / 2, u64::MAX - 1, u64::MAX] {
            let range = topology.token_range_of(token).expect("token is placed");
            assert!(range.contains(token), "token {token} outside {range:?}");
            let replicas = topology.replicas_of(token).expect("replicas present");
            assert_eq!(replicas.len(), 2);
        }
    }

    #[test]
    fn uniform_topology_rotates_replicas() {
        let topology = ShardTopology::uniform(3, &[10, 20, 30], 1).expect("build topology");
        let leaders = topology
            .shards()
            .iter()
            .map(|shard| shard.replicas.clone())
            .collect::<Vec<_>>();
        assert_eq!(leaders, vec![vec![10], vec![20], vec![30]]);
    }

    #[test]
    fn gaps_have_no_placement() {
        let topology = ShardTopology::new(vec![
            TopologyShard {
                shard_id: 1,
                start_hash: 0,
                end_hash: 99,
                replicas: vec![1],
                leaseholder: None,
            },
            TopologyShard {
                shard_id: 2,
                start_hash: 200,
                end_hash: 299,
                replicas: vec![2],
                leaseholder: None,
            },
        ])
        .expect("build topology");
        assert_eq!(
            topology.token_range_of(50),
            Some(TokenRange { start: 0, end: 99 })
        );
        assert_eq!(topology.token_range_of(150), None);
        assert_eq!(topology.replicas_of(250), Some(ReplicaSet::from([2])));
        assert_eq!(topology.token_range_of(300), None);
    }

    #[test]
    fn overlapping_shards_are_rejected() {
        let err = ShardTopology::new(vec![
            TopologyShard {
                shard_id: 1,
                start_hash: 0,
                end_hash: 100,
                replicas: vec![1],
                leaseholder: None,
            },
            TopologyShard {
                shard_id: 2,
                start_hash: 100,
                end_hash: 200,
                replicas: vec![1],
                leaseholder: None,
            },
        ])
        .expect_err("overlap must fail");
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn topology_parses_from_json() {
        let raw = r#"{"shards": [
            {"shard_id": 7, "start_hash": 0, "end_hash": 18446744073709551615, "replicas": [3, 1]}
        ]}"#;
        let topology = ShardTopology::from_json(raw).expect("parse topology");
        assert_eq!(topology.replicas_of(42), Some(ReplicaSet::from([1, 3])));
        assert!(ShardTopology::from_json(r#"{"shards": []}"#).is_err());
    }
}
