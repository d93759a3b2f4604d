//! Grouping configuration and the clamped settings derived from it.
//!
//! `GroupingConfig` is what operators write (CLI flags, `KCV_*` environment
//! variables or an embedded config section); `EffectiveGrouping` is what the
//! executor actually runs with after minimum-value clamping.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Default upper bound for grouped slice queries or keys per physical call.
pub const DEFAULT_GROUPING_LIMIT: usize = 20;
/// Default minimum number of keys before keys grouping is considered.
pub const DEFAULT_KEYS_GROUPING_MIN: usize = 2;

/// Operator-facing grouping options.
#[derive(Clone, Debug, PartialEq, Eq, clap::Args, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GroupingConfig {
    /// Group point-equivalent slice queries of one key into a multi-column
    /// request. When false every slice query is its own range request.
    #[arg(
        long,
        env = "KCV_SLICE_GROUPING_ALLOWED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub slice_grouping_allowed: bool,

    /// Maximum number of slice queries merged into one physical request.
    #[arg(long, env = "KCV_SLICE_GROUPING_LIMIT", default_value_t = DEFAULT_GROUPING_LIMIT)]
    pub slice_grouping_limit: usize,

    /// Group row keys with the same placement into one multi-key request.
    ///
    /// Multi-key requests return the row key with every column, trading
    /// response size for fewer round trips.
    #[arg(
        long,
        env = "KCV_KEYS_GROUPING_ALLOWED",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub keys_grouping_allowed: bool,

    /// Maximum number of row keys merged into one physical request.
    #[arg(long, env = "KCV_KEYS_GROUPING_LIMIT", default_value_t = DEFAULT_GROUPING_LIMIT)]
    pub keys_grouping_limit: usize,

    /// Requests with fewer keys than this are never keys-grouped.
    #[arg(long, env = "KCV_KEYS_GROUPING_MIN", default_value_t = DEFAULT_KEYS_GROUPING_MIN)]
    pub keys_grouping_min: usize,

    /// Keys grouping strategy: `replicas-aware`, `token-range-aware` or `chunked`.
    #[arg(long, env = "KCV_KEYS_GROUPING_CLASS", default_value = "replicas-aware")]
    pub keys_grouping_class: String,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            slice_grouping_allowed: true,
            slice_grouping_limit: DEFAULT_GROUPING_LIMIT,
            keys_grouping_allowed: false,
            keys_grouping_limit: DEFAULT_GROUPING_LIMIT,
            keys_grouping_min: DEFAULT_KEYS_GROUPING_MIN,
            keys_grouping_class: KeyGroupingClass::ReplicasAware.to_string(),
        }
    }
}

impl GroupingConfig {
    /// Configuration that issues one physical request per `(key, query)`.
    pub fn disabled() -> Self {
        Self {
            slice_grouping_allowed: false,
            keys_grouping_allowed: false,
            ..Self::default()
        }
    }

    /// Clamp every limit to its minimum, logging a warning for each clamped
    /// option, and derive which grouping dimensions are active.
    pub fn resolve(&self) -> EffectiveGrouping {
        let slice_grouping_limit =
            clamp_limit("slice-grouping-limit", self.slice_grouping_limit, 1);
        let keys_grouping_limit = clamp_limit("keys-grouping-limit", self.keys_grouping_limit, 1);
        let keys_grouping_min = clamp_limit(
            "keys-grouping-min",
            self.keys_grouping_min,
            DEFAULT_KEYS_GROUPING_MIN,
        );
        EffectiveGrouping {
            slice_grouping: self.slice_grouping_allowed && slice_grouping_limit > 1,
            slice_grouping_limit,
            keys_grouping: self.keys_grouping_allowed && keys_grouping_limit > 1,
            keys_grouping_limit,
            keys_grouping_min,
        }
    }

    /// Parse the configured strategy selector.
    pub fn key_grouping_class(&self) -> anyhow::Result<KeyGroupingClass> {
        self.keys_grouping_class.parse()
    }
}

fn clamp_limit(option: &'static str, value: usize, minimum: usize) -> usize {
    if value < minimum {
        tracing::warn!(
            option,
            configured = value,
            minimum,
            "grouping option below its minimum; forcing it to the minimum"
        );
        return minimum;
    }
    value
}

/// Grouping settings after clamping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EffectiveGrouping {
    pub slice_grouping: bool,
    pub slice_grouping_limit: usize,
    pub keys_grouping: bool,
    pub keys_grouping_limit: usize,
    pub keys_grouping_min: usize,
}

impl EffectiveGrouping {
    /// Whether `key_count` keys of one request are worth partitioning.
    pub fn keys_groupable(&self, key_count: usize) -> bool {
        self.keys_grouping && key_count >= self.keys_grouping_min
    }
}

/// Built-in key-grouping strategies selectable from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyGroupingClass {
    /// Keys replicated on the same node set share a request.
    ReplicasAware,
    /// Keys owned by the same token range share a request.
    TokenRangeAware,
    /// Fixed-size chunks without placement awareness.
    Chunked,
}

impl KeyGroupingClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReplicasAware => "replicas-aware",
            Self::TokenRangeAware => "token-range-aware",
            Self::Chunked => "chunked",
        }
    }

    /// True for strategies that group by placement and need a partition map.
    pub fn needs_partition_map(self) -> bool {
        matches!(self, Self::ReplicasAware | Self::TokenRangeAware)
    }
}

impl fmt::Display for KeyGroupingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyGroupingClass {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "replicas-aware" | "replicas_aware" => Ok(Self::ReplicasAware),
            "token-range-aware" | "token_range_aware" => Ok(Self::TokenRangeAware),
            "chunked" => Ok(Self::Chunked),
            other => Err(anyhow!(
                "unknown keys grouping strategy {other:?} (expected replicas-aware, token-range-aware or chunked)"
            )),
        }
    }
}
