mod common;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use common::{executor, grouped_config, limited, range, row, seed, topology};
use kcv_grouping::{
    collect_keys, collect_multi_slices, EntryList, GroupingConfig, GroupingExecutor,
    KeysQueriesGroup, MemoryClient, MultiKeysQueryGroups, RowKey, SliceQuery,
};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const ROWS: usize = 40;
const COLUMNS: u16 = 24;

type Resolved = HashMap<SliceQuery, HashMap<RowKey, EntryList>>;

fn random_query(rng: &mut SmallRng) -> SliceQuery {
    // Columns past COLUMNS exercise empty answers.
    let start = rng.gen_range(0..COLUMNS + 4);
    let query = match rng.gen_range(0..3) {
        0 => range(start, start + 1),
        1 => range(start, start + rng.gen_range(0..6)),
        _ => {
            let other = rng.gen_range(0..COLUMNS + 4);
            range(start.min(other), start.max(other))
        }
    };
    if rng.gen_bool(0.4) {
        limited(query, rng.gen_range(1..4))
    } else {
        query
    }
}

fn random_groups(rng: &mut SmallRng) -> MultiKeysQueryGroups {
    // Include a few keys that are not stored at all.
    let mut keys = (0..ROWS + 5).map(row).collect::<Vec<_>>();
    keys.shuffle(rng);
    let mut groups = MultiKeysQueryGroups::default();
    let mut remaining = &keys[..rng.gen_range(1..keys.len())];
    while !remaining.is_empty() {
        let take = rng.gen_range(1..=remaining.len().min(12));
        let (group_keys, rest) = remaining.split_at(take);
        remaining = rest;
        let queries = (0..rng.gen_range(1..8))
            .map(|_| random_query(rng))
            .collect::<Vec<_>>();
        groups.push(KeysQueriesGroup::new(group_keys.to_vec(), queries));
    }
    groups
}

fn grouped_configs() -> Vec<GroupingConfig> {
    let base = grouped_config();
    vec![
        GroupingConfig::default(),
        base.clone(),
        GroupingConfig {
            keys_grouping_class: "token-range-aware".to_string(),
            ..base.clone()
        },
        GroupingConfig {
            keys_grouping_class: "chunked".to_string(),
            keys_grouping_limit: 3,
            slice_grouping_limit: 2,
            ..base.clone()
        },
        GroupingConfig {
            slice_grouping_allowed: false,
            keys_grouping_class: "chunked".to_string(),
            ..base
        },
    ]
}

async fn run(executor: &GroupingExecutor<MemoryClient>, groups: &MultiKeysQueryGroups) -> Result<Resolved> {
    Ok(collect_multi_slices(executor.execute_multi_key_multi_slice(groups, &0)).await?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grouped_results_match_ungrouped_results() -> Result<()> {
    let client = Arc::new(MemoryClient::new());
    seed(&client, ROWS, COLUMNS);
    let baseline = executor(client.clone(), GroupingConfig::disabled());
    let candidates = grouped_configs()
        .into_iter()
        .map(|config| executor(client.clone(), config))
        .collect::<Vec<_>>();

    let mut rng = SmallRng::seed_from_u64(0x6b6376);
    for round in 0..40 {
        let groups = random_groups(&mut rng);
        let expected = run(&baseline, &groups).await?;
        for (idx, candidate) in candidates.iter().enumerate() {
            let actual = run(candidate, &groups).await?;
            assert_eq!(actual, expected, "round {round}, config #{idx}");
        }
    }

    // Grouping must have saved round trips somewhere.
    let baseline_calls = baseline.stats().snapshot().total_calls();
    for candidate in &candidates[1..] {
        assert!(candidate.stats().snapshot().total_calls() < baseline_calls);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_key_single_slice_matches_single_key_reads() -> Result<()> {
    let client = Arc::new(MemoryClient::new());
    seed(&client, ROWS, COLUMNS);
    let grouped = GroupingExecutor::builder(client.clone())
        .config(grouped_config())
        .partition_map(topology())
        .build()?;

    let mut rng = SmallRng::seed_from_u64(11);
    for _ in 0..30 {
        let keys = (0..rng.gen_range(1..ROWS + 3))
            .map(|_| row(rng.gen_range(0..ROWS + 3)))
            .collect::<Vec<_>>();
        let query = random_query(&mut rng);

        let results = collect_keys(grouped.execute_multi_key_single_slice(&keys, query.clone(), &0)).await?;

        for key in &keys {
            let single = grouped
                .execute_single_key_single_slice(key.clone(), query.clone(), &0)
                .await?;
            assert_eq!(results[key], single, "key {key:?} query {query:?}");
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn point_batches_return_exact_columns() -> Result<()> {
    let client = Arc::new(MemoryClient::new());
    seed(&client, 2, COLUMNS);
    let executor = executor(client, GroupingConfig::default());
    let queries = (0..COLUMNS)
        .step_by(3)
        .map(|idx| range(idx, idx + 1))
        .collect::<Vec<_>>();
    let groups = MultiKeysQueryGroups::new(vec![KeysQueriesGroup::new(vec![row(1)], queries.clone())]);

    let results = run(&executor, &groups).await?;

    for query in &queries {
        let entries = &results[query][&row(1)];
        assert_eq!(entries.len(), 1);
        assert_eq!(&entries[0].column, query.start());
    }
    Ok(())
}
