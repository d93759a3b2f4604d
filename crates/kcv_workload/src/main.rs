//! Workload generator for the grouped slice-query executor.
//!
//! Seeds an in-memory wide-column store, replays random multi-key,
//! multi-slice batches through a grouped executor and through a fully
//! ungrouped one, checks both return identical results and writes a JSON
//! report comparing their physical call counts.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use kcv_grouping::{
    collect_multi_slices, EntryList, GroupingConfig, GroupingExecutor, GroupingStatsSnapshot,
    KeysQueriesGroup, MemoryClient, MultiKeysQueryGroups, NodeId, PartitionMap,
    PassAllBackPressure, QueryBackPressure, RowKey, SemaphoreBackPressure, ShardTopology,
    SliceQuery,
};
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "kcv-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of stored rows.
    #[arg(long, default_value_t = 500)]
    rows: usize,

    /// Columns stored per row.
    #[arg(long, default_value_t = 64)]
    columns: u32,

    /// Number of batches replayed through each executor.
    #[arg(long, default_value_t = 100)]
    batches: usize,

    /// Key sets per batch.
    #[arg(long, default_value_t = 3)]
    groups_per_batch: usize,

    /// Row keys per key set.
    #[arg(long, default_value_t = 16)]
    keys_per_group: usize,

    /// Point-equivalent queries per key set.
    #[arg(long, default_value_t = 8)]
    point_queries: usize,

    /// Range queries per key set.
    #[arg(long, default_value_t = 2)]
    range_queries: usize,

    /// Percent of queries that carry a small result limit.
    #[arg(long, default_value_t = 25)]
    limited_pct: u8,

    /// Token ranges in the simulated cluster.
    #[arg(long, default_value_t = 16)]
    shards: usize,

    /// Nodes in the simulated cluster.
    #[arg(long, default_value_t = 3)]
    nodes: u64,

    /// Replicas per token range.
    #[arg(long, default_value_t = 2)]
    replication: usize,

    /// Concurrent physical requests allowed (0 disables backpressure).
    #[arg(long, default_value_t = 0)]
    permits: usize,

    /// Artificial latency added to every physical request, in microseconds.
    #[arg(long, default_value_t = 0)]
    latency_us: u64,

    /// Percent of physical requests that fail.
    #[arg(long, default_value_t = 0)]
    fault_pct: u8,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the JSON report to this path.
    #[arg(long, default_value = ".tmp/kcv-workload/report.json")]
    out: PathBuf,

    #[command(flatten)]
    grouping: GroupingConfig,
}

/// Parameters embedded in the report for reproducibility.
#[derive(Serialize, Debug, Clone)]
struct ReportMeta {
    rows: usize,
    columns: u32,
    batches: usize,
    groups_per_batch: usize,
    keys_per_group: usize,
    point_queries: usize,
    range_queries: usize,
    limited_pct: u8,
    shards: usize,
    nodes: u64,
    replication: usize,
    permits: usize,
    latency_us: u64,
    fault_pct: u8,
    seed: u64,
    grouping: GroupingConfig,
}

/// Outcome of replaying every batch through one executor.
#[derive(Serialize, Debug, Clone)]
struct ExecutorReport {
    elapsed_ms: f64,
    failed_batches: usize,
    stats: GroupingStatsSnapshot,
}

#[derive(Serialize, Debug, Clone)]
struct Report {
    meta: ReportMeta,
    grouped: ExecutorReport,
    ungrouped: ExecutorReport,
    /// Batches where both executors succeeded but returned different results.
    mismatched_batches: usize,
    /// Batches compared (both executors succeeded).
    compared_batches: usize,
    /// Physical calls saved by grouping, as a fraction of ungrouped calls.
    call_reduction: f64,
}

type Resolved = HashMap<SliceQuery, HashMap<RowKey, EntryList>>;

/// Upper bound for `--columns`; generated query bounds stay below `u32::MAX`.
const MAX_COLUMNS: u32 = 1 << 20;

/// Parse CLI args, initialize logging, and run the requested subcommand.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

/// Replay the workload through both executors and write the report.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.rows > 0, "--rows must be > 0");
    anyhow::ensure!(
        args.columns > 0 && args.columns <= MAX_COLUMNS,
        "--columns must be in 1..={MAX_COLUMNS}"
    );
    anyhow::ensure!(args.keys_per_group > 0, "--keys-per-group must be > 0");
    anyhow::ensure!(
        args.point_queries + args.range_queries > 0,
        "at least one of --point-queries and --range-queries must be > 0"
    );
    anyhow::ensure!(args.nodes > 0, "--nodes must be > 0");
    anyhow::ensure!(args.limited_pct <= 100, "--limited-pct must be <= 100");
    anyhow::ensure!(args.fault_pct <= 100, "--fault-pct must be <= 100");

    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);

    let client = Arc::new(build_client(&args));
    seed_rows(&client, args.rows, args.columns);
    tracing::info!(rows = args.rows, columns = args.columns, seed, "seeded in-memory store");

    let nodes = (1..=args.nodes).collect::<Vec<NodeId>>();
    let topology: Arc<dyn PartitionMap> = Arc::new(
        ShardTopology::uniform(args.shards, &nodes, args.replication)
            .context("build partition topology")?,
    );
    let backpressure: Arc<dyn QueryBackPressure> = if args.permits == 0 {
        Arc::new(PassAllBackPressure)
    } else {
        Arc::new(SemaphoreBackPressure::new(args.permits))
    };

    let grouped = GroupingExecutor::builder(client.clone())
        .config(args.grouping.clone())
        .partition_map(topology.clone())
        .backpressure(backpressure.clone())
        .build()
        .context("build grouped executor")?;
    let ungrouped = GroupingExecutor::builder(client.clone())
        .config(GroupingConfig::disabled())
        .partition_map(topology)
        .backpressure(backpressure)
        .build()
        .context("build ungrouped executor")?;

    let mut grouped_elapsed = Duration::ZERO;
    let mut ungrouped_elapsed = Duration::ZERO;
    let mut grouped_failed = 0usize;
    let mut ungrouped_failed = 0usize;
    let mut compared = 0usize;
    let mut mismatched = 0usize;

    for batch in 0..args.batches {
        let groups = random_batch(&mut rng, &args)?;
        let tx = batch as u64;

        let (grouped_result, elapsed) = replay(&grouped, &groups, tx).await;
        grouped_elapsed += elapsed;
        let (ungrouped_result, elapsed) = replay(&ungrouped, &groups, tx).await;
        ungrouped_elapsed += elapsed;

        match (grouped_result, ungrouped_result) {
            (Ok(left), Ok(right)) => {
                compared += 1;
                if left != right {
                    mismatched += 1;
                    tracing::error!(batch, "grouped and ungrouped results differ");
                }
            }
            (left, right) => {
                if let Err(err) = &left {
                    grouped_failed += 1;
                    tracing::debug!(batch, error = %err, "grouped batch failed");
                }
                if let Err(err) = &right {
                    ungrouped_failed += 1;
                    tracing::debug!(batch, error = %err, "ungrouped batch failed");
                }
            }
        }
    }

    let grouped_stats = grouped.stats().snapshot();
    let ungrouped_stats = ungrouped.stats().snapshot();
    let call_reduction = if ungrouped_stats.total_calls() == 0 {
        0.0
    } else {
        1.0 - grouped_stats.total_calls() as f64 / ungrouped_stats.total_calls() as f64
    };
    tracing::info!(
        grouped_calls = grouped_stats.total_calls(),
        ungrouped_calls = ungrouped_stats.total_calls(),
        call_reduction,
        compared,
        mismatched,
        "workload finished"
    );

    let report = Report {
        meta: ReportMeta {
            rows: args.rows,
            columns: args.columns,
            batches: args.batches,
            groups_per_batch: args.groups_per_batch,
            keys_per_group: args.keys_per_group,
            point_queries: args.point_queries,
            range_queries: args.range_queries,
            limited_pct: args.limited_pct,
            shards: args.shards,
            nodes: args.nodes,
            replication: args.replication,
            permits: args.permits,
            latency_us: args.latency_us,
            fault_pct: args.fault_pct,
            seed,
            grouping: args.grouping.clone(),
        },
        grouped: ExecutorReport {
            elapsed_ms: grouped_elapsed.as_secs_f64() * 1000.0,
            failed_batches: grouped_failed,
            stats: grouped_stats,
        },
        ungrouped: ExecutorReport {
            elapsed_ms: ungrouped_elapsed.as_secs_f64() * 1000.0,
            failed_batches: ungrouped_failed,
            stats: ungrouped_stats,
        },
        mismatched_batches: mismatched,
        compared_batches: compared,
        call_reduction,
    };
    write_report(&args.out, &report).context("write report")?;
    eprintln!("wrote report: {}", args.out.display());

    anyhow::ensure!(
        mismatched == 0,
        "{mismatched} of {compared} batches returned different results when grouped"
    );
    Ok(())
}

fn build_client(args: &RunArgs) -> MemoryClient {
    let mut client = MemoryClient::new();
    if args.latency_us > 0 {
        client = client.with_latency(Duration::from_micros(args.latency_us));
    }
    if args.fault_pct > 0 {
        let pct = u32::from(args.fault_pct);
        client = client.fail_when(move |_| rand::thread_rng().gen_range(0..100) < pct);
    }
    client
}

fn row_key(idx: usize) -> RowKey {
    Bytes::from(format!("row-{idx:08}"))
}

/// Fixed-width column names keep point ranges exact.
fn column(idx: u32) -> Bytes {
    Bytes::copy_from_slice(&idx.to_be_bytes())
}

fn seed_rows(client: &MemoryClient, rows: usize, columns: u32) {
    for row in 0..rows {
        for col in 0..columns {
            client.insert(row_key(row), column(col), Bytes::from(format!("{row}:{col}")));
        }
    }
}

/// Build one batch of disjoint key sets with their slice queries.
fn random_batch(rng: &mut SmallRng, args: &RunArgs) -> anyhow::Result<MultiKeysQueryGroups> {
    let wanted = (args.groups_per_batch * args.keys_per_group).min(args.rows);
    let mut picked = index::sample(rng, args.rows, wanted)
        .into_iter()
        .map(row_key)
        .collect::<Vec<_>>();
    let mut groups = MultiKeysQueryGroups::default();
    while !picked.is_empty() {
        let take = args.keys_per_group.min(picked.len());
        let keys = picked.drain(..take).collect::<Vec<_>>();
        let mut queries = Vec::with_capacity(args.point_queries + args.range_queries);
        for _ in 0..args.point_queries {
            // Occasionally ask for a column past the stored ones.
            let col = rng.gen_range(0..args.columns + 2);
            queries.push(maybe_limited(
                rng,
                args.limited_pct,
                SliceQuery::new(column(col), column(col + 1))?,
            )?);
        }
        for _ in 0..args.range_queries {
            let start = rng.gen_range(0..args.columns);
            let len = rng.gen_range(1..=8);
            queries.push(maybe_limited(
                rng,
                args.limited_pct,
                SliceQuery::new(column(start), column(start + len))?,
            )?);
        }
        groups.push(KeysQueriesGroup::new(keys, queries));
    }
    Ok(groups)
}

fn maybe_limited(
    rng: &mut SmallRng,
    limited_pct: u8,
    query: SliceQuery,
) -> anyhow::Result<SliceQuery> {
    if rng.gen_range(0..100) < u32::from(limited_pct) {
        query.with_limit(rng.gen_range(1..=3))
    } else {
        Ok(query)
    }
}

async fn replay(
    executor: &GroupingExecutor<MemoryClient>,
    groups: &MultiKeysQueryGroups,
    tx: u64,
) -> (anyhow::Result<Resolved>, Duration) {
    let start = Instant::now();
    let result = collect_multi_slices(executor.execute_multi_key_multi_slice(groups, &tx))
        .await
        .map_err(anyhow::Error::from);
    (result, start.elapsed())
}

fn write_report(path: &PathBuf, report: &Report) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        // Ensure the output directory exists before writing.
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["kcv-workload", "run"];
        argv.extend_from_slice(extra);
        match Args::try_parse_from(argv).expect("parse args").cmd {
            Command::Run(args) => args,
        }
    }

    #[test]
    fn grouping_flags_are_flattened_into_run() {
        let args = args(&["--keys-grouping-allowed", "true", "--slice-grouping-limit", "4"]);
        assert!(args.grouping.keys_grouping_allowed);
        assert_eq!(args.grouping.slice_grouping_limit, 4);
        assert_eq!(args.rows, 500);
    }

    #[test]
    fn batches_use_disjoint_keys() {
        let args = args(&["--rows", "40", "--groups-per-batch", "3", "--keys-per-group", "5"]);
        let mut rng = SmallRng::seed_from_u64(3);
        let batch = random_batch(&mut rng, &args).expect("random batch");
        let mut keys = batch
            .groups()
            .iter()
            .flat_map(|group| group.keys.iter().cloned())
            .collect::<Vec<_>>();
        assert_eq!(keys.len(), 15);
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 15);
        assert_eq!(batch.groups().len(), 3);
    }

    #[tokio::test]
    async fn oversized_column_count_is_rejected() {
        let max = u32::MAX.to_string();
        let err = run(args(&["--columns", &max]))
            .await
            .expect_err("column count out of range");
        assert!(err.to_string().contains("--columns"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn small_workload_writes_a_clean_report() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("kcv-workload-{}", std::process::id()));
        let out = dir.join("report.json");
        let out_arg = out.to_string_lossy().to_string();
        let args = args(&[
            "--rows",
            "50",
            "--columns",
            "16",
            "--batches",
            "10",
            "--seed",
            "9",
            "--keys-grouping-allowed",
            "true",
            "--out",
            &out_arg,
        ]);
        run(args).await?;

        let report: serde_json::Value = serde_json::from_slice(&std::fs::read(&out)?)?;
        assert_eq!(report["mismatched_batches"], 0);
        assert_eq!(report["compared_batches"], 10);
        assert!(report["call_reduction"].as_f64().unwrap_or_default() > 0.0);
        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }
}
