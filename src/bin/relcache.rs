//! Binary entry point for the relcache inspection CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use relcache::{
    cli::Snapshot,
    storage::{CounterMetrics, IndexStats, MetricsSnapshot},
    CacheOptions, EdgeIndex, HealthCheck, Kind, MemoryStore, ObjectId, ObjectIdSet, Relation,
    RelationCache, UsageInfo,
};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

#[path = "relcache/config.rs"]
mod config;

use config::CliConfig;

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const CYCLE_EXIT_CODE: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "relcache",
    version,
    about = "Inspect object relationships loaded from a snapshot",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "RELCACHE_CONFIG",
        help = "CLI config file (defaults to <config dir>/relcache/cli.toml)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_name = "MS",
        help = "How long to wait for the cache to populate"
    )]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct SnapshotArg {
    #[arg(value_name = "SNAPSHOT", help = "JSON snapshot of objects")]
    snapshot: PathBuf,
}

#[derive(Args, Debug)]
struct QueryArgs {
    #[command(flatten)]
    source: SnapshotArg,

    #[arg(value_name = "ID", help = "Object id as Kind/namespace/name")]
    id: ObjectId,

    #[arg(long, help = "Only follow edges with this relation")]
    relation: Option<Relation>,

    #[arg(long, help = "Only report objects of this kind")]
    kind: Option<Kind>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index size, population health and counters.
    Stats {
        #[command(flatten)]
        source: SnapshotArg,
    },
    /// Objects the given object points at.
    Deps(QueryArgs),
    /// Objects pointing at the given object.
    Users(QueryArgs),
    /// Check whether the object reaches itself through one relation.
    Cycle {
        #[command(flatten)]
        source: SnapshotArg,

        #[arg(value_name = "ID")]
        id: ObjectId,

        #[arg(long)]
        relation: Relation,

        #[arg(long)]
        kind: Kind,
    },
    /// Every outgoing edge in the index.
    Dump {
        #[command(flatten)]
        source: SnapshotArg,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug)]
enum Side {
    Forward,
    Reverse,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.clone())?;
    install_tracing_subscriber(config.log_filter());
    if let Some(path) = config.path() {
        tracing::debug!(path = %path.display(), "cli.config");
    }

    let metrics = Arc::new(CounterMetrics::default());
    let options = CacheOptions::new()
        .metrics(metrics.clone())
        .retry(config.retry());
    let timeout = Duration::from_millis(
        cli.timeout_ms
            .or(config.timeout_ms())
            .unwrap_or(DEFAULT_TIMEOUT_MS),
    );
    let open = |source: &SnapshotArg| -> Result<RelationCache<MemoryStore>, Box<dyn Error>> {
        Ok(Snapshot::from_path(&source.snapshot)?.load(options.clone(), timeout)?)
    };

    let mut code = 0;
    match &cli.command {
        Command::Stats { source } => {
            let cache = open(source)?;
            let report = StatsReport {
                index: cache.index().stats(),
                kinds: cache.registered_kinds(),
                health: cache.health(),
                metrics: metrics.snapshot(),
            };
            cache.shutdown();
            emit(cli.format, &report, || print_stats(&report))?;
        }
        Command::Deps(args) => {
            let cache = open(&args.source)?;
            let report = query_report(cache.index(), Side::Forward, args);
            cache.shutdown();
            emit(cli.format, &report, || print_query(&report, "->"))?;
        }
        Command::Users(args) => {
            let cache = open(&args.source)?;
            let report = query_report(cache.index(), Side::Reverse, args);
            cache.shutdown();
            emit(cli.format, &report, || print_query(&report, "<-"))?;
        }
        Command::Cycle {
            source,
            id,
            relation,
            kind,
        } => {
            let cache = open(source)?;
            let cycle = cache
                .index()
                .is_cyclic_for_relation_for_kind(id, relation, kind);
            cache.shutdown();
            if cycle.is_some() {
                code = CYCLE_EXIT_CODE;
            }
            let report = CycleReport {
                id: id.clone(),
                relation: relation.clone(),
                kind: kind.clone(),
                cycle,
            };
            emit(cli.format, &report, || print_cycle(&report))?;
        }
        Command::Dump { source } => {
            let cache = open(source)?;
            let dump = cache.index().snapshot();
            cache.shutdown();
            emit(cli.format, &dump, || {
                for (id, usage) in &dump {
                    print_usage(id, usage);
                }
            })?;
        }
    }
    Ok(code)
}

fn install_tracing_subscriber(config_filter: Option<&str>) {
    let filter = EnvFilter::try_from_env("RELCACHE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(config_filter.unwrap_or("warn")));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Serialize)]
struct StatsReport {
    index: IndexStats,
    kinds: Vec<Kind>,
    health: HealthCheck,
    metrics: MetricsSnapshot,
}

#[derive(Serialize)]
struct QueryReport {
    id: ObjectId,
    relation: Option<Relation>,
    kind: Option<Kind>,
    objects: Vec<ObjectId>,
}

#[derive(Serialize)]
struct CycleReport {
    id: ObjectId,
    relation: Relation,
    kind: Kind,
    cycle: Option<Vec<ObjectId>>,
}

fn query_report(index: &EdgeIndex, side: Side, args: &QueryArgs) -> QueryReport {
    let found = query(
        index,
        side,
        &args.id,
        args.relation.as_ref(),
        args.kind.as_ref(),
    );
    QueryReport {
        id: args.id.clone(),
        relation: args.relation.clone(),
        kind: args.kind.clone(),
        objects: found.sorted(),
    }
}

fn query(
    index: &EdgeIndex,
    side: Side,
    id: &ObjectId,
    relation: Option<&Relation>,
    kind: Option<&Kind>,
) -> ObjectIdSet {
    match (side, relation, kind) {
        (Side::Forward, None, None) => index.get_used_objects_for(id),
        (Side::Forward, None, Some(kind)) => index.get_used_objects_for_kind(id, kind),
        (Side::Forward, Some(rel), None) => index.get_used_objects_for_relation(id, rel),
        (Side::Forward, Some(rel), Some(kind)) => {
            index.get_used_objects_for_relation_to_kind(id, rel, kind)
        }
        (Side::Reverse, None, None) => index.get_users_for(id),
        (Side::Reverse, None, Some(kind)) => index.get_users_for_kind(id, kind),
        (Side::Reverse, Some(rel), None) => index.get_users_for_relation(id, rel),
        (Side::Reverse, Some(rel), Some(kind)) => {
            index.get_users_for_relation_to_kind(id, rel, kind)
        }
    }
}

fn print_stats(report: &StatsReport) {
    println!("Index");
    println!("  sources: {}", report.index.sources);
    println!("  targets: {}", report.index.targets);
    println!("  edges: {}", report.index.edges);
    println!("Health: {:?}", report.health.status);
    for check in &report.health.checks {
        match check {
            relcache::Check::Population {
                kind,
                state,
                attempts,
                ..
            } => println!("  {kind}: {state} (attempts: {attempts})"),
            relcache::Check::Index {
                asymmetric_edges, ..
            } => println!("  index: {asymmetric_edges} asymmetric edges"),
        }
    }
    println!("Counters");
    println!("  objects replaced: {}", report.metrics.objects_replaced);
    println!("  edges added: {}", report.metrics.edges_added);
    println!("  list retries: {}", report.metrics.population_retries);
}

fn print_query(report: &QueryReport, arrow: &str) {
    if report.objects.is_empty() {
        println!("{} {arrow} (none)", report.id);
        return;
    }
    for object in &report.objects {
        println!("{} {arrow} {object}", report.id);
    }
}

fn print_cycle(report: &CycleReport) {
    match &report.cycle {
        Some(path) => {
            let rendered: Vec<String> = path.iter().map(ToString::to_string).collect();
            println!("cycle: {}", rendered.join(" -> "));
        }
        None => println!(
            "no {} cycle through {} for kind {}",
            report.relation, report.id, report.kind
        ),
    }
}

fn print_usage(id: &ObjectId, usage: &UsageInfo) {
    println!("{id}");
    let mut relations: Vec<&Relation> = usage.relations().collect();
    relations.sort();
    for relation in relations {
        if let Some(targets) = usage.get(relation) {
            for target in targets.sorted() {
                println!("  {relation} -> {target}");
            }
        }
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}
