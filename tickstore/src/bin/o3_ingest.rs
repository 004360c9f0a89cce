//! tickstore out-of-order ingest demo
//!
//! Usage:
//!   o3-ingest --dir /tmp/trades --batches 20 --rows 10000 --jitter-hours 48
//!
//! Creates (or reopens) a trades table and commits batches whose timestamps
//! wander back into already committed partitions, then prints what each
//! commit did and the resulting partitions.

use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::PathBuf;

use tickstore::storage::PartitionBy;
use tickstore::{ColumnDef, ColumnType, ColumnValues, RowBatch, StoreConfig, TableMeta, TableReader, TableWriter};

const MICROS_PER_HOUR: i64 = 3_600_000_000;

#[derive(Parser, Debug)]
#[command(name = "o3-ingest")]
#[command(about = "Commit out-of-order batches into a tickstore table")]
#[command(version)]
struct Args {
    /// Table directory
    #[arg(short, long, default_value = "./trades")]
    dir: PathBuf,

    /// Optional JSON store configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of batches to commit
    #[arg(short, long, default_value_t = 10)]
    batches: usize,

    /// Rows per batch
    #[arg(short, long, default_value_t = 10_000)]
    rows: usize,

    /// How far back (in hours) a row may land behind the batch's clock
    #[arg(long, default_value_t = 36)]
    jitter_hours: i64,

    /// Distinct symbols
    #[arg(long, default_value_t = 32)]
    symbols: i32,
}

fn trades_meta(partition_by: PartitionBy) -> TableMeta {
    TableMeta::new(
        vec![
            ColumnDef::new("ts", ColumnType::Timestamp),
            ColumnDef::new("sym", ColumnType::Symbol).with_index(64),
            ColumnDef::new("price", ColumnType::Double),
            ColumnDef::new("qty", ColumnType::Long),
            ColumnDef::new("venue", ColumnType::String),
        ],
        "ts",
        partition_by,
    )
}

fn random_batch(rng: &mut impl Rng, clock: i64, args: &Args) -> RowBatch {
    const VENUES: [&str; 4] = ["XNAS", "XNYS", "BATS", "IEXG"];
    let jitter = args.jitter_hours.max(1) * MICROS_PER_HOUR;

    let mut ts: Vec<i64> = (0..args.rows)
        .map(|_| clock - rng.random_range(0..jitter))
        .collect();
    ts.shuffle(rng);

    RowBatch::new()
        .with_column("ts", ColumnValues::Timestamp(ts))
        .with_column(
            "sym",
            ColumnValues::Symbol((0..args.rows).map(|_| rng.random_range(0..args.symbols.max(1))).collect()),
        )
        .with_column(
            "price",
            ColumnValues::Double((0..args.rows).map(|_| rng.random_range(10.0..500.0)).collect()),
        )
        .with_column(
            "qty",
            ColumnValues::Long((0..args.rows).map(|_| rng.random_range(1..1_000)).collect()),
        )
        .with_column(
            "venue",
            ColumnValues::Str(
                (0..args.rows)
                    .map(|_| VENUES[rng.random_range(0..VENUES.len())].to_string())
                    .collect(),
            ),
        )
}

fn run(args: Args) -> tickstore::Result<()> {
    let config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };

    let mut writer = if args.dir.join(tickstore::table::schema::META_FILE).exists() {
        TableWriter::open(&args.dir, config.clone())?
    } else {
        TableWriter::create(&args.dir, trades_meta(config.partition_by), config.clone())?
    };

    let mut rng = rand::rng();
    let mut clock = writer
        .max_timestamp()
        .unwrap_or(1_700_000_000_000_000)
        + MICROS_PER_HOUR;

    for _ in 0..args.batches {
        let batch = random_batch(&mut rng, clock, &args);
        let summary = writer.commit(&batch)?;
        let actions: Vec<String> = summary
            .partitions
            .iter()
            .map(|(name, action)| format!("{}:{:?}", name, action))
            .collect();
        println!(
            "txn {:>4}  {:?} {:>7} rows  [{}]",
            summary.txn,
            summary.class,
            summary.rows,
            actions.join(", ")
        );
        clock += args.jitter_hours.max(1) * MICROS_PER_HOUR / 2;
    }
    drop(writer);

    let reader = TableReader::open(&args.dir, config)?;
    println!();
    println!("{:<16} {:>10} {:>20} {:>20}", "partition", "rows", "min ts", "max ts");
    for state in reader.partitions()? {
        let partition = reader.partition(&state.name)?;
        let ts = partition.read_timestamps()?;
        let sorted = ts.windows(2).all(|w| w[0] <= w[1]);
        println!(
            "{:<16} {:>10} {:>20} {:>20}{}",
            state.name,
            state.row_count,
            state.min_timestamp,
            state.max_timestamp,
            if sorted { "" } else { "  UNSORTED" }
        );
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("o3-ingest error: {}", e);
        std::process::exit(1);
    }
}
