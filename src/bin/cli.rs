//! ChronoKV CLI
//!
//! Command-line interface over an embedded ChronoKV data directory.

use std::process;

use chronokv::{ChronoError, Config, Engine, Entry, IndexKind, KeyRange};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

/// ChronoKV CLI
#[derive(Parser, Debug)]
#[command(name = "chronokv-cli")]
#[command(about = "Versioned embedded key-value store")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./chronokv_data")]
    data_dir: String,

    /// Index structure to open the data directory with
    #[arg(short, long, value_enum, default_value = "btree")]
    index: IndexArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum IndexArg {
    Btree,
    Hash,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a new version of a key
    Put {
        /// The key to write
        key: String,

        /// The value to store
        value: String,
    },

    /// Get the newest live version of a key
    Get {
        /// The key to read
        key: String,
    },

    /// Get a key as it was at a given version
    GetAsOf {
        /// The key to read
        key: String,

        /// Highest version to consider
        version: u64,
    },

    /// Record a deletion of a key
    Delete {
        /// The key to delete
        key: String,
    },

    /// List every version of the keys in [start, end)
    Scan {
        /// Inclusive lower bound (omit for the first key)
        #[arg(long)]
        start: Option<String>,

        /// Exclusive upper bound (omit for the last key)
        #[arg(long)]
        end: Option<String>,

        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show the full version chain of a key
    History {
        /// The key to inspect
        key: String,
    },

    /// Flush the index and write a checkpoint
    Checkpoint,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chronokv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::builder()
        .data_dir(&args.data_dir)
        .index_kind(match args.index {
            IndexArg::Btree => IndexKind::BTree,
            IndexArg::Hash => IndexKind::Hash,
        })
        .build();

    let engine = match Engine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Failed to open engine: {}", e);
            process::exit(1);
        }
    };

    let outcome = run(&engine, args.command);
    let closed = engine.close();

    if let Err(e) = outcome.and(closed) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(engine: &Engine, command: Commands) -> Result<(), ChronoError> {
    match command {
        Commands::Put { key, value } => {
            let version = engine.put(key.as_bytes(), value.as_bytes())?;
            println!("OK version={}", version);
        }
        Commands::Get { key } => print_lookup(engine.get(key.as_bytes())?),
        Commands::GetAsOf { key, version } => print_lookup(engine.get_as_of(key.as_bytes(), version)?),
        Commands::Delete { key } => {
            let version = engine.delete(key.as_bytes())?;
            println!("OK version={}", version);
        }
        Commands::Scan { start, end, limit } => {
            let range = KeyRange::new((
                bound(start, std::ops::Bound::Included),
                bound(end, std::ops::Bound::Excluded),
            ));
            for entry in engine.scan(range)?.take(limit.unwrap_or(usize::MAX)) {
                print_entry(&entry?);
            }
        }
        Commands::History { key } => {
            let history = engine.history(key.as_bytes())?;
            if history.is_empty() {
                println!("(no history)");
            }
            for entry in &history {
                print_entry(entry);
            }
        }
        Commands::Checkpoint => {
            let meta = engine.checkpoint()?;
            println!(
                "OK checkpoint={} replay_offset={}",
                meta.sequence, meta.replay_offset
            );
        }
    }
    Ok(())
}

fn bound(key: Option<String>, make: fn(Vec<u8>) -> std::ops::Bound<Vec<u8>>) -> std::ops::Bound<Vec<u8>> {
    key.map_or(std::ops::Bound::Unbounded, |k| make(k.into_bytes()))
}

fn print_lookup(entry: Option<Entry>) {
    match entry {
        Some(entry) => print_entry(&entry),
        None => println!("(not found)"),
    }
}

fn print_entry(entry: &Entry) {
    let key = String::from_utf8_lossy(&entry.key);
    match &entry.value {
        Some(value) => println!(
            "{} @{} [{}] = {}",
            key,
            entry.version,
            entry.timestamp,
            String::from_utf8_lossy(value)
        ),
        None => println!("{} @{} [{}] <deleted>", key, entry.version, entry.timestamp),
    }
}
