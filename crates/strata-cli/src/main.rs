use std::path::PathBuf;

use clap::{Parser, Subcommand};
use strata_core::{Cell, StoreConfig, Timestamps, Value};
use strata_sqlite::SqliteDataStore;
use tracing::{debug, info};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "Inspect and edit a Strata file-per-subject store")]
#[command(version)]
struct Args {
    /// JSON store configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store root directory (overrides the configuration file)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print results as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every stored cell
    Dump,
    /// Print the on-disk size in bytes
    Size,
    /// Print the newest value of a predicate
    Get { subject: String, predicate: String },
    /// Replace a predicate's value with text
    Set {
        subject: String,
        predicate: String,
        value: String,
        /// Timestamp in microseconds since the epoch (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },
    /// Print cells whose predicate matches a regex
    Matching {
        subject: String,
        pattern: String,
        /// Every version instead of only the newest
        #[arg(long)]
        all: bool,
    },
}

fn load_config(args: &Args) -> Result<StoreConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::from_file(path)?,
        None => StoreConfig::default(),
    };
    if let Some(root) = &args.root {
        config.root_path = root.clone();
    }
    Ok(config)
}

/// Bytes as text where possible, escaped otherwise.
fn printable(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.escape_ascii().to_string(),
    }
}

fn print_value(value: &Value) -> String {
    match value {
        Value::Bytes(bytes) => printable(bytes),
        other => other.to_string(),
    }
}

fn print_cell(json: bool, cell: &Cell) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string(cell)?);
    } else {
        println!("{} @{} = {}", cell.predicate, cell.timestamp, print_value(&cell.value));
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let config = load_config(&args)?;
    debug!("opening store at {}", config.root_path.display());
    let store = SqliteDataStore::open(config)?;

    match args.command {
        Command::Dump => {
            for cell in store.dump(None)? {
                if args.json {
                    println!("{}", serde_json::to_string(&cell)?);
                } else {
                    println!(
                        "({}, {}, {}) = {}",
                        cell.subject,
                        cell.predicate,
                        cell.timestamp,
                        printable(&cell.value)
                    );
                }
            }
        }
        Command::Size => println!("{}", store.size()?),
        Command::Get { subject, predicate } => match store.resolve(None, &subject, &predicate)? {
            Some((value, timestamp)) => print_cell(args.json, &Cell::new(predicate, value, timestamp))?,
            None => info!("{} has no value for {}", subject, predicate),
        },
        Command::Set {
            subject,
            predicate,
            value,
            timestamp,
        } => store.set(None, &subject, &predicate, value, timestamp, true)?,
        Command::Matching {
            subject,
            pattern,
            all,
        } => {
            let timestamps = if all {
                Timestamps::All
            } else {
                Timestamps::Newest
            };
            for cell in store.resolve_matching(None, &subject, &[pattern], timestamps, None)? {
                print_cell(args.json, &cell)?;
            }
        }
    }

    store.close()?;
    Ok(())
}
