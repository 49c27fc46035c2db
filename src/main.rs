//! granitedb - administration tool for a GraniteDB data directory
//!
//! Commands:
//! - `prime`       choose the trusted starting directory (restore from snapshot)
//! - `recover`     prime, replay the WAL, checkpoint, then print every table
//! - `checkpoint`  recover and publish a fresh recovery snapshot
//! - `dump-wal`    print every WAL record, one per line
//!
//! ```text
//! data/            live directory
//! data-recovery/   snapshot as of the last checkpoint
//! data.wal         write-ahead log
//! ```

use std::path::PathBuf;

use log::info;

use granitedb::index::{Database, Index};
use granitedb::recovery::{self, WalReader};
use granitedb::{Config, Engine};

fn print_help() {
    println!("granitedb - GraniteDB data directory administration");
    println!();
    println!("Usage: granitedb [OPTIONS] <COMMAND>");
    println!();
    println!("Commands:");
    println!("  prime        Restore the live directory from the recovery snapshot");
    println!("  recover      Replay the WAL and print table contents");
    println!("  checkpoint   Replay the WAL and publish a fresh snapshot");
    println!("  dump-wal     Print every WAL record");
    println!();
    println!("Options:");
    println!("  -d, --data-dir DIR    Data directory (default: ./data)");
    println!("  -w, --wal FILE        WAL file (default: <data-dir>.wal)");
    println!("      --full-sync       fsync metadata as well as data on every append");
    println!("  -h, --help            Show this help");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();
    let mut command = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" | "-d" => {
                if i + 1 < args.len() {
                    config.data_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--wal" | "-w" => {
                if i + 1 < args.len() {
                    config.wal_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--full-sync" => {
                config = config.full_sync();
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other if command.is_none() && !other.starts_with('-') => {
                command = Some(other.to_string());
            }
            other => {
                return Err(format!("unexpected argument '{}'", other).into());
            }
        }
        i += 1;
    }

    match command.as_deref() {
        Some("prime") => {
            let outcome = recovery::prime(&config.data_dir, &config.snapshot_suffix)?;
            println!("{:?}", outcome);
        }
        Some("recover") => {
            let engine = Engine::open(&config)?;
            let report = engine.recovery_report();
            println!(
                "prime: {:?}; scanned {} records, redone {}, skipped {}, undone {} transactions",
                engine.prime_outcome(),
                report.records_scanned,
                report.redone,
                report.skipped,
                report.undone_transactions.len()
            );
            for table in engine.database().tables() {
                let entries: Vec<String> = table
                    .table_start()?
                    .map(|e| format!("{}={}", e.key, e.value))
                    .collect();
                println!("{} ({} rows): {}", table.name(), entries.len(), entries.join(" "));
            }
        }
        Some("checkpoint") => {
            let engine = Engine::open(&config)?;
            info!(
                "snapshot published to '{}'",
                engine.recovery().snapshot_dir().display()
            );
        }
        Some("dump-wal") => {
            for record in WalReader::read_all(config.wal_path())? {
                println!("{}", record);
            }
        }
        Some(other) => {
            return Err(format!("unknown command '{}' (see --help)", other).into());
        }
        None => print_help(),
    }

    Ok(())
}
