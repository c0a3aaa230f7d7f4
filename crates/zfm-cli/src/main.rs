mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use zfm_core::{Genotype, Location, Rack, Tank, TankStore};
use zfm_storage::SqliteStore;
use zfm_xlsx::XlsxStore;

#[derive(Parser)]
#[command(name = "zfm")]
#[command(about = "Tank, rack and genotype inventory", long_about = None)]
struct Cli {
    /// Config file (default: $ZFM_CONFIG_PATH or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite inventory file, overriding the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Serve reads and writes from a workbook held in memory instead
    #[arg(long, global = true, conflicts_with = "db")]
    xlsx: Option<PathBuf>,
    /// Reject malformed import rows instead of skipping them
    #[arg(long, global = true)]
    strict: bool,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bulk-load a workbook into the database
    Import { file: PathBuf },
    /// List racks with their placed tanks
    Racks,
    /// List genotypes keyed by id
    Genotypes,
    /// Show one tank by uid
    Tank { uid: u32 },
    /// Show the tank at a rack slot
    Find {
        rack: u32,
        row: String,
        col: u32,
        #[arg(long, default_value = "")]
        room: String,
    },
    /// Upsert a tank from a JSON file ("-" reads stdin)
    WriteTank { uid: u32, file: PathBuf },
    /// Upsert a genotype from a JSON file ("-" reads stdin)
    WriteGenotype { file: PathBuf },
    /// Upsert rack metadata from a JSON file ("-" reads stdin)
    WriteRack { file: PathBuf },
    /// List genotypes naming PARENT as mother or father
    Children { parent: String },
    /// Merge tanks into one with a fresh uid
    Merge {
        #[arg(required = true, num_args = 1..)]
        uids: Vec<u32>,
    },
    /// Move a tank to the graveyard
    Cull { uid: u32 },
    /// List culled tanks
    Graveyard,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let path = config::config_path(cli.config.as_deref());
    let mut config = config::load_config(&path)?;
    if cli.strict {
        config.import.strict = true;
    }
    if let Some(db) = cli.db {
        config.database = Some(db);
    }

    let output = match cli.xlsx {
        Some(workbook) => {
            let mut store = XlsxStore::open(&workbook, &config.import.options())
                .with_context(|| format!("failed to load workbook {}", workbook.display()))?;
            dispatch(&mut store, cli.command)?
        }
        None => {
            let database = config.database_path();
            if let Some(parent) = database.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database dir {}", parent.display())
                })?;
            }
            let mut store = SqliteStore::open(&database)
                .with_context(|| format!("failed to open database {}", database.display()))?
                .with_import_options(config.import.options());
            run_sqlite(&mut store, cli.command)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("ZFM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// The database reports what an import wrote and skipped.
fn run_sqlite(store: &mut SqliteStore, command: Commands) -> Result<Value> {
    match command {
        Commands::Import { file } => {
            let report = store
                .import_file(&file)
                .with_context(|| format!("failed to import {}", file.display()))?;
            Ok(serde_json::to_value(report)?)
        }
        command => dispatch(store, command),
    }
}

fn dispatch<S: TankStore>(store: &mut S, command: Commands) -> Result<Value> {
    let value = match command {
        Commands::Import { file } => {
            store
                .import_from_xlsx(&file)
                .with_context(|| format!("failed to import {}", file.display()))?;
            json!({ "imported": file })
        }
        Commands::Racks => serde_json::to_value(store.get_racks()?)?,
        Commands::Genotypes => serde_json::to_value(store.get_genotypes()?)?,
        Commands::Tank { uid } => serde_json::to_value(store.read_tank(uid)?)?,
        Commands::Find {
            rack,
            row,
            col,
            room,
        } => serde_json::to_value(store.find_tank(&Location::new(room, rack, row, col))?)?,
        Commands::WriteTank { uid, file } => {
            let tank: Tank = read_record(&file)?;
            store
                .write_tank(uid, &tank)
                .with_context(|| format!("failed to write tank {uid}"))?;
            serde_json::to_value(store.read_tank(uid)?)?
        }
        Commands::WriteGenotype { file } => {
            let genotype: Genotype = read_record(&file)?;
            store
                .write_genotype(&genotype)
                .with_context(|| format!("failed to write genotype {}", genotype.uid))?;
            serde_json::to_value(store.read_genotype(&genotype.uid)?)?
        }
        Commands::WriteRack { file } => {
            let rack: Rack = read_record(&file)?;
            store
                .write_rack(&rack)
                .with_context(|| format!("failed to write rack {}", rack.rack_num))?;
            json!({ "rack_num": rack.rack_num, "size": rack.size })
        }
        Commands::Children { parent } => serde_json::to_value(store.get_children(&parent)?)?,
        Commands::Merge { uids } => {
            let merged = store
                .merge_tanks(&uids)
                .with_context(|| format!("failed to merge tanks {uids:?}"))?;
            serde_json::to_value(merged)?
        }
        Commands::Cull { uid } => {
            store
                .cull_tank(uid)
                .with_context(|| format!("failed to cull tank {uid}"))?;
            json!({ "culled": uid })
        }
        Commands::Graveyard => serde_json::to_value(store.get_graveyard()?)?,
    };
    Ok(value)
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        buf
    } else {
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse record from {}", path.display()))
}
