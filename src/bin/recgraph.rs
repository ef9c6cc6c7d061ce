//! recgraph CLI tool
//!
//! Maintenance commands for a directory of record-graph documents.
//!
//! ## Commands
//!
//! - `check <dir>`: Load the documents and report dropped references, migrations and edits
//! - `stats <dir>`: Record and edge counts per type and relation
//! - `mentions <dir> <type:id>`: Records that mention the given record
//! - `upgrade <dir>`: Rewrite older documents at the current version

use clap::{Parser, Subcommand};
use recgraph_core::{
    catalog::RelationKind,
    codec::{Serializer, CURRENT_VERSION},
    config::{ConfigProvider, EngineConfig, TomlConfigProvider},
    host::AcceptAll,
    mentions::Wait,
    properties::{RecordId, RecordType},
    Database,
};
use std::{path::PathBuf, sync::Arc};

#[derive(Parser)]
#[command(name = "recgraph")]
#[command(author, version, about = "Inspect and maintain record-graph documents", long_about = None)]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a database directory and report what the load had to repair
    Check {
        /// Directory holding the documents
        dir: PathBuf,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Count records and edges
    Stats {
        /// Directory holding the documents
        dir: PathBuf,
    },

    /// List the records mentioning a record
    Mentions {
        /// Directory holding the documents
        dir: PathBuf,

        /// Record id, e.g. `person:12`
        record: RecordId,

        /// Maximum number of mentioners to print
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Save the database back at the current document version
    Upgrade {
        /// Directory holding the documents
        dir: PathBuf,
    },
}

fn open(config: &EngineConfig, dir: &PathBuf) -> Result<Database, Box<dyn std::error::Error>> {
    let mut db = Database::new(config.clone());
    let report = db.load_all(dir)?;
    tracing::info!(
        "[recgraph] loaded {} records from {} documents",
        report.records,
        report.documents.len()
    );
    Ok(db)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => TomlConfigProvider::new(path).get_config()?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Check { dir, verbose } => {
            let mut db = Database::new(config);
            let report = db.load_all(&dir)?;

            println!("=== Check Results ===");
            println!("Documents: {}", report.documents.join(", "));
            println!("Records: {}", report.records);
            match report.loaded_version {
                Some(version) if version < CURRENT_VERSION => {
                    println!("Version: {version} (current is {CURRENT_VERSION})")
                }
                Some(version) => println!("Version: {version}"),
                None => println!("Version: unknown"),
            }
            println!("Resolution passes: {}", report.resolve.passes);
            println!("Default edges: {}", report.resolve.defaults);
            println!("Dropped references: {}", report.dropped_references.len());
            println!("Reparented notes: {}", report.reparented.len());
            println!("Dropped folder roles: {}", report.dropped_roles.len());
            for name in report.externally_modified.iter() {
                println!("Modified outside the engine: {name}");
            }
            for name in report.migrated.iter() {
                println!("Migrated: {name}");
            }
            if verbose {
                for dropped in report.dropped_references.iter() {
                    println!("  dropped {dropped}");
                }
                for id in report.reparented.iter() {
                    println!("  reparented {id}");
                }
                for role in report.dropped_roles.iter() {
                    println!("  dropped role {role}");
                }
            }
            Ok(())
        }

        Commands::Stats { dir } => {
            let db = open(&config, &dir)?;
            println!("=== Records ===");
            for kind in RecordType::all().iter() {
                let store = db.store(kind);
                let online = store.iter().filter(|r| r.is_online()).count();
                println!("{:<12} {:>8}", kind.tag(), online);
            }
            println!("\n=== Edges ===");
            for kind in RelationKind::all() {
                let count = db.relation(*kind).edges().count();
                if count > 0 {
                    println!("{:<20} {:>8}", kind.to_string(), count);
                }
            }
            Ok(())
        }

        Commands::Mentions { dir, record, limit } => {
            let db = open(&config, &dir)?;
            if db.get(record).is_none() {
                return Err(format!("{record} does not exist in {}", dir.display()).into());
            }
            if !db.config().rebuild_mentions_on_load {
                db.rebuild_mentions()?;
            }
            let answer = db.first_mentions(record, limit, Wait::Yes);
            let total = db.mentioner_set(record, Wait::Yes).value.len();
            println!("{total} records mention {record}");
            for id in answer.value {
                let key = db
                    .get(id)
                    .and_then(|r| r.search_key())
                    .map(|k| format!(" ({k})"))
                    .unwrap_or_default();
                println!("  {id}{key}");
            }
            if total > limit {
                println!("  ... {} more", total - limit);
            }
            Ok(())
        }

        Commands::Upgrade { dir } => {
            let mut db = open(&config, &dir)?;
            let from = db.documents().loaded_version;
            if from.is_some_and(|v| v >= CURRENT_VERSION) {
                println!("Documents are already at version {CURRENT_VERSION}");
                return Ok(());
            }
            let report = Serializer::new()
                .with_hooks(Arc::new(AcceptAll))
                .save_all(&mut db, &dir)?;
            println!(
                "Upgraded {} records from version {} to {CURRENT_VERSION}",
                report.records,
                report
                    .upgraded_from
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            );
            Ok(())
        }
    }
}
