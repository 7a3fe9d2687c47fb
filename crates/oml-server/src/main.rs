// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement collection server administration CLI.
//!
//! # Usage
//!
//! ```bash
//! # Verify the PostgreSQL backend is reachable and usable
//! oml-server --backend postgres check
//!
//! # List tables of an experiment database
//! oml-server --backend sqlite --data-dir /var/lib/oml tables trial01
//!
//! # Look up (or allocate) a sender id
//! oml-server senders trial01 node-17
//!
//! # Read or write experiment metadata
//! oml-server metadata trial01 start_time
//! oml-server metadata trial01 operator "jane"
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use oml_server::config::{BackendKind, PgConfig, ServerConfig};
use oml_server::database::{Database, DbAdapter, PsqlAdapter, SqliteAdapter};
use std::path::PathBuf;

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BackendArg {
    Sqlite,
    Postgres,
}

#[derive(Parser, Debug)]
#[command(name = "oml-server")]
#[command(about = "Measurement collection server - experiment database administration", long_about = None)]
struct Args {
    /// Storage backend
    #[arg(short, long, value_enum, default_value_t = BackendArg::Sqlite)]
    backend: BackendArg,

    /// Directory holding SQLite experiment databases
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// PostgreSQL host (overrides OML_PG_HOST)
    #[arg(long)]
    pg_host: Option<String>,

    /// PostgreSQL port or service (overrides OML_PG_PORT)
    #[arg(long)]
    pg_port: Option<String>,

    /// PostgreSQL user (overrides OML_PG_USER)
    #[arg(long)]
    pg_user: Option<String>,

    /// PostgreSQL password (overrides OML_PG_PASS)
    #[arg(long)]
    pg_pass: Option<String>,

    /// Extra libpq-style connection parameters (overrides OML_PG_CONNINFO)
    #[arg(long)]
    pg_conninfo: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify the configured backend is reachable and usable
    Check,
    /// List tables and schemas of an experiment database
    Tables {
        /// Experiment database name
        database: String,
    },
    /// Look up (or allocate) the stable id for a sender name
    Senders {
        /// Experiment database name
        database: String,
        /// Sender name
        name: String,
    },
    /// Read or write experiment metadata
    Metadata {
        /// Experiment database name
        database: String,
        /// Metadata key
        key: String,
        /// New value; omit to read
        value: Option<String>,
    },
}

fn server_config(args: &Args) -> ServerConfig {
    // CLI flags take precedence over the OML_PG_* environment.
    let mut pg = PgConfig::from_env();
    if let Some(host) = &args.pg_host {
        pg.host = host.clone();
    }
    if let Some(port) = &args.pg_port {
        pg.port = port.clone();
    }
    if let Some(user) = &args.pg_user {
        pg.user = user.clone();
    }
    if let Some(pass) = &args.pg_pass {
        pg.pass = pass.clone();
    }
    if let Some(conninfo) = &args.pg_conninfo {
        pg.conninfo = conninfo.clone();
    }

    ServerConfig {
        backend: match args.backend {
            BackendArg::Sqlite => BackendKind::Sqlite,
            BackendArg::Postgres => BackendKind::Postgres,
        },
        data_dir: args.data_dir.clone(),
        pg,
    }
}

fn open_database(config: &ServerConfig, name: &str) -> Result<Database> {
    let adapter: Box<dyn DbAdapter> = match config.backend {
        BackendKind::Sqlite => {
            std::fs::create_dir_all(&config.data_dir)?;
            Box::new(SqliteAdapter::open(
                config.data_dir.join(format!("{name}.sq3")),
            )?)
        }
        BackendKind::Postgres => Box::new(PsqlAdapter::connect(&config.pg, name)?),
    };
    Ok(Database::open(name, adapter)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let config = server_config(&args);
    config.validate()?;

    match args.command {
        Commands::Check => match config.backend {
            BackendKind::Postgres => {
                PsqlAdapter::setup(&config.pg)?;
                println!(
                    "PostgreSQL backend at {}:{} is usable for user '{}'.",
                    config.pg.host, config.pg.port, config.pg.user
                );
            }
            BackendKind::Sqlite => {
                std::fs::create_dir_all(&config.data_dir)?;
                println!(
                    "SQLite backend in {} is usable.",
                    config.data_dir.display()
                );
            }
        },

        Commands::Tables { database } => {
            let mut db = open_database(&config, &database)?;
            let tables = db.get_table_list()?;
            if tables.is_empty() {
                println!("No tables in '{database}'.");
            } else {
                println!("Tables in '{database}' ({}):", db.get_uri());
                for table in &tables {
                    match &table.schema {
                        Some(schema) => println!("  {}", schema.to_meta()),
                        None => println!("  {} (bookkeeping)", table.name),
                    }
                }
            }
            db.release();
        }

        Commands::Senders { database, name } => {
            let mut db = open_database(&config, &database)?;
            let id = db.add_sender_id(&name)?;
            println!("{id}");
            db.release();
        }

        Commands::Metadata {
            database,
            key,
            value,
        } => {
            let mut db = open_database(&config, &database)?;
            match value {
                Some(value) => {
                    db.set_metadata(&key, &value)?;
                    println!("{key}={value}");
                }
                None => match db.get_metadata(&key)? {
                    Some(value) => println!("{value}"),
                    None => println!("No value for '{key}'."),
                },
            }
            db.release();
        }
    }

    Ok(())
}
