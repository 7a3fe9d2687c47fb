// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # oml-server -- measurement collection server core
//!
//! The server half of the measurement collection system. Injection points
//! stream measurement tuples at the server; this crate validates them
//! against their declared [`Schema`], aggregates them per session and
//! persists them into a relational store through a backend-neutral
//! [`Database`] façade with SQLite and PostgreSQL adapters.
//!
//! ```no_run
//! use oml_server::database::{Database, SqliteAdapter};
//! use oml_server::schema::{Field, Schema, Value, ValueType};
//! use oml_server::session::Session;
//!
//! # fn main() -> Result<(), oml_server::database::DbError> {
//! let adapter = SqliteAdapter::open("trial.sq3")?;
//! let mut db = Database::open("trial", Box::new(adapter))?;
//!
//! let mut session = Session::start(&mut db, "node-17")?;
//! let schema = Schema::new(
//!     "power",
//!     vec![
//!         Field::new("v", ValueType::Double),
//!         Field::new("ok", ValueType::Bool),
//!     ],
//! )?;
//! session.register_stream(&mut db, 1, schema)?;
//! session.insert(&mut db, 1, 1, 0.5, &[Value::Double(3.14), Value::Bool(true)]);
//! db.release();
//! # Ok(())
//! # }
//! ```
//!
//! Every persisted table carries four implicit metadata columns ahead of
//! the schema columns (`oml_sender_id`, `oml_seq`, `oml_ts_client`,
//! `oml_ts_server`); sender names map to stable small integer ids via the
//! `_senders` table, and schemas are stored in `_experiment_metadata` so a
//! reopened database rediscovers its tables.

pub mod config;
pub mod database;
pub mod schema;
pub mod session;

pub use config::{BackendKind, PgConfig, ServerConfig};
pub use database::{Database, DbAdapter, DbError, PsqlAdapter, SqliteAdapter, TableDescr};
pub use schema::{Field, Schema, SchemaError, Value, ValueType};
pub use session::{Session, SessionStats};
