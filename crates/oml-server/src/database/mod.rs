// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend-neutral database façade.
//!
//! A [`Database`] owns exactly one boxed [`DbAdapter`] plus the state the
//! backends share: the schema registry, the experiment start time, and the
//! transaction heartbeat. Rows are inserted inside a long-running
//! transaction that is committed and reopened at most once per second,
//! checked in the insert hot path so the policy stays O(1) per row.
//!
//! Opening a database bootstraps the `_senders` and `_experiment_metadata`
//! bookkeeping tables, restores `start_time` from stored metadata (so
//! server timestamps stay on one clock across restarts), and rediscovers
//! previously created tables from their `table_<name>` schema records.

pub mod adapter;
pub mod psql;
pub mod sqlite;

pub use adapter::{DbAdapter, DbError, TableDescr, TypeMap};
pub use psql::PsqlAdapter;
pub use sqlite::SqliteAdapter;

use crate::schema::{Schema, Value};
use adapter::check_types;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// One open experiment database.
pub struct Database {
    name: String,
    adapter: Box<dyn DbAdapter>,
    /// Experiment epoch, wall-clock seconds. Server timestamps are
    /// relative to this.
    start_time: u64,
    /// Wall-clock second of the last transaction heartbeat.
    last_commit: u64,
    schemas: HashMap<String, Schema>,
}

impl Database {
    /// Open `name` over the given backend adapter.
    pub fn open(name: impl Into<String>, mut adapter: Box<dyn DbAdapter>) -> Result<Database, DbError> {
        let name = name.into();

        adapter.stmt(
            "CREATE TABLE IF NOT EXISTS \"_senders\" (id INT PRIMARY KEY, name TEXT UNIQUE);",
        )?;
        adapter
            .stmt("CREATE TABLE IF NOT EXISTS \"_experiment_metadata\" (key TEXT, value TEXT);")?;

        let now = epoch_now() as u64;
        let start_time = match adapter.get_metadata("start_time")? {
            Some(stored) => match stored.parse::<u64>() {
                Ok(start) => start,
                Err(_) => {
                    warn!("{name}: corrupt start_time metadata '{stored}', resetting");
                    adapter.set_metadata("start_time", &now.to_string())?;
                    now
                }
            },
            None => {
                adapter.set_metadata("start_time", &now.to_string())?;
                now
            }
        };

        // Rediscover tables created by an earlier run; their prepared
        // statements are rebuilt shallowly since the tables exist.
        let mut schemas = HashMap::new();
        for descr in adapter.get_table_list()? {
            if let Some(schema) = descr.schema {
                adapter.table_create(&schema, true)?;
                schemas.insert(descr.name, schema);
            }
        }
        if !schemas.is_empty() {
            info!("{name}: rediscovered {} existing tables", schemas.len());
        }

        adapter.stmt("BEGIN;")?;
        info!(
            "{name}: opened {} ({} backend)",
            adapter.get_uri(),
            adapter.backend_name()
        );

        Ok(Database {
            name,
            adapter,
            start_time,
            last_commit: now,
            schemas,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wall-clock epoch seconds captured when the experiment first opened.
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Connection URI for logging.
    pub fn get_uri(&self) -> String {
        self.adapter.get_uri()
    }

    /// The schema registered for `table`, if any.
    pub fn schema(&self, table: &str) -> Option<&Schema> {
        self.schemas.get(table)
    }

    /// Names of all registered tables.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Register a schema: create the backing table (unless `shallow`),
    /// prepare the insert path and persist the schema text so the table
    /// can be rediscovered after a restart.
    pub fn table_create(&mut self, schema: Schema, shallow: bool) -> Result<(), DbError> {
        if self.schemas.contains_key(schema.name()) {
            warn!(
                "{}: table '{}' is already registered, keeping existing handle",
                self.name,
                schema.name()
            );
            return Ok(());
        }
        self.adapter.table_create(&schema, shallow)?;
        if !shallow {
            self.adapter
                .set_metadata(&format!("table_{}", schema.name()), &schema.to_meta())?;
        }
        self.schemas.insert(schema.name().to_string(), schema);
        Ok(())
    }

    /// Insert one measurement row.
    ///
    /// Checks the transaction heartbeat, stamps the server timestamp
    /// (`now - start_time`), validates value types against the schema, and
    /// routes to the backend's prepared statement. A failure loses this
    /// row only; the session is expected to log and continue.
    pub fn insert(
        &mut self,
        table: &str,
        sender_id: i32,
        seq_no: i32,
        ts_client: f64,
        values: &[Value],
    ) -> Result<(), DbError> {
        let now = epoch_now();
        if now as u64 > self.last_commit {
            self.reopen_transaction()?;
            self.last_commit = now as u64;
        }
        let ts_server = now - self.start_time as f64;

        let schema = self
            .schemas
            .get(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))?;
        check_types(schema, values)?;
        self.adapter
            .insert(schema, sender_id, seq_no, ts_client, ts_server, values)
    }

    /// Stable id for a sender name; allocated on first sight.
    pub fn add_sender_id(&mut self, sender: &str) -> Result<i32, DbError> {
        self.adapter.add_sender_id(sender)
    }

    pub fn get_metadata(&mut self, key: &str) -> Result<Option<String>, DbError> {
        self.adapter.get_metadata(key)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), DbError> {
        self.adapter.set_metadata(key, value)
    }

    /// Enumerate tables known to the store (see [`DbAdapter::get_table_list`]).
    pub fn get_table_list(&mut self) -> Result<Vec<TableDescr>, DbError> {
        self.adapter.get_table_list()
    }

    /// Commit the running transaction and open a new one. A poisoned
    /// transaction is rolled back instead of committed.
    pub fn reopen_transaction(&mut self) -> Result<(), DbError> {
        if let Err(e) = self.adapter.stmt("COMMIT;") {
            warn!("{}: commit failed, rolling back: {e}", self.name);
            self.adapter.stmt("ROLLBACK;")?;
        }
        self.adapter.stmt("BEGIN;")
    }

    /// Commit and disconnect.
    pub fn release(self) {
        debug!("{}: releasing database", self.name);
        // Final commit happens in Drop.
    }

    #[cfg(test)]
    fn set_last_commit(&mut self, epoch_secs: u64) {
        self.last_commit = epoch_secs;
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        for table in self.schemas.keys() {
            self.adapter.table_free(table);
        }
        if let Err(e) = self.adapter.stmt("COMMIT;") {
            warn!("{}: final commit failed: {e}", self.name);
        }
    }
}
