// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite adapter.
//!
//! The default zero-infrastructure backend. Values are bound directly
//! through rusqlite (`?` placeholders); unsigned types are widened into
//! SQLite's signed 64-bit integers, `uint64`/`guid` keeping their bit
//! pattern.

use super::adapter::{
    build_create_table, build_insert_sql, check_types, DbAdapter, DbError, TableDescr, TypeMap,
};
use crate::schema::{Schema, Value, ValueType};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

static SQLITE_TYPE_MAP: TypeMap = TypeMap {
    entries: &[
        (ValueType::PrimaryKey, "INTEGER PRIMARY KEY AUTOINCREMENT", 4),
        (ValueType::Int32, "INTEGER", 4),
        (ValueType::UInt32, "INTEGER", 8),
        (ValueType::Int64, "INTEGER", 8),
        (ValueType::UInt64, "INTEGER", 8),
        (ValueType::Double, "REAL", 8),
        (ValueType::Bool, "INTEGER", 1),
        (ValueType::Text, "TEXT", 0),
        (ValueType::Blob, "BLOB", 0),
        (ValueType::Guid, "INTEGER", 8),
        (ValueType::VectorInt32, "TEXT", 0),
        (ValueType::VectorUInt32, "TEXT", 0),
        (ValueType::VectorInt64, "TEXT", 0),
        (ValueType::VectorUInt64, "TEXT", 0),
        (ValueType::VectorDouble, "TEXT", 0),
        (ValueType::VectorBool, "TEXT", 0),
    ],
};

struct SqliteTable {
    insert_sql: String,
}

/// SQLite implementation of the adapter contract.
pub struct SqliteAdapter {
    conn: Connection,
    path: PathBuf,
    tables: HashMap<String, SqliteTable>,
}

impl SqliteAdapter {
    /// Open (or create) the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SqliteAdapter, DbError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        debug!("opened sqlite database {}", path.display());
        Ok(SqliteAdapter {
            conn,
            path,
            tables: HashMap::new(),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<SqliteAdapter, DbError> {
        Ok(SqliteAdapter {
            conn: Connection::open_in_memory()?,
            path: PathBuf::from(":memory:"),
            tables: HashMap::new(),
        })
    }

    fn bind_value(value: &Value) -> Result<rusqlite::types::Value, DbError> {
        use rusqlite::types::Value as Sql;
        Ok(match value {
            Value::Int32(v) => Sql::Integer(i64::from(*v)),
            Value::UInt32(v) => Sql::Integer(i64::from(*v)),
            Value::Int64(v) => Sql::Integer(*v),
            // Bit-pattern alias; the sign may flip for very large values.
            Value::UInt64(v) => Sql::Integer(*v as i64),
            Value::Guid(v) => Sql::Integer(*v as i64),
            Value::Double(v) => Sql::Real(*v),
            Value::Bool(v) => Sql::Integer(i64::from(*v)),
            Value::Text(v) => Sql::Text(v.clone()),
            Value::Blob(v) => Sql::Blob(v.clone()),
            vector => {
                debug_assert!(vector.value_type().is_vector());
                let json = vector
                    .json_array()
                    .ok_or_else(|| DbError::Backend("expected a vector value".to_string()))?
                    .map_err(|e| DbError::Backend(format!("vector encoding failed: {e}")))?;
                Sql::Text(json)
            }
        })
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> DbError {
        DbError::Backend(e.to_string())
    }
}

impl DbAdapter for SqliteAdapter {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn type_map(&self) -> &'static TypeMap {
        &SQLITE_TYPE_MAP
    }

    fn prepared_var(&self, _order: u32) -> String {
        "?".to_string()
    }

    fn stmt(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn table_create(&mut self, schema: &Schema, shallow: bool) -> Result<(), DbError> {
        if self.tables.contains_key(schema.name()) {
            debug!("table '{}' already prepared", schema.name());
            return Ok(());
        }
        if !shallow {
            let ddl = build_create_table(&SQLITE_TYPE_MAP, schema)?;
            self.conn.execute_batch(&ddl)?;
        }
        let insert_sql = build_insert_sql(schema, |o| self.prepared_var(o));
        self.tables
            .insert(schema.name().to_string(), SqliteTable { insert_sql });
        Ok(())
    }

    fn table_free(&mut self, table: &str) {
        self.tables.remove(table);
    }

    fn insert(
        &mut self,
        schema: &Schema,
        sender_id: i32,
        seq_no: i32,
        ts_client: f64,
        ts_server: f64,
        values: &[Value],
    ) -> Result<(), DbError> {
        check_types(schema, values)?;
        let table = self
            .tables
            .get(schema.name())
            .ok_or_else(|| DbError::UnknownTable(schema.name().to_string()))?;

        let mut params: Vec<rusqlite::types::Value> = Vec::with_capacity(values.len() + 4);
        params.push(rusqlite::types::Value::Integer(i64::from(sender_id)));
        params.push(rusqlite::types::Value::Integer(i64::from(seq_no)));
        params.push(rusqlite::types::Value::Real(ts_client));
        params.push(rusqlite::types::Value::Real(ts_server));
        for value in values {
            params.push(Self::bind_value(value)?);
        }

        let mut stmt = self.conn.prepare_cached(&table.insert_sql)?;
        stmt.execute(params_from_iter(params))?;
        Ok(())
    }

    fn get_key_value(
        &mut self,
        table: &str,
        key_column: &str,
        value_column: &str,
        key: &str,
    ) -> Result<Option<String>, DbError> {
        let sql =
            format!("SELECT \"{value_column}\" FROM \"{table}\" WHERE \"{key_column}\" = ?;");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        // Values may be stored as INTEGER (sender ids); read through SQLite's
        // text coercion.
        let value: Option<String> = stmt
            .query_row([key], |row| {
                row.get::<_, rusqlite::types::Value>(0).map(|v| match v {
                    rusqlite::types::Value::Text(s) => s,
                    rusqlite::types::Value::Integer(i) => i.to_string(),
                    rusqlite::types::Value::Real(r) => r.to_string(),
                    other => format!("{other:?}"),
                })
            })
            .optional()?;
        Ok(value)
    }

    fn set_key_value(
        &mut self,
        table: &str,
        key_column: &str,
        value_column: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbError> {
        if self
            .get_key_value(table, key_column, value_column, key)?
            .is_none()
        {
            let sql = format!(
                "INSERT INTO \"{table}\" (\"{key_column}\", \"{value_column}\") VALUES (?, ?);"
            );
            self.conn.execute(&sql, [key, value])?;
        } else {
            let sql = format!(
                "UPDATE \"{table}\" SET \"{value_column}\" = ? WHERE \"{key_column}\" = ?;"
            );
            self.conn.execute(&sql, [value, key])?;
        }
        Ok(())
    }

    fn add_sender_id(&mut self, name: &str) -> Result<i32, DbError> {
        if let Some(id) = self.get_key_value("_senders", "name", "id", name)? {
            return id
                .parse::<i32>()
                .map_err(|e| DbError::Backend(format!("corrupt sender id '{id}': {e}")));
        }

        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM _senders;", [], |row| row.get(0))?;
        let index = max.map(|m| m as i32 + 1).unwrap_or(0);
        self.set_key_value("_senders", "name", "id", name, &index.to_string())?;
        Ok(index)
    }

    fn get_uri(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn get_table_list(&mut self) -> Result<Vec<TableDescr>, DbError> {
        let names: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite%';",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };

        if !names.iter().any(|n| n == "_experiment_metadata") {
            debug!("no _experiment_metadata table, assuming fresh database");
            return Ok(Vec::new());
        }

        let mut tables = Vec::new();
        for name in names {
            if name == "_experiment_metadata" {
                continue;
            }
            if name == "_senders" {
                tables.push(TableDescr { name, schema: None });
                continue;
            }
            let Some(meta) = self.get_metadata(&format!("table_{name}"))? else {
                warn!("no stored schema for table '{name}', ignoring it");
                continue;
            };
            match Schema::from_meta(&meta) {
                Ok(schema) => tables.push(TableDescr {
                    name,
                    schema: Some(schema),
                }),
                Err(e) => warn!("could not parse stored schema for table '{name}': {e}"),
            }
        }
        Ok(tables)
    }
}
