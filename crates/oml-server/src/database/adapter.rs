// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Backend-neutral database adapter contract.
//!
//! Each storage backend implements [`DbAdapter`], a capability record
//! covering DDL, prepared inserts, the key/value metadata store, sender-id
//! allocation and table rediscovery. The [`Database`](super::Database)
//! façade owns exactly one boxed adapter; callers never touch the backend
//! connection directly.

use crate::schema::{Schema, SchemaError, Value, ValueType, METADATA_COLUMNS};
use thiserror::Error;

/// Adapter-level failures.
#[derive(Debug, Error)]
pub enum DbError {
    /// Statement or protocol failure reported by the backend.
    #[error("database error: {0}")]
    Backend(String),

    /// The backend connection is gone; release and recreate.
    #[error("database connection lost: {0}")]
    ConnectionLost(String),

    /// Value type does not match the declared column type.
    #[error("type mismatch for column {column} of table '{table}': expected {expected}, got {actual}")]
    TypeMismatch {
        table: String,
        column: usize,
        expected: ValueType,
        actual: ValueType,
    },

    /// Wrong number of values for the schema.
    #[error("table '{table}' takes {expected} values, got {actual}")]
    ValueCount {
        table: String,
        expected: usize,
        actual: usize,
    },

    /// Insert routed to a table that was never registered.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// No type-map entry for a semantic type.
    #[error("backend has no mapping for type {0}")]
    UnmappedType(ValueType),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Per-backend mapping from semantic types to DDL spellings and binary
/// storage sizes (0 = variable length).
pub struct TypeMap {
    pub entries: &'static [(ValueType, &'static str, usize)],
}

impl TypeMap {
    /// DDL spelling for a semantic type.
    pub fn ddl(&self, ty: ValueType) -> Result<&'static str, DbError> {
        self.entries
            .iter()
            .find(|(t, _, _)| *t == ty)
            .map(|(_, ddl, _)| *ddl)
            .ok_or(DbError::UnmappedType(ty))
    }

    /// Binary storage size in bytes, 0 for variable-length types.
    pub fn size(&self, ty: ValueType) -> usize {
        self.entries
            .iter()
            .find(|(t, _, _)| *t == ty)
            .map(|(_, _, size)| *size)
            .unwrap_or(0)
    }
}

/// One table rediscovered from stored metadata.
///
/// `schema` is `None` for the `_senders` bookkeeping table, which carries
/// no measurement schema but must not be recreated by bootstrap code.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescr {
    pub name: String,
    pub schema: Option<Schema>,
}

/// Capability record implemented by each storage backend.
pub trait DbAdapter: Send {
    /// Short backend identifier for logs (`"sqlite"`, `"psql"`).
    fn backend_name(&self) -> &'static str;

    /// This backend's semantic-type mapping.
    fn type_map(&self) -> &'static TypeMap;

    /// Placeholder for prepared-statement parameter `order` (1-based).
    fn prepared_var(&self, order: u32) -> String;

    /// Execute one or more raw SQL statements.
    fn stmt(&mut self, sql: &str) -> Result<(), DbError>;

    /// Create backend state for a table: DDL (unless `shallow`, meaning
    /// the table already exists in the store), the prepared insert and the
    /// per-column scratch buffers. Idempotent per table name.
    fn table_create(&mut self, schema: &Schema, shallow: bool) -> Result<(), DbError>;

    /// Drop the backend state for a table (the stored table survives).
    fn table_free(&mut self, table: &str);

    /// Insert one row through the table's prepared statement. The caller
    /// has already validated value types against the schema.
    fn insert(
        &mut self,
        schema: &Schema,
        sender_id: i32,
        seq_no: i32,
        ts_client: f64,
        ts_server: f64,
        values: &[Value],
    ) -> Result<(), DbError>;

    /// Key/value lookup on a two-column bookkeeping table.
    fn get_key_value(
        &mut self,
        table: &str,
        key_column: &str,
        value_column: &str,
        key: &str,
    ) -> Result<Option<String>, DbError>;

    /// Key/value upsert on a two-column bookkeeping table.
    fn set_key_value(
        &mut self,
        table: &str,
        key_column: &str,
        value_column: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbError>;

    /// Experiment-level metadata, backed by `_experiment_metadata`.
    fn get_metadata(&mut self, key: &str) -> Result<Option<String>, DbError> {
        self.get_key_value("_experiment_metadata", "key", "value", key)
    }

    /// Experiment-level metadata upsert.
    fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), DbError> {
        self.set_key_value("_experiment_metadata", "key", "value", key, value)
    }

    /// Allocate (or look up) the stable id for a sender name.
    fn add_sender_id(&mut self, name: &str) -> Result<i32, DbError>;

    /// Connection URI for logging.
    fn get_uri(&self) -> String;

    /// Enumerate user tables, resolving schemas from stored metadata.
    /// A fresh database yields an empty list, not an error.
    fn get_table_list(&mut self) -> Result<Vec<TableDescr>, DbError>;
}

/// Build the `CREATE TABLE` statement for a schema.
///
/// The four metadata columns are prepended to the schema columns; a
/// leading primary-key sentinel becomes an auto-allocated id column ahead
/// of them.
pub fn build_create_table(type_map: &TypeMap, schema: &Schema) -> Result<String, DbError> {
    let mut columns = Vec::new();

    if schema.has_primary_key() {
        let sentinel = &schema.fields()[0];
        columns.push(format!(
            "{} {}",
            sentinel.name,
            type_map.ddl(ValueType::PrimaryKey)?
        ));
    }
    for (name, ty) in METADATA_COLUMNS {
        columns.push(format!("{} {}", name, type_map.ddl(ty)?));
    }
    for field in schema.payload_fields() {
        columns.push(format!("{} {}", field.name, type_map.ddl(field.ty)?));
    }

    Ok(format!(
        "CREATE TABLE \"{}\" ({});",
        schema.name(),
        columns.join(", ")
    ))
}

/// Build the parameterised `INSERT` statement for a schema, using the
/// backend's placeholder syntax.
pub fn build_insert_sql(schema: &Schema, prepared_var: impl Fn(u32) -> String) -> String {
    let mut columns: Vec<&str> = METADATA_COLUMNS.iter().map(|(name, _)| *name).collect();
    columns.extend(schema.payload_fields().iter().map(|f| f.name.as_str()));

    let placeholders: Vec<String> = (1..=columns.len() as u32).map(prepared_var).collect();

    format!(
        "INSERT INTO \"{}\" ({}) VALUES ({});",
        schema.name(),
        columns.join(", "),
        placeholders.join(", ")
    )
}

/// The conventional name of a table's prepared insert statement.
pub fn insert_stmt_name(table: &str) -> String {
    format!("OMLInsert-{table}")
}

/// Assert that `values` matches the schema's payload columns exactly.
pub fn check_types(schema: &Schema, values: &[Value]) -> Result<(), DbError> {
    let fields = schema.payload_fields();
    if fields.len() != values.len() {
        return Err(DbError::ValueCount {
            table: schema.name().to_string(),
            expected: fields.len(),
            actual: values.len(),
        });
    }
    for (k, (field, value)) in fields.iter().zip(values).enumerate() {
        if value.value_type() != field.ty {
            return Err(DbError::TypeMismatch {
                table: schema.name().to_string(),
                column: k,
                expected: field.ty,
                actual: value.value_type(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    static TEST_MAP: TypeMap = TypeMap {
        entries: &[
            (ValueType::PrimaryKey, "SERIAL PRIMARY KEY", 4),
            (ValueType::Int32, "INT4", 4),
            (ValueType::Double, "FLOAT8", 8),
            (ValueType::Bool, "BOOLEAN", 1),
            (ValueType::Text, "TEXT", 0),
        ],
    };

    fn power_schema() -> Schema {
        Schema::new(
            "power",
            vec![
                Field::new("v", ValueType::Double),
                Field::new("ok", ValueType::Bool),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_create_table_prepends_metadata_columns() {
        let sql = build_create_table(&TEST_MAP, &power_schema()).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE \"power\" (oml_sender_id INT4, oml_seq INT4, \
             oml_ts_client FLOAT8, oml_ts_server FLOAT8, v FLOAT8, ok BOOLEAN);"
        );
    }

    #[test]
    fn test_create_table_with_sentinel_prepends_serial() {
        let schema = Schema::new(
            "keyed",
            vec![
                Field::new("id", ValueType::PrimaryKey),
                Field::new("v", ValueType::Double),
            ],
        )
        .unwrap();
        let sql = build_create_table(&TEST_MAP, &schema).unwrap();
        assert!(sql.starts_with("CREATE TABLE \"keyed\" (id SERIAL PRIMARY KEY, oml_sender_id"));
    }

    #[test]
    fn test_insert_sql_uses_backend_placeholders() {
        let schema = power_schema();
        assert_eq!(
            build_insert_sql(&schema, |o| format!("${o}")),
            "INSERT INTO \"power\" (oml_sender_id, oml_seq, oml_ts_client, \
             oml_ts_server, v, ok) VALUES ($1, $2, $3, $4, $5, $6);"
        );
        assert_eq!(
            build_insert_sql(&schema, |_| "?".to_string()),
            "INSERT INTO \"power\" (oml_sender_id, oml_seq, oml_ts_client, \
             oml_ts_server, v, ok) VALUES (?, ?, ?, ?, ?, ?);"
        );
    }

    #[test]
    fn test_insert_stmt_name() {
        assert_eq!(insert_stmt_name("power"), "OMLInsert-power");
    }

    #[test]
    fn test_check_types_exact_match_required() {
        let schema = power_schema();
        assert!(check_types(&schema, &[Value::Double(3.14), Value::Bool(true)]).is_ok());

        let err = check_types(&schema, &[Value::Int32(3), Value::Bool(true)]).unwrap_err();
        assert!(matches!(err, DbError::TypeMismatch { column: 0, .. }));

        let err = check_types(&schema, &[Value::Double(3.14)]).unwrap_err();
        assert!(matches!(err, DbError::ValueCount { expected: 2, actual: 1, .. }));
    }

    #[test]
    fn test_check_types_zero_payload() {
        let schema = Schema::new("heartbeat", vec![]).unwrap();
        assert!(check_types(&schema, &[]).is_ok());
    }

    #[test]
    fn test_unmapped_type_is_an_error() {
        let schema = Schema::new("t", vec![Field::new("g", ValueType::Guid)]).unwrap();
        assert!(matches!(
            build_create_table(&TEST_MAP, &schema),
            Err(DbError::UnmappedType(ValueType::Guid))
        ));
    }
}
