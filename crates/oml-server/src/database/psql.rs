// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! PostgreSQL adapter.
//!
//! Connects in two phases: first to the `postgres` administrative database
//! to check privileges and create the experiment database if needed, then
//! to the experiment database itself. Rows go through per-table prepared
//! statements (`OMLInsert-<table>`) with parameters encoded by this module
//! into PostgreSQL's binary wire representation: big-endian integers,
//! IEEE-754 doubles bit-cast big-endian, single-byte booleans. Strings,
//! hex-escaped byteas and JSON-array vectors travel in text format.
//!
//! Unsigned types are widened or bit-aliased into the next signed size
//! (`uint32` -> `INT8` keeps the value; `uint64`/`guid` -> `BIGINT` may
//! alias the sign).

use super::adapter::{
    build_create_table, build_insert_sql, check_types, insert_stmt_name, DbAdapter, DbError,
    TableDescr, TypeMap,
};
use crate::config::PgConfig;
use crate::schema::{Schema, Value, ValueType, METADATA_COLUMNS};
use bytes::BytesMut;
use postgres::types::{to_sql_checked, Format, IsNull, ToSql, Type};
use postgres::{Client, NoTls, SimpleQueryMessage, SimpleQueryRow};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Floor size for per-column scratch buffers; large enough for any
/// rendered integer.
const MAX_DIGITS: usize = 32;

static PSQL_TYPE_MAP: TypeMap = TypeMap {
    entries: &[
        (ValueType::PrimaryKey, "SERIAL PRIMARY KEY", 4),
        (ValueType::Int32, "INT4", 4),
        (ValueType::UInt32, "INT8", 8),
        (ValueType::Int64, "INT8", 8),
        (ValueType::UInt64, "BIGINT", 8),
        (ValueType::Double, "FLOAT8", 8),
        (ValueType::Bool, "BOOLEAN", 1),
        (ValueType::Text, "TEXT", 0),
        (ValueType::Blob, "BYTEA", 0),
        (ValueType::Guid, "BIGINT", 8),
        (ValueType::VectorInt32, "TEXT", 0),
        (ValueType::VectorUInt32, "TEXT", 0),
        (ValueType::VectorInt64, "TEXT", 0),
        (ValueType::VectorUInt64, "TEXT", 0),
        (ValueType::VectorDouble, "TEXT", 0),
        (ValueType::VectorBool, "TEXT", 0),
    ],
};

// ============================================================================
// Binary parameter encoding
// ============================================================================

pub(crate) mod encode {
    /// 4-byte big-endian int32.
    pub fn put_i32(val: i32, buf: &mut Vec<u8>) -> usize {
        buf.clear();
        buf.extend_from_slice(&val.to_be_bytes());
        4
    }

    /// 8-byte big-endian int64.
    pub fn put_i64(val: i64, buf: &mut Vec<u8>) -> usize {
        buf.clear();
        buf.extend_from_slice(&val.to_be_bytes());
        8
    }

    /// uint32 widened to int64 so the value survives the signed backend.
    pub fn put_u32(val: u32, buf: &mut Vec<u8>) -> usize {
        put_i64(i64::from(val), buf)
    }

    /// uint64 bit-aliased into int64; the sign may flip.
    pub fn put_u64(val: u64, buf: &mut Vec<u8>) -> usize {
        put_i64(val as i64, buf)
    }

    /// IEEE-754 bits, big-endian.
    pub fn put_f64(val: f64, buf: &mut Vec<u8>) -> usize {
        buf.clear();
        buf.extend_from_slice(&val.to_be_bytes());
        8
    }

    /// Single byte, 0 or 1.
    pub fn put_bool(val: bool, buf: &mut Vec<u8>) -> usize {
        buf.clear();
        buf.push(u8::from(val));
        1
    }

    /// Text-format bytea: `\x` followed by lowercase hex.
    pub fn put_bytea_hex(val: &[u8], buf: &mut Vec<u8>) -> usize {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        buf.clear();
        buf.reserve(2 + val.len() * 2);
        buf.extend_from_slice(b"\\x");
        for b in val {
            buf.push(HEX[(b >> 4) as usize]);
            buf.push(HEX[(b & 0x0f) as usize]);
        }
        buf.len()
    }

    /// UTF-8 body, text format.
    pub fn put_text(val: &str, buf: &mut Vec<u8>) -> usize {
        buf.clear();
        buf.extend_from_slice(val.as_bytes());
        buf.len()
    }
}

/// A pre-encoded parameter: raw bytes plus the wire format flag.
#[derive(Debug)]
struct RawParam<'a> {
    bytes: &'a [u8],
    binary: bool,
}

impl ToSql for RawParam<'_> {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        out.extend_from_slice(self.bytes);
        Ok(IsNull::No)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        if self.binary {
            Format::Binary
        } else {
            Format::Text
        }
    }

    to_sql_checked!();
}

struct PsqlTable {
    /// Logical statement name, kept for logs and idempotence.
    stmt_name: String,
    stmt: postgres::Statement,
    /// One scratch buffer per parameter, metadata columns first.
    scratch: Vec<Vec<u8>>,
}

/// PostgreSQL implementation of the adapter contract.
pub struct PsqlAdapter {
    client: Client,
    dbname: String,
    uri: String,
    tables: HashMap<String, PsqlTable>,
}

impl From<postgres::Error> for DbError {
    fn from(e: postgres::Error) -> DbError {
        if e.is_closed() {
            DbError::ConnectionLost(e.to_string())
        } else {
            DbError::Backend(e.to_string())
        }
    }
}

/// Map a server diagnostic onto the host log the way the wire severities
/// are ranked: E/F/P are errors, W warns, the chatter is debug.
fn log_server_notice(dbname: &str, e: &postgres::Error) {
    match e.as_db_error() {
        Some(db) => match db.severity().chars().next() {
            Some('E') | Some('F') | Some('P') => error!("psql:{dbname}: {}", db.message()),
            Some('W') => warn!("psql:{dbname}: {}", db.message()),
            _ => debug!("psql:{dbname}: {}", db.message()),
        },
        None => error!("psql:{dbname}: {e}"),
    }
}

fn connect_to(cfg: &PgConfig, dbname: &str) -> Result<Client, DbError> {
    let mut pg = if cfg.conninfo.is_empty() {
        postgres::Config::new()
    } else {
        cfg.conninfo
            .parse::<postgres::Config>()
            .map_err(|e| DbError::Backend(format!("bad conninfo: {e}")))?
    };
    pg.host(&cfg.host);
    pg.port(cfg.port_number());
    pg.user(&cfg.user);
    pg.dbname(dbname);
    pg.application_name("oml-server");
    if !cfg.pass.is_empty() {
        pg.password(&cfg.pass);
    }
    Ok(pg.connect(NoTls)?)
}

fn simple_rows(client: &mut Client, sql: &str) -> Result<Vec<SimpleQueryRow>, DbError> {
    Ok(client
        .simple_query(sql)?
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect())
}

fn quote_literal(s: &str) -> String {
    s.replace('\'', "''")
}

impl PsqlAdapter {
    /// Verify the backend is reachable and the configured user can create
    /// databases. Fatal at startup if not.
    pub fn setup(cfg: &PgConfig) -> Result<(), DbError> {
        info!(
            "psql: sending experiment data to PostgreSQL server {}:{} as user '{}'",
            cfg.host, cfg.port, cfg.user
        );
        let mut admin = connect_to(cfg, "postgres")?;

        let sql = format!(
            "SELECT rolcreatedb FROM pg_roles WHERE rolname='{}';",
            quote_literal(&cfg.user)
        );
        let rows = simple_rows(&mut admin, &sql)?;
        let can_create = rows
            .first()
            .and_then(|row| row.get(0))
            .map(|v| v == "t")
            .unwrap_or(false);
        if !can_create {
            return Err(DbError::Backend(format!(
                "user '{}' does not have the CREATE DATABASE role",
                cfg.user
            )));
        }
        debug!("psql: user '{}' has CREATE DATABASE privileges", cfg.user);
        Ok(())
    }

    /// Open the experiment database `dbname`, creating it if needed.
    pub fn connect(cfg: &PgConfig, dbname: &str) -> Result<PsqlAdapter, DbError> {
        info!("psql:{dbname}: accessing database");

        let mut admin = connect_to(cfg, "postgres")?;
        let sql = format!(
            "SELECT datname FROM pg_database WHERE datname='{}';",
            quote_literal(dbname)
        );
        if simple_rows(&mut admin, &sql)?.is_empty() {
            info!("psql:{dbname}: database does not exist, creating it");
            admin
                .batch_execute(&format!("CREATE DATABASE \"{dbname}\";"))
                .map_err(|e| {
                    log_server_notice(dbname, &e);
                    DbError::from(e)
                })?;
        }
        drop(admin);

        let client = connect_to(cfg, dbname)?;
        let uri = format!(
            "postgresql://{}@{}:{}/{}",
            cfg.user,
            cfg.host,
            cfg.port_number(),
            dbname
        );
        Ok(PsqlAdapter {
            client,
            dbname: dbname.to_string(),
            uri,
            tables: HashMap::new(),
        })
    }

    fn encode_payload(
        dbname: &str,
        scratch: &mut [Vec<u8>],
        schema: &Schema,
        values: &[Value],
    ) -> Result<Vec<bool>, DbError> {
        // Format flag per payload parameter: true = binary.
        let mut binary = Vec::with_capacity(values.len());
        for (k, value) in values.iter().enumerate() {
            let buf = &mut scratch[k];
            let is_binary = match value {
                Value::Int32(v) => {
                    encode::put_i32(*v, buf);
                    true
                }
                Value::UInt32(v) => {
                    encode::put_u32(*v, buf);
                    true
                }
                Value::Int64(v) => {
                    encode::put_i64(*v, buf);
                    true
                }
                Value::UInt64(v) => {
                    encode::put_u64(*v, buf);
                    true
                }
                Value::Guid(v) => {
                    encode::put_u64(*v, buf);
                    true
                }
                Value::Double(v) => {
                    encode::put_f64(*v, buf);
                    true
                }
                Value::Bool(v) => {
                    encode::put_bool(*v, buf);
                    true
                }
                Value::Text(v) => {
                    encode::put_text(v, buf);
                    false
                }
                Value::Blob(v) => {
                    encode::put_bytea_hex(v, buf);
                    false
                }
                vector => {
                    debug_assert!(vector.value_type().is_vector());
                    let json = vector
                        .json_array()
                        .ok_or_else(|| {
                            DbError::Backend("expected a vector value".to_string())
                        })?
                        .map_err(|e| {
                            DbError::Backend(format!(
                                "psql:{dbname}: vector encoding failed in '{}': {e}",
                                schema.name()
                            ))
                        })?;
                    encode::put_text(&json, buf);
                    false
                }
            };
            binary.push(is_binary);
        }
        Ok(binary)
    }
}

impl DbAdapter for PsqlAdapter {
    fn backend_name(&self) -> &'static str {
        "psql"
    }

    fn type_map(&self) -> &'static TypeMap {
        &PSQL_TYPE_MAP
    }

    fn prepared_var(&self, order: u32) -> String {
        format!("${order}")
    }

    fn stmt(&mut self, sql: &str) -> Result<(), DbError> {
        debug!("psql:{}: will execute '{sql}'", self.dbname);
        self.client.batch_execute(sql).map_err(|e| {
            log_server_notice(&self.dbname, &e);
            DbError::from(e)
        })
    }

    fn table_create(&mut self, schema: &Schema, shallow: bool) -> Result<(), DbError> {
        let name = schema.name();
        debug!("psql:{}: creating table '{name}' (shallow={shallow})", self.dbname);

        // Already described in this session: the prepared statement and
        // scratch buffers exist, nothing to re-prepare.
        if self.tables.contains_key(name) {
            debug!(
                "psql:{}: insertion statement {} already exists",
                self.dbname,
                insert_stmt_name(name)
            );
            return Ok(());
        }

        if !shallow {
            let ddl = build_create_table(&PSQL_TYPE_MAP, schema)?;
            self.stmt(&ddl)?;
        }

        let insert_sql = build_insert_sql(schema, |o| format!("${o}"));
        let stmt_name = insert_stmt_name(name);
        debug!(
            "psql:{}: preparing statement '{stmt_name}' ({insert_sql})",
            self.dbname
        );
        let stmt = self.client.prepare(&insert_sql).map_err(|e| {
            log_server_notice(&self.dbname, &e);
            DbError::from(e)
        })?;

        let param_count = schema.payload_fields().len() + METADATA_COLUMNS.len();
        let mut scratch = Vec::with_capacity(param_count);
        for i in 0..param_count {
            let ty = if i < METADATA_COLUMNS.len() {
                METADATA_COLUMNS[i].1
            } else {
                schema.payload_fields()[i - METADATA_COLUMNS.len()].ty
            };
            let size = PSQL_TYPE_MAP.size(ty).max(MAX_DIGITS);
            scratch.push(Vec::with_capacity(size));
        }

        self.tables.insert(
            name.to_string(),
            PsqlTable {
                stmt_name,
                stmt,
                scratch,
            },
        );
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
            .get_mut(schema.name())
            .ok_or_else(|| DbError::UnknownTable(schema.name().to_string()))?;

        let (meta_scratch, payload_scratch) = table.scratch.split_at_mut(METADATA_COLUMNS.len());
        encode::put_i32(sender_id, &mut meta_scratch[0]);
        encode::put_i32(seq_no, &mut meta_scratch[1]);
        encode::put_f64(ts_client, &mut meta_scratch[2]);
        encode::put_f64(ts_server, &mut meta_scratch[3]);

        let payload_binary =
            Self::encode_payload(&self.dbname, payload_scratch, schema, values)?;

        let mut params: Vec<RawParam<'_>> = Vec::with_capacity(table.scratch.len());
        for (i, buf) in table.scratch.iter().enumerate() {
            let binary = i < METADATA_COLUMNS.len() || payload_binary[i - METADATA_COLUMNS.len()];
            params.push(RawParam { bytes: buf, binary });
        }
        let refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        let stmt = table.stmt.clone();
        if let Err(e) = self.client.execute(&stmt, &refs) {
            log_server_notice(&self.dbname, &e);
            error!(
                "psql:{}: INSERT INTO '{}' ({}) failed",
                self.dbname,
                schema.name(),
                table.stmt_name
            );
            return Err(DbError::from(e));
        }
        Ok(())
    }

    fn get_key_value(
        &mut self,
        table: &str,
        key_column: &str,
        value_column: &str,
        key: &str,
    ) -> Result<Option<String>, DbError> {
        let sql = format!(
            "SELECT \"{value_column}\" FROM \"{table}\" WHERE \"{key_column}\"='{}';",
            quote_literal(key)
        );
        let rows = simple_rows(&mut self.client, &sql)?;
        if rows.len() > 1 {
            warn!(
                "psql:{}: key-value lookup for '{key}' in {table}({key_column}, {value_column}) \
                 returned more than one row",
                self.dbname
            );
        }
        Ok(rows
            .first()
            .and_then(|row| row.get(0))
            .map(str::to_string))
    }

    fn set_key_value(
        &mut self,
        table: &str,
        key_column: &str,
        value_column: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DbError> {
        let sql = if self
            .get_key_value(table, key_column, value_column, key)?
            .is_none()
        {
            format!(
                "INSERT INTO \"{table}\" (\"{key_column}\", \"{value_column}\") VALUES ('{}', '{}');",
                quote_literal(key),
                quote_literal(value)
            )
        } else {
            format!(
                "UPDATE \"{table}\" SET \"{value_column}\"='{}' WHERE \"{key_column}\"='{}';",
                quote_literal(value),
                quote_literal(key)
            )
        };
        self.stmt(&sql)
    }

    fn add_sender_id(&mut self, name: &str) -> Result<i32, DbError> {
        if let Some(id) = self.get_key_value("_senders", "name", "id", name)? {
            return id
                .parse::<i32>()
                .map_err(|e| DbError::Backend(format!("corrupt sender id '{id}': {e}")));
        }

        let index = match simple_rows(&mut self.client, "SELECT MAX(id) FROM _senders;") {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get(0))
                .and_then(|max| max.parse::<i32>().ok())
                .map(|max| max + 1)
                .unwrap_or(0),
            Err(e) => {
                warn!(
                    "psql:{}: failed to get maximum sender id, restarting at 0: {e}",
                    self.dbname
                );
                0
            }
        };
        self.set_key_value("_senders", "name", "id", name, &index.to_string())?;
        Ok(index)
    }

    fn get_uri(&self) -> String {
        self.uri.clone()
    }

    fn get_table_list(&mut self) -> Result<Vec<TableDescr>, DbError> {
        let rows = simple_rows(
            &mut self.client,
            "SELECT tablename FROM pg_tables \
             WHERE tablename NOT LIKE 'pg%' AND tablename NOT LIKE 'sql%';",
        )?;
        let names: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get(0))
            .map(str::to_string)
            .collect();

        if !names.iter().any(|n| n == "_experiment_metadata") {
            debug!("psql:{}: _experiment_metadata table not found", self.dbname);
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
                warn!(
                    "psql:{}: no stored schema for table '{name}', ignoring it",
                    self.dbname
                );
                continue;
            };
            match Schema::from_meta(&meta) {
                Ok(schema) => tables.push(TableDescr {
                    name,
                    schema: Some(schema),
                }),
                Err(e) => warn!(
                    "psql:{}: could not parse stored schema for table '{name}': {e}",
                    self.dbname
                ),
            }
        }
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    #[test]
    fn test_int_encodings_are_big_endian() {
        let mut buf = Vec::new();
        assert_eq!(encode::put_i32(1, &mut buf), 4);
        assert_eq!(buf, [0, 0, 0, 1]);

        encode::put_i32(-2, &mut buf);
        assert_eq!(buf, [0xff, 0xff, 0xff, 0xfe]);

        assert_eq!(encode::put_i64(0x0102_0304_0506_0708, &mut buf), 8);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_uint32_widened_keeps_value() {
        let mut buf = Vec::new();
        encode::put_u32(u32::MAX, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_uint64_aliases_bit_pattern() {
        let mut buf = Vec::new();
        encode::put_u64(u64::MAX, &mut buf);
        assert_eq!(buf, [0xff; 8]);
    }

    #[test]
    fn test_double_is_ieee_bits_big_endian() {
        let mut buf = Vec::new();
        assert_eq!(encode::put_f64(1.0, &mut buf), 8);
        assert_eq!(buf, [0x3f, 0xf0, 0, 0, 0, 0, 0, 0]);

        encode::put_f64(-2.5, &mut buf);
        assert_eq!(buf, (-2.5f64).to_bits().to_be_bytes());
    }

    #[test]
    fn test_bool_is_single_byte() {
        let mut buf = Vec::new();
        assert_eq!(encode::put_bool(true, &mut buf), 1);
        assert_eq!(buf, [1]);
        encode::put_bool(false, &mut buf);
        assert_eq!(buf, [0]);
    }

    #[test]
    fn test_bytea_hex_escape() {
        let mut buf = Vec::new();
        encode::put_bytea_hex(&[0x00, 0x0f, 0xa5, 0xff], &mut buf);
        assert_eq!(buf, b"\\x000fa5ff");
    }

    #[test]
    fn test_scratch_reuse_clears_previous_value() {
        let mut buf = Vec::new();
        encode::put_text("a long string that grows the buffer", &mut buf);
        encode::put_i32(7, &mut buf);
        assert_eq!(buf, [0, 0, 0, 7]);
    }

    #[test]
    fn test_raw_param_formats() {
        let binary = RawParam {
            bytes: &[0, 0, 0, 1],
            binary: true,
        };
        let text = RawParam {
            bytes: b"hello",
            binary: false,
        };
        assert!(matches!(binary.encode_format(&Type::INT4), Format::Binary));
        assert!(matches!(text.encode_format(&Type::TEXT), Format::Text));

        let mut out = BytesMut::new();
        binary.to_sql(&Type::INT4, &mut out).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_ddl_matches_backend_type_map() {
        let schema = Schema::new(
            "power",
            vec![
                Field::new("v", ValueType::Double),
                Field::new("ok", ValueType::Bool),
            ],
        )
        .unwrap();
        let sql = build_create_table(&PSQL_TYPE_MAP, &schema).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE \"power\" (oml_sender_id INT4, oml_seq INT4, \
             oml_ts_client FLOAT8, oml_ts_server FLOAT8, v FLOAT8, ok BOOLEAN);"
        );
    }

    #[test]
    fn test_insert_sql_uses_dollar_placeholders() {
        let schema = Schema::new("power", vec![Field::new("v", ValueType::Double)]).unwrap();
        assert_eq!(
            build_insert_sql(&schema, |o| format!("${o}")),
            "INSERT INTO \"power\" (oml_sender_id, oml_seq, oml_ts_client, \
             oml_ts_server, v) VALUES ($1, $2, $3, $4, $5);"
        );
    }

    #[test]
    fn test_unsigned_types_widen_in_ddl() {
        assert_eq!(PSQL_TYPE_MAP.ddl(ValueType::UInt32).unwrap(), "INT8");
        assert_eq!(PSQL_TYPE_MAP.ddl(ValueType::UInt64).unwrap(), "BIGINT");
        assert_eq!(PSQL_TYPE_MAP.ddl(ValueType::Guid).unwrap(), "BIGINT");
        assert_eq!(PSQL_TYPE_MAP.size(ValueType::UInt32), 8);
    }

    #[test]
    fn test_payload_encoding_formats() {
        let schema = Schema::new(
            "mixed",
            vec![
                Field::new("n", ValueType::Int32),
                Field::new("s", ValueType::Text),
                Field::new("b", ValueType::Blob),
                Field::new("vd", ValueType::VectorDouble),
            ],
        )
        .unwrap();
        let mut scratch = vec![Vec::new(), Vec::new(), Vec::new(), Vec::new()];
        let values = [
            Value::Int32(258),
            Value::Text("abc".to_string()),
            Value::Blob(vec![0xff]),
            Value::VectorDouble(vec![0.5]),
        ];

        let binary =
            PsqlAdapter::encode_payload("test", &mut scratch, &schema, &values).unwrap();
        assert_eq!(binary, [true, false, false, false]);
        assert_eq!(scratch[0], [0, 0, 1, 2]);
        assert_eq!(scratch[1], b"abc");
        assert_eq!(scratch[2], b"\\xff");
        assert_eq!(scratch[3], b"[0.5]");
    }

    #[test]
    fn test_quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("o'brien"), "o''brien");
        assert_eq!(quote_literal("plain"), "plain");
    }
}
