// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Full experiment lifecycle over the SQLite backend: open, sessions,
//! schema registration, inserts, release, reopen with table rediscovery.

use oml_server::database::{Database, SqliteAdapter};
use oml_server::schema::{Field, Schema, Value, ValueType};
use oml_server::session::Session;

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
fn test_experiment_survives_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trial01.sq3");

    // First server run: two injection points, one table, a few rows.
    let first_start;
    {
        let adapter = SqliteAdapter::open(&path).unwrap();
        let mut db = Database::open("trial01", Box::new(adapter)).unwrap();
        first_start = db.start_time();

        let mut alpha = Session::start(&mut db, "alpha").unwrap();
        let mut beta = Session::start(&mut db, "beta").unwrap();
        assert_eq!(alpha.sender_id(), 0);
        assert_eq!(beta.sender_id(), 1);

        alpha.register_stream(&mut db, 1, power_schema()).unwrap();
        beta.register_stream(&mut db, 1, power_schema()).unwrap();

        for seq in 1..=5 {
            assert!(alpha.insert(
                &mut db,
                1,
                seq,
                seq as f64 / 10.0,
                &[Value::Double(seq as f64), Value::Bool(seq % 2 == 0)],
            ));
        }
        assert!(beta.insert(&mut db, 1, 1, 0.5, &[Value::Double(-1.0), Value::Bool(true)]));

        db.release();
    }

    // Second server run on the same file: tables rediscovered from stored
    // metadata, sender ids stable, the experiment clock unchanged.
    let adapter = SqliteAdapter::open(&path).unwrap();
    let mut db = Database::open("trial01", Box::new(adapter)).unwrap();
    assert_eq!(db.start_time(), first_start);
    assert!(db.schema("power").is_some());
    assert_eq!(db.tables().count(), 1);

    let tables = db.get_table_list().unwrap();
    let power = tables.iter().find(|t| t.name == "power").unwrap();
    assert_eq!(power.schema.as_ref().unwrap(), &power_schema());
    assert!(tables
        .iter()
        .any(|t| t.name == "_senders" && t.schema.is_none()));

    let mut alpha = Session::start(&mut db, "alpha").unwrap();
    assert_eq!(alpha.sender_id(), 0);
    let mut gamma = Session::start(&mut db, "gamma").unwrap();
    assert_eq!(gamma.sender_id(), 2);

    // The rediscovered table accepts rows without re-issuing DDL.
    alpha.register_stream(&mut db, 1, power_schema()).unwrap();
    assert!(alpha.insert(&mut db, 1, 6, 0.6, &[Value::Double(6.0), Value::Bool(true)]));
    db.release();

    // Check the persisted rows directly.
    let conn = rusqlite::Connection::open(&path).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM power;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 7);

    let alpha_rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM power WHERE oml_sender_id = 0;",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(alpha_rows, 6);
}
