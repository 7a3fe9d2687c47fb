// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client session bookkeeping.
//!
//! One [`Session`] exists per connected injection point. It binds the
//! client's name to a stable sender id, holds the registry of measurement
//! streams the client has declared (stream index to table), and routes
//! decoded measurement tuples into the bound [`Database`]. Protocol
//! parsing and the socket event-loop live outside this crate; they hand
//! the session already-decoded schemas and values.
//!
//! Per-row failures are logged and counted, never fatal: a malformed or
//! mistyped tuple loses that row while the session keeps going.

use crate::database::{Database, DbError};
use crate::schema::{Schema, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

struct StreamState {
    table: String,
    last_seq: Option<i32>,
}

/// Row counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub rows_inserted: u64,
    pub rows_dropped: u64,
}

/// One connected injection point.
pub struct Session {
    sender: String,
    sender_id: i32,
    streams: HashMap<u32, StreamState>,
    stats: SessionStats,
}

impl Session {
    /// Start a session for `sender`, allocating (or looking up) its
    /// stable id in the database.
    pub fn start(db: &mut Database, sender: &str) -> Result<Session, DbError> {
        let sender_id = db.add_sender_id(sender)?;
        info!("session for sender '{sender}' (id {sender_id}) on {}", db.get_uri());
        Ok(Session {
            sender: sender.to_string(),
            sender_id,
            streams: HashMap::new(),
            stats: SessionStats::default(),
        })
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn sender_id(&self) -> i32 {
        self.sender_id
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Declare measurement stream `index` with the given schema, creating
    /// the backing table on first sight.
    pub fn register_stream(
        &mut self,
        db: &mut Database,
        index: u32,
        schema: Schema,
    ) -> Result<(), DbError> {
        let table = schema.name().to_string();
        db.table_create(schema, false)?;
        if let Some(old) = self.streams.insert(
            index,
            StreamState {
                table: table.clone(),
                last_seq: None,
            },
        ) {
            warn!(
                "sender '{}' redefined stream {index} from '{}' to '{table}'",
                self.sender, old.table
            );
        }
        Ok(())
    }

    /// Route one measurement tuple to its table.
    ///
    /// Returns whether the row was stored. Failures (unknown stream, type
    /// mismatch, backend error) are logged and counted; the session
    /// continues.
    pub fn insert(
        &mut self,
        db: &mut Database,
        index: u32,
        seq_no: i32,
        ts_client: f64,
        values: &[Value],
    ) -> bool {
        let Some(stream) = self.streams.get_mut(&index) else {
            warn!(
                "sender '{}' sent a tuple for undeclared stream {index}, dropping it",
                self.sender
            );
            self.stats.rows_dropped += 1;
            return false;
        };

        if let Some(last) = stream.last_seq {
            if seq_no <= last {
                debug!(
                    "sender '{}' stream {index}: sequence went backwards ({last} -> {seq_no})",
                    self.sender
                );
            } else if seq_no > last + 1 {
                debug!(
                    "sender '{}' stream {index}: sequence gap ({last} -> {seq_no})",
                    self.sender
                );
            }
        }

        match db.insert(&stream.table, self.sender_id, seq_no, ts_client, values) {
            Ok(()) => {
                stream.last_seq = Some(seq_no);
                self.stats.rows_inserted += 1;
                true
            }
            Err(e) => {
                warn!(
                    "sender '{}' stream {index}: dropping row {seq_no}: {e}",
                    self.sender
                );
                self.stats.rows_dropped += 1;
                false
            }
        }
    }
}
