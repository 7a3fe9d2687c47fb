// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File output stream.
//!
//! Backs the `file:` and `flush:` collection URIs. `flush:` pushes every
//! write to disk immediately; `file:` leaves buffering to the OS.

use super::{OutStream, StreamError};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Append-mode file sink.
pub struct FileOutStream {
    file: File,
    dest: String,
    flush_every_write: bool,
    header_written: bool,
}

impl FileOutStream {
    /// Open (or create) `path` for appending.
    ///
    /// With `flush_every_write`, each write is flushed and synced before
    /// returning, trading throughput for durability.
    pub fn open<P: AsRef<Path>>(path: P, flush_every_write: bool) -> Result<Self, StreamError> {
        let path = path.as_ref();
        let dest = format!(
            "{}:{}",
            if flush_every_write { "flush" } else { "file" },
            path.display()
        );
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| StreamError::Fatal {
                dest: dest.clone(),
                source,
            })?;
        debug!("opened file sink {dest}");
        Ok(Self {
            file,
            dest,
            flush_every_write,
            header_written: false,
        })
    }

    fn fatal(&self, source: std::io::Error) -> StreamError {
        StreamError::Fatal {
            dest: self.dest.clone(),
            source,
        }
    }
}

impl OutStream for FileOutStream {
    fn write(&mut self, body: &[u8], header: &[u8]) -> Result<usize, StreamError> {
        if !self.header_written && !header.is_empty() {
            self.file.write_all(header).map_err(|e| self.fatal(e))?;
        }
        self.header_written = true;
        self.file.write_all(body).map_err(|e| self.fatal(e))?;
        if self.flush_every_write {
            self.file.flush().map_err(|e| self.fatal(e))?;
            self.file.sync_data().map_err(|e| self.fatal(e))?;
        }
        Ok(body.len())
    }

    fn close(&mut self) -> Result<(), StreamError> {
        self.file.flush().map_err(|e| self.fatal(e))?;
        self.file.sync_data().map_err(|e| self.fatal(e))
    }

    fn dest(&self) -> &str {
        &self.dest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileOutStream::open(&path, false).unwrap();
        sink.write(b"m1", b"HEADER").unwrap();
        sink.write(b"m2", b"HEADER").unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"HEADERm1m2");
    }

    #[test]
    fn test_file_sink_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut sink = FileOutStream::open(&path, true).unwrap();
        sink.write(b"first", &[]).unwrap();
        sink.close().unwrap();
        drop(sink);

        let mut sink = FileOutStream::open(&path, true).unwrap();
        sink.write(b"second", &[]).unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"firstsecond");
    }

    #[test]
    fn test_flush_dest_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let sink = FileOutStream::open(&path, true).unwrap();
        assert!(sink.dest().starts_with("flush:"));
    }
}
