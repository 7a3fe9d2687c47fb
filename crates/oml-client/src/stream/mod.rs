// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Output-stream abstraction for measurement bytes.
//!
//! An [`OutStream`] is a byte sink with one twist: every write carries an
//! optional `header` alongside the `body`, and the sink writes the header
//! first whenever the underlying transport is fresh (first open or just
//! reconnected). The buffered writer uses this to replay the metadata
//! prologue ahead of measurement data after every reconnection.
//!
//! Variants:
//! - [`FileOutStream`] -- append-mode file, optionally flushed per write
//! - [`TcpOutStream`] -- lazy connect with in-band reconnection
//! - [`ZlibOutStream`] -- gzip-framed deflate wrapper around any sink

mod file;
mod net;
mod zlib;

pub use file::FileOutStream;
pub use net::TcpOutStream;
pub use zlib::{find_sync, inflate_resync, ZlibError, ZlibOutStream};

use thiserror::Error;

/// Errors surfaced by an [`OutStream`].
///
/// Recoverable errors (connection resets, refused connects) are retried by
/// the drain task with back-off; fatal errors cause the offending chunk to
/// be dropped.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Transient transport failure; the same write may succeed later.
    #[error("recoverable stream error on {dest}: {source}")]
    Recoverable {
        dest: String,
        #[source]
        source: std::io::Error,
    },

    /// Permanent failure; retrying cannot help.
    #[error("fatal stream error on {dest}: {source}")]
    Fatal {
        dest: String,
        #[source]
        source: std::io::Error,
    },

    /// Compression-state failure in the zlib wrapper.
    #[error("deflate error on {dest}: {message}")]
    Deflate { dest: String, message: String },
}

impl StreamError {
    /// True if the drain task should keep the data and retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StreamError::Recoverable { .. })
    }
}

/// A polymorphic sink for measurement bytes.
pub trait OutStream: Send {
    /// Write `body`, preceded by `header` iff the underlying transport is
    /// fresh (never written to, or reopened since the last write).
    ///
    /// Returns the number of `body` bytes accepted. Implementations write
    /// the whole body or fail; short writes are not surfaced.
    fn write(&mut self, body: &[u8], header: &[u8]) -> Result<usize, StreamError>;

    /// Flush and release the underlying transport.
    fn close(&mut self) -> Result<(), StreamError>;

    /// Destination label for diagnostics (URI-ish).
    fn dest(&self) -> &str;
}

impl OutStream for Box<dyn OutStream> {
    fn write(&mut self, body: &[u8], header: &[u8]) -> Result<usize, StreamError> {
        (**self).write(body, header)
    }

    fn close(&mut self) -> Result<(), StreamError> {
        (**self).close()
    }

    fn dest(&self) -> &str {
        (**self).dest()
    }
}

// ============================================================================
// Test mock stream
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Shared state of a [`MockStream`], visible to the test after the
    /// stream itself has been moved into a writer.
    #[derive(Debug, Default)]
    pub struct MockState {
        /// Everything accepted, headers included, in write order.
        pub written: Mutex<Vec<u8>>,
        /// One entry per successful write: (header replayed?, body length).
        pub writes: Mutex<Vec<(bool, usize)>>,
        /// Number of failures still to inject before writes succeed again.
        pub fail_next: AtomicUsize,
        /// Close call count.
        pub closed: AtomicUsize,
    }

    impl MockState {
        pub fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }

        /// Make the next `n` writes fail with a recoverable error, which
        /// also marks the transport as needing a header replay.
        pub fn inject_failures(&self, n: usize) {
            self.fail_next.store(n, Ordering::SeqCst);
        }
    }

    /// Write-capturing, error-injectable [`OutStream`] test double.
    #[derive(Debug)]
    pub struct MockStream {
        state: Arc<MockState>,
        fresh: bool,
    }

    impl MockStream {
        pub fn new() -> (Self, Arc<MockState>) {
            let state = Arc::new(MockState::default());
            (
                Self {
                    state: Arc::clone(&state),
                    fresh: true,
                },
                state,
            )
        }
    }

    impl OutStream for MockStream {
        fn write(&mut self, body: &[u8], header: &[u8]) -> Result<usize, StreamError> {
            let pending = self.state.fail_next.load(Ordering::SeqCst);
            if pending > 0 {
                self.state.fail_next.store(pending - 1, Ordering::SeqCst);
                self.fresh = true;
                return Err(StreamError::Recoverable {
                    dest: "mock".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "injected"),
                });
            }

            let mut written = self.state.written.lock().unwrap();
            let replayed = self.fresh && !header.is_empty();
            if replayed {
                written.extend_from_slice(header);
            }
            self.fresh = false;
            written.extend_from_slice(body);
            self.state
                .writes
                .lock()
                .unwrap()
                .push((replayed, body.len()));
            Ok(body.len())
        }

        fn close(&mut self) -> Result<(), StreamError> {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn dest(&self) -> &str {
            "mock"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let recoverable = StreamError::Recoverable {
            dest: "tcp:host:3003".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        };
        let fatal = StreamError::Fatal {
            dest: "file:/tmp/x".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(recoverable.is_recoverable());
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn test_mock_stream_header_once() {
        let (mut stream, state) = mock::MockStream::new();
        stream.write(b"body1", b"HDR").unwrap();
        stream.write(b"body2", b"HDR").unwrap();
        assert_eq!(state.written(), b"HDRbody1body2");
    }

    #[test]
    fn test_mock_stream_replays_header_after_failure() {
        let (mut stream, state) = mock::MockStream::new();
        stream.write(b"a", b"HDR").unwrap();
        state.inject_failures(1);
        assert!(stream.write(b"b", b"HDR").is_err());
        stream.write(b"b", b"HDR").unwrap();
        assert_eq!(state.written(), b"HDRaHDRb");
    }
}
