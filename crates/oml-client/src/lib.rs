// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # oml-client -- injection-point measurement buffering
//!
//! The client half of the measurement collection system. Measurement
//! producers append encoded records into a [`BufferedWriter`], which holds
//! them in bounded memory and drains them to a collection endpoint through
//! an [`OutStream`]: a plain or flush-on-write file, a reconnecting TCP
//! sink, or a gzip-framed deflate wrapper around either.
//!
//! ```no_run
//! use oml_client::{BufferedWriter, TcpOutStream};
//!
//! let sink = TcpOutStream::new("collect.example", 3003);
//! let writer = BufferedWriter::create(Box::new(sink), 64 * 1024, 16);
//!
//! writer.push_meta(b"protocol: 5\n");
//! writer.push(b"1.5\t0\t23.4\n");
//! writer.close();
//! ```
//!
//! Back-pressure drops the oldest measurement data, never metadata, and the
//! metadata prologue is replayed whenever the transport is re-established,
//! so a collector joining mid-run still sees the schema first.

pub mod stream;
pub mod uri;
pub mod writer;

pub use stream::{
    find_sync, inflate_resync, FileOutStream, OutStream, StreamError, TcpOutStream, ZlibError,
    ZlibOutStream,
};
pub use uri::{parse_uri, resolve_service, scheme_of, ParsedUri, Scheme, UriError};
pub use writer::{BufferedWriter, WriterStats};

use tracing::warn;

/// Errors from [`stream_from_uri`].
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Build the output stream described by a collection URI.
///
/// `file:`/`flush:` URIs open the named path; `tcp:` (and schemeless
/// `host[:port]` forms) connect lazily to the collection endpoint. Append
/// `+zlib` to a scheme (`tcp+zlib:...`) to wrap the sink in deflate
/// framing. UDP collection is not supported by this library.
pub fn stream_from_uri(uri: &str) -> Result<Box<dyn OutStream>, CreateError> {
    const DEFAULT_PORT: u16 = 3003;

    let (base, compress) = match uri.split_once('+') {
        Some((scheme, rest)) if rest.starts_with("zlib:") => (
            format!("{scheme}:{}", &rest["zlib:".len()..]),
            true,
        ),
        _ => (uri.to_string(), false),
    };

    let parsed = parse_uri(&base)?;
    let scheme = parsed
        .protocol
        .as_deref()
        .map(scheme_of)
        .unwrap_or(Scheme::Tcp);
    let path = parsed
        .path
        .clone()
        .ok_or(UriError::MissingHost(base.clone()))?;

    let inner: Box<dyn OutStream> = match scheme {
        Scheme::File => Box::new(FileOutStream::open(&path, false)?),
        Scheme::FileFlush => Box::new(FileOutStream::open(&path, true)?),
        Scheme::Udp => {
            warn!("udp collection is not supported, using tcp:{path}");
            let port = parsed
                .port
                .as_deref()
                .map(|p| resolve_service(p, DEFAULT_PORT))
                .unwrap_or(DEFAULT_PORT);
            Box::new(TcpOutStream::new(path, port))
        }
        Scheme::Tcp | Scheme::Unknown => {
            let port = parsed
                .port
                .as_deref()
                .map(|p| resolve_service(p, DEFAULT_PORT))
                .unwrap_or(DEFAULT_PORT);
            Box::new(TcpOutStream::new(path, port))
        }
    };

    Ok(if compress {
        Box::new(ZlibOutStream::new(inner))
    } else {
        inner
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_from_file_uri() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file:{}", dir.path().join("out.bin").display());
        let stream = stream_from_uri(&uri).unwrap();
        assert!(stream.dest().starts_with("file:"));
    }

    #[test]
    fn test_stream_from_tcp_uri_is_lazy() {
        let stream = stream_from_uri("tcp:[::1]:3003").unwrap();
        assert_eq!(stream.dest(), "tcp:[::1]:3003");
    }

    #[test]
    fn test_stream_from_zlib_uri() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("file+zlib:{}", dir.path().join("out.gz").display());
        let stream = stream_from_uri(&uri).unwrap();
        assert!(stream.dest().starts_with("zlib+file:"));
    }

    #[test]
    fn test_stream_from_bad_uri() {
        assert!(stream_from_uri("tcp::3003").is_err());
    }
}
