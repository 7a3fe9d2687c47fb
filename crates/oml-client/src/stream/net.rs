// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP output stream with in-band reconnection.
//!
//! The socket is connected lazily on the first write and dropped on any I/O
//! error; the error is reported as recoverable so the drain task retries the
//! same chunk after back-off. A successful reconnect marks the transport
//! fresh again, which makes the next write replay the metadata header.

use super::{OutStream, StreamError};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP sink for a collection endpoint.
pub struct TcpOutStream {
    host: String,
    port: u16,
    dest: String,
    stream: Option<TcpStream>,
    header_written: bool,
}

impl TcpOutStream {
    /// Create a sink for `host:port`. No connection is attempted until the
    /// first write.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let dest = if host.contains(':') {
            format!("tcp:[{host}]:{port}")
        } else {
            format!("tcp:{host}:{port}")
        };
        Self {
            host,
            port,
            dest,
            stream: None,
            header_written: false,
        }
    }

    fn recoverable(&self, source: std::io::Error) -> StreamError {
        StreamError::Recoverable {
            dest: self.dest.clone(),
            source,
        }
    }

    fn ensure_connected(&mut self) -> Result<(), StreamError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addrs = (self.host.as_str(), self.port);
        let addr = std::net::ToSocketAddrs::to_socket_addrs(&addrs)
            .map_err(|e| self.recoverable(e))?
            .next()
            .ok_or_else(|| {
                self.recoverable(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    "no address resolved",
                ))
            })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| self.recoverable(e))?;
        let _ = stream.set_nodelay(true);
        info!("connected to {}", self.dest);
        self.stream = Some(stream);
        self.header_written = false;
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!("dropping connection to {}", self.dest);
        }
    }
}

impl OutStream for TcpOutStream {
    fn write(&mut self, body: &[u8], header: &[u8]) -> Result<usize, StreamError> {
        self.ensure_connected()?;
        let write_header = !self.header_written && !header.is_empty();

        let io = match self.stream.as_mut() {
            Some(stream) => {
                if write_header {
                    stream.write_all(header).and_then(|()| stream.write_all(body))
                } else {
                    stream.write_all(body)
                }
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "not connected",
            )),
        };

        match io {
            Ok(()) => {
                self.header_written = true;
                Ok(body.len())
            }
            Err(e) => {
                self.disconnect();
                Err(self.recoverable(e))
            }
        }
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Write);
        }
        Ok(())
    }

    fn dest(&self) -> &str {
        &self.dest
    }
}
