// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collection-URI parsing.
//!
//! A collection URI has the form `[proto:]path[:service]`, where `proto` is
//! one of `file`, `flush`, `tcp` or `udp`. `path` can be a hostname, an IPv4
//! address, an IPv6 address within brackets (`tcp:[::1]:3003`), or a
//! filesystem path for the file schemes. A bare `host:port` with an unknown
//! scheme is accepted as a TCP destination with a warning.

use thiserror::Error;
use tracing::warn;

/// URI scheme classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Local file, OS-buffered writes.
    File,
    /// Local file, flushed to disk after every write.
    FileFlush,
    /// TCP collection endpoint.
    Tcp,
    /// UDP collection endpoint.
    Udp,
    /// Anything else.
    Unknown,
}

impl Scheme {
    /// True for the file-backed schemes.
    pub fn is_file(self) -> bool {
        matches!(self, Scheme::File | Scheme::FileFlush)
    }

    /// True for the network schemes.
    pub fn is_network(self) -> bool {
        matches!(self, Scheme::Tcp | Scheme::Udp)
    }
}

/// Classify a URI by its scheme prefix.
///
/// `flush` is checked before `file` so that `flush:...` is not mistaken for
/// an unknown scheme.
pub fn scheme_of(uri: &str) -> Scheme {
    if uri.starts_with("flush") {
        Scheme::FileFlush
    } else if uri.starts_with("file") {
        Scheme::File
    } else if uri.starts_with("tcp") {
        Scheme::Tcp
    } else if uri.starts_with("udp") {
        Scheme::Udp
    } else {
        Scheme::Unknown
    }
}

/// The three components of a parsed collection URI.
///
/// Any component may be absent; `ParsedUri { protocol: None, path: Some(_),
/// port: None }` is the minimal accepted form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedUri {
    pub protocol: Option<String>,
    pub path: Option<String>,
    pub port: Option<String>,
}

impl ParsedUri {
    /// Render the URI back into its textual `[proto:]path[:port]` form.
    ///
    /// An IPv6 path (one containing `:`) is re-bracketed.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(proto) = &self.protocol {
            out.push_str(proto);
            out.push(':');
        }
        if let Some(path) = &self.path {
            if path.contains(':') {
                out.push('[');
                out.push_str(path);
                out.push(']');
            } else {
                out.push_str(path);
            }
        }
        if let Some(port) = &self.port {
            out.push(':');
            out.push_str(port);
        }
        out
    }
}

/// Collection-URI parse failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("collection URI is empty")]
    Empty,
    #[error("collection URI '{0}' does not contain a hostname or path")]
    MissingHost(String),
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Parse a collection URI of the form `[proto:]path[:service]`.
///
/// Bracketed IPv6 addresses are supported for the network schemes. A
/// two-token URI with an unrecognised scheme (`host.example:9999`) is
/// treated as `host:port` with a warning. `proto::port` (no host) and empty
/// URIs are rejected.
pub fn parse_uri(uri: &str) -> Result<ParsedUri, UriError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(UriError::Empty);
    }

    let scheme = scheme_of(uri);

    // Cut the URI into up to three raw tokens.
    let (t0, t1, t2) = if let Some(open) = uri.find('[') {
        // Bracketed address: [proto:] '[' host ']' [:port]
        let before = uri[..open].trim_end_matches(':');
        let after = &uri[open + 1..];
        match after.find(']') {
            Some(close) => {
                let host = &after[..close];
                let rest = after[close + 1..].trim_start_matches(':');
                (before, host, rest)
            }
            None => (before, after, ""),
        }
    } else {
        let mut it = uri.splitn(3, ':');
        (
            it.next().unwrap_or(""),
            it.next().unwrap_or(""),
            it.next().unwrap_or(""),
        )
    };

    if !t0.is_empty() && !t1.is_empty() {
        // "abc:xyz" or "abc:xyz:123" -- if abc is a transport, use it;
        // otherwise the first token is itself the hostname/path.
        if scheme.is_network() {
            Ok(ParsedUri {
                protocol: non_empty(t0),
                path: non_empty(t1),
                port: non_empty(t2),
            })
        } else if scheme.is_file() {
            Ok(ParsedUri {
                protocol: non_empty(t0),
                path: non_empty(t1),
                port: None,
            })
        } else {
            warn!("collection URI '{uri}' has an unknown scheme, assuming 'tcp:{t0}:{t1}'");
            Ok(ParsedUri {
                protocol: None,
                path: non_empty(t0),
                port: non_empty(t1),
            })
        }
    } else if !t0.is_empty() && !t2.is_empty() {
        // "abc::123" -- no hostname/path to infer.
        warn!("collection URI '{uri}' is invalid as it does not contain a hostname or path");
        Err(UriError::MissingHost(uri.to_string()))
    } else if !t0.is_empty() || !t1.is_empty() {
        // A single token, possibly bracketed.
        let host = if t0.is_empty() { t1 } else { t0 };
        Ok(ParsedUri {
            protocol: None,
            path: non_empty(host),
            port: non_empty(t2),
        })
    } else {
        Err(UriError::MissingHost(uri.to_string()))
    }
}

/// Resolve a textual service name or port number into a port.
///
/// Only numeric ports are resolved; anything else falls back to `default`
/// with a warning.
pub fn resolve_service(service: &str, default: u16) -> u16 {
    match service.parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            warn!("could not resolve service '{service}', defaulting to {default}");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(proto: Option<&str>, path: Option<&str>, port: Option<&str>) -> ParsedUri {
        ParsedUri {
            protocol: proto.map(str::to_string),
            path: path.map(str::to_string),
            port: port.map(str::to_string),
        }
    }

    #[test]
    fn test_scheme_classification() {
        assert_eq!(scheme_of("tcp:host:3003"), Scheme::Tcp);
        assert_eq!(scheme_of("udp:host"), Scheme::Udp);
        assert_eq!(scheme_of("file:/tmp/out"), Scheme::File);
        assert_eq!(scheme_of("flush:/tmp/out"), Scheme::FileFlush);
        assert_eq!(scheme_of("host.example:9999"), Scheme::Unknown);
        assert!(Scheme::FileFlush.is_file());
        assert!(!Scheme::Tcp.is_file());
        assert!(Scheme::Udp.is_network());
    }

    #[test]
    fn test_parse_network_uri() {
        assert_eq!(
            parse_uri("tcp:collect.example:3003").unwrap(),
            parts(Some("tcp"), Some("collect.example"), Some("3003"))
        );
        assert_eq!(
            parse_uri("tcp:collect.example").unwrap(),
            parts(Some("tcp"), Some("collect.example"), None)
        );
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        assert_eq!(
            parse_uri("tcp:[::1]:3003").unwrap(),
            parts(Some("tcp"), Some("::1"), Some("3003"))
        );
        assert_eq!(
            parse_uri("[fe80::1]:3003").unwrap(),
            parts(None, Some("fe80::1"), Some("3003"))
        );
    }

    #[test]
    fn test_parse_file_uri_has_no_port() {
        assert_eq!(
            parse_uri("file:/tmp/out.log").unwrap(),
            parts(Some("file"), Some("/tmp/out.log"), None)
        );
        assert_eq!(
            parse_uri("flush:/tmp/out.log").unwrap(),
            parts(Some("flush"), Some("/tmp/out.log"), None)
        );
    }

    #[test]
    fn test_parse_unknown_scheme_falls_back_to_host_port() {
        assert_eq!(
            parse_uri("host.example:9999").unwrap(),
            parts(None, Some("host.example"), Some("9999"))
        );
    }

    #[test]
    fn test_parse_single_token() {
        assert_eq!(
            parse_uri("collect.example").unwrap(),
            parts(None, Some("collect.example"), None)
        );
    }

    #[test]
    fn test_parse_rejects_missing_host() {
        assert_eq!(
            parse_uri("tcp::3003"),
            Err(UriError::MissingHost("tcp::3003".to_string()))
        );
        assert_eq!(parse_uri(""), Err(UriError::Empty));
        assert_eq!(parse_uri("   "), Err(UriError::Empty));
    }

    #[test]
    fn test_render_round_trip() {
        for uri in [
            "tcp:collect.example:3003",
            "tcp:[::1]:3003",
            "file:/tmp/out.log",
            "flush:/var/log/measure.log",
            "collect.example",
            "collect.example:9999",
        ] {
            let parsed = parse_uri(uri).unwrap();
            assert_eq!(parse_uri(&parsed.render()).unwrap(), parsed, "{uri}");
        }
    }

    #[test]
    fn test_resolve_service() {
        assert_eq!(resolve_service("3003", 5432), 3003);
        assert_eq!(resolve_service("postgresql", 5432), 5432);
        assert_eq!(resolve_service("", 5432), 5432);
    }
}
