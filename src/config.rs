//! # Configuration Module
//!
//! This crate has no configuration files and no environment variables that
//! govern behavior (`RUST_LOG` only controls log verbosity). Everything the
//! proxy needs is derived from its two CLI positional arguments, parsed here.

use std::net::SocketAddr;

/// Per-direction buffer bound, in bytes (spec.md §3, §5).
///
/// A connection's uplink and downlink buffers are each allowed to grow up to
/// this size before reads on that side are paused; this is the backpressure
/// mechanism described in spec.md §4.1/§5.
pub const BUF_LIMIT: usize = 65_536;

/// Parsed command-line invocation: `relaytrace <listen_port> <upstream_host:upstream_port>`.
#[derive(Debug, Clone)]
pub struct Args {
    pub listen_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
}

impl Args {
    /// `Host: <host>:<port>` value used to rewrite the uplink request (spec.md §4.2.1).
    pub fn upstream_host_header(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.listen_port))
    }
}

/// Naive positional-argument parser.
///
/// The CLI surface is explicitly out of scope for this crate (spec.md §1) —
/// a derive-based parser would be overkill for two positional arguments and
/// a single failure mode. Invalid syntax prints a usage line to stderr and
/// the caller is expected to exit with status 1 (spec.md §6).
pub fn parse_args<I: Iterator<Item = String>>(mut argv: I) -> Result<Args, String> {
    let _program = argv.next();
    let listen_port = argv.next().ok_or("missing listen_port")?;
    let upstream = argv.next().ok_or("missing upstream_host:upstream_port")?;

    let listen_port: u16 = listen_port
        .parse()
        .map_err(|_| format!("invalid listen_port: {listen_port}"))?;

    let (host, port) = upstream
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid upstream address: {upstream}"))?;
    let upstream_port: u16 = port
        .parse()
        .map_err(|_| format!("invalid upstream port: {port}"))?;

    Ok(Args {
        listen_port,
        upstream_host: host.to_string(),
        upstream_port,
    })
}

pub const USAGE: &str = "usage: relaytrace <listen_port> <upstream_host:upstream_port>";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_args() {
        let args = parse_args(
            ["relaytrace", "8080", "example.com:443"]
                .into_iter()
                .map(String::from),
        )
        .unwrap();
        assert_eq!(args.listen_port, 8080);
        assert_eq!(args.upstream_host, "example.com");
        assert_eq!(args.upstream_port, 443);
        assert_eq!(args.upstream_host_header(), "example.com:443");
    }

    #[test]
    fn rejects_missing_upstream() {
        assert!(parse_args(["relaytrace", "8080"].into_iter().map(String::from)).is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse_args(
            ["relaytrace", "notaport", "example.com:443"]
                .into_iter()
                .map(String::from)
        )
        .is_err());
    }
}
