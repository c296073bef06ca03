//! Parsing of node addresses.
//!
//! Nodes identify each other by a TCP `host:port` pair (IPv6 hosts in
//! brackets) or, on platforms that support them, an abstract Unix socket
//! written as `@name`. The port defaults when omitted.

use crate::error::Error;
use crate::Result;

/// Port assumed when an address does not name one.
pub const DEFAULT_PORT: u16 = 8001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAddr {
    Tcp { host: String, port: u16 },
    /// Abstract Unix socket, without the leading `@`.
    Unix(String),
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeAddr::Tcp { host, port } if host.contains(':') => {
                write!(f, "[{host}]:{port}")
            }
            NodeAddr::Tcp { host, port } => write!(f, "{host}:{port}"),
            NodeAddr::Unix(name) => write!(f, "@{name}"),
        }
    }
}

/// Parses a node address.
///
/// Accepted forms: `host`, `host:port`, `[v6-host]:port`, `[v6-host]` and
/// `@abstract-name`.
pub fn parse(addr: &str) -> Result<NodeAddr> {
    if addr.is_empty() {
        return Err(Error::InvalidConfig("address must not be empty".into()));
    }
    if let Some(name) = addr.strip_prefix('@') {
        return Ok(NodeAddr::Unix(name.to_owned()));
    }

    if let Some(rest) = addr.strip_prefix('[') {
        // Bracketed IPv6, optionally followed by :port.
        let Some((host, rest)) = rest.split_once(']') else {
            return Err(Error::InvalidConfig(format!(
                "missing ']' in address `{addr}`"
            )));
        };
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(addr, port)?,
            None if rest.is_empty() => DEFAULT_PORT,
            None => {
                return Err(Error::InvalidConfig(format!(
                    "trailing garbage in address `{addr}`"
                )))
            }
        };
        return Ok(NodeAddr::Tcp {
            host: host.to_owned(),
            port,
        });
    }

    match addr.rsplit_once(':') {
        // A bare colon-free host.
        None => Ok(NodeAddr::Tcp {
            host: addr.to_owned(),
            port: DEFAULT_PORT,
        }),
        // More than one colon without brackets is an unescaped IPv6
        // address; refuse it rather than guess where the port starts.
        Some((host, _)) if host.contains(':') => Err(Error::InvalidConfig(format!(
            "IPv6 address `{addr}` must be bracketed"
        ))),
        Some((host, port)) => Ok(NodeAddr::Tcp {
            host: host.to_owned(),
            port: parse_port(addr, port)?,
        }),
    }
}

fn parse_port(addr: &str, port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid port in address `{addr}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_host_gets_the_default_port() {
        assert_eq!(
            parse("10.0.0.7").unwrap(),
            NodeAddr::Tcp {
                host: "10.0.0.7".into(),
                port: DEFAULT_PORT
            }
        );
    }

    #[test]
    fn host_and_port() {
        assert_eq!(
            parse("db-3.internal:9001").unwrap(),
            NodeAddr::Tcp {
                host: "db-3.internal".into(),
                port: 9001
            }
        );
    }

    #[test]
    fn bracketed_ipv6() {
        assert_eq!(
            parse("[fd00::7]:9001").unwrap(),
            NodeAddr::Tcp {
                host: "fd00::7".into(),
                port: 9001
            }
        );
        assert_eq!(
            parse("[fd00::7]").unwrap(),
            NodeAddr::Tcp {
                host: "fd00::7".into(),
                port: DEFAULT_PORT
            }
        );
        assert!(parse("fd00::7").is_err());
        assert!(parse("[fd00::7").is_err());
        assert!(parse("[fd00::7]9001").is_err());
    }

    #[test]
    fn abstract_unix_socket() {
        assert_eq!(parse("@cluster-1").unwrap(), NodeAddr::Unix("cluster-1".into()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("host:notaport").is_err());
        assert!(parse("host:99999").is_err());
    }

    #[test]
    fn display_roundtrips() {
        for addr in ["10.0.0.7:8001", "[fd00::7]:9001", "@cluster-1"] {
            assert_eq!(parse(addr).unwrap().to_string(), addr);
        }
    }
}
