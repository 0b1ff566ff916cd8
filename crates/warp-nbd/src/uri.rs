//! NBD URIs
//!
//! Supports the two plain transports of the NBD URI scheme:
//!
//! - `nbd://host[:port]/export` (TCP, default port 10809)
//! - `nbd+unix:///export?socket=/path/to/socket`

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use url::{Host, Url};

use crate::error::{ClientError, ClientResult};

/// Default NBD TCP port
pub const DEFAULT_PORT: u16 = 10809;

/// Where the server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NbdAddress {
    /// TCP host and port
    Tcp {
        /// Host name or address
        host: String,
        /// Port
        port: u16,
    },
    /// Unix domain socket path
    Unix(PathBuf),
}

/// Parsed NBD URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdUri {
    /// Server address
    pub address: NbdAddress,
    /// Export name (may be empty)
    pub export: String,
}

impl NbdUri {
    /// Parse an `nbd://` or `nbd+unix://` URI
    pub fn parse(input: &str) -> ClientResult<Self> {
        let url = Url::parse(input)
            .map_err(|e| ClientError::InvalidArgument(format!("invalid URI {:?}: {}", input, e)))?;
        let export = url.path().trim_start_matches('/').to_string();

        let address = match url.scheme() {
            "nbd" => {
                let host = match url.host() {
                    Some(Host::Domain(name)) if !name.is_empty() => name.to_string(),
                    Some(Host::Ipv4(addr)) => addr.to_string(),
                    Some(Host::Ipv6(addr)) => addr.to_string(),
                    _ => "localhost".to_string(),
                };
                NbdAddress::Tcp {
                    host,
                    port: url.port().unwrap_or(DEFAULT_PORT),
                }
            }
            "nbd+unix" => {
                let socket = url
                    .query_pairs()
                    .find(|(key, _)| key == "socket")
                    .map(|(_, value)| PathBuf::from(value.into_owned()))
                    .ok_or_else(|| {
                        ClientError::InvalidArgument(format!(
                            "{:?} needs a socket= query parameter",
                            input
                        ))
                    })?;
                NbdAddress::Unix(socket)
            }
            other => {
                return Err(ClientError::InvalidArgument(format!(
                    "unsupported URI scheme {:?}",
                    other
                )))
            }
        };

        Ok(Self { address, export })
    }
}

impl FromStr for NbdUri {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NbdUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            NbdAddress::Tcp { host, port } if host.contains(':') => {
                write!(f, "nbd://[{}]:{}/{}", host, port, self.export)
            }
            NbdAddress::Tcp { host, port } => write!(f, "nbd://{}:{}/{}", host, port, self.export),
            NbdAddress::Unix(path) => write!(
                f,
                "nbd+unix:///{}?socket={}",
                self.export,
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_with_port() {
        let uri = NbdUri::parse("nbd://example.com:2000/disk").unwrap();
        assert_eq!(
            uri.address,
            NbdAddress::Tcp {
                host: "example.com".into(),
                port: 2000
            }
        );
        assert_eq!(uri.export, "disk");
    }

    #[test]
    fn test_tcp_default_port_and_empty_export() {
        let uri: NbdUri = "nbd://127.0.0.1".parse().unwrap();
        assert_eq!(
            uri.address,
            NbdAddress::Tcp {
                host: "127.0.0.1".into(),
                port: DEFAULT_PORT
            }
        );
        assert_eq!(uri.export, "");
    }

    #[test]
    fn test_ipv6_host() {
        let uri = NbdUri::parse("nbd://[::1]:10810/x").unwrap();
        assert_eq!(
            uri.address,
            NbdAddress::Tcp {
                host: "::1".into(),
                port: 10810
            }
        );
        assert_eq!(uri.to_string(), "nbd://[::1]:10810/x");
    }

    #[test]
    fn test_unix_socket() {
        let uri = NbdUri::parse("nbd+unix:///scratch?socket=/tmp/nbd.sock").unwrap();
        assert_eq!(uri.address, NbdAddress::Unix(PathBuf::from("/tmp/nbd.sock")));
        assert_eq!(uri.export, "scratch");
    }

    #[test]
    fn test_unix_requires_socket() {
        assert!(matches!(
            NbdUri::parse("nbd+unix:///scratch"),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_tls_scheme() {
        assert!(matches!(
            NbdUri::parse("nbds://example.com/disk"),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(NbdUri::parse("not a uri").is_err());
    }
}
