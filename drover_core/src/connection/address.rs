use std::fmt;
use std::path::PathBuf;

use tokio::net::{TcpStream, UnixStream};

use super::connection::Connection;
use super::error::{ConnectionError, Result};

/// Address of a worker or listener endpoint.
///
/// Worker processes report their listening sockets as strings of the form
/// `tcp://127.0.0.1:4902` or `unix:/tmp/drover/apps/web.1.sock`; this type is
/// the parsed form used everywhere inside the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressSpec {
    Tcp(String),
    Unix(PathBuf),
}

impl AddressSpec {
    /// Parses an address string.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            if rest.is_empty() {
                return Err(ConnectionError::InvalidAddress(s.to_string()));
            }
            Ok(AddressSpec::Tcp(rest.to_string()))
        } else if let Some(rest) = s.strip_prefix("unix:") {
            if rest.is_empty() {
                return Err(ConnectionError::InvalidAddress(s.to_string()));
            }
            Ok(AddressSpec::Unix(PathBuf::from(rest)))
        } else {
            Err(ConnectionError::InvalidAddress(s.to_string()))
        }
    }

    /// Opens a new connection to this address.
    pub async fn connect(&self, purpose: &str) -> Result<Connection> {
        match self {
            AddressSpec::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Connection::new_tcp(stream, purpose))
            }
            AddressSpec::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(Connection::new_unix(stream, purpose))
            }
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpec::Tcp(addr) => write!(f, "tcp://{}", addr),
            AddressSpec::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_tcp_and_unix() {
        assert_eq!(
            AddressSpec::parse("tcp://127.0.0.1:4902").unwrap(),
            AddressSpec::Tcp("127.0.0.1:4902".to_string())
        );
        assert_eq!(
            AddressSpec::parse("unix:/tmp/app.sock").unwrap(),
            AddressSpec::Unix(PathBuf::from("/tmp/app.sock"))
        );
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(AddressSpec::parse("http://x").is_err());
        assert!(AddressSpec::parse("tcp://").is_err());
        assert!(AddressSpec::parse("").is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["tcp://127.0.0.1:1", "unix:/run/a.sock"] {
            assert_eq!(AddressSpec::parse(s).unwrap().to_string(), s);
        }
    }
}
