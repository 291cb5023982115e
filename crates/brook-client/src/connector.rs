//! Server address parsing and transport establishment.
//!
//! Address resolution happens synchronously at `connect()` time so an
//! unresolvable host can be reported before any state transition; the
//! actual socket connect is async and performed by the driver.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use brook_protocol::DEFAULT_PORT;

use crate::error::{ClientError, ClientResult};

/// A parsed and resolved server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    /// Local socket at a filesystem path.
    Unix(PathBuf),
    /// Resolved TCP candidates for a `host[:port]` string.
    Inet {
        display: String,
        addrs: Vec<SocketAddr>,
    },
}

impl ServerAddress {
    /// Parses a server string: a leading `/` is a Unix socket path,
    /// anything else resolves as `host[:port]` (default port
    /// [`DEFAULT_PORT`]).
    pub fn parse(server: &str) -> ClientResult<Self> {
        if server.starts_with('/') {
            return Ok(ServerAddress::Unix(PathBuf::from(server)));
        }

        let (host, port) = match server.rsplit_once(':') {
            Some((host, port_str)) if !host.is_empty() => match port_str.parse::<u16>() {
                Ok(port) => (host, port),
                Err(_) => (server, DEFAULT_PORT),
            },
            _ => (server, DEFAULT_PORT),
        };

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| ClientError::InvalidServer(format!("{}: {}", server, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(ClientError::InvalidServer(server.to_string()));
        }

        Ok(ServerAddress::Inet {
            display: server.to_string(),
            addrs,
        })
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerAddress::Unix(path) => write!(f, "{}", path.display()),
            ServerAddress::Inet { display, .. } => f.write_str(display),
        }
    }
}

/// A connected transport channel.
pub(crate) enum Channel {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// Establishes the transport for `addr`, trying each resolved candidate.
pub(crate) async fn establish(
    addr: &ServerAddress,
    timeout: Duration,
) -> std::io::Result<Channel> {
    match addr {
        ServerAddress::Unix(path) => {
            debug!(path = %path.display(), "connecting to local socket");
            let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
            Ok(Channel::Unix(stream))
        }
        ServerAddress::Inet {
            display: server_name,
            addrs,
        } => {
            debug!(server = %server_name, "connecting over TCP");
            let mut last_error =
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no addresses");
            for candidate in addrs {
                match tokio::time::timeout(timeout, TcpStream::connect(candidate)).await {
                    Ok(Ok(stream)) => return Ok(Channel::Tcp(stream)),
                    Ok(Err(e)) => last_error = e,
                    Err(_) => {
                        last_error = std::io::Error::from(std::io::ErrorKind::TimedOut);
                    }
                }
            }
            Err(last_error)
        }
    }
}
