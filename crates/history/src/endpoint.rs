//! Listening endpoints: TCP and local (Unix) sockets.
//!
//! Sessions are generic over any byte stream; the endpoint is the only
//! transport-specific piece, reduced to a capability set of accepting a
//! connection and describing the remote end.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A listening socket that yields framed session streams.
pub trait SessionEndpoint {
    /// The accepted connection stream type.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Accept one connection, returning the stream and a description of
    /// the remote end for logging.
    fn accept(
        &mut self,
    ) -> impl std::future::Future<Output = io::Result<(Self::Stream, String)>> + Send;
}

/// Accept with a deadline; expiry closes nothing but surfaces a timeout the
/// caller can treat as a shutdown signal.
pub async fn accept_with_timeout<E: SessionEndpoint>(
    endpoint: &mut E,
    timeout: Duration,
) -> io::Result<(E::Stream, String)> {
    tokio::time::timeout(timeout, endpoint.accept())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "accept timeout"))?
}

/// TCP listener endpoint.
pub struct TcpEndpoint {
    listener: TcpListener,
}

impl TcpEndpoint {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }
}

impl SessionEndpoint for TcpEndpoint {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr.to_string()))
    }
}

/// Local (Unix domain) socket endpoint.
#[cfg(unix)]
pub struct LocalEndpoint {
    listener: tokio::net::UnixListener,
}

#[cfg(unix)]
impl LocalEndpoint {
    pub fn bind(path: &std::path::Path) -> io::Result<Self> {
        Ok(Self {
            listener: tokio::net::UnixListener::bind(path)?,
        })
    }
}

#[cfg(unix)]
impl SessionEndpoint for LocalEndpoint {
    type Stream = tokio::net::UnixStream;

    async fn accept(&mut self) -> io::Result<(Self::Stream, String)> {
        let (stream, _) = self.listener.accept().await?;
        Ok((stream, "local socket".to_string()))
    }
}
