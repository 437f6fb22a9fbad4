//! TCP carrier, client and server role.
//!
//! Byte-stream transport: no message boundaries, so the stream worker runs
//! the incremental frame decoder on received bytes. Nagle is disabled on
//! every connection. The server keeps its listener across connections and
//! optionally rejects peers other than the configured remote.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::StreamTransport;
use crate::error::{CanwireError, Result};

/// Outgoing TCP connection to a fixed remote.
pub struct TcpClientTransport {
    remote: SocketAddr,
    stream: Option<TcpStream>,
}

impl TcpClientTransport {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            stream: None,
        }
    }
}

#[async_trait]
impl StreamTransport for TcpClientTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn message_oriented(&self) -> bool {
        false
    }

    async fn attempt_connect(&mut self) -> Result<()> {
        tracing::info!(remote = %self.remote, "connecting");
        let stream = TcpStream::connect(self.remote).await?;
        stream.set_nodelay(true)?;
        tracing::info!(remote = %self.remote, "connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(CanwireError::NotConnected)?;
        Ok(stream.read(buf).await?)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(CanwireError::NotConnected)?;
        stream.write_all(buf).await?;
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// Listening TCP endpoint accepting one connection at a time.
pub struct TcpServerTransport {
    listener: TcpListener,
    expected_peer: Option<IpAddr>,
    stream: Option<TcpStream>,
}

impl TcpServerTransport {
    /// Bind the listener. `expected_peer` enables the connect-time peer
    /// check.
    pub async fn bind(local: SocketAddr, expected_peer: Option<IpAddr>) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        Ok(Self {
            listener,
            expected_peer,
            stream: None,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl StreamTransport for TcpServerTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn message_oriented(&self) -> bool {
        false
    }

    async fn attempt_connect(&mut self) -> Result<()> {
        tracing::info!("waiting for a client to connect");
        let (stream, addr) = self.listener.accept().await?;
        if let Some(expected) = self.expected_peer {
            if addr.ip() != expected {
                tracing::warn!(from = %addr, "rejecting connection from unexpected peer");
                return Err(CanwireError::PeerRejected(addr));
            }
        }
        stream.set_nodelay(true)?;
        tracing::info!(from = %addr, "accepted connection");
        self.stream = Some(stream);
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(CanwireError::NotConnected)?;
        Ok(stream.read(buf).await?)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(CanwireError::NotConnected)?;
        stream.write_all(buf).await?;
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_server_connect_and_exchange() {
        let mut server = TcpServerTransport::bind("127.0.0.1:0".parse().unwrap(), None)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = TcpClientTransport::new(addr);

        let (server_result, client_result) =
            tokio::join!(server.attempt_connect(), client.attempt_connect());
        server_result.unwrap();
        client_result.unwrap();

        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = server.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_server_rejects_unexpected_peer() {
        let mut server = TcpServerTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            Some("10.11.12.13".parse().unwrap()),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = TcpClientTransport::new(addr);

        let (server_result, _client_result) =
            tokio::join!(server.attempt_connect(), client.attempt_connect());
        assert!(matches!(
            server_result,
            Err(CanwireError::PeerRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_without_connection() {
        let mut client = TcpClientTransport::new("127.0.0.1:1".parse().unwrap());
        let mut buf = [0u8; 4];
        assert!(matches!(
            client.recv(&mut buf).await,
            Err(CanwireError::NotConnected)
        ));
    }
}
