//! TCP transport

use super::{TransportConfig, TransportError};
use crate::chunk::{ChunkFormat, ChunkOptions, ChunkStream, StreamRole};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

/// Outbound TCP connections
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Open a TCP connection within the connect timeout
    pub async fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<TcpStream, TransportError> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        configure(&stream, &self.config);
        if let Ok(peer) = stream.peer_addr() {
            debug!(%peer, "TCP connection established");
        }
        Ok(stream)
    }

    /// Open a connection and wrap it as the client end of a chunk stream
    pub async fn connect_chunked<A: ToSocketAddrs>(
        &self,
        addr: A,
        format: &ChunkFormat,
        options: ChunkOptions,
    ) -> Result<ChunkStream<TcpStream>, TransportError> {
        let stream = self.connect(addr).await?;
        Ok(ChunkStream::new(stream, format, StreamRole::Client, options)?)
    }
}

/// Inbound TCP connections
#[derive(Debug)]
pub struct TcpListenerTransport {
    listener: TcpListener,
    config: TransportConfig,
}

impl TcpListenerTransport {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        configure(&stream, &self.config);
        debug!(%peer, "TCP connection accepted");
        Ok((stream, peer))
    }

    /// Accept a connection and wrap it as the server end of a chunk stream
    pub async fn accept_chunked(
        &self,
        format: &ChunkFormat,
        options: ChunkOptions,
    ) -> Result<(ChunkStream<TcpStream>, SocketAddr), TransportError> {
        let (stream, peer) = self.accept().await?;
        let stream = ChunkStream::new(stream, format, StreamRole::Server, options)?;
        Ok((stream, peer))
    }
}

fn configure(stream: &TcpStream, config: &TransportConfig) {
    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunked_over_tcp() {
        let listener = TcpListenerTransport::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let format = ChunkFormat::Http {
            host: "tunnel.example".to_string(),
        };

        let server_format = format.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener
                .accept_chunked(&server_format, ChunkOptions::default())
                .await
                .unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write(&buf[..n]).await.unwrap();
            stream.close(false).await.unwrap();
        });

        let client = TcpTransport::default()
            .connect_chunked(addr, &format, ChunkOptions::default())
            .await
            .unwrap();
        client.write(b"Hello, TCP!").await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello, TCP!");

        client.close(false).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            TcpTransport::default().connect(addr).await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }
}
