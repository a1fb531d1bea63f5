//! TCP transport
//!
//! Connections are handed to the rest of the crate as plain duplex byte
//! streams; nothing above this module knows they are TCP.

use crate::network::peer::PeerError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Any duplex byte stream a peer can run over
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Listening socket for inbound peers
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind on all interfaces; port 0 picks a free port
    pub async fn bind(port: u16) -> Result<Self, PeerError> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| PeerError::BindFailed {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        log::info!("Listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), PeerError> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }
}

/// Open an outbound connection, giving up after `timeout`
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, PeerError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
