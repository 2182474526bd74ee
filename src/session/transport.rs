//! Byte-stream transport used by sessions.
//!
//! Sessions never touch sockets directly; they ask a [`Connector`] for a
//! stream. The default connector opens TCP, tests can hand out in-memory
//! duplex pipes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Trait alias for session streams
pub trait SessionStreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStreamTrait for T {}

pub type SessionStream = Box<dyn SessionStreamTrait>;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, addr: &str) -> std::io::Result<SessionStream>;
}

/// Plain TCP with Nagle disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> std::io::Result<SessionStream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
