//! Transport abstraction and the TCP implementation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::transport::endpoint::Endpoint;
use crate::utils::{MqError, Result};

/// A bidirectional byte stream a [`Connection`](super::Connection) can run on.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Opens raw streams to broker endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream>;
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream> {
        let addr = (endpoint.address.as_str(), endpoint.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MqError::transport(format!("connect to {endpoint} timed out")))??;
        stream.set_nodelay(true)?;
        debug!("tcp connection established to {}", endpoint);
        Ok(Box::new(stream))
    }
}
