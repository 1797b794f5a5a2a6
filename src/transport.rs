//! Byte-stream transport beneath a session.
//!
//! The engines only need whole-buffer operations: gathered sends and
//! all-or-nothing reads. [`StreamTransport`] adapts any tokio reader/writer
//! pair; [`TcpTransport`] is the TCP instantiation used in production.

use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};

use crate::error::TransportError;

/// Connection to a target.
///
/// Implementations must be cancellation-safe in the sense that dropping a
/// pending [`recv_exact`](Self::recv_exact) must leave the transport usable
/// for [`shutdown_read`](Self::shutdown_read) and [`close`](Self::close).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write every buffer in order.
    async fn send(&self, parts: &[Bytes]) -> Result<(), TransportError>;

    /// Fill `buf` completely.
    ///
    /// A stream that ends before the first byte yields
    /// [`TransportError::Closed`]; one that ends part-way yields
    /// [`TransportError::Partial`].
    async fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Stop receiving. Pending and later reads fail.
    async fn shutdown_read(&self) -> Result<(), TransportError>;

    /// Flush and close the stream in both directions.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Source of fresh transports for automatic reconnection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection to the target.
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Transport over a split tokio stream.
pub struct StreamTransport<R, W> {
    reader: Mutex<Option<R>>,
    writer: Mutex<Option<W>>,
}

impl<R, W> fmt::Debug for StreamTransport<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a reader and writer.
    ///
    /// # Examples
    ///
    /// ```
    /// use iscsi_initiator::transport::StreamTransport;
    ///
    /// let (client, _target) = tokio::io::duplex(4096);
    /// let (r, w) = tokio::io::split(client);
    /// let _transport = StreamTransport::new(r, w);
    /// ```
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }
}

/// TCP transport.
pub type TcpTransport = StreamTransport<OwnedReadHalf, OwnedWriteHalf>;

impl StreamTransport<OwnedReadHalf, OwnedWriteHalf> {
    /// Connect to `addr` with Nagle's algorithm disabled.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the connection or socket option
    /// fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self::new(reader, writer))
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, parts: &[Bytes]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Released)?;
        let mut written = 0;
        for part in parts {
            let mut rest = part.as_ref();
            while !rest.is_empty() {
                match writer.write(rest).await {
                    Ok(0) => return Err(write_error(written, io::ErrorKind::WriteZero.into())),
                    Ok(n) => {
                        written += n;
                        rest = &rest[n..];
                    }
                    Err(err) => return Err(write_error(written, err)),
                }
            }
        }
        writer.flush().await.map_err(|err| write_error(written, err))?;
        Ok(())
    }

    async fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::Released)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(if filled == 0 {
                    TransportError::Closed
                } else {
                    TransportError::Partial {
                        received: filled,
                        expected: buf.len(),
                    }
                });
            }
            filled += n;
        }
        Ok(())
    }

    async fn shutdown_read(&self) -> Result<(), TransportError> {
        self.reader.lock().await.take();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// A failure before any byte left is plain I/O; after that the frame is torn.
fn write_error(written: usize, source: io::Error) -> TransportError {
    if written == 0 {
        TransportError::Io(source)
    } else {
        TransportError::Torn { written, source }
    }
}

/// Connects to a fixed TCP address.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = TcpTransport::connect(self.address.as_str()).await?;
        Ok(Arc::new(transport))
    }
}
