//! Reference driver for stream based protocols over plain TCP.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{Authentication, ConnectionFactory, Transport};
use crate::errors::Error;

// Default TCP timeout
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);
const DATA_SEND_AND_RECEIVE_TIMEOUT: Duration = Duration::from_secs(4);
const READ_CHUNK: usize = 1024;

/// Extracts the correlation key from an encoded frame
pub type KeyExtractor = fn(&[u8]) -> Option<u64>;

fn no_key(_frame: &[u8]) -> Option<u64> {
    None
}

/// Opens plain TCP connections for stream based protocols (ISO-on-TCP, ADS, EtherNet/IP, ...).
///
/// Endpoints are `host:port`, or just `host` when a default port is configured.
#[derive(Clone)]
pub struct TcpConnectionFactory {
    default_port: Option<u16>,
    connect_timeout: Duration,
    key_extractor: KeyExtractor,
}

impl fmt::Debug for TcpConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnectionFactory")
            .field("default_port", &self.default_port)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for TcpConnectionFactory {
    fn default() -> Self {
        Self {
            default_port: None,
            connect_timeout: CONNECTION_TIMEOUT,
            key_extractor: no_key,
        }
    }
}

impl TcpConnectionFactory {
    /// Factory without default port, using a connect timeout of 3 seconds
    pub fn new() -> Self {
        Self::default()
    }

    /// Port used for endpoints that do not name one, e.g. 102 for S7
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = Some(port);
        self
    }

    /// Maximum time to wait for the TCP handshake
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Function locating the correlation key inside the protocol's frames
    pub fn with_key_extractor(mut self, key_extractor: KeyExtractor) -> Self {
        self.key_extractor = key_extractor;
        self
    }

    fn address(&self, endpoint: &str) -> String {
        match self.default_port {
            Some(port) if !endpoint.contains(':') => format!("{endpoint}:{port}"),
            _ => endpoint.to_string(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    type Transport = TcpTransport;

    async fn open(
        &self,
        endpoint: &str,
        authentication: Option<&Authentication>,
    ) -> Result<TcpTransport, Error> {
        if authentication.is_some() {
            debug!(endpoint, "Plain TCP does not authenticate, ignoring credentials");
        }
        let address = self.address(endpoint);
        let stream = match timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(Error::Connection(format!(
                    "Error on connecting to '{address}': {err}"
                )))
            }
            Err(_elapsed) => {
                return Err(Error::Connection(format!(
                    "Error on connecting to '{}': Timed out after {} seconds",
                    address,
                    self.connect_timeout.as_secs()
                )))
            }
        };
        stream.set_nodelay(true)?;
        debug!(%address, "Opened TCP connection");

        let (reader, writer) = stream.into_split();
        let closed = Arc::new(AtomicBool::new(false));
        Ok(TcpTransport {
            writer,
            reader: Some(TcpReader {
                reader,
                peer: address.clone(),
                closed: Arc::clone(&closed),
            }),
            peer: address,
            closed,
        })
    }

    async fn close(&self, transport: &mut TcpTransport) -> Result<(), Error> {
        transport.disconnect().await
    }

    fn is_connected(&self, transport: &TcpTransport) -> bool {
        !transport.closed.load(Ordering::Acquire)
    }

    fn correlation_key(&self, frame: &[u8]) -> Option<u64> {
        (self.key_extractor)(frame)
    }
}

/// TCP session opened by [`TcpConnectionFactory`].
///
/// The transport writes; responses are read through its [`TcpReader`], which
/// can be taken out so a reader task receives while requests keep going out.
#[derive(Debug)]
pub struct TcpTransport {
    writer: OwnedWriteHalf,
    reader: Option<TcpReader>,
    peer: String,
    closed: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Address the transport is connected to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Hand out the receiving half, e.g. to a task that dispatches responses.
    ///
    /// Returns `None` if it was taken before.
    pub fn take_reader(&mut self) -> Option<TcpReader> {
        self.reader.take()
    }

    /// Receive through the receiving half while it has not been taken.
    /// # Errors
    ///
    /// Will return `Error` if the reader was taken, the read timed out or the
    /// peer closed the connection.
    pub async fn recv(&mut self) -> Result<BytesMut, Error> {
        match self.reader.as_mut() {
            Some(reader) => reader.recv().await,
            None => Err(Error::Connection(format!(
                "Reader of '{}' was handed out",
                self.peer
            ))),
        }
    }

    /// Gracefully shut down the write half of the connection
    /// # Errors
    ///
    /// Will return `Error` if the connection could not be shut down.
    pub async fn disconnect(&mut self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        self.writer.shutdown().await?;
        debug!(peer = %self.peer, "Closed TCP connection");
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("Connection is closed".to_string()));
        }
        match timeout(DATA_SEND_AND_RECEIVE_TIMEOUT, self.writer.write_all(&frame)).await {
            Ok(Ok(())) => {
                trace!(peer = %self.peer, len = frame.len(), "Sent frame");
                Ok(())
            }
            Ok(Err(err)) => {
                self.closed.store(true, Ordering::Release);
                Err(err.into())
            }
            Err(_) => Err(Error::DataExchangeTimedOut),
        }
    }
}

/// Receiving half of a [`TcpTransport`]
#[derive(Debug)]
pub struct TcpReader {
    reader: OwnedReadHalf,
    peer: String,
    closed: Arc<AtomicBool>,
}

impl TcpReader {
    /// Address the connection is connected to
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Receive whatever the device sent next, at most one read worth of bytes.
    ///
    /// Framing is up to the driver's codec.
    /// # Errors
    ///
    /// Will return `Error` if the read timed out or the peer closed the connection.
    /// The latter marks the transport disconnected.
    pub async fn recv(&mut self) -> Result<BytesMut, Error> {
        let mut data = BytesMut::with_capacity(READ_CHUNK);
        let read = match timeout(DATA_SEND_AND_RECEIVE_TIMEOUT, self.reader.read_buf(&mut data)).await
        {
            Ok(read) => read,
            Err(_) => return Err(Error::DataExchangeTimedOut),
        };
        match read {
            Ok(0) => {
                self.closed.store(true, Ordering::Release);
                Err(Error::IO(std::io::ErrorKind::UnexpectedEof))
            }
            Ok(len) => {
                trace!(peer = %self.peer, len, "Received frame");
                Ok(data)
            }
            Err(err) => {
                self.closed.store(true, Ordering::Release);
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    fn first_two_bytes(frame: &[u8]) -> Option<u64> {
        match frame {
            [hi, lo, ..] => Some(u64::from(u16::from_be_bytes([*hi, *lo]))),
            _ => None,
        }
    }

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(len) => socket.write_all(&buf[..len]).await.unwrap(),
                }
            }
        });
        address
    }

    #[tokio::test]
    async fn send_and_receive_a_frame() {
        let address = echo_server().await;
        let factory = TcpConnectionFactory::new().with_key_extractor(first_two_bytes);

        let mut transport = factory.open(&address, None).await.unwrap();
        assert!(factory.is_connected(&transport));
        transport
            .send(Bytes::from_static(&[0x00, 0x2a, 0xff]))
            .await
            .unwrap();
        let response = transport.recv().await.unwrap();

        assert_eq!(&response[..], &[0x00, 0x2a, 0xff]);
        assert_eq!(factory.correlation_key(&response), Some(42));

        factory.close(&mut transport).await.unwrap();
        assert!(!factory.is_connected(&transport));
        assert!(transport.send(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = TcpConnectionFactory::new().with_default_port(port);
        let err = factory.open("127.0.0.1", None).await.unwrap_err();

        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn reader_half_receives_while_sending() {
        let address = echo_server().await;
        let factory = TcpConnectionFactory::new();

        let mut transport = factory.open(&address, None).await.unwrap();
        let mut reader = transport.take_reader().unwrap();
        assert!(transport.take_reader().is_none());
        assert!(transport.recv().await.is_err());

        let pending_read = tokio::spawn(async move { reader.recv().await });
        transport.send(Bytes::from_static(&[0x00, 0x07, 0x01])).await.unwrap();

        let response = pending_read.await.unwrap().unwrap();
        assert_eq!(&response[..], &[0x00, 0x07, 0x01]);
        assert_eq!(transport.peer(), address);
    }

    #[test]
    fn default_port_only_applies_without_explicit_port() {
        let factory = TcpConnectionFactory::new().with_default_port(102);

        assert_eq!(factory.address("10.0.0.5"), "10.0.0.5:102");
        assert_eq!(factory.address("10.0.0.5:4840"), "10.0.0.5:4840");
        assert_eq!(factory.correlation_key(&[1, 2]), None);
    }
}
