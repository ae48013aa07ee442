//! Transport Module
//!
//! Byte-oriented duplex channel to the server. Two kinds exist: an RFCOMM
//! channel opened through the [`BluetoothStack`], and a TCP socket.
//!
//! Once the handshake succeeds the transport is split into a reader (owned
//! by the receive loop) and a writer (shared by the send path behind a
//! lock), so inbound and outbound traffic can proceed at the same time.

use crate::domain::models::{DeviceDescriptor, ServiceEndpoint};
use crate::error::{Error, Result};
use crate::infrastructure::comm::message::{self, stream_error, Message};
use crate::infrastructure::comm::stack::{BluetoothStack, BoxedChannel, Channel};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// RFCOMM channel to a Bluetooth device
pub struct BluetoothTransport {
    peer: String,
    channel: Option<BoxedChannel>,
}

impl BluetoothTransport {
    pub fn new(peer: impl Into<String>, channel: BoxedChannel) -> Self {
        Self {
            peer: peer.into(),
            channel: Some(channel),
        }
    }
}

/// Stream socket to a host
pub struct SocketTransport {
    peer: String,
    stream: Option<TcpStream>,
}

impl SocketTransport {
    pub fn new(peer: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            peer: peer.into(),
            stream: Some(stream),
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub enum Transport {
    Bluetooth(BluetoothTransport),
    Socket(SocketTransport),
}

impl Transport {
    /// Open a transport to `descriptor`, giving up after `timeout`
    pub async fn open(
        descriptor: &DeviceDescriptor,
        stack: &dyn BluetoothStack,
        timeout: Duration,
    ) -> Result<Self> {
        info!(
            "Opening transport to {} ({:?})",
            descriptor.address, descriptor.endpoint
        );
        match descriptor.endpoint {
            ServiceEndpoint::Rfcomm(channel) => {
                let open = stack.open_channel(&descriptor.address, channel);
                let stream = tokio::time::timeout(timeout, open)
                    .await
                    .map_err(|_| Error::Timeout)??;
                Ok(Self::Bluetooth(BluetoothTransport::new(
                    descriptor.address.clone(),
                    stream,
                )))
            }
            ServiceEndpoint::Tcp(port) => {
                let connect = TcpStream::connect((descriptor.address.as_str(), port));
                let stream = tokio::time::timeout(timeout, connect)
                    .await
                    .map_err(|_| Error::Timeout)?
                    .map_err(|e| Error::ConnectFailed(e.to_string()))?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not disable Nagle: {}", e);
                }
                Ok(Self::Socket(SocketTransport::new(
                    format!("{}:{}", descriptor.address, port),
                    stream,
                )))
            }
        }
    }

    pub fn peer(&self) -> &str {
        match self {
            Self::Bluetooth(t) => &t.peer,
            Self::Socket(t) => &t.peer,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Self::Bluetooth(t) => t.channel.is_some(),
            Self::Socket(t) => t.stream.is_some(),
        }
    }

    fn stream(&mut self) -> Result<&mut dyn Channel> {
        match self {
            Self::Bluetooth(t) => match t.channel.as_mut() {
                Some(channel) => Ok(&mut **channel),
                None => Err(Error::TransportClosed),
            },
            Self::Socket(t) => match t.stream.as_mut() {
                Some(stream) => Ok(stream as &mut dyn Channel),
                None => Err(Error::TransportClosed),
            },
        }
    }

    /// Read exactly `n` bytes, waiting at most `timeout`
    pub async fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let stream = self.stream()?;
        let mut buf = vec![0u8; n];
        tokio::time::timeout(timeout, stream.read_exact(&mut buf))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(stream_error)?;
        Ok(buf)
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(bytes).await.map_err(stream_error)?;
        stream.flush().await.map_err(stream_error)
    }

    /// Read the next framed message; `None` waits indefinitely
    pub async fn read_message(&mut self, timeout: Option<Duration>) -> Result<Message> {
        let stream = self.stream()?;
        read_framed(stream, timeout).await
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = message::frame(message)?;
        self.write_all(&bytes).await
    }

    /// Shut the channel down. Safe to call any number of times.
    pub async fn close(&mut self) {
        let peer = self.peer().to_string();
        match self {
            Self::Bluetooth(t) => {
                if let Some(mut channel) = t.channel.take() {
                    let _ = channel.shutdown().await;
                    debug!("Closed RFCOMM channel to {}", peer);
                }
            }
            Self::Socket(t) => {
                if let Some(mut stream) = t.stream.take() {
                    let _ = stream.shutdown().await;
                    debug!("Closed socket to {}", peer);
                }
            }
        }
    }

    /// Split into independent read and write halves
    pub fn into_split(self) -> Result<(TransportReader, TransportWriter)> {
        let peer = self.peer().to_string();
        let (reader, writer): (BoxedReader, BoxedWriter) = match self {
            Self::Bluetooth(mut t) => {
                let channel = t.channel.take().ok_or(Error::TransportClosed)?;
                let (r, w) = tokio::io::split(channel);
                (Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter)
            }
            Self::Socket(mut t) => {
                let stream = t.stream.take().ok_or(Error::TransportClosed)?;
                let (r, w) = stream.into_split();
                (Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter)
            }
        };
        Ok((
            TransportReader { inner: reader },
            TransportWriter {
                peer,
                inner: Some(writer),
            },
        ))
    }
}

async fn read_framed<R>(reader: &mut R, timeout: Option<Duration>) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, message::unframe(reader))
            .await
            .map_err(|_| Error::Timeout)?,
        None => message::unframe(reader).await,
    }
}

/// Receiving half of a split transport
pub struct TransportReader {
    inner: BoxedReader,
}

impl TransportReader {
    pub async fn read_message(&mut self, timeout: Option<Duration>) -> Result<Message> {
        read_framed(&mut *self.inner, timeout).await
    }
}

/// Sending half of a split transport
pub struct TransportWriter {
    peer: String,
    inner: Option<BoxedWriter>,
}

impl TransportWriter {
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let bytes = message::frame(message)?;
        let writer = self.inner.as_mut().ok_or(Error::TransportClosed)?;
        writer.write_all(&bytes).await.map_err(stream_error)?;
        writer.flush().await.map_err(stream_error)
    }

    /// Shut the write side down. Safe to call any number of times.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.inner.take() {
            let _ = writer.shutdown().await;
            debug!("Closed write side to {}", self.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::comm::message::MessageType;

    fn duplex_transport() -> (Transport, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        (
            Transport::Bluetooth(BluetoothTransport::new("001122AABBCC", Box::new(client))),
            server,
        )
    }

    #[tokio::test]
    async fn test_read_exact_timeout() {
        let (mut transport, _server) = duplex_transport();
        let result = transport.read_exact(4, Duration::from_millis(20)).await;
        assert_eq!(result, Err(Error::Timeout));
    }

    #[tokio::test]
    async fn test_read_after_peer_closed() {
        let (mut transport, server) = duplex_transport();
        drop(server);
        let result = transport.read_exact(1, Duration::from_millis(200)).await;
        assert_eq!(result, Err(Error::TransportClosed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut transport, _server) = duplex_transport();
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());
        assert_eq!(
            transport.write_all(&[1]).await,
            Err(Error::TransportClosed)
        );
        assert!(transport.into_split().is_err());
    }

    #[tokio::test]
    async fn test_split_halves_work_independently() {
        let (transport, mut server) = duplex_transport();
        let (mut reader, mut writer) = transport.into_split().unwrap();

        writer
            .send(&Message::empty(MessageType::Ignore))
            .await
            .unwrap();
        let mut header = [0u8; 3];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0, 0, 0]);

        server.write_all(&[3, 0, 1, 42]).await.unwrap();
        let message = reader.read_message(None).await.unwrap();
        assert_eq!(message.kind(), Some(MessageType::StateSync));
        assert_eq!(message.payload, vec![42]);

        writer.close().await;
        writer.close().await;
        assert_eq!(
            writer.send(&Message::empty(MessageType::Ignore)).await,
            Err(Error::TransportClosed)
        );
    }

    #[tokio::test]
    async fn test_open_socket_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let descriptor = DeviceDescriptor::new("127.0.0.1", None, ServiceEndpoint::Tcp(port));
        let stack = crate::infrastructure::comm::stack::UnavailableStack;
        let result = Transport::open(&descriptor, &stack, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(Error::ConnectFailed(_))));
    }
}
