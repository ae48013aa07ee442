//! Message Framing
//!
//! # Wire Layout
//!
//! ```text
//! [0]     : message type (u8)
//! [1-2]   : payload length (u16 big-endian)
//! [3..]   : payload, exactly `length` bytes of atom-encoded data
//! ```
//!
//! A zero length is legal. Unknown type ids still frame and unframe; the
//! receiver decides what to do with them.

use crate::error::{Error, Result};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

/// Size of the frame header in bytes
pub const HEADER_LEN: usize = 3;

/// Largest payload the length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Message types known to this client.
///
/// The numeric values are fixed by deployed servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Keep-alive, carries no data
    Ignore = 0,
    PlayerInfo = 2,
    StateSync = 3,
    ItemSync = 4,
    ServerShutdown = 7,
    ClientInfo = 8,
    Control = 10,
    RequestItem = 11,
    RequestList = 12,
}

impl MessageType {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Ignore),
            2 => Some(Self::PlayerInfo),
            3 => Some(Self::StateSync),
            4 => Some(Self::ItemSync),
            7 => Some(Self::ServerShutdown),
            8 => Some(Self::ClientInfo),
            10 => Some(Self::Control),
            11 => Some(Self::RequestItem),
            12 => Some(Self::RequestList),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// A message received from or to be sent to the server
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    /// Raw type id, may be one this client does not know
    pub id: u8,
    /// Atom-encoded data
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self {
            id: kind.id(),
            payload,
        }
    }

    /// A message without payload
    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Vec::new())
    }

    /// The known message type, if any
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_id(self.id)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Serialize a message into header plus payload
pub fn frame(message: &Message) -> Result<Vec<u8>> {
    let len = message.payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(Error::PayloadTooLarge(len));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.push(message.id);
    out.extend_from_slice(&(len as u16).to_be_bytes());
    out.extend_from_slice(&message.payload);
    Ok(out)
}

/// Split a header into type id and payload length
pub fn parse_header(header: [u8; HEADER_LEN]) -> (u8, usize) {
    (header[0], u16::from_be_bytes([header[1], header[2]]) as usize)
}

/// Read one complete message from a byte stream.
///
/// Waits until the whole header and payload arrived. A stream that ends in
/// the middle of a message yields [`Error::TransportClosed`].
pub async fn unframe<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(stream_error)?;
    let (id, len) = parse_header(header);

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(stream_error)?;

    trace!("Unframed message type {} with {} bytes", id, len);
    Ok(Message { id, payload })
}

/// Map an I/O failure on the byte stream to the transport error
pub(crate) fn stream_error(e: io::Error) -> Error {
    debug!("Stream I/O error: {}", e);
    Error::TransportClosed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_ids_are_stable() {
        let expected = [
            (MessageType::Ignore, 0),
            (MessageType::PlayerInfo, 2),
            (MessageType::StateSync, 3),
            (MessageType::ItemSync, 4),
            (MessageType::ServerShutdown, 7),
            (MessageType::ClientInfo, 8),
            (MessageType::Control, 10),
            (MessageType::RequestItem, 11),
            (MessageType::RequestList, 12),
        ];
        for (kind, id) in expected {
            assert_eq!(kind.id(), id);
            assert_eq!(MessageType::from_id(id), Some(kind));
        }
        for unused in [1, 5, 6, 9, 13, 255] {
            assert_eq!(MessageType::from_id(unused), None);
        }
    }

    #[test]
    fn test_frame_empty_ignore() {
        let bytes = frame(&Message::empty(MessageType::Ignore)).unwrap();
        assert_eq!(bytes, vec![0, 0, 0]);
    }

    #[test]
    fn test_frame_header() {
        let bytes = frame(&Message::new(MessageType::RequestItem, vec![9; 258])).unwrap();
        assert_eq!(&bytes[..3], &[11, 1, 2]);
        assert_eq!(bytes.len(), 3 + 258);
    }

    #[test]
    fn test_frame_too_large() {
        let message = Message::new(MessageType::Control, vec![0; MAX_PAYLOAD_LEN + 1]);
        assert_eq!(
            frame(&message),
            Err(Error::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[tokio::test]
    async fn test_unframe_round_trip() {
        let message = Message::new(MessageType::StateSync, vec![1, 2, 3]);
        let bytes = frame(&message).unwrap();
        let mut stream: &[u8] = &bytes;
        assert_eq!(unframe(&mut stream).await.unwrap(), message);
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn test_unframe_empty_then_next() {
        let mut bytes = frame(&Message::empty(MessageType::Ignore)).unwrap();
        bytes.extend(frame(&Message::new(MessageType::ItemSync, vec![7])).unwrap());
        let mut stream: &[u8] = &bytes;

        let first = unframe(&mut stream).await.unwrap();
        assert_eq!(first.kind(), Some(MessageType::Ignore));
        assert!(first.payload.is_empty());

        let second = unframe(&mut stream).await.unwrap();
        assert_eq!(second.payload, vec![7]);
    }

    #[tokio::test]
    async fn test_unframe_unknown_type_delivered() {
        let bytes = [9u8, 0, 1, 0xAB];
        let mut stream: &[u8] = &bytes;
        let message = unframe(&mut stream).await.unwrap();
        assert_eq!(message.id, 9);
        assert_eq!(message.kind(), None);
        assert_eq!(message.payload, vec![0xAB]);
    }

    #[tokio::test]
    async fn test_unframe_truncated_stream() {
        let bytes = frame(&Message::new(MessageType::PlayerInfo, vec![5; 10])).unwrap();
        for cut in 0..bytes.len() {
            let mut stream: &[u8] = &bytes[..cut];
            assert_eq!(
                unframe(&mut stream).await,
                Err(Error::TransportClosed),
                "cut at {}",
                cut
            );
        }
    }
}
