//! Error type shared by the communication subsystem.

use thiserror::Error;

/// Everything that can go wrong while talking to a player server.
///
/// Errors are plain values so they can travel over event channels and be
/// compared in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("transport closed")]
    TransportClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("no device found")]
    NoDeviceFound,

    #[error("service search failed: {0}")]
    ServiceSearchFailed(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid device: {0}")]
    InvalidDevice(String),
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPayload(reason.into())
    }

    /// Whether a failed attempt may be retried by the reconnect policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed
                | Self::Timeout
                | Self::ConnectFailed(_)
                | Self::NoDeviceFound
                | Self::ServiceSearchFailed(_)
                | Self::HandshakeFailed(_)
                | Self::MalformedPayload(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
