//! Client/server handshake: send client info, wait for player info.

use crate::domain::player::{ClientInfo, PlayerInfo};
use crate::error::{Error, Result};
use crate::infrastructure::comm::atom::Serializable;
use crate::infrastructure::comm::message::{Message, MessageType};
use crate::infrastructure::comm::transport::Transport;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub client_info: ClientInfo,
    /// Time allowed for the player info to arrive
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            client_info: ClientInfo::default(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Run the handshake on a freshly opened transport.
///
/// Keep-alive messages before the player info are skipped. Any other
/// message, a malformed player info or a missed deadline fails the
/// handshake; the caller is responsible for closing the transport.
pub async fn perform(transport: &mut Transport, config: &HandshakeConfig) -> Result<PlayerInfo> {
    let deadline = Instant::now() + config.timeout;

    let payload = config.client_info.to_payload()?;
    let hello = Message::new(MessageType::ClientInfo, payload);
    tokio::time::timeout_at(deadline, transport.send(&hello))
        .await
        .map_err(|_| Error::Timeout)??;
    debug!("Sent client info to {}", transport.peer());

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout);
        }

        let message = transport.read_message(Some(remaining)).await?;
        match message.kind() {
            Some(MessageType::Ignore) => continue,
            Some(MessageType::PlayerInfo) => {
                let info = PlayerInfo::from_payload(&message.payload)
                    .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
                info!("Handshake with {} complete, player is {}", transport.peer(), info.name);
                return Ok(info);
            }
            _ => {
                return Err(Error::HandshakeFailed(format!(
                    "expected player info, got message type {}",
                    message.id
                )))
            }
        }
    }
}
