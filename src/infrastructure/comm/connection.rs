//! Connection Module
//!
//! Drives one device connection through its lifecycle: locate the service,
//! open the transport, handshake, then receive and dispatch messages until
//! the link ends. Optionally waits and tries again.
//!
//! The state machine runs in its own task and is the only writer of the
//! connection state. Collaborators learn about everything through the
//! [`ConnectionEvent`] channel.

use crate::domain::models::{ConnectionEvent, ConnectionState, Device, DeviceDescriptor};
use crate::domain::player::{
    Control, ControlCommand, Item, ItemList, ItemRequest, ListRequest, PlayerInfo, PlayerState,
};
use crate::error::{Error, Result};
use crate::infrastructure::comm::atom::Serializable;
use crate::infrastructure::comm::handshake::{self, HandshakeConfig};
use crate::infrastructure::comm::message::{Message, MessageType};
use crate::infrastructure::comm::scanner::{self, DeviceScanner, ScanConfig};
use crate::infrastructure::comm::stack::BluetoothStack;
use crate::infrastructure::comm::transport::{Transport, TransportReader, TransportWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound for opening the transport (and for single writes)
    pub connect_timeout: Duration,
    pub handshake: HandshakeConfig,
    /// Retry after failures and lost links
    pub auto_reconnect: bool,
    /// Failed attempts in a row before giving up
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
    /// A lost session counts as a failed attempt unless it stayed up this long
    pub stable_session: Duration,
    /// Consecutive malformed messages tolerated while connected
    pub max_malformed_messages: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake: HandshakeConfig::default(),
            auto_reconnect: false,
            max_reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(2),
            stable_session: Duration::from_secs(10),
            max_malformed_messages: 3,
        }
    }
}

/// Write side of an established link
struct Link {
    writer: TransportWriter,
    /// Wakes the receive loop when the send path sees the transport die
    lost: Arc<Notify>,
}

type SharedLink = Arc<Mutex<Option<Link>>>;

/// Connection to a player server
pub struct Connection {
    config: ConnectionConfig,
    stack: Arc<dyn BluetoothStack>,
    scanner: DeviceScanner,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    link: SharedLink,
    stop: Option<watch::Sender<bool>>,
    driver: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        stack: Arc<dyn BluetoothStack>,
        scan_config: ScanConfig,
        config: ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            scanner: DeviceScanner::new(stack.clone(), scan_config),
            stack,
            config,
            events,
            state: Arc::new(state),
            link: Arc::new(Mutex::new(None)),
            stop: None,
            driver: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start connecting to `device` in the background.
    ///
    /// Only allowed while idle; a running attempt or live connection must be
    /// ended with [`disconnect`](Self::disconnect) first.
    pub fn connect(&mut self, device: Device) -> Result<()> {
        match self.state() {
            ConnectionState::Idle => {}
            ConnectionState::Connected | ConnectionState::Closing => {
                return Err(Error::AlreadyConnected)
            }
            _ => return Err(Error::AlreadyConnecting),
        }
        device.validate()?;

        // an idle connection's previous driver is done or about to return
        if let Some(previous) = self.driver.take() {
            previous.abort();
        }

        info!("Connecting to {:?} device '{}'", device.kind, device.address);
        let first = if device.needs_scan() {
            ConnectionState::Scanning
        } else {
            ConnectionState::Connecting
        };
        publish_state(&self.state, &self.events, first);

        let (stop_tx, stop_rx) = watch::channel(false);
        let driver = Driver {
            device,
            config: self.config.clone(),
            stack: self.stack.clone(),
            scanner: self.scanner.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            link: self.link.clone(),
        };
        self.driver = Some(tokio::spawn(driver.run(stop_rx)));
        self.stop = Some(stop_tx);
        Ok(())
    }

    /// End the current attempt or connection and wait until idle
    pub async fn disconnect(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!("Connection driver ended abnormally: {}", e);
            }
        }
        if let Some(mut link) = self.link.lock().await.take() {
            link.writer.close().await;
        }
        publish_state(&self.state, &self.events, ConnectionState::Idle);
    }

    pub async fn send_control(&self, command: ControlCommand) -> Result<()> {
        let payload = Control::from(command).to_payload()?;
        self.send_payload(MessageType::Control, payload).await
    }

    /// Run a player action on the given targets
    pub async fn send_action(&self, action_id: i32, targets: Vec<String>) -> Result<()> {
        let payload = Control::action(action_id, targets).to_payload()?;
        self.send_payload(MessageType::Control, payload).await
    }

    pub async fn request_item(&self, id: impl Into<String>) -> Result<()> {
        let payload = ItemRequest { id: id.into() }.to_payload()?;
        self.send_payload(MessageType::RequestItem, payload).await
    }

    pub async fn request_list(&self, path: Vec<String>, page: i32) -> Result<()> {
        let payload = ListRequest { path, page }.to_payload()?;
        self.send_payload(MessageType::RequestList, payload).await
    }

    async fn send_payload(&self, kind: MessageType, payload: Vec<u8>) -> Result<()> {
        let message = Message::new(kind, payload);
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(Error::NotConnected)?;

        let sent = tokio::time::timeout(self.config.connect_timeout, link.writer.send(&message))
            .await
            .unwrap_or(Err(Error::Timeout));
        match sent {
            Ok(()) => {
                debug!("Sent {:?}", message);
                Ok(())
            }
            Err(e @ Error::PayloadTooLarge(_)) => Err(e),
            Err(e) => {
                // part of the frame may be on the wire, so the stream is unusable
                warn!("Sending {:?} failed, dropping the link: {}", kind, e);
                if let Some(link) = guard.take() {
                    link.lost.notify_one();
                }
                Err(Error::SendFailed(e.to_string()))
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

fn publish_state(
    state: &watch::Sender<ConnectionState>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
    next: ConnectionState,
) {
    let changed = state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });
    if changed {
        info!("Connection state: {}", next);
        let _ = events.send(ConnectionEvent::StateChanged(next));
    }
}

/// Resolves once a stop was requested or the connection handle is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// How an established session ended
enum SessionEnd {
    ServerShutdown,
    /// Link failed after being up for the given time
    Lost(Error, Duration),
}

enum Dispatch {
    Continue,
    Shutdown,
}

/// State machine task behind a [`Connection`]
struct Driver {
    device: Device,
    config: ConnectionConfig,
    stack: Arc<dyn BluetoothStack>,
    scanner: DeviceScanner,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    link: SharedLink,
}

impl Driver {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut failures = 0u32;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = stopped(&mut stop) => None,
                outcome = self.session() => Some(outcome),
            };

            let retry = match outcome {
                None => {
                    info!("Connection to '{}' stopped", self.device.address);
                    false
                }
                Some(Ok(SessionEnd::ServerShutdown)) => {
                    info!("Server shut down");
                    false
                }
                Some(Ok(SessionEnd::Lost(e, uptime))) => {
                    warn!("Connection lost after {:?}: {}", uptime, e);
                    self.emit(ConnectionEvent::Error(e));
                    if uptime >= self.config.stable_session {
                        failures = 0;
                    } else {
                        failures += 1;
                    }
                    true
                }
                Some(Err(e)) => {
                    error!("Connection attempt failed: {}", e);
                    let retryable = e.is_retryable();
                    self.emit(ConnectionEvent::Error(e));
                    failures += 1;
                    retryable
                }
            };

            self.teardown().await;

            if !retry || !self.config.auto_reconnect || failures >= self.config.max_reconnect_attempts
            {
                self.publish(ConnectionState::Idle);
                return;
            }

            self.publish(ConnectionState::ReconnectWait);
            info!(
                "Reconnecting in {:?} (failed attempts: {}/{})",
                self.config.reconnect_backoff, failures, self.config.max_reconnect_attempts
            );
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => {
                    self.publish(ConnectionState::Idle);
                    return;
                }
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
    }

    /// One attempt: locate, open, handshake, then receive until the end
    async fn session(&self) -> Result<SessionEnd> {
        let descriptor = self.locate().await?;

        self.publish(ConnectionState::Connecting);
        let mut transport =
            Transport::open(&descriptor, self.stack.as_ref(), self.config.connect_timeout).await?;

        self.publish(ConnectionState::Handshaking);
        let info = match handshake::perform(&mut transport, &self.config.handshake).await {
            Ok(info) => info,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let (mut reader, writer) = transport.into_split()?;
        let lost = Arc::new(Notify::new());
        *self.link.lock().await = Some(Link {
            writer,
            lost: lost.clone(),
        });

        self.publish(ConnectionState::Connected);
        self.emit(ConnectionEvent::PlayerInfo(info));

        let connected_at = Instant::now();
        Ok(match self.receive(&mut reader, &lost).await {
            SessionEnd::Lost(e, _) => SessionEnd::Lost(e, connected_at.elapsed()),
            end => end,
        })
    }

    async fn locate(&self) -> Result<DeviceDescriptor> {
        if !self.device.needs_scan() {
            return scanner::manual_descriptor(&self.device);
        }

        self.publish(ConnectionState::Scanning);
        let found = self.scanner.scan(&self.device).await.map_err(|e| {
            warn!("Scan failed: {}", e);
            Error::NoDeviceFound
        })?;
        found
            .into_iter()
            .find(|d| d.matches(&self.device))
            .ok_or(Error::NoDeviceFound)
    }

    async fn receive(&self, reader: &mut TransportReader, lost: &Notify) -> SessionEnd {
        let mut malformed = 0u32;
        loop {
            let received = tokio::select! {
                result = reader.read_message(None) => result,
                _ = lost.notified() => Err(Error::TransportClosed),
            };
            let message = match received {
                Ok(message) => message,
                Err(e) => return SessionEnd::Lost(e, Duration::ZERO),
            };

            match self.dispatch(message) {
                Ok(Dispatch::Continue) => malformed = 0,
                Ok(Dispatch::Shutdown) => return SessionEnd::ServerShutdown,
                Err(e) => {
                    malformed += 1;
                    warn!(
                        "Dropping malformed message ({}/{}): {}",
                        malformed, self.config.max_malformed_messages, e
                    );
                    if malformed > self.config.max_malformed_messages {
                        return SessionEnd::Lost(e, Duration::ZERO);
                    }
                }
            }
        }
    }

    fn dispatch(&self, message: Message) -> Result<Dispatch> {
        let payload = &message.payload;
        let event = match message.kind() {
            Some(MessageType::Ignore) => return Ok(Dispatch::Continue),
            Some(MessageType::PlayerInfo) => {
                ConnectionEvent::PlayerInfo(PlayerInfo::from_payload(payload)?)
            }
            Some(MessageType::StateSync) => {
                ConnectionEvent::StateSync(PlayerState::from_payload(payload)?)
            }
            Some(MessageType::ItemSync) => ConnectionEvent::ItemSync(Item::from_payload(payload)?),
            Some(MessageType::RequestItem) => {
                ConnectionEvent::RequestedItem(Item::from_payload(payload)?)
            }
            Some(MessageType::RequestList) => {
                ConnectionEvent::ItemList(ItemList::from_payload(payload)?)
            }
            Some(MessageType::ServerShutdown) => {
                self.emit(ConnectionEvent::ServerShutdown);
                return Ok(Dispatch::Shutdown);
            }
            Some(MessageType::ClientInfo) | Some(MessageType::Control) | None => {
                debug!("Ignoring message type {}", message.id);
                return Ok(Dispatch::Continue);
            }
        };
        self.emit(event);
        Ok(Dispatch::Continue)
    }

    /// Release the link if there is one, passing through `Closing`
    async fn teardown(&self) {
        if *self.state.borrow() == ConnectionState::Connected {
            self.publish(ConnectionState::Closing);
        }
        if let Some(mut link) = self.link.lock().await.take() {
            link.writer.close().await;
        }
    }

    fn publish(&self, next: ConnectionState) {
        publish_state(&self.state, &self.events, next);
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SearchStrategy;
    use crate::infrastructure::comm::stack::UnavailableStack;

    fn idle_connection() -> (Connection, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            Arc::new(UnavailableStack),
            ScanConfig::default(),
            ConnectionConfig::default(),
            tx,
        );
        (connection, rx)
    }

    fn device() -> Device {
        Device::bluetooth("001122AABBCC", SearchStrategy::Manual).with_port(5)
    }

    #[tokio::test]
    async fn test_connect_rejected_outside_idle() {
        let (mut connection, _events) = idle_connection();

        publish_state(&connection.state, &connection.events, ConnectionState::Closing);
        assert_eq!(connection.connect(device()), Err(Error::AlreadyConnected));

        publish_state(
            &connection.state,
            &connection.events,
            ConnectionState::ReconnectWait,
        );
        assert_eq!(connection.connect(device()), Err(Error::AlreadyConnecting));

        // rejected calls leave the state alone
        assert_eq!(connection.state(), ConnectionState::ReconnectWait);
        assert!(connection.driver.is_none());
    }

    #[test]
    fn test_state_changes_are_published_once() {
        let (connection, mut events) = idle_connection();
        publish_state(&connection.state, &connection.events, ConnectionState::Scanning);
        publish_state(&connection.state, &connection.events, ConnectionState::Scanning);

        assert!(matches!(
            events.try_recv(),
            Ok(ConnectionEvent::StateChanged(ConnectionState::Scanning))
        ));
        assert!(events.try_recv().is_err());
    }
}
