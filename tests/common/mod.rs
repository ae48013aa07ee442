#![allow(dead_code)]

use async_trait::async_trait;
use player_remote::domain::models::{ConnectionEvent, ConnectionState};
use player_remote::domain::player::PlayerInfo;
use player_remote::infrastructure::comm::atom::Serializable;
use player_remote::infrastructure::comm::message::{frame, unframe, Message, MessageType};
use player_remote::infrastructure::comm::stack::{BluetoothStack, BoxedChannel, RemoteDevice};
use player_remote::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub const ADDRESS: &str = "001122AABBCC";

/// Server end of a channel the client opened
pub struct Accepted {
    pub address: String,
    pub channel: u8,
    pub stream: DuplexStream,
}

/// Bluetooth stack backed by in-memory pipes.
///
/// Every opened channel hands its server end to the test through
/// the receiver returned by [`SimulatedStack::new`].
pub struct SimulatedStack {
    devices: Vec<RemoteDevice>,
    services: HashMap<String, Result<Option<u8>>>,
    open: HashSet<(String, u8)>,
    hang_on_open: bool,
    buffer: usize,
    calls: Mutex<Vec<String>>,
    accepted_tx: mpsc::UnboundedSender<Accepted>,
}

impl SimulatedStack {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let stack = Self {
            devices: Vec::new(),
            services: HashMap::new(),
            open: HashSet::new(),
            hang_on_open: false,
            buffer: 64 * 1024,
            calls: Mutex::new(Vec::new()),
            accepted_tx,
        };
        (stack, accepted_rx)
    }

    /// A device answering inquiries, with the given service lookup result
    pub fn with_device(mut self, address: &str, lookup: Result<Option<u8>>) -> Self {
        self.devices.push(RemoteDevice {
            address: address.to_string(),
            name: Some(format!("Player {}", address)),
        });
        self.services.insert(address.to_string(), lookup);
        self
    }

    /// Channel that accepts connections
    pub fn with_open_channel(mut self, address: &str, channel: u8) -> Self {
        self.open.insert((address.to_string(), channel));
        self
    }

    /// Opening any channel never completes
    pub fn hanging(mut self) -> Self {
        self.hang_on_open = true;
        self
    }

    /// Capacity of each opened pipe; a peer that stops reading fills it
    pub fn with_buffer(mut self, bytes: usize) -> Self {
        self.buffer = bytes;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BluetoothStack for SimulatedStack {
    async fn inquiry(&self) -> Result<Vec<RemoteDevice>> {
        self.record("inquiry".to_string());
        Ok(self.devices.clone())
    }

    async fn find_service(&self, address: &str, _service_uuid: &str) -> Result<Option<u8>> {
        self.record(format!("find_service {}", address));
        self.services
            .get(address)
            .cloned()
            .unwrap_or(Ok(None))
    }

    async fn open_channel(&self, address: &str, channel: u8) -> Result<BoxedChannel> {
        self.record(format!("open {} {}", address, channel));
        if self.hang_on_open {
            std::future::pending::<()>().await;
        }
        if !self.open.contains(&(address.to_string(), channel)) {
            return Err(Error::ConnectFailed(format!("channel {} refused", channel)));
        }
        let (client, server) = tokio::io::duplex(self.buffer);
        let _ = self.accepted_tx.send(Accepted {
            address: address.to_string(),
            channel,
            stream: server,
        });
        Ok(Box::new(client))
    }
}

pub fn player_info(name: &str) -> PlayerInfo {
    PlayerInfo {
        name: name.to_string(),
        ..PlayerInfo::default()
    }
}

/// Play the server side of the handshake
pub async fn serve_handshake(stream: &mut DuplexStream, info: &PlayerInfo) {
    let hello = unframe(stream).await.unwrap();
    assert_eq!(hello.kind(), Some(MessageType::ClientInfo));
    send(stream, MessageType::PlayerInfo, info.to_payload().unwrap()).await;
}

pub async fn send(stream: &mut DuplexStream, kind: MessageType, payload: Vec<u8>) {
    send_raw(stream, kind.id(), payload).await;
}

pub async fn send_raw(stream: &mut DuplexStream, id: u8, payload: Vec<u8>) {
    let bytes = frame(&Message { id, payload }).unwrap();
    stream.write_all(&bytes).await.unwrap();
}

pub async fn next_accepted(rx: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no channel opened")
        .expect("stack dropped")
}

/// Collect events until the connection reports `until`
pub async fn events_until(
    rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    until: ConnectionState,
) -> Vec<ConnectionEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event channel closed");
        let done = matches!(event, ConnectionEvent::StateChanged(s) if s == until);
        events.push(event);
        if done {
            return events;
        }
    }
}

pub fn states(events: &[ConnectionEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}
