//! Communication Module
//!
//! Talks to a media player server over RFCOMM or TCP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Connection                         │
//! │  (state machine, receive loop, outbound calls)           │
//! └──────┬──────────────────┬───────────────────┬───────────┘
//!        │                  │                   │
//!        ▼                  ▼                   ▼
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────┐
//! │   Scanner   │   │  Handshake   │   │   Transport    │
//! │             │   │              │   │                │
//! │ - inquiry   │   │ - client     │   │ - RFCOMM / TCP │
//! │ - SDP       │   │   info out   │   │ - timeouts     │
//! │ - failsafe  │   │ - player     │   │ - split halves │
//! │   probing   │   │   info in    │   │                │
//! └──────┬──────┘   └──────────────┘   └───────┬────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌─────────────┐                      ┌────────────────┐
//! │    Stack    │                      │ Message / Atom │
//! │ (platform)  │                      │  (wire codec)  │
//! └─────────────┘                      └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`atom`] - Typed atom encoding of message payloads
//! - [`message`] - Message framing
//! - [`stack`] - Platform Bluetooth seam
//! - `bluez` - BlueZ implementation of the seam (Linux, `bluez` feature)
//! - [`transport`] - Byte channel to the server
//! - [`handshake`] - Client info / player info exchange
//! - [`scanner`] - Device and service discovery
//! - [`connection`] - Connection lifecycle

pub mod atom;
#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod bluez;
pub mod connection;
pub mod handshake;
pub mod message;
pub mod scanner;
pub mod stack;
pub mod transport;

pub use connection::{Connection, ConnectionConfig};
pub use scanner::{DeviceScanner, ScanConfig, ScanHandle, ScanOutcome};
pub use stack::{platform_stack, BluetoothStack, UnavailableStack};
