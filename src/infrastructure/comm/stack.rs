//! Bluetooth Stack Seam
//!
//! Device inquiry, service record lookup and RFCOMM channel setup are
//! vendor specific. The rest of the subsystem only sees this trait; a
//! platform integration implements it and is injected into the scanner
//! and the connection.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Service class UUID the server registers in its SDP record
pub const SERVICE_UUID: &str = "025fe2ae-0762-4bed-90f2-d8d778f020fe";

/// Byte stream of an open channel
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Channel for T {}

pub type BoxedChannel = Box<dyn Channel>;

/// A device that answered an inquiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub address: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait BluetoothStack: Send + Sync {
    /// Discover nearby devices
    async fn inquiry(&self) -> Result<Vec<RemoteDevice>>;

    /// Look up the RFCOMM channel of `service_uuid` on a device.
    ///
    /// `Ok(None)` means the device has no such service. An error means the
    /// lookup itself failed or is not supported by the local stack.
    async fn find_service(&self, address: &str, service_uuid: &str) -> Result<Option<u8>>;

    /// Open an RFCOMM channel
    async fn open_channel(&self, address: &str, channel: u8) -> Result<BoxedChannel>;
}

/// Bluetooth stack of this platform, or [`UnavailableStack`] if there is none.
///
/// `inquiry_window` is how long an inquiry listens for devices.
#[cfg(all(target_os = "linux", feature = "bluez"))]
pub async fn platform_stack(inquiry_window: Duration) -> Arc<dyn BluetoothStack> {
    match crate::infrastructure::comm::bluez::BluezStack::new(inquiry_window).await {
        Ok(stack) => Arc::new(stack),
        Err(e) => {
            tracing::warn!("Bluetooth unavailable: {}", e);
            Arc::new(UnavailableStack)
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "bluez")))]
pub async fn platform_stack(_inquiry_window: Duration) -> Arc<dyn BluetoothStack> {
    tracing::debug!("No Bluetooth integration built in");
    Arc::new(UnavailableStack)
}

/// Stack used when the platform has no Bluetooth integration
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableStack;

#[async_trait]
impl BluetoothStack for UnavailableStack {
    async fn inquiry(&self) -> Result<Vec<RemoteDevice>> {
        Err(Error::ConnectFailed("no Bluetooth stack available".to_string()))
    }

    async fn find_service(&self, _address: &str, _service_uuid: &str) -> Result<Option<u8>> {
        Err(Error::ServiceSearchFailed(
            "no Bluetooth stack available".to_string(),
        ))
    }

    async fn open_channel(&self, _address: &str, _channel: u8) -> Result<BoxedChannel> {
        Err(Error::ConnectFailed("no Bluetooth stack available".to_string()))
    }
}
