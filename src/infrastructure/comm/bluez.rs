//! BlueZ Stack
//!
//! [`BluetoothStack`] on Linux through the BlueZ daemon. Inquiry runs a
//! discovery session for a fixed window and then lists every device the
//! adapter knows. RFCOMM channels are opened with kernel sockets.
//!
//! BlueZ publishes which service UUIDs a device offers but not the RFCOMM
//! channel behind them. A device advertising the service therefore makes
//! the lookup fail, which sends the failsafe strategy on to channel probing.

use crate::error::{Error, Result};
use crate::infrastructure::comm::stack::{BluetoothStack, BoxedChannel, RemoteDevice};
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, Address, Session, Uuid};
use std::time::Duration;
use tracing::{debug, info};

pub struct BluezStack {
    adapter: Adapter,
    inquiry_window: Duration,
}

impl BluezStack {
    /// Connect to the daemon and power up the default adapter
    pub async fn new(inquiry_window: Duration) -> Result<Self> {
        let session = Session::new().await.map_err(stack_error)?;
        let adapter = session.default_adapter().await.map_err(stack_error)?;
        adapter.set_powered(true).await.map_err(stack_error)?;
        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(Self {
            adapter,
            inquiry_window,
        })
    }
}

#[async_trait]
impl BluetoothStack for BluezStack {
    async fn inquiry(&self) -> Result<Vec<RemoteDevice>> {
        {
            // discovery stays active while the event stream is alive
            let _discovery = self.adapter.discover_devices().await.map_err(stack_error)?;
            tokio::time::sleep(self.inquiry_window).await;
        }

        let mut found = Vec::new();
        for address in self.adapter.device_addresses().await.map_err(stack_error)? {
            let name = match self.adapter.device(address) {
                Ok(device) => device.name().await.ok().flatten(),
                Err(_) => None,
            };
            found.push(RemoteDevice {
                address: plain_address(address),
                name,
            });
        }
        debug!("BlueZ knows {} devices", found.len());
        Ok(found)
    }

    async fn find_service(&self, address: &str, service_uuid: &str) -> Result<Option<u8>> {
        let uuid = Uuid::parse_str(service_uuid)
            .map_err(|e| Error::ServiceSearchFailed(format!("bad service UUID: {}", e)))?;
        let device = self
            .adapter
            .device(parse_address(address)?)
            .map_err(|e| Error::ServiceSearchFailed(e.to_string()))?;
        let uuids = device
            .uuids()
            .await
            .map_err(|e| Error::ServiceSearchFailed(e.to_string()))?;

        match uuids {
            Some(uuids) if !uuids.contains(&uuid) => Ok(None),
            Some(_) => Err(Error::ServiceSearchFailed(
                "service present but its channel is not published".to_string(),
            )),
            None => Err(Error::ServiceSearchFailed(
                "service list not resolved".to_string(),
            )),
        }
    }

    async fn open_channel(&self, address: &str, channel: u8) -> Result<BoxedChannel> {
        let target = SocketAddr::new(parse_address(address)?, channel);
        let stream = Stream::connect(target)
            .await
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        Ok(Box::new(stream))
    }
}

fn stack_error(e: bluer::Error) -> Error {
    Error::ConnectFailed(format!("BlueZ: {}", e))
}

/// `001122AABBCC` into an adapter address
fn parse_address(address: &str) -> Result<Address> {
    crate::domain::models::validate_bluetooth_address(address)?;
    let mut bytes = [0u8; 6];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&address[i * 2..i * 2 + 2], 16)
            .map_err(|_| Error::InvalidDevice(format!("bad address {}", address)))?;
    }
    Ok(Address::new(bytes))
}

fn plain_address(address: Address) -> String {
    address.0.iter().map(|b| format!("{:02X}", b)).collect()
}
