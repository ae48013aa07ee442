//! Device Scanner Module
//!
//! Turns a configured [`Device`] into connectable [`DeviceDescriptor`]s
//! according to its search strategy:
//!
//! - `Scan`: inquiry, then service record lookup on every candidate.
//!   Devices without the service are left out.
//! - `ScanFailsafe`: like `Scan`, but when the lookup fails the fallback
//!   channels are probed in order and the first one that completes a
//!   handshake is used.
//! - `Manual`: no radio activity, the configured address and port are used.

use crate::domain::models::{
    Device, DeviceDescriptor, DeviceKind, SearchStrategy, ServiceEndpoint, MAX_RFCOMM_CHANNEL,
};
use crate::error::{Error, Result};
use crate::infrastructure::comm::handshake::{self, HandshakeConfig};
use crate::infrastructure::comm::stack::{BluetoothStack, RemoteDevice, SERVICE_UUID};
use crate::infrastructure::comm::transport::{BluetoothTransport, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub service_uuid: String,
    /// Channels probed in order by the failsafe strategy
    pub fallback_channels: Vec<u8>,
    pub inquiry_timeout: Duration,
    /// Bound for each service lookup and each channel probe
    pub probe_timeout: Duration,
    pub handshake: HandshakeConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID.to_string(),
            fallback_channels: vec![1, 5, 10],
            inquiry_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            handshake: HandshakeConfig::default(),
        }
    }
}

/// Final result of a background scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Possibly empty list of devices offering the service
    Devices(Vec<DeviceDescriptor>),
    Failed(Error),
}

#[derive(Clone)]
pub struct DeviceScanner {
    stack: Arc<dyn BluetoothStack>,
    config: ScanConfig,
}

impl DeviceScanner {
    pub fn new(stack: Arc<dyn BluetoothStack>, config: ScanConfig) -> Self {
        Self { stack, config }
    }

    /// Start a scan in the background.
    ///
    /// The returned handle yields exactly one outcome, unless the scan is
    /// cancelled first, in which case it yields none.
    pub fn start_scan(&self, device: Device) -> ScanHandle {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));

        let scanner = self.clone();
        let flag = cancelled.clone();
        let task = tokio::spawn(async move {
            let outcome = match scanner.scan(&device).await {
                Ok(devices) => ScanOutcome::Devices(devices),
                Err(e) => ScanOutcome::Failed(e),
            };
            if !flag.load(Ordering::SeqCst) {
                let _ = tx.send(outcome);
            }
        });

        ScanHandle {
            task,
            outcome: Some(rx),
            cancelled,
        }
    }

    /// Find descriptors for `device` according to its search strategy
    pub async fn scan(&self, device: &Device) -> Result<Vec<DeviceDescriptor>> {
        match device.effective_search() {
            SearchStrategy::Manual => Ok(vec![manual_descriptor(device)?]),
            strategy => self.discover(device, strategy).await,
        }
    }

    async fn discover(
        &self,
        device: &Device,
        strategy: SearchStrategy,
    ) -> Result<Vec<DeviceDescriptor>> {
        info!("Scanning for devices ({:?})", strategy);
        let found = tokio::time::timeout(self.config.inquiry_timeout, self.stack.inquiry())
            .await
            .map_err(|_| Error::Timeout)??;
        debug!("Inquiry returned {} devices", found.len());

        let mut results = Vec::new();
        for remote in found {
            if !device.address.is_empty() && !remote.address.eq_ignore_ascii_case(&device.address)
            {
                continue;
            }
            if let Some(channel) = self.locate_service(&remote, strategy).await {
                info!("Found service on {} channel {}", remote.address, channel);
                results.push(DeviceDescriptor::new(
                    remote.address,
                    remote.name,
                    ServiceEndpoint::Rfcomm(channel),
                ));
            }
        }
        Ok(results)
    }

    /// Channel of the service on `remote`, if it has one.
    ///
    /// Failures here only exclude the one device from the results.
    async fn locate_service(&self, remote: &RemoteDevice, strategy: SearchStrategy) -> Option<u8> {
        let lookup = self
            .stack
            .find_service(&remote.address, &self.config.service_uuid);
        let error = match tokio::time::timeout(self.config.probe_timeout, lookup).await {
            Ok(Ok(Some(channel))) => return Some(channel),
            Ok(Ok(None)) => {
                debug!("{} does not offer the service", remote.address);
                return None;
            }
            Ok(Err(e)) => e,
            Err(_) => Error::Timeout,
        };

        if strategy != SearchStrategy::ScanFailsafe {
            warn!("Service search on {} failed: {}", remote.address, error);
            return None;
        }

        warn!(
            "Service search on {} failed ({}), probing channels {:?}",
            remote.address, error, self.config.fallback_channels
        );
        for &channel in &self.config.fallback_channels {
            match self.probe_channel(&remote.address, channel).await {
                Ok(()) => return Some(channel),
                Err(e) => debug!("Channel {} on {}: {}", channel, remote.address, e),
            }
        }
        None
    }

    /// Open `channel` and check that a server answers the handshake
    async fn probe_channel(&self, address: &str, channel: u8) -> Result<()> {
        let open = self.stack.open_channel(address, channel);
        let stream = tokio::time::timeout(self.config.probe_timeout, open)
            .await
            .map_err(|_| Error::Timeout)??;
        let mut transport = Transport::Bluetooth(BluetoothTransport::new(address, stream));
        let result = handshake::perform(&mut transport, &self.config.handshake).await;
        transport.close().await;
        result.map(|_| ())
    }
}

/// Descriptor for a device whose endpoint is configured explicitly
pub fn manual_descriptor(device: &Device) -> Result<DeviceDescriptor> {
    device.validate()?;
    let port = device
        .port
        .ok_or_else(|| Error::InvalidDevice("port missing".to_string()))?;
    let endpoint = match device.kind {
        DeviceKind::Bluetooth => {
            let channel = u8::try_from(port)
                .ok()
                .filter(|c| (1..=MAX_RFCOMM_CHANNEL).contains(c))
                .ok_or_else(|| Error::InvalidDevice(format!("bad channel {}", port)))?;
            ServiceEndpoint::Rfcomm(channel)
        }
        DeviceKind::Socket => ServiceEndpoint::Tcp(port),
    };
    Ok(DeviceDescriptor::new(
        device.address.clone(),
        device.name.clone(),
        endpoint,
    ))
}

/// Handle to a running background scan
pub struct ScanHandle {
    task: JoinHandle<()>,
    outcome: Option<oneshot::Receiver<ScanOutcome>>,
    cancelled: Arc<AtomicBool>,
}

impl ScanHandle {
    /// Stop the scan. No outcome is delivered afterwards.
    pub fn cancel(&mut self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("Scan cancelled");
        }
        self.task.abort();
        self.outcome = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for the outcome; `None` if the scan was cancelled
    pub async fn outcome(&mut self) -> Option<ScanOutcome> {
        let rx = self.outcome.take()?;
        let outcome = rx.await.ok()?;
        if self.is_cancelled() {
            return None;
        }
        Some(outcome)
    }
}

impl Drop for ScanHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
