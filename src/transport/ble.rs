//! BLE GATT transport for the real device, built on BlueZ via `bluer`.
//!
//! The hub exposes one vendor service with a write-capable output
//! characteristic and a notify-capable sensor characteristic. All UUIDs and
//! discovery parameters are configurable because the vendor protocol has not
//! been confirmed against hardware.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session, Uuid};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::traits::{DeviceLink, LinkConnector, LinkHandles};

/// Vendor GATT service advertised by the hub.
pub const HUB_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);
/// Write-capable output characteristic (command frames).
pub const HUB_OUTPUT_UUID: Uuid = Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123);
/// Notify-capable sensor characteristic (telemetry frames).
pub const HUB_SENSOR_UUID: Uuid = Uuid::from_u128(0x00001525_1212_efde_1523_785feabcd123);

/// Notification channel depth between the GATT pump and the router.
const NOTIFY_BUFFER: usize = 32;

/// Configuration for BLE discovery and connection.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Vendor service to look for.
    pub service_uuid: Uuid,
    /// Output (write) characteristic within the service.
    pub output_char_uuid: Uuid,
    /// Sensor (notify) characteristic within the service.
    pub sensor_char_uuid: Uuid,
    /// Advertised name prefix to match during scanning.
    pub name_prefix: Option<String>,
    /// Known hub address; skips scanning when the device is reachable.
    pub known_address: Option<Address>,
    /// How long to scan before giving up.
    pub scan_duration: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: HUB_SERVICE_UUID,
            output_char_uuid: HUB_OUTPUT_UUID,
            sensor_char_uuid: HUB_SENSOR_UUID,
            name_prefix: Some("WeDo 2.0".into()),
            known_address: None,
            scan_duration: Duration::from_secs(10),
        }
    }
}

/// Connector that scans for the hub and opens a GATT session.
pub struct BleConnector {
    config: BleConfig,
}

impl BleConnector {
    pub fn new(config: BleConfig) -> Self {
        Self { config }
    }

    async fn adapter(&self) -> Result<Adapter> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    /// Find the hub: a known address wins, otherwise scan until a device
    /// matches by name prefix or advertised service.
    async fn discover(&self, adapter: &Adapter) -> Result<Device> {
        if let Some(addr) = self.config.known_address {
            if let Ok(device) = adapter.device(addr) {
                debug!(%addr, "using known hub address");
                return Ok(device);
            }
        }

        let events = adapter.discover_devices().await?;
        tokio::pin!(events);
        let scanned = timeout(self.config.scan_duration, async {
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(addr) = event {
                    let Ok(device) = adapter.device(addr) else {
                        continue;
                    };
                    if self.matches(&device).await {
                        info!(%addr, "hub found");
                        return Some(device);
                    }
                }
            }
            None
        })
        .await;

        match scanned {
            Ok(Some(device)) => Ok(device),
            _ => Err(anyhow!(
                "no hub found within {:?}",
                self.config.scan_duration
            )),
        }
    }

    async fn matches(&self, device: &Device) -> bool {
        if let Some(prefix) = &self.config.name_prefix {
            if let Ok(Some(name)) = device.name().await {
                if name.starts_with(prefix.as_str()) {
                    return true;
                }
            }
        }
        if let Ok(Some(uuids)) = device.uuids().await {
            if uuids.contains(&self.config.service_uuid) {
                return true;
            }
        }
        false
    }

    /// Locate a characteristic by UUID once services are resolved.
    async fn characteristic(&self, device: &Device, uuid: Uuid) -> Result<Characteristic> {
        // Service resolution can lag the connect slightly.
        for _ in 0..10 {
            for service in device.services().await? {
                if service.uuid().await? != self.config.service_uuid {
                    continue;
                }
                for characteristic in service.characteristics().await? {
                    if characteristic.uuid().await? == uuid {
                        return Ok(characteristic);
                    }
                }
            }
            sleep(Duration::from_millis(200)).await;
        }
        Err(anyhow!("characteristic {uuid} not found on hub"))
    }
}

#[async_trait]
impl LinkConnector for BleConnector {
    async fn connect(&self) -> Result<LinkHandles> {
        let adapter = self.adapter().await.context("bluetooth adapter")?;
        let device = self.discover(&adapter).await?;

        if !device.is_connected().await? {
            device.connect().await.context("gatt connect")?;
        }

        let output = self
            .characteristic(&device, self.config.output_char_uuid)
            .await?;
        let sensor = self
            .characteristic(&device, self.config.sensor_char_uuid)
            .await?;

        let notify = sensor.notify().await.context("subscribe notifications")?;
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        tokio::spawn(async move {
            tokio::pin!(notify);
            while let Some(frame) = notify.next().await {
                if tx.send(Bytes::from(frame)).await.is_err() {
                    break;
                }
            }
            // Stream end means the device went away; dropping `tx` closes
            // the channel and lets the router observe the loss.
            debug!("notification stream ended");
        });

        info!(address = %device.address(), "hub link open");
        Ok(LinkHandles {
            link: Arc::new(BleLink { device, output }),
            notifications: rx,
        })
    }

    fn name(&self) -> &'static str {
        "ble"
    }
}

/// Write half of an open GATT session.
pub struct BleLink {
    device: Device,
    output: Characteristic,
}

#[async_trait]
impl DeviceLink for BleLink {
    async fn write(&self, frame: &[u8]) -> Result<()> {
        self.output.write(frame).await.context("gatt write")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self.device.disconnect().await {
            warn!("gatt disconnect failed: {e}");
        }
        Ok(())
    }
}
