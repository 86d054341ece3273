//! In-memory loopback transport for tests and hardware-free development.
//!
//! Plays the role of a device on the other end of the link: frames written
//! through the [`DeviceLink`] are captured in write order, and tests inject
//! notification frames or sever the link through [`LoopbackDevice`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

use super::traits::{DeviceLink, LinkConnector, LinkHandles};

/// Notification channel depth; mirrors what a BLE stack would buffer.
const NOTIFY_BUFFER: usize = 32;

/// Shared fake-device state, observable from tests.
#[derive(Default)]
pub struct LoopbackDevice {
    written: Mutex<Vec<Bytes>>,
    notify_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    refuse: AtomicBool,
    connects: AtomicU32,
}

impl LoopbackDevice {
    /// All frames written since creation, in wire order.
    pub fn written(&self) -> Vec<Bytes> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of frames written so far.
    pub fn written_count(&self) -> usize {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// How many times a connect has succeeded.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make subsequent connect attempts fail (device out of range).
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Push a notification frame to the current session, if any.
    pub async fn notify(&self, frame: &[u8]) {
        let tx = self
            .notify_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = tx {
            let _ = tx.send(Bytes::copy_from_slice(frame)).await;
        }
    }

    /// Sever the current link without an explicit disconnect, as if the
    /// device went out of range.
    pub fn drop_link(&self) {
        self.notify_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Connector producing links against a shared [`LoopbackDevice`].
#[derive(Clone)]
pub struct LoopbackConnector {
    device: Arc<LoopbackDevice>,
}

impl LoopbackConnector {
    pub fn new() -> (Self, Arc<LoopbackDevice>) {
        let device = Arc::new(LoopbackDevice::default());
        (
            Self {
                device: device.clone(),
            },
            device,
        )
    }
}

#[async_trait]
impl LinkConnector for LoopbackConnector {
    async fn connect(&self) -> Result<LinkHandles> {
        if self.device.refuse.load(Ordering::SeqCst) {
            bail!("device unreachable");
        }
        let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
        // A fresh notification channel per session; any previous one closes.
        *self
            .device
            .notify_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        self.device.connects.fetch_add(1, Ordering::SeqCst);

        Ok(LinkHandles {
            link: Arc::new(LoopbackLink {
                device: self.device.clone(),
                open: AtomicBool::new(true),
            }),
            notifications: rx,
        })
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

/// Write half of a loopback session.
pub struct LoopbackLink {
    device: Arc<LoopbackDevice>,
    open: AtomicBool,
}

#[async_trait]
impl DeviceLink for LoopbackLink {
    async fn write(&self, frame: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            bail!("link closed");
        }
        self.device
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Bytes::copy_from_slice(frame));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.device.drop_link();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_are_captured_in_write_order() {
        let (connector, device) = LoopbackConnector::new();
        let handles = connector.connect().await.unwrap();

        handles.link.write(&[0x01]).await.unwrap();
        handles.link.write(&[0x02]).await.unwrap();
        handles.link.write(&[0x03]).await.unwrap();

        let written = device.written();
        assert_eq!(written.len(), 3);
        assert_eq!(&written[0][..], &[0x01]);
        assert_eq!(&written[2][..], &[0x03]);
    }

    #[tokio::test]
    async fn closing_ends_the_notification_stream_and_writes() {
        let (connector, _device) = LoopbackConnector::new();
        let mut handles = connector.connect().await.unwrap();

        handles.link.close().await.unwrap();
        assert!(handles.notifications.recv().await.is_none());
        assert!(handles.link.write(&[0x01]).await.is_err());
    }

    #[tokio::test]
    async fn dropped_link_closes_notifications() {
        let (connector, device) = LoopbackConnector::new();
        let mut handles = connector.connect().await.unwrap();

        device.notify(&[0x05, 0x00, 0x01]).await;
        device.drop_link();

        assert_eq!(
            handles.notifications.recv().await.as_deref(),
            Some(&[0x05u8, 0x00, 0x01][..])
        );
        assert!(handles.notifications.recv().await.is_none());
    }

    #[tokio::test]
    async fn refused_connect_fails() {
        let (connector, device) = LoopbackConnector::new();
        device.set_refuse(true);
        assert!(connector.connect().await.is_err());
        assert_eq!(device.connect_count(), 0);

        device.set_refuse(false);
        assert!(connector.connect().await.is_ok());
        assert_eq!(device.connect_count(), 1);
    }
}
