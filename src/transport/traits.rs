//! Transport trait abstraction for pluggable device links.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// The write half of an open device link (the output channel).
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Write one command frame to the device.
    async fn write(&self, frame: &[u8]) -> Result<()>;

    /// Close the link. Further writes fail and the notification stream ends.
    async fn close(&self) -> Result<()>;
}

/// Everything a successful connect produces: the write handle plus the
/// notification stream. Handles are fresh per connect and never reused
/// across sessions.
pub struct LinkHandles {
    pub link: Arc<dyn DeviceLink>,
    /// Inbound notification frames in arrival order. The channel closing
    /// signals link loss.
    pub notifications: mpsc::Receiver<Bytes>,
}

/// Factory for opening device links.
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Discover the device and open fresh output/notification channels.
    async fn connect(&self) -> Result<LinkHandles>;

    /// Human-readable name for this transport.
    fn name(&self) -> &'static str;
}
