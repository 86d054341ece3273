//! Append-only diagnostic log of frame and lifecycle events.
//!
//! The core emits structured [`LogEntry`] values for external display (a
//! console panel in the UI); it never requires a consumer to be present.
//! Entries fan out over a broadcast channel; a lagging consumer loses the
//! oldest entries, which is a display concern, not ours.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Category of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Error,
    Success,
    /// A command frame written to the device.
    TxFrame,
    /// A notification frame received from the device.
    RxFrame,
}

/// One immutable, timestamped log event.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub kind: LogKind,
    pub message: String,
    /// Raw frame bytes for TxFrame/RxFrame entries.
    pub frame: Option<Bytes>,
}

/// Handle to the diagnostic stream. Cheap to clone; all clones feed the same
/// subscribers.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    tx: broadcast::Sender<LogEntry>,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Register for every entry produced from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    pub(crate) fn info(&self, message: impl Into<String>) {
        self.append(LogKind::Info, message.into(), None);
    }

    pub(crate) fn error(&self, message: impl Into<String>) {
        self.append(LogKind::Error, message.into(), None);
    }

    pub(crate) fn success(&self, message: impl Into<String>) {
        self.append(LogKind::Success, message.into(), None);
    }

    pub(crate) fn tx_frame(&self, message: impl Into<String>, frame: Bytes) {
        self.append(LogKind::TxFrame, message.into(), Some(frame));
    }

    pub(crate) fn rx_frame(&self, frame: Bytes) {
        self.append(LogKind::RxFrame, format!("rx {}", hex(&frame)), Some(frame));
    }

    fn append(&self, kind: LogKind, message: String, frame: Option<Bytes>) {
        debug!(?kind, %message, "diag");
        // No subscribers is fine; the core never depends on consumers.
        let _ = self.tx.send(LogEntry {
            timestamp_ms: now_ms(),
            kind,
            message,
            frame,
        });
    }
}

/// Render frame bytes for display, e.g. `08 00 81 00 11 51 00 66`.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
