//! One-time construction and wiring of the core components.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::connection::{ConnectionConfig, ConnectionManager, LinkState};
use crate::diag::{DiagnosticLog, LogEntry};
use crate::error::CoreError;
use crate::sandbox::{ExecutionSandbox, Instruction, RunHandle};
use crate::telemetry::{TelemetrySnapshot, TelemetryStore};
use crate::transport::{BleConfig, BleConnector, LinkConnector};

/// The assembled core: one connection manager, one execution sandbox, one
/// telemetry store, one diagnostic log. Construct it once at application
/// startup; all state lives here, not in globals.
pub struct DeviceCore {
    manager: Arc<ConnectionManager>,
    sandbox: Arc<ExecutionSandbox>,
    diag: DiagnosticLog,
}

impl DeviceCore {
    /// Wire the core against any transport.
    pub fn new(connector: Arc<dyn LinkConnector>, config: ConnectionConfig) -> Self {
        let diag = DiagnosticLog::new();
        let telemetry = TelemetryStore::new();
        let manager = Arc::new(ConnectionManager::new(
            connector,
            config,
            telemetry,
            diag.clone(),
        ));
        let sandbox = Arc::new(ExecutionSandbox::new(Arc::clone(&manager)));
        Self {
            manager,
            sandbox,
            diag,
        }
    }

    /// Wire the core against the real BLE hub.
    pub fn over_ble(ble: BleConfig, config: ConnectionConfig) -> Self {
        Self::new(Arc::new(BleConnector::new(ble)), config)
    }

    pub async fn connect(&self) -> Result<(), CoreError> {
        self.manager.connect().await
    }

    /// Cancels any running program (its shutdown sequence goes out while the
    /// link is still up), then closes the link. Idempotent.
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        self.sandbox.stop().await;
        self.manager.disconnect().await
    }

    pub async fn start(&self, instructions: Vec<Instruction>) -> Result<RunHandle, CoreError> {
        self.sandbox.start(instructions).await
    }

    pub async fn stop(&self) {
        self.sandbox.stop().await;
    }

    pub async fn snapshot(&self) -> TelemetrySnapshot {
        self.manager.telemetry().snapshot().await
    }

    pub async fn state(&self) -> LinkState {
        self.manager.state().await
    }

    /// Registration point for external log display.
    pub fn subscribe_log(&self) -> broadcast::Receiver<LogEntry> {
        self.diag.subscribe()
    }
}
