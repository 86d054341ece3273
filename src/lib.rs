//! Device communication and program-execution core for WeDo-style BLE
//! robots.
//!
//! A user authors short actuator programs in an external block editor; that
//! editor hands this crate an ordered instruction list, and this crate runs
//! it against the physical hub over a BLE link:
//!
//! - [`codec`] — pure binary command/telemetry codec
//! - [`telemetry`] — latest decoded sensor snapshot
//! - [`connection`] — link lifecycle, send primitive, bounded reconnection
//! - [`sandbox`] — one run at a time, cooperative cancellation, guaranteed
//!   actuator shutdown
//! - [`diag`] — append-only event stream for external display
//! - [`transport`] — pluggable device links (BLE via BlueZ, in-memory
//!   loopback)
//!
//! [`DeviceCore`] wires the pieces together:
//!
//! ```no_run
//! use wedo_core::{BleConfig, ConnectionConfig, DeviceCore, Instruction, MotorPort};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), wedo_core::CoreError> {
//! let core = DeviceCore::over_ble(BleConfig::default(), ConnectionConfig::default());
//! core.connect().await?;
//! let run = core
//!     .start(vec![
//!         Instruction::SetMotor { port: MotorPort::A, power: 80 },
//!         Instruction::Wait { duration: Duration::from_millis(500) },
//!         Instruction::SetMotor { port: MotorPort::A, power: 0 },
//!     ])
//!     .await?;
//! let outcome = run.wait().await;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```
//!
//! Whatever ends a run — completion, error, `stop()`, or link loss — the
//! sandbox halts every actuator the run touched before reporting done.

pub mod codec;
pub mod connection;
pub mod device;
pub mod diag;
pub mod error;
pub mod sandbox;
pub mod telemetry;
pub mod transport;

pub use codec::{CommandFrame, FrameKind, LightColor, MotorPort, TiltDirection};
pub use connection::{ConnectionConfig, ConnectionManager, LinkState};
pub use device::DeviceCore;
pub use diag::{DiagnosticLog, LogEntry, LogKind};
pub use error::CoreError;
pub use sandbox::{
    ExecutionSandbox, Instruction, RunHandle, RunOutcome, SensorId, SensorReading,
};
pub use telemetry::{TelemetrySnapshot, TelemetryStore};
pub use transport::{BleConfig, BleConnector, LinkConnector, LoopbackConnector};
