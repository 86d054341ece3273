pub mod ble;
pub mod loopback;
pub mod traits;

pub use ble::{BleConfig, BleConnector, HUB_OUTPUT_UUID, HUB_SENSOR_UUID, HUB_SERVICE_UUID};
pub use loopback::{LoopbackConnector, LoopbackDevice};
pub use traits::{DeviceLink, LinkConnector, LinkHandles};
