pub mod manager;

pub use manager::{ConnectionConfig, ConnectionManager, LinkState};
