//! Shared telemetry snapshot, written by the notification router and read
//! by any number of consumers.

use std::sync::Arc;
use tokio::sync::RwLock;

use crate::codec::{LightColor, TelemetryUpdate, TiltDirection};

/// Latest known sensor readings. Fields default to zero/false/none until the
/// device reports otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TelemetrySnapshot {
    /// Motion sensor level.
    pub motion: i32,
    /// Tilt sensor direction.
    pub tilt: TiltDirection,
    /// Ambient light level, 0-100.
    pub light_level: u8,
    /// Hub button state.
    pub button: bool,
    /// Battery level, 0-100.
    pub battery: u8,
    /// Last color commanded to the hub light.
    pub light_color: LightColor,
}

/// Holds the current [`TelemetrySnapshot`].
///
/// Single writer by construction: only the connection manager's notification
/// router applies updates (and records outbound light changes). Updates are
/// per-field, last-write-wins.
#[derive(Debug, Clone, Default)]
pub struct TelemetryStore {
    inner: Arc<RwLock<TelemetrySnapshot>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one decoded field update.
    pub async fn apply(&self, update: TelemetryUpdate) {
        let mut snap = self.inner.write().await;
        match update {
            TelemetryUpdate::Motion(level) => snap.motion = level,
            TelemetryUpdate::Tilt(direction) => snap.tilt = direction,
            TelemetryUpdate::LightLevel(level) => snap.light_level = level,
            TelemetryUpdate::Battery(level) => snap.battery = level,
            TelemetryUpdate::Button(pressed) => snap.button = pressed,
        }
    }

    /// Record the color last sent to the hub light.
    pub async fn record_light_color(&self, color: LightColor) {
        self.inner.write().await.light_color = color;
    }

    /// Current immutable copy for read-only consumption.
    pub async fn snapshot(&self) -> TelemetrySnapshot {
        *self.inner.read().await
    }

    /// Reset all fields to defaults. Called when a fresh link comes up.
    pub async fn reset(&self) {
        *self.inner.write().await = TelemetrySnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_at_defaults() {
        let store = TelemetryStore::new();
        let snap = store.snapshot().await;
        assert_eq!(snap, TelemetrySnapshot::default());
        assert_eq!(snap.motion, 0);
        assert_eq!(snap.tilt, TiltDirection::None);
        assert!(!snap.button);
    }

    #[tokio::test]
    async fn updates_are_per_field_last_write_wins() {
        let store = TelemetryStore::new();
        store.apply(TelemetryUpdate::Motion(12)).await;
        store.apply(TelemetryUpdate::Battery(90)).await;
        store.apply(TelemetryUpdate::Motion(-3)).await;

        let snap = store.snapshot().await;
        assert_eq!(snap.motion, -3);
        assert_eq!(snap.battery, 90);
        // untouched fields keep their defaults
        assert_eq!(snap.light_level, 0);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let store = TelemetryStore::new();
        store.apply(TelemetryUpdate::Button(true)).await;
        store.record_light_color(LightColor::Red).await;
        store.reset().await;
        assert_eq!(store.snapshot().await, TelemetrySnapshot::default());
    }
}
