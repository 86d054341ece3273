//! Connection manager: link lifecycle, send primitive, bounded reconnection.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::codec::{self, CommandFrame, FrameKind};
use crate::diag::{hex, DiagnosticLog};
use crate::error::CoreError;
use crate::telemetry::TelemetryStore;
use crate::transport::{DeviceLink, LinkConnector};
use bytes::Bytes;

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on a whole connect attempt (discovery + handshake).
    pub connect_timeout: Duration,
    /// Bound on a single frame write. A timed-out write is a failed write.
    pub write_timeout: Duration,
    /// Delay before the first reconnect attempt.
    pub reconnect_delay: Duration,
    /// Cap for the doubling reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Reconnect attempts after an unexpected link loss before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(8),
            max_reconnect_attempts: 3,
        }
    }
}

/// Externally visible lifecycle state of the single device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Internal session slot; the `Connected` variant owns the write handle.
enum SessionState {
    Disconnected,
    Connecting,
    Connected(Arc<dyn DeviceLink>),
}

impl SessionState {
    fn state(&self) -> LinkState {
        match self {
            SessionState::Disconnected => LinkState::Disconnected,
            SessionState::Connecting => LinkState::Connecting,
            SessionState::Connected(_) => LinkState::Connected,
        }
    }
}

/// Owns the device link lifecycle. At most one session exists at a time; a
/// new `connect()` after `disconnect()` always opens fresh channels.
pub struct ConnectionManager {
    connector: Arc<dyn LinkConnector>,
    config: ConnectionConfig,
    session: RwLock<SessionState>,
    /// Bumped on every connect and explicit disconnect so that a stale
    /// router task cannot trigger loss handling for a superseded session.
    generation: AtomicU64,
    /// Suppresses concurrent reconnect loops.
    reconnecting: AtomicBool,
    /// Serializes frame writes; program order is preserved on the wire.
    write_gate: Mutex<()>,
    connected_tx: watch::Sender<bool>,
    telemetry: TelemetryStore,
    diag: DiagnosticLog,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn LinkConnector>,
        config: ConnectionConfig,
        telemetry: TelemetryStore,
        diag: DiagnosticLog,
    ) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            connector,
            config,
            session: RwLock::new(SessionState::Disconnected),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            write_gate: Mutex::new(()),
            connected_tx,
            telemetry,
            diag,
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LinkState {
        self.session.read().await.state()
    }

    /// Watch channel that flips to `false` whenever the link goes away.
    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    pub fn telemetry(&self) -> TelemetryStore {
        self.telemetry.clone()
    }

    pub fn diag(&self) -> DiagnosticLog {
        self.diag.clone()
    }

    /// Open the device link. Rejects re-entrant calls; on any failure the
    /// session reverts to `Disconnected` and the cause is surfaced.
    pub async fn connect(self: &Arc<Self>) -> Result<(), CoreError> {
        {
            let mut session = self.session.write().await;
            match *session {
                SessionState::Connecting => return Err(CoreError::AlreadyConnecting),
                SessionState::Connected(_) => return Err(CoreError::AlreadyConnected),
                SessionState::Disconnected => *session = SessionState::Connecting,
            }
        }
        self.diag
            .info(format!("connecting via {}", self.connector.name()));

        let handles = match timeout(self.config.connect_timeout, self.connector.connect()).await {
            Ok(Ok(handles)) => handles,
            Ok(Err(e)) => {
                *self.session.write().await = SessionState::Disconnected;
                self.diag.error(format!("connection failed: {e:#}"));
                return Err(CoreError::Link(e));
            }
            Err(_) => {
                *self.session.write().await = SessionState::Disconnected;
                self.diag.error("connection attempt timed out");
                return Err(CoreError::Timeout("connect"));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.telemetry.reset().await;
        *self.session.write().await = SessionState::Connected(handles.link);
        self.connected_tx.send_replace(true);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.route_notifications(generation, handles.notifications)
                .await;
        });

        self.diag.success("device connected");
        Ok(())
    }

    /// Close the link. Idempotent; a no-op during a connect attempt (the
    /// attempt's own failure path cleans up). While `Disconnected` it still
    /// advances the session generation, which stands down any reconnect loop
    /// waiting out its backoff after a link loss.
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        let link = {
            let mut session = self.session.write().await;
            match std::mem::replace(&mut *session, SessionState::Disconnected) {
                SessionState::Connected(link) => link,
                SessionState::Connecting => {
                    *session = SessionState::Connecting;
                    return Ok(());
                }
                SessionState::Disconnected => {
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
            }
        };
        // Invalidate the router before closing so a closing notification
        // stream is not mistaken for link loss.
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.connected_tx.send_replace(false);
        if let Err(e) = link.close().await {
            warn!("link close failed: {e:#}");
        }
        self.diag.info("disconnected");
        Ok(())
    }

    /// Write one command frame to the output channel. Writes are serialized;
    /// no two frames interleave on the wire.
    pub async fn send(&self, frame: &CommandFrame) -> Result<(), CoreError> {
        let link = match &*self.session.read().await {
            SessionState::Connected(link) => Arc::clone(link),
            _ => return Err(CoreError::NotConnected),
        };

        let _gate = self.write_gate.lock().await;
        match timeout(self.config.write_timeout, link.write(frame.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.diag.error(format!("write failed: {e:#}"));
                return Err(CoreError::Link(e));
            }
            Err(_) => {
                self.diag.error("write timed out");
                return Err(CoreError::Timeout("write"));
            }
        }

        self.diag.tx_frame(
            format!("tx {:?} {}", frame.kind(), hex(frame.as_bytes())),
            frame.bytes(),
        );
        if let FrameKind::Light { color } = frame.kind() {
            self.telemetry.record_light_color(color).await;
        }
        Ok(())
    }

    /// Drain the notification channel into the telemetry store until the
    /// link goes away.
    async fn route_notifications(
        self: Arc<Self>,
        generation: u64,
        mut notifications: mpsc::Receiver<Bytes>,
    ) {
        while let Some(frame) = notifications.recv().await {
            self.diag.rx_frame(frame.clone());
            match codec::decode_notification(&frame) {
                Ok(update) => self.telemetry.apply(update).await,
                // Malformed frames are dropped, never raised: the device
                // cannot be asked to resend.
                Err(e) => {
                    debug!("dropped notification: {e}");
                    self.diag.info(format!("dropped notification: {e}"));
                }
            }
        }
        self.handle_link_loss(generation).await;
    }

    /// Called when a session's notification stream ends. A no-op for any
    /// session that was superseded or explicitly disconnected.
    async fn handle_link_loss(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut session = self.session.write().await;
            match *session {
                SessionState::Connected(_) => *session = SessionState::Disconnected,
                _ => return,
            }
        }
        self.connected_tx.send_replace(false);
        self.diag.error("device link lost");

        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(this.reconnect_loop(generation));
    }

    /// Bounded retry with doubling backoff; terminal failure once exhausted.
    /// Stands down if the session generation moves during a backoff, which
    /// means the loss was overtaken by an explicit disconnect or connect.
    ///
    /// Boxed: this future awaits `connect()`, which spawns the router task
    /// that in turn reaches this method on link loss. Boxing cuts that cycle
    /// of opaque future types.
    fn reconnect_loop(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut delay = self.config.reconnect_delay;
            for attempt in 1..=self.config.max_reconnect_attempts {
                sleep(delay).await;
                if self.generation.load(Ordering::SeqCst) != generation {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                self.diag.info(format!(
                    "reconnect attempt {attempt}/{}",
                    self.config.max_reconnect_attempts
                ));
                match self.connect().await {
                    Ok(()) => {
                        self.reconnecting.store(false, Ordering::SeqCst);
                        info!("reconnected after {attempt} attempt(s)");
                        return;
                    }
                    // someone else brought the link up during the backoff
                    Err(CoreError::AlreadyConnected | CoreError::AlreadyConnecting) => {
                        self.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(e) => {
                        self.diag.error(format!("reconnect failed: {e}"));
                        delay = std::cmp::min(delay * 2, self.config.max_reconnect_delay);
                    }
                }
            }
            self.reconnecting.store(false, Ordering::SeqCst);
            self.diag.error("reconnect attempts exhausted, giving up");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LightColor, MotorPort, TiltDirection};
    use crate::transport::{LoopbackConnector, LoopbackDevice};

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            max_reconnect_attempts: 3,
        }
    }

    fn manager() -> (Arc<ConnectionManager>, Arc<LoopbackDevice>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let (connector, device) = LoopbackConnector::new();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(connector),
            test_config(),
            TelemetryStore::new(),
            DiagnosticLog::new(),
        ));
        (manager, device)
    }

    #[tokio::test]
    async fn connect_reaches_connected_with_default_telemetry() {
        let (manager, _device) = manager();
        assert_eq!(manager.state().await, LinkState::Disconnected);

        manager.connect().await.unwrap();
        assert_eq!(manager.state().await, LinkState::Connected);

        let snap = manager.telemetry().snapshot().await;
        assert_eq!(snap.motion, 0);
        assert_eq!(snap.tilt, TiltDirection::None);
        assert_eq!(snap.light_level, 0);
        assert!(!snap.button);
        assert_eq!(snap.battery, 0);
    }

    #[tokio::test]
    async fn reentrant_connect_is_rejected() {
        let (manager, _device) = manager();
        manager.connect().await.unwrap();
        assert!(matches!(
            manager.connect().await,
            Err(CoreError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn failed_connect_reverts_to_disconnected() {
        let (manager, device) = manager();
        device.set_refuse(true);
        assert!(matches!(manager.connect().await, Err(CoreError::Link(_))));
        assert_eq!(manager.state().await, LinkState::Disconnected);

        // the failure does not poison the session; a later connect works
        device.set_refuse(false);
        manager.connect().await.unwrap();
        assert_eq!(manager.state().await, LinkState::Connected);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let (manager, device) = manager();
        let frame = CommandFrame::motor(MotorPort::A, 50);
        assert!(matches!(
            manager.send(&frame).await,
            Err(CoreError::NotConnected)
        ));
        assert_eq!(device.written_count(), 0);
    }

    #[tokio::test]
    async fn send_writes_frames_in_order() {
        let (manager, device) = manager();
        manager.connect().await.unwrap();

        let first = CommandFrame::motor(MotorPort::A, 80);
        let second = CommandFrame::motor(MotorPort::B, -30);
        manager.send(&first).await.unwrap();
        manager.send(&second).await.unwrap();

        let written = device.written();
        assert_eq!(written.len(), 2);
        assert_eq!(&written[0][..], first.as_bytes());
        assert_eq!(&written[1][..], second.as_bytes());
    }

    #[tokio::test]
    async fn light_send_records_last_color() {
        let (manager, _device) = manager();
        manager.connect().await.unwrap();

        manager
            .send(&CommandFrame::light(LightColor::Purple))
            .await
            .unwrap();
        let snap = manager.telemetry().snapshot().await;
        assert_eq!(snap.light_color, LightColor::Purple);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (manager, _device) = manager();
        manager.disconnect().await.unwrap();
        manager.connect().await.unwrap();
        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();
        assert_eq!(manager.state().await, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn notifications_update_telemetry() {
        let (manager, device) = manager();
        manager.connect().await.unwrap();

        device.notify(&[0x01, 0x00, 0x15]).await;
        device.notify(&[0x05, 0x00, 0x01]).await;
        sleep(Duration::from_millis(50)).await;

        let snap = manager.telemetry().snapshot().await;
        assert_eq!(snap.motion, 0x15);
        assert!(snap.button);
    }

    #[tokio::test]
    async fn malformed_notifications_leave_telemetry_untouched() {
        let (manager, device) = manager();
        manager.connect().await.unwrap();

        device.notify(&[0x01]).await; // truncated
        device.notify(&[0x7E, 0x00, 0x42]).await; // unknown type
        sleep(Duration::from_millis(50)).await;

        let snap = manager.telemetry().snapshot().await;
        assert_eq!(snap, crate::telemetry::TelemetrySnapshot::default());
        assert_eq!(manager.state().await, LinkState::Connected);
    }

    #[tokio::test]
    async fn link_loss_triggers_bounded_reconnect() {
        let (manager, device) = manager();
        manager.connect().await.unwrap();
        assert_eq!(device.connect_count(), 1);

        device.drop_link();
        sleep(Duration::from_millis(100)).await;

        // exactly one reconnect attempt succeeded
        assert_eq!(device.connect_count(), 2);
        assert_eq!(manager.state().await, LinkState::Connected);
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_max_attempts() {
        let (manager, device) = manager();
        manager.connect().await.unwrap();

        device.set_refuse(true);
        device.drop_link();
        // delays are 10/20/40 ms; give the loop time to exhaust itself
        sleep(Duration::from_millis(250)).await;

        assert_eq!(manager.state().await, LinkState::Disconnected);
        assert_eq!(device.connect_count(), 1);
        assert!(!manager.reconnecting.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disconnect_during_reconnect_backoff_cancels_it() {
        let (connector, device) = LoopbackConnector::new();
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(connector),
            ConnectionConfig {
                reconnect_delay: Duration::from_millis(100),
                ..test_config()
            },
            TelemetryStore::new(),
            DiagnosticLog::new(),
        ));
        manager.connect().await.unwrap();

        device.drop_link();
        // let the loss be observed, then disconnect while the loop is
        // still waiting out its first backoff
        sleep(Duration::from_millis(20)).await;
        manager.disconnect().await.unwrap();

        sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.state().await, LinkState::Disconnected);
        assert_eq!(device.connect_count(), 1);
        assert!(!manager.reconnecting.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn explicit_disconnect_does_not_reconnect() {
        let (manager, device) = manager();
        manager.connect().await.unwrap();
        manager.disconnect().await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(device.connect_count(), 1);
        assert_eq!(manager.state().await, LinkState::Disconnected);
    }
}
