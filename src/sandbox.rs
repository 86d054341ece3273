//! Execution sandbox: runs one translated instruction sequence against the
//! connection manager, with cooperative cancellation and a guaranteed
//! actuator shutdown whenever the run ends, for any reason.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{CommandFrame, LightColor, MotorPort};
use crate::connection::{ConnectionManager, LinkState};
use crate::diag::DiagnosticLog;
use crate::error::CoreError;
use crate::telemetry::TelemetryStore;

/// Sensors readable from a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorId {
    Motion,
    Tilt,
    Light,
    Button,
    Battery,
}

/// The closed instruction set the sandbox interprets. Produced by the
/// external program editor; the sandbox never evaluates program text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    SetMotor { port: MotorPort, power: i32 },
    SetLight { color: LightColor },
    Wait { duration: Duration },
    ReadSensor { id: SensorId },
}

/// One sensor value observed by a `ReadSensor` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    pub id: SensorId,
    pub value: i32,
}

/// Terminal result of a run. Every outcome is preceded by the shutdown
/// sequence; a motor is never left running after the run reports done.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every instruction ran.
    Completed { readings: Vec<SensorReading> },
    /// Stopped by the user. Intentional, not an error.
    Cancelled,
    /// The device link went away mid-run.
    ConnectionLost,
    /// An instruction failed.
    Failed { error: CoreError },
}

/// Why a session was asked to stop early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    User,
    LinkLost,
}

/// State shared between the run task, `stop()`, and the link watcher.
struct SessionShared {
    cancel: CancellationToken,
    stop_cause: StdMutex<Option<StopCause>>,
    /// Last commanded power per touched motor port.
    motors: StdMutex<BTreeMap<MotorPort, i32>>,
    /// Last commanded light color, if the run changed the light.
    light: StdMutex<Option<LightColor>>,
    /// Exactly-once guard for the shutdown sequence.
    shutdown_done: AtomicBool,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            stop_cause: StdMutex::new(None),
            motors: StdMutex::new(BTreeMap::new()),
            light: StdMutex::new(None),
            shutdown_done: AtomicBool::new(false),
        }
    }

    /// First cause wins; later triggers only re-cancel the token.
    fn request_stop(&self, cause: StopCause) {
        {
            let mut slot = self
                .stop_cause
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.cancel.cancel();
    }

    fn stop_cause(&self) -> Option<StopCause> {
        *self
            .stop_cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_motor(&self, port: MotorPort, power: i32) {
        self.motors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port, power);
    }

    fn record_light(&self, color: LightColor) {
        *self.light.lock().unwrap_or_else(PoisonError::into_inner) = Some(color);
    }

    /// Ports whose last commanded power is nonzero, in port order.
    fn motors_to_halt(&self) -> Vec<MotorPort> {
        self.motors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, power)| **power != 0)
            .map(|(port, _)| *port)
            .collect()
    }

    /// Whether the light was changed and left on.
    fn light_needs_off(&self) -> bool {
        matches!(
            *self.light.lock().unwrap_or_else(PoisonError::into_inner),
            Some(color) if color != LightColor::Off
        )
    }
}

/// Handle to a running program; `wait()` yields the terminal outcome.
pub struct RunHandle {
    handle: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub async fn wait(self) -> RunOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Failed {
                error: CoreError::Link(anyhow::anyhow!("run task failed: {e}")),
            },
        }
    }
}

/// Runs one instruction sequence at a time. A second `start()` while a
/// session is active is rejected with `Busy`, never queued.
pub struct ExecutionSandbox {
    manager: Arc<ConnectionManager>,
    telemetry: TelemetryStore,
    diag: DiagnosticLog,
    active: Mutex<Option<Arc<SessionShared>>>,
}

impl ExecutionSandbox {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let telemetry = manager.telemetry();
        let diag = manager.diag();
        Self {
            manager,
            telemetry,
            diag,
            active: Mutex::new(None),
        }
    }

    /// Whether a session is currently active.
    pub async fn is_running(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Begin interpreting `instructions` in order. Fails with `Busy` while a
    /// session is active and `NotConnected` without a live link.
    pub async fn start(
        self: &Arc<Self>,
        instructions: Vec<Instruction>,
    ) -> Result<RunHandle, CoreError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CoreError::Busy);
        }
        if self.manager.state().await != LinkState::Connected {
            return Err(CoreError::NotConnected);
        }

        let session = Arc::new(SessionShared::new());
        *active = Some(Arc::clone(&session));
        drop(active);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(session, instructions).await });
        Ok(RunHandle { handle })
    }

    /// Cancel the active session, if any, and immediately issue the shutdown
    /// sequence so actuators halt without waiting for the run loop to notice.
    /// A no-op when nothing is running.
    pub async fn stop(&self) {
        let session = self.active.lock().await.clone();
        let Some(session) = session else {
            return;
        };
        session.request_stop(StopCause::User);
        self.shutdown(&session).await;
    }

    async fn run(
        self: Arc<Self>,
        session: Arc<SessionShared>,
        instructions: Vec<Instruction>,
    ) -> RunOutcome {
        self.diag
            .info(format!("program started, {} instructions", instructions.len()));

        // Cancel the session with cause LinkLost the moment the manager
        // leaves Connected.
        let mut connected = self.manager.watch_connected();
        let watcher_session = Arc::clone(&session);
        let watcher = tokio::spawn(async move {
            loop {
                if !*connected.borrow() {
                    watcher_session.request_stop(StopCause::LinkLost);
                    return;
                }
                if connected.changed().await.is_err() {
                    return;
                }
            }
        });

        let mut readings = Vec::new();
        let mut failure = None;

        for instruction in instructions {
            if session.cancel.is_cancelled() {
                break;
            }
            match self.step(&session, instruction, &mut readings).await {
                Ok(()) => {}
                Err(CoreError::Cancelled) => break,
                Err(CoreError::NotConnected) => {
                    session.request_stop(StopCause::LinkLost);
                    break;
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        watcher.abort();
        self.shutdown(&session).await;

        {
            let mut active = self.active.lock().await;
            if active
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &session))
            {
                *active = None;
            }
        }

        if let Some(error) = failure {
            self.diag.error(format!("program failed: {error}"));
            return RunOutcome::Failed { error };
        }
        match session.stop_cause() {
            Some(StopCause::User) => {
                self.diag.info("program stopped");
                RunOutcome::Cancelled
            }
            Some(StopCause::LinkLost) => {
                self.diag.error("program aborted: connection lost");
                RunOutcome::ConnectionLost
            }
            None if session.cancel.is_cancelled() => RunOutcome::Cancelled,
            None => {
                self.diag.success("program completed");
                RunOutcome::Completed { readings }
            }
        }
    }

    /// Execute one instruction. Sends and waits are suspension points; the
    /// cancellation token wins any race against them.
    async fn step(
        &self,
        session: &SessionShared,
        instruction: Instruction,
        readings: &mut Vec<SensorReading>,
    ) -> Result<(), CoreError> {
        match instruction {
            Instruction::SetMotor { port, power } => {
                // Recorded before the send so the shutdown sequence covers a
                // frame that may have reached the device.
                session.record_motor(port, power.clamp(-100, 100));
                let frame = CommandFrame::motor(port, power);
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => Err(CoreError::Cancelled),
                    result = self.manager.send(&frame) => result,
                }
            }
            Instruction::SetLight { color } => {
                session.record_light(color);
                let frame = CommandFrame::light(color);
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => Err(CoreError::Cancelled),
                    result = self.manager.send(&frame) => result,
                }
            }
            Instruction::Wait { duration } => {
                tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => Err(CoreError::Cancelled),
                    () = tokio::time::sleep(duration) => Ok(()),
                }
            }
            Instruction::ReadSensor { id } => {
                let snapshot = self.telemetry.snapshot().await;
                let value = match id {
                    SensorId::Motion => snapshot.motion,
                    SensorId::Tilt => snapshot.tilt as i32,
                    SensorId::Light => i32::from(snapshot.light_level),
                    SensorId::Button => i32::from(snapshot.button),
                    SensorId::Battery => i32::from(snapshot.battery),
                };
                debug!(?id, value, "sensor read");
                readings.push(SensorReading { id, value });
                Ok(())
            }
        }
    }

    /// Issue zero-power for every port the run left running and switch the
    /// light off if the run left it on. Runs exactly once per session no
    /// matter how many termination triggers fire; failures (e.g.
    /// `NotConnected` after link loss) are logged, never raised.
    async fn shutdown(&self, session: &SessionShared) {
        if session.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        for port in session.motors_to_halt() {
            let frame = CommandFrame::motor(port, 0);
            if let Err(e) = self.manager.send(&frame).await {
                warn!(?port, "shutdown: motor halt failed: {e}");
                self.diag
                    .error(format!("shutdown: motor {port:?} halt failed: {e}"));
            }
        }
        if session.light_needs_off() {
            let frame = CommandFrame::light(LightColor::Off);
            if let Err(e) = self.manager.send(&frame).await {
                warn!("shutdown: light off failed: {e}");
                self.diag.error(format!("shutdown: light off failed: {e}"));
            }
        }
    }
}
