//! Idle timer engine.
//!
//! Owns the countdown state machine: screen-on/off belief, the active
//! timeout, and at most one pending lock deadline. All state lives in a
//! single actor task; control calls and screen events arrive as messages
//! on one channel, so handler execution is serialized and a replaced or
//! cleared deadline can never fire.

use crate::privilege::{PrivilegeError, PrivilegeGate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// Normalized screen/user-presence event delivered by the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    /// Screen became interactive.
    ScreenOn,
    /// Screen turned off.
    ScreenOff,
    /// User unlocked or otherwise proved presence.
    UserPresent,
}

/// Message accepted by the engine actor.
#[derive(Debug)]
enum EngineMsg {
    Start(Duration),
    Stop,
    SetTimeout(Duration),
    Event(LockEvent),
}

/// Read-only projection of the engine state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    /// Whether idle monitoring is active.
    pub running: bool,
    /// Current idle timeout.
    pub timeout: Duration,
}

/// Cloneable handle to the engine actor.
///
/// All methods are synchronous and non-blocking; they enqueue a message for
/// the actor. `is_running` reads the mirrored status instead of asking the
/// actor, so it stays answerable even mid-transition.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineMsg>,
    status: watch::Receiver<EngineStatus>,
}

impl EngineHandle {
    /// Start (or restart) idle monitoring with the given timeout.
    ///
    /// Idempotent by replacement: when already running the new timeout takes
    /// effect immediately and the countdown restarts from now.
    pub fn start(&self, timeout: Duration) {
        self.send(EngineMsg::Start(timeout));
    }

    /// Stop idle monitoring. Safe to call when not running.
    pub fn stop(&self) {
        self.send(EngineMsg::Stop);
    }

    /// Update the idle timeout.
    ///
    /// When running with the screen on, the countdown restarts from now with
    /// the new duration, regardless of how long the previous arm had already
    /// waited.
    pub fn set_timeout(&self, timeout: Duration) {
        self.send(EngineMsg::SetTimeout(timeout));
    }

    /// Forward a screen/user-presence event to the engine.
    pub fn dispatch(&self, event: LockEvent) {
        self.send(EngineMsg::Event(event));
    }

    /// Whether the engine is currently monitoring.
    pub fn is_running(&self) -> bool {
        self.status.borrow().running
    }

    /// Watch channel mirroring `{running, timeout}`.
    pub fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    fn send(&self, msg: EngineMsg) {
        // Fails only when the actor is gone, i.e. during process teardown.
        if self.tx.send(msg).is_err() {
            debug!("Engine task no longer running, dropping message");
        }
    }
}

/// The engine actor state.
///
/// Invariant: `deadline.is_some()` exactly when `running && screen_on`.
pub struct IdleEngine {
    gate: Arc<dyn PrivilegeGate>,
    timeout: Duration,
    screen_on: bool,
    running: bool,
    deadline: Option<Instant>,
    status_tx: watch::Sender<EngineStatus>,
}

impl IdleEngine {
    /// Spawn the engine actor and return its handle.
    ///
    /// The actor lives for the rest of the process; `start`/`stop` toggle
    /// monitoring without restarting the task.
    pub fn spawn(gate: Arc<dyn PrivilegeGate>, default_timeout: Duration) -> EngineHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(EngineStatus {
            running: false,
            timeout: default_timeout,
        });

        let engine = Self {
            gate,
            timeout: default_timeout,
            screen_on: true,
            running: false,
            deadline: None,
            status_tx,
        };
        tokio::spawn(engine.run(rx));

        EngineHandle {
            tx,
            status: status_rx,
        }
    }

    /// Actor loop: serialize messages against the pending deadline.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                () = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.fire().await;
                }
            }
        }
        debug!("Engine actor shutting down");
    }

    fn handle(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Start(timeout) => {
                info!("Starting idle monitoring with timeout {:?}", timeout);
                self.timeout = timeout;
                self.running = true;
                self.rearm();
                self.publish();
            }
            EngineMsg::Stop => {
                if self.running {
                    info!("Stopping idle monitoring");
                }
                self.running = false;
                self.deadline = None;
                self.publish();
            }
            EngineMsg::SetTimeout(timeout) => {
                debug!("Timeout updated to {:?}", timeout);
                self.timeout = timeout;
                // Countdown restarts from now; with the screen off the new
                // value only takes effect on the next screen-on.
                self.rearm();
                self.publish();
            }
            EngineMsg::Event(event) => self.on_event(event),
        }
    }

    fn on_event(&mut self, event: LockEvent) {
        match event {
            LockEvent::ScreenOn => {
                self.screen_on = true;
                self.rearm();
            }
            LockEvent::ScreenOff => {
                self.screen_on = false;
                // No lock should fire while the screen is already off.
                self.deadline = None;
            }
            LockEvent::UserPresent => {
                self.rearm();
            }
        }
    }

    /// Replace the pending deadline with `now + timeout`, or clear it when
    /// not running or the screen is off. The old deadline is dropped first,
    /// so at most one pending fire exists at any time.
    fn rearm(&mut self) {
        if self.running && self.screen_on {
            let at = Instant::now() + self.timeout;
            debug!("Arming lock deadline in {:?}", self.timeout);
            self.deadline = Some(at);
        } else {
            self.deadline = None;
        }
    }

    /// Deadline elapsed. Fires at most once per arm and never rearms itself;
    /// the next arm comes from the next event or control call.
    async fn fire(&mut self) {
        self.deadline = None;

        // Screen state is rechecked at fire time, not arm time.
        if !self.screen_on {
            debug!("Deadline elapsed with screen off, ignoring");
            return;
        }

        info!("Idle timeout elapsed, locking screen");
        match self.gate.lock_now().await {
            Ok(()) => debug!("Lock issued"),
            Err(PrivilegeError::NotPrivileged) => {
                warn!("Cannot lock: admin privilege not active");
            }
            Err(e) => warn!("Lock failed: {}", e),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(EngineStatus {
            running: self.running,
            timeout: self.timeout,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time;

    /// Gate that records lock invocations against the (paused) clock.
    struct RecordingGate {
        active: AtomicBool,
        locks: Mutex<Vec<Instant>>,
        denied: AtomicU32,
    }

    impl RecordingGate {
        fn new(active: bool) -> Arc<Self> {
            Arc::new(Self {
                active: AtomicBool::new(active),
                locks: Mutex::new(Vec::new()),
                denied: AtomicU32::new(0),
            })
        }

        fn lock_count(&self) -> usize {
            self.locks.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PrivilegeGate for RecordingGate {
        async fn is_active(&self) -> bool {
            self.active.load(Ordering::Relaxed)
        }

        async fn request_activation(&self) -> Result<bool, PrivilegeError> {
            self.active.store(true, Ordering::Relaxed);
            Ok(true)
        }

        async fn lock_now(&self) -> Result<(), PrivilegeError> {
            if !self.active.load(Ordering::Relaxed) {
                self.denied.fetch_add(1, Ordering::Relaxed);
                return Err(PrivilegeError::NotPrivileged);
            }
            self.locks.lock().unwrap().push(Instant::now());
            Ok(())
        }

        async fn revoke(&self) {
            self.active.store(false, Ordering::Relaxed);
        }
    }

    /// Let the actor drain its mailbox without moving the clock.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    const MS: Duration = Duration::from_millis(1);

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once_after_timeout() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(1000 * MS);
        settle().await;
        assert!(engine.is_running());

        time::sleep(999 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 0);

        time::sleep(2 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);

        // No auto-rearm after firing.
        time::sleep(5000 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn user_present_resets_countdown() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(1000 * MS);
        settle().await;

        time::sleep(500 * MS).await;
        engine.dispatch(LockEvent::UserPresent);
        settle().await;

        // Original deadline at t=1000 must not fire.
        time::sleep(600 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 0);

        // Reset deadline at t=1500 does.
        time::sleep(500 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_timeout_rearms_from_now() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(5000 * MS);
        settle().await;
        engine.set_timeout(1000 * MS);
        settle().await;

        time::sleep(1100 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);

        // The stale 5000ms arm is gone.
        time::sleep(5000 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_timeout_than_elapsed_still_rearms() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(5000 * MS);
        settle().await;

        // 3s already spent waiting; the 1s update restarts from now anyway.
        time::sleep(3000 * MS).await;
        engine.set_timeout(1000 * MS);
        settle().await;

        time::sleep(900 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 0);
        time::sleep(200 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn screen_off_cancels_pending_fire() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(1000 * MS);
        settle().await;
        engine.dispatch(LockEvent::ScreenOff);
        settle().await;

        time::sleep(5000 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn screen_on_rearms_after_screen_off() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(1000 * MS);
        engine.dispatch(LockEvent::ScreenOff);
        settle().await;

        time::sleep(400 * MS).await;
        engine.dispatch(LockEvent::ScreenOn);
        settle().await;

        // Fresh countdown from the screen-on, not from start.
        time::sleep(900 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 0);
        time::sleep(200 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_stop_never_fires() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(1000 * MS);
        engine.stop();
        settle().await;
        assert!(!engine.is_running());

        time::sleep(10_000 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.stop();
        engine.stop();
        settle().await;
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn start_replaces_running_timeout() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(5000 * MS);
        settle().await;
        engine.start(1000 * MS);
        settle().await;

        time::sleep(1100 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
        time::sleep(5000 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn event_spam_leaves_one_pending_deadline() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(1000 * MS);
        settle().await;
        for _ in 0..50 {
            engine.dispatch(LockEvent::ScreenOn);
            engine.dispatch(LockEvent::UserPresent);
        }
        settle().await;

        time::sleep(1100 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events_ignored_while_stopped() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.dispatch(LockEvent::ScreenOn);
        engine.dispatch(LockEvent::UserPresent);
        settle().await;

        time::sleep(10_000 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 0);
        assert!(!engine.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn set_timeout_while_screen_off_defers_arming() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(1000 * MS);
        engine.dispatch(LockEvent::ScreenOff);
        engine.set_timeout(500 * MS);
        settle().await;

        time::sleep(2000 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 0);

        // New value applies on the next screen-on.
        engine.dispatch(LockEvent::ScreenOn);
        settle().await;
        time::sleep(600 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unprivileged_fire_is_not_fatal() {
        let gate = RecordingGate::new(false);
        let engine = IdleEngine::spawn(gate.clone(), 300 * MS);

        engine.start(1000 * MS);
        settle().await;
        time::sleep(1100 * MS).await;
        settle().await;

        assert_eq!(gate.lock_count(), 0);
        assert_eq!(gate.denied.load(Ordering::Relaxed), 1);
        assert!(engine.is_running());

        // Engine stays usable: grant privilege, re-arm, lock succeeds.
        gate.request_activation().await.unwrap();
        engine.dispatch(LockEvent::UserPresent);
        settle().await;
        time::sleep(1100 * MS).await;
        settle().await;
        assert_eq!(gate.lock_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_mirrors_running_and_timeout() {
        let gate = RecordingGate::new(true);
        let engine = IdleEngine::spawn(gate.clone(), 300_000 * MS);

        let status = engine.status();
        assert_eq!(
            *status.borrow(),
            EngineStatus {
                running: false,
                timeout: 300_000 * MS,
            }
        );

        engine.start(60_000 * MS);
        settle().await;
        assert_eq!(
            *status.borrow(),
            EngineStatus {
                running: true,
                timeout: 60_000 * MS,
            }
        );

        engine.stop();
        settle().await;
        assert!(!status.borrow().running);
    }
}
