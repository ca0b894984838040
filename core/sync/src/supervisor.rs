//! Root control loop.
//!
//! Owns the poll timer and wires detector → state machine → session. While
//! the session is down the detector keeps running so state stays current,
//! but publish/clear actions are dropped; a forced republish after
//! reconnect restores correctness. Reconnects retry forever at a fixed
//! delay; a missing host is transient, only a bad configuration is fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::detector::ProcessDetector;
use crate::payload;
use crate::session::{ConnectError, PresenceTransport, SessionError};
use crate::state_machine::{Action, ActivityStateMachine};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Wake-up slice of the scheduler loop; bounds shutdown latency and keeps
/// reconnect waits interruptible without a blocking sleep.
const SCHEDULER_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Running,
    Reconnecting,
}

pub struct SyncSupervisor<T: PresenceTransport> {
    config: Config,
    detector: ProcessDetector,
    machine: ActivityStateMachine,
    session: T,
    mode: Mode,
    connection_lost: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    last_logged_detection: Option<bool>,
}

impl<T: PresenceTransport> SyncSupervisor<T> {
    pub fn new(
        config: Config,
        detector: ProcessDetector,
        mut session: T,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let connection_lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connection_lost);
        session.on_disconnected(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));

        Self {
            config,
            detector,
            machine: ActivityStateMachine::new(),
            session,
            mode: Mode::Running,
            connection_lost,
            shutdown,
            last_logged_detection: None,
        }
    }

    /// Connects and drives the poll loop until shutdown is requested.
    ///
    /// A failed initial connect is surfaced to the caller and terminates the
    /// service: at startup an unreachable host is treated as a configuration
    /// fault, not a transient one.
    pub fn run(&mut self) -> Result<(), ConnectError> {
        self.session.connect()?;
        info!(
            interval_ms = self.config.poll_interval_ms,
            "Presence sync started"
        );

        let interval = self.config.poll_interval();
        // First tick fires immediately so state is established without
        // waiting one full interval.
        let mut next_tick = Instant::now();
        let mut next_retry = Instant::now();

        while !self.shutdown.load(Ordering::SeqCst) {
            if Instant::now() >= next_tick {
                let was_reconnecting = self.mode == Mode::Reconnecting;
                self.tick();
                next_tick = Instant::now() + interval;
                if !was_reconnecting && self.mode == Mode::Reconnecting {
                    next_retry = Instant::now() + RECONNECT_DELAY;
                }
            }

            if self.mode == Mode::Reconnecting && Instant::now() >= next_retry {
                if !self.try_reconnect() {
                    next_retry = Instant::now() + RECONNECT_DELAY;
                }
            }

            thread::sleep(SCHEDULER_SLICE);
        }

        info!("Shutting down presence sync");
        self.session.close();
        Ok(())
    }

    /// One poll cycle: detector → state machine → session, in that order.
    fn tick(&mut self) {
        self.session.poll();
        if self.connection_lost.swap(false, Ordering::SeqCst) {
            self.enter_reconnecting();
        }

        let detected = self.detector.check();
        self.log_detection_change(detected);

        let action = self.machine.transition(detected);
        self.apply(action, false);
    }

    /// Executes a state machine action against the session. Actions are
    /// dropped (not queued) while disconnected; the forced republish after
    /// reconnect recovers.
    fn apply(&mut self, action: Action, forced: bool) {
        match action {
            Action::None => {}
            Action::Publish => {
                if !self.session.is_connected() {
                    debug!("Dropping publish while disconnected");
                    return;
                }
                let activity = payload::build_activity(&self.config, self.machine.since());
                match self.session.publish(&activity) {
                    Ok(()) => info!(forced, "Presence published"),
                    Err(err) => self.handle_session_error("publish", err),
                }
            }
            Action::Clear => {
                if !self.session.is_connected() {
                    debug!("Dropping clear while disconnected");
                    return;
                }
                match self.session.clear() {
                    Ok(()) => info!("Presence cleared"),
                    Err(err) => self.handle_session_error("clear", err),
                }
            }
        }
    }

    fn handle_session_error(&mut self, operation: &str, err: SessionError) {
        warn!(error = %err, operation, "Presence operation failed");
        // The session fires the disconnect handler when an operation dies on
        // a closed socket; pick the flag up right away instead of waiting a
        // full tick.
        if self.connection_lost.swap(false, Ordering::SeqCst) {
            self.enter_reconnecting();
        }
    }

    fn enter_reconnecting(&mut self) {
        if self.mode == Mode::Reconnecting {
            return;
        }
        self.mode = Mode::Reconnecting;
        warn!(
            retry_secs = RECONNECT_DELAY.as_secs(),
            "Presence host connection lost, retrying"
        );
    }

    fn try_reconnect(&mut self) -> bool {
        match self.session.connect() {
            Ok(()) => {
                self.connection_lost.store(false, Ordering::SeqCst);
                self.mode = Mode::Running;
                info!(
                    epoch = self.session.session_epoch(),
                    "Reconnected to presence host"
                );
                let action = self.machine.force_republish();
                self.apply(action, true);
                true
            }
            Err(err) => {
                debug!(error = %err, "Reconnect attempt failed");
                false
            }
        }
    }

    fn log_detection_change(&mut self, detected: bool) {
        if self.last_logged_detection == Some(detected) {
            return;
        }
        if detected {
            info!("Figma detected");
        } else {
            info!("Figma not detected");
        }
        self.last_logged_detection = Some(detected);
    }
}
