//! Edge-triggered activity state machine.
//!
//! Decides, per detector result, whether the presence host needs a publish,
//! a clear, or nothing. Actions fire only on phase changes; repeated
//! identical detector results are debounced to `None`.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
}

/// What the current tick requires of the presence session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Publish,
    Clear,
}

pub struct ActivityStateMachine {
    phase: Phase,
    since: DateTime<Utc>,
}

impl ActivityStateMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            since: Utc::now(),
        }
    }

    /// Feeds one detector result in, returning the required action.
    pub fn transition(&mut self, detected: bool) -> Action {
        match (self.phase, detected) {
            (Phase::Idle, true) => {
                self.phase = Phase::Active;
                self.since = Utc::now();
                Action::Publish
            }
            (Phase::Active, false) => {
                self.phase = Phase::Idle;
                self.since = Utc::now();
                Action::Clear
            }
            (Phase::Idle, false) | (Phase::Active, true) => Action::None,
        }
    }

    /// Re-emits `Publish` when `Active`, without touching `since`. Called
    /// after a reconnect so presence is restored without waiting for a
    /// detector edge.
    pub fn force_republish(&self) -> Action {
        match self.phase {
            Phase::Active => Action::Publish,
            Phase::Idle => Action::None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// When the current phase began. Publishes use this as the activity
    /// start timestamp.
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }
}

impl Default for ActivityStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
