//! Pane activity state machine.
//!
//! Status is derived from rolling snapshot hashes: a changing hash means
//! the pane is `running`, a stable hash means `ready`. Two stabilizers
//! prevent flapping:
//!
//! - a transition must persist for `transition_delay` before the emitted
//!   status flips; a flap to a different candidate restarts the timer;
//! - a `running` observation caused by the user's own keystroke echo is
//!   suppressed when input arrived within `input_ignore_window`.
//!
//! A state machine can be seeded from a persisted baseline so a daemon
//! restart does not reset `last_active_at` or the emitted status. The
//! seeded `last_active_at` survives the first post-restart sample even
//! when the current hash differs from the persisted one.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::report::PaneRuntimeBaseline;

// ---------------------------------------------------------------------------
// PaneStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaneStatus {
    Running,
    Ready,
    Unknown,
}

impl PaneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a persisted status string; anything unrecognized is `unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "ready" => Self::Ready,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for PaneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StatusFsm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StatusFsmOptions {
    /// How long a new candidate status must persist before it is emitted.
    pub transition_delay: Duration,
    /// Window after a user keystroke during which a hash change is treated
    /// as input echo rather than pane activity.
    pub input_ignore_window: Duration,
}

impl Default for StatusFsmOptions {
    fn default() -> Self {
        Self {
            transition_delay: Duration::from_millis(2000),
            input_ignore_window: Duration::from_millis(1500),
        }
    }
}

/// Result of one FSM tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTick {
    /// The emitted (stable) status after this sample.
    pub status: PaneStatus,
    /// Whether the snapshot hash changed relative to the previous sample.
    pub hash_changed: bool,
    /// True exactly when this sample flipped the emitted status from
    /// `running` to `ready`.
    pub ready_edge: bool,
    /// The FSM's activity timestamp after this sample.
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StatusFsm {
    opts: StatusFsmOptions,
    prev_hash: String,
    emitted: PaneStatus,
    candidate: PaneStatus,
    candidate_since: Option<DateTime<Utc>>,
    last_active_at: Option<DateTime<Utc>>,
    /// Baseline applied and not yet consumed by a sample.
    seeded: bool,
    /// At least one non-empty sample observed in this process lifetime.
    sampled: bool,
    /// Hash changed at least once in this process lifetime (gates
    /// ready-edge auto-completion against cold starts).
    armed: bool,
}

impl StatusFsm {
    pub fn new(opts: StatusFsmOptions) -> Self {
        Self {
            opts,
            prev_hash: String::new(),
            emitted: PaneStatus::Unknown,
            candidate: PaneStatus::Unknown,
            candidate_since: None,
            last_active_at: None,
            seeded: false,
            sampled: false,
            armed: false,
        }
    }

    /// Seed state from a persisted baseline. Only meaningful before the
    /// first sample.
    pub fn seed(&mut self, baseline: &PaneRuntimeBaseline) {
        if self.sampled {
            return;
        }
        self.prev_hash = baseline.snapshot_hash.clone();
        self.emitted = baseline.runtime_status;
        self.candidate = baseline.runtime_status;
        self.candidate_since = None;
        self.last_active_at = baseline.last_active_at;
        self.seeded = true;
    }

    pub fn emitted(&self) -> PaneStatus {
        self.emitted
    }

    pub fn last_active_at(&self) -> Option<DateTime<Utc>> {
        self.last_active_at
    }

    /// True once the pane's content has changed since process start.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Feed one snapshot hash sample.
    pub fn tick(
        &mut self,
        hash: &str,
        now: DateTime<Utc>,
        last_input: Option<DateTime<Utc>>,
    ) -> StatusTick {
        if hash.is_empty() {
            self.emitted = PaneStatus::Unknown;
            self.candidate = PaneStatus::Unknown;
            self.candidate_since = None;
            self.prev_hash.clear();
            return StatusTick {
                status: PaneStatus::Unknown,
                hash_changed: false,
                ready_edge: false,
                last_active_at: self.last_active_at,
            };
        }

        // Cold first sample: seed both emitted and candidate as running.
        if !self.sampled && !self.seeded {
            self.prev_hash = hash.to_owned();
            self.emitted = PaneStatus::Running;
            self.candidate = PaneStatus::Running;
            self.candidate_since = None;
            self.last_active_at = Some(now);
            self.sampled = true;
            return StatusTick {
                status: PaneStatus::Running,
                hash_changed: false,
                ready_edge: false,
                last_active_at: self.last_active_at,
            };
        }

        let consuming_seed = self.seeded && !self.sampled;
        self.sampled = true;
        self.seeded = false;

        let hash_changed = self.prev_hash != hash;
        self.prev_hash = hash.to_owned();

        if hash_changed && !consuming_seed {
            // Restart continuity: the seeded timestamp survives the first
            // post-restart sample even when the hash differs.
            self.last_active_at = Some(now);
            self.armed = true;
        }
        if self.last_active_at.is_none() {
            self.last_active_at = Some(now);
        }

        let mut observed = if hash_changed {
            PaneStatus::Running
        } else {
            PaneStatus::Ready
        };

        // Input-echo hysteresis: a fresh keystroke makes the pane look busy
        // for one or two captures. Hold the previously emitted state.
        if observed == PaneStatus::Running && self.emitted != PaneStatus::Running {
            if let Some(t) = last_input {
                let window = TimeDelta::from_std(self.opts.input_ignore_window)
                    .unwrap_or_else(|_| TimeDelta::zero());
                if now.signed_duration_since(t) <= window {
                    observed = self.emitted;
                }
            }
        }

        let mut ready_edge = false;
        if observed == self.emitted {
            self.candidate = observed;
            self.candidate_since = None;
        } else if self.candidate != observed {
            self.candidate = observed;
            self.candidate_since = Some(now);
        } else {
            let since = self.candidate_since.unwrap_or(now);
            let delay = TimeDelta::from_std(self.opts.transition_delay)
                .unwrap_or_else(|_| TimeDelta::zero());
            if now.signed_duration_since(since) >= delay {
                let was = self.emitted;
                self.emitted = observed;
                self.candidate_since = None;
                ready_edge = was == PaneStatus::Running && observed == PaneStatus::Ready;
            }
        }

        StatusTick {
            status: self.emitted,
            hash_changed,
            ready_edge,
            last_active_at: self.last_active_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
