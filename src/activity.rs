//! Active-riding accumulator.
//!
//! The grade limiter relaxes its ceilings per *active* hour, not per
//! wall-clock hour. Riding counts as active while a trainer is connected or
//! the power meter reports a fresh reading above the threshold.
//!
//! The tracker is ticked periodically and turns elapsed active milliseconds
//! into whole seconds, carrying the remainder between ticks.

use crate::config::ACTIVE_POWER_THRESHOLD_W;

/// Riding state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ActivityState {
    Idle,
    Active,
}

/// Decide whether the rider is active right now.
pub fn is_active(trainer_connected: bool, fresh_power: Option<i16>) -> bool {
    trainer_connected || fresh_power.is_some_and(|p| p > ACTIVE_POWER_THRESHOLD_W)
}

pub struct ActivityTracker {
    state: ActivityState,
    last_tick_ms: Option<u64>,
    remainder_ms: u64,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub const fn new() -> Self {
        Self {
            state: ActivityState::Idle,
            last_tick_ms: None,
            remainder_ms: 0,
        }
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    /// Periodic tick; returns the whole active seconds since the previous one.
    ///
    /// Time between two ticks is credited according to the state observed
    /// at the later tick.
    pub fn tick(&mut self, now_ms: u64, active: bool) -> u32 {
        let new_state = if active {
            ActivityState::Active
        } else {
            ActivityState::Idle
        };
        if new_state != self.state {
            info!("activity: {:?} -> {:?}", self.state, new_state);
            self.state = new_state;
        }

        let elapsed = match self.last_tick_ms.replace(now_ms) {
            Some(last) => now_ms.saturating_sub(last),
            None => 0,
        };
        if !active {
            self.remainder_ms = 0;
            return 0;
        }

        let total = self.remainder_ms + elapsed;
        self.remainder_ms = total % 1000;
        (total / 1000).min(u32::MAX as u64) as u32
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
