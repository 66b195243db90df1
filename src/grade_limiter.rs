//! Adaptive grade limiter - thermal safety override for trainers.
//!
//! Some trainers overheat at high simulated grades and low speed, then
//! drop resistance abruptly ("thermal release"). The limiter keeps a
//! 50-bucket table of safe-grade ceilings over the restricted speed band
//! and clamps simulation grades to it:
//!
//! - **apply**: outside the band grades pass through; inside they are
//!   clamped to the bucket ceiling.
//! - **learn**: on a thermal release the bucket ceiling drops to 90 % of
//!   the grade that triggered it (never below the floor, never raised).
//! - **decay**: every accumulated hour of active riding, every bucket
//!   relaxes by 0.1 % back towards the initial ceiling.
//!
//! Speed is in 0.01 km/h and grade in 0.01 % (FTMS units).

use crate::config::{
    GradeLimitMode, GRADE_BUCKETS, GRADE_BUCKET_WIDTH, GRADE_DECAY_INTERVAL_SECS,
    GRADE_DECAY_STEP, GRADE_LEARN_PERCENT, GRADE_SPEED_MAX, GRADE_SPEED_MIN, MAX_GRADE_INITIAL,
    MIN_GRADE_FLOOR,
};
use crate::error::StorageError;

/// Serialized table size: 50 × i16 LE.
pub const TABLE_BLOB_SIZE: usize = GRADE_BUCKETS * 2;

/// Serialized activity counters: active seconds, seconds at last decay.
pub const ACTIVITY_BLOB_SIZE: usize = 8;

/// Active-time counters are persisted at least this often (active seconds).
const ACTIVITY_PERSIST_SECS: u32 = 600;

/// Outcome of [`GradeLimiter::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GradeDecision {
    pub requested: i16,
    pub applied: i16,
    pub limited: bool,
}

/// Bucket index for `speed`, or `None` outside the restricted band.
pub fn bucket_of(speed: u16) -> Option<usize> {
    if !(GRADE_SPEED_MIN..GRADE_SPEED_MAX).contains(&speed) {
        return None;
    }
    let bucket = ((speed - GRADE_SPEED_MIN) / GRADE_BUCKET_WIDTH) as usize;
    Some(bucket.min(GRADE_BUCKETS - 1))
}

/// Speed range `start..=end` covered by `bucket`.
pub fn bucket_range(bucket: usize) -> (u16, u16) {
    let start = GRADE_SPEED_MIN + bucket as u16 * GRADE_BUCKET_WIDTH;
    (start, start + GRADE_BUCKET_WIDTH - 1)
}

pub struct GradeLimiter {
    mode: GradeLimitMode,
    ceilings: [i16; GRADE_BUCKETS],
    active_seconds: u32,
    last_decay_at: u32,
    last_persisted_at: u32,
    table_dirty: bool,
    activity_dirty: bool,
}

impl GradeLimiter {
    pub const fn new(mode: GradeLimitMode) -> Self {
        Self {
            mode,
            ceilings: [MAX_GRADE_INITIAL; GRADE_BUCKETS],
            active_seconds: 0,
            last_decay_at: 0,
            last_persisted_at: 0,
            table_dirty: false,
            activity_dirty: false,
        }
    }

    pub fn mode(&self) -> GradeLimitMode {
        self.mode
    }

    /// Clamp `requested` for the current `speed`.
    pub fn apply(&self, speed: u16, requested: i16) -> GradeDecision {
        let ceiling = match self.mode {
            GradeLimitMode::Disabled => None,
            GradeLimitMode::HardClamp(max) => Some(max),
            GradeLimitMode::Adaptive => bucket_of(speed).map(|b| self.ceilings[b]),
        };

        match ceiling {
            Some(ceiling) if requested > ceiling => GradeDecision {
                requested,
                applied: ceiling,
                limited: true,
            },
            _ => GradeDecision {
                requested,
                applied: requested,
                limited: false,
            },
        }
    }

    /// Lower the ceiling for `speed` after a thermal release at `grade_at_release`.
    ///
    /// Returns true if the table changed (and must be persisted).
    pub fn learn(&mut self, speed: u16, grade_at_release: i16) -> bool {
        if self.mode != GradeLimitMode::Adaptive {
            return false;
        }
        let Some(bucket) = bucket_of(speed) else {
            debug!("grade: release at speed {} outside band, nothing learned", speed);
            return false;
        };

        let candidate = (grade_at_release as i32 * GRADE_LEARN_PERCENT / 100) as i16;
        let candidate = candidate.max(MIN_GRADE_FLOOR);
        if candidate >= self.ceilings[bucket] {
            return false;
        }

        let (start, _) = bucket_range(bucket);
        info!(
            "grade: bucket {} (speed {}) ceiling {} -> {}",
            bucket,
            start,
            self.ceilings[bucket],
            candidate
        );
        self.ceilings[bucket] = candidate;
        self.table_dirty = true;
        true
    }

    /// Relax every bucket if a full active hour passed since the last decay.
    ///
    /// Returns true if any ceiling changed.
    pub fn decay(&mut self) -> bool {
        if self.active_seconds - self.last_decay_at < GRADE_DECAY_INTERVAL_SECS {
            return false;
        }
        self.last_decay_at = self.active_seconds;
        self.activity_dirty = true;

        let mut changed = false;
        for c in self.ceilings.iter_mut().filter(|c| **c < MAX_GRADE_INITIAL) {
            *c = (*c + GRADE_DECAY_STEP).min(MAX_GRADE_INITIAL);
            changed = true;
        }
        if changed {
            info!("grade: decayed at {} active hours", self.active_hours());
            self.table_dirty = true;
        }
        changed
    }

    /// Account `secs` of active riding, decaying when an hour boundary passes.
    pub fn add_active_seconds(&mut self, secs: u32) -> bool {
        if secs == 0 {
            return false;
        }
        self.active_seconds = self.active_seconds.saturating_add(secs);
        if self.active_seconds - self.last_persisted_at >= ACTIVITY_PERSIST_SECS {
            self.last_persisted_at = self.active_seconds;
            self.activity_dirty = true;
        }
        self.decay()
    }

    pub fn active_seconds(&self) -> u32 {
        self.active_seconds
    }

    pub fn active_hours(&self) -> u32 {
        self.active_seconds / 3600
    }

    pub fn ceilings(&self) -> &[i16; GRADE_BUCKETS] {
        &self.ceilings
    }

    pub fn ceiling(&self, bucket: usize) -> Option<i16> {
        self.ceilings.get(bucket).copied()
    }

    /// Directly set a bucket ceiling (clamped into range). Used to restore or seed tables.
    pub fn set_ceiling(&mut self, bucket: usize, grade: i16) {
        if let Some(c) = self.ceilings.get_mut(bucket) {
            *c = grade.clamp(MIN_GRADE_FLOOR, MAX_GRADE_INITIAL);
            self.table_dirty = true;
        }
    }

    // Persistence

    pub fn encode_table(&self) -> [u8; TABLE_BLOB_SIZE] {
        let mut buf = [0u8; TABLE_BLOB_SIZE];
        for (chunk, c) in buf.chunks_exact_mut(2).zip(self.ceilings.iter()) {
            chunk.copy_from_slice(&c.to_le_bytes());
        }
        buf
    }

    /// Restore the table; out-of-range values are clamped into range.
    pub fn load_table(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if data.len() != TABLE_BLOB_SIZE {
            warn!("grade: stored table has {} bytes, using defaults", data.len());
            return Err(StorageError::Corrupt);
        }
        for (c, chunk) in self.ceilings.iter_mut().zip(data.chunks_exact(2)) {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            *c = v.clamp(MIN_GRADE_FLOOR, MAX_GRADE_INITIAL);
        }
        self.table_dirty = false;
        Ok(())
    }

    pub fn encode_activity(&self) -> [u8; ACTIVITY_BLOB_SIZE] {
        let mut buf = [0u8; ACTIVITY_BLOB_SIZE];
        buf[..4].copy_from_slice(&self.active_seconds.to_le_bytes());
        buf[4..].copy_from_slice(&self.last_decay_at.to_le_bytes());
        buf
    }

    pub fn load_activity(&mut self, data: &[u8]) -> Result<(), StorageError> {
        if data.len() != ACTIVITY_BLOB_SIZE {
            return Err(StorageError::Corrupt);
        }
        let active = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let last = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        self.active_seconds = active;
        self.last_decay_at = last.min(active);
        self.last_persisted_at = active;
        self.activity_dirty = false;
        Ok(())
    }

    /// True once per change; the caller persists the table.
    pub fn take_table_dirty(&mut self) -> bool {
        core::mem::take(&mut self.table_dirty)
    }

    pub fn take_activity_dirty(&mut self) -> bool {
        core::mem::take(&mut self.activity_dirty)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
