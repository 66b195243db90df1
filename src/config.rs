//! Application-wide constants and run-time relay policy.
//!
//! All timing parameters, capacities and protocol constants live here so
//! they can be tuned in one place. Policy that differs between trainers or
//! builds is carried by [`RelayConfig`].

// BLE central

/// Maximum simultaneous sensor connections (HR strap, power meter, trainer).
pub const MAX_CONNECTIONS: usize = 3;

/// Maximum notification/indication subscriptions tracked per sensor link.
pub const MAX_SUBSCRIPTIONS: usize = 5;

/// Maximum number of advertisers tracked at once.
pub const MAX_DISCOVERED: usize = 8;

/// Connection-establishment timeout (ms).
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// A discovered device not seen for this long is dropped (ms).
pub const DEVICE_AGING_MS: u64 = 10_000;

/// Default length of the priority reconnection window (ms). 5 minutes.
pub const PRIORITY_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Name prefix of every relay unit. Advertisers using it are ignored.
pub const OWN_NAME_PREFIX: &str = "Z-Relay";

/// Longest device name kept, in bytes.
pub const NAME_MAX_LEN: usize = 32;

/// BLE connection interval range (in 1.25 ms units). 24..40 = 30..50 ms.
pub const BLE_CONN_INTERVAL_MIN: u16 = 24;
pub const BLE_CONN_INTERVAL_MAX: u16 = 40;

/// BLE slave latency (number of connection events the peripheral can skip).
pub const BLE_SLAVE_LATENCY: u16 = 0;

/// BLE supervision timeout (in 10 ms units). 400 = 4 s.
pub const BLE_SUP_TIMEOUT: u16 = 400;

// Data-plane relay

/// Cycling Power cache is stale after this long (ms).
pub const CP_CACHE_TIMEOUT_MS: u64 = 5_000;

/// Cadence drops to zero when the crank count is unchanged this long (ms).
pub const CADENCE_ZERO_TIMEOUT_MS: u64 = 4_000;

/// Power above this (W) counts as active riding.
pub const ACTIVE_POWER_THRESHOLD_W: i16 = 50;

// Control point

/// Longest Control Point write accepted from the companion app.
pub const CP_MAX_WRITE_LEN: usize = 20;

// Grade limiter (speed in 0.01 km/h, grade in 0.01 %)

/// Lower bound of the restricted speed band (inclusive). 10 km/h.
pub const GRADE_SPEED_MIN: u16 = 1_000;

/// Upper bound of the restricted speed band (exclusive). 30 km/h.
pub const GRADE_SPEED_MAX: u16 = 3_000;

/// Number of speed buckets in the safety table.
pub const GRADE_BUCKETS: usize = 50;

/// Width of one speed bucket.
pub const GRADE_BUCKET_WIDTH: u16 = (GRADE_SPEED_MAX - GRADE_SPEED_MIN) / GRADE_BUCKETS as u16;

/// Ceiling every bucket starts at and decays back towards. 20 %.
pub const MAX_GRADE_INITIAL: i16 = 2_000;

/// No bucket is ever learned below this. 1 %.
pub const MIN_GRADE_FLOOR: i16 = 100;

/// Learned ceiling as a percentage of the grade at thermal release.
pub const GRADE_LEARN_PERCENT: i32 = 90;

/// Per-hour relaxation step applied by decay. 0.1 %.
pub const GRADE_DECAY_STEP: i16 = 10;

/// Active seconds between two decay steps.
pub const GRADE_DECAY_INTERVAL_SECS: u32 = 3_600;

/// Fixed ceiling used by [`GradeLimitMode::HardClamp`] by default. 2 %.
pub const HARD_CLAMP_GRADE: i16 = 200;

// Activity

/// Period of the activity tick driving the active-time accumulator (ms).
pub const ACTIVITY_TICK_MS: u64 = 1_000;

// Paired-device storage

/// Maximum number of sensors remembered across reboots.
pub const MAX_SAVED_DEVICES: usize = 4;

/// Flash page index where persistent storage starts (4 KB per page on nRF52840).
pub const STORAGE_FLASH_PAGE_START: u32 = 240;

/// Number of flash pages reserved for persistent storage.
pub const STORAGE_FLASH_PAGE_COUNT: u32 = 4;

/// Longest diagnostic event line, newline included. A full grade table
/// is the largest event.
pub const EVENT_LINE_MAX: usize = 2_560;

// Button
//
//   Button 1 → P0.11 (nRF52840-DK), active-low with internal pull-up.

/// Button debounce time (ms).
pub const BUTTON_DEBOUNCE_MS: u64 = 50;

/// Hold time that turns a press into "forget all + priority window" (ms).
pub const BUTTON_LONG_PRESS_MS: u64 = 2_000;

/// How Set Indoor Bike Simulation commands reach the trainer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SimulationTranslation {
    /// Rewrite to Set Target Resistance unless the trainer declares
    /// Indoor Bike Simulation support in its Fitness Machine Feature.
    #[default]
    Auto,
    /// Always rewrite to Set Target Resistance.
    Always,
    /// Forward the simulation command (with the limited grade patched in).
    Never,
}

/// Which grade ceiling is applied to simulation commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GradeLimitMode {
    /// Learned per-speed ceilings with hourly decay.
    #[default]
    Adaptive,
    /// Debug override: every grade above the value is clipped, regardless of speed.
    HardClamp(i16),
    /// Grades are forwarded untouched.
    Disabled,
}

/// Run-time relay policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RelayConfig {
    pub translation: SimulationTranslation,
    pub grade_limit: GradeLimitMode,
    /// Length of the priority window opened by a long press (ms).
    pub priority_window_ms: u64,
    /// Learn a ceiling when the trainer reports a thermal release.
    pub learn_on_thermal_release: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            translation: SimulationTranslation::Auto,
            grade_limit: GradeLimitMode::Adaptive,
            priority_window_ms: PRIORITY_WINDOW_MS,
            learn_on_thermal_release: true,
        }
    }
}
