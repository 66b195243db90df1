//! Bluetooth Low Energy subsystem.
//!
//! The relay drives the host stack in both roles at once:
//!
//! 1. **Central** - scans for heart-rate straps, power meters and FTMS
//!    trainers, connects up to [`MAX_CONNECTIONS`] of them and walks
//!    their GATT tables ([`discovery`]).
//! 2. **Peripheral** - advertises the union of those services so the
//!    companion app sees one virtual sensor.
//!
//! [`multi_conn`] owns the slot table and the scan/advertise lifecycle.
//! Everything talks to the radio through the [`host::BleHost`] trait so the
//! state machines run unchanged on the host for tests.
//!
//! [`MAX_CONNECTIONS`]: crate::config::MAX_CONNECTIONS

pub mod adv_parser;
pub mod devices;
pub mod discovery;
pub mod host;
pub mod multi_conn;

use core::fmt;

/// 16-bit SIG UUIDs the relay cares about.
pub mod uuid {
    pub const HEART_RATE_SERVICE: u16 = 0x180D;
    pub const CYCLING_SPEED_CADENCE_SERVICE: u16 = 0x1816;
    pub const CYCLING_POWER_SERVICE: u16 = 0x1818;
    pub const FITNESS_MACHINE_SERVICE: u16 = 0x1826;

    pub const HEART_RATE_MEASUREMENT: u16 = 0x2A37;
    pub const CSC_MEASUREMENT: u16 = 0x2A5B;
    pub const CYCLING_POWER_MEASUREMENT: u16 = 0x2A63;
    pub const FITNESS_MACHINE_FEATURE: u16 = 0x2ACC;
    pub const INDOOR_BIKE_DATA: u16 = 0x2AD2;
    pub const TRAINING_STATUS: u16 = 0x2AD3;
    pub const FITNESS_MACHINE_CONTROL_POINT: u16 = 0x2AD9;
    pub const FITNESS_MACHINE_STATUS: u16 = 0x2ADA;

    pub const CLIENT_CHARACTERISTIC_CONFIG: u16 = 0x2902;
}

/// Link-layer address of a remote device (little-endian bytes, as on air).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BdAddr {
    /// 0 = public, 1 = random static, 2/3 = private.
    pub addr_type: u8,
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub const fn new(addr_type: u8, bytes: [u8; 6]) -> Self {
        Self { addr_type, bytes }
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

/// Serialized in its display form.
impl serde::Serialize for BdAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use fmt::Write as _;
        let mut text = heapless::String::<17>::new();
        // "XX:XX:XX:XX:XX:XX" always fits
        let _ = write!(text, "{}", self);
        serializer.serialize_str(&text)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for BdAddr {
    fn format(&self, f: defmt::Formatter) {
        let b = &self.bytes;
        defmt::write!(
            f,
            "{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}",
            b[5],
            b[4],
            b[3],
            b[2],
            b[1],
            b[0]
        )
    }
}

/// Services a device advertises or exposes, as persisted in the device store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceMask(u8);

impl ServiceMask {
    pub const NONE: Self = Self(0);
    pub const HEART_RATE: Self = Self(0x01);
    pub const CYCLING_POWER: Self = Self(0x02);
    pub const FITNESS_MACHINE: Self = Self(0x04);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0x07)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Mask bit for a 16-bit service UUID, if it is one we relay.
    pub const fn from_service_uuid(uuid: u16) -> Self {
        match uuid {
            uuid::HEART_RATE_SERVICE => Self::HEART_RATE,
            uuid::CYCLING_POWER_SERVICE => Self::CYCLING_POWER,
            uuid::FITNESS_MACHINE_SERVICE => Self::FITNESS_MACHINE,
            _ => Self::NONE,
        }
    }
}

impl core::ops::BitOr for ServiceMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Opaque connection handle assigned by the host stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkId(pub u16);

/// Stable identity of one subscription.
///
/// `generation` is bumped every time the slot starts a new connection, so an
/// event carrying a key from a previous link never matches the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubscriptionKey {
    pub slot: u8,
    pub generation: u8,
    pub index: u8,
}

/// What a subscription carries; the relay dispatches on this tag alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscriptionKind {
    HeartRate,
    CyclingPower,
    IndoorBikeData,
    TrainingStatus,
    MachineStatus,
    ControlPoint,
}

/// Characteristics of the relay's own GATT server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LocalCharacteristic {
    HeartRateMeasurement,
    CscMeasurement,
    CyclingPowerMeasurement,
    IndoorBikeData,
    TrainingStatus,
    MachineStatus,
    ControlPoint,
}

impl SubscriptionKind {
    /// Server characteristic a notification of this kind is republished on.
    pub const fn local(self) -> LocalCharacteristic {
        match self {
            SubscriptionKind::HeartRate => LocalCharacteristic::HeartRateMeasurement,
            SubscriptionKind::CyclingPower => LocalCharacteristic::CyclingPowerMeasurement,
            SubscriptionKind::IndoorBikeData => LocalCharacteristic::IndoorBikeData,
            SubscriptionKind::TrainingStatus => LocalCharacteristic::TrainingStatus,
            SubscriptionKind::MachineStatus => LocalCharacteristic::MachineStatus,
            SubscriptionKind::ControlPoint => LocalCharacteristic::ControlPoint,
        }
    }
}
