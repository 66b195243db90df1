//! Seam between the relay engine and the BLE host stack.
//!
//! Every request is non-blocking: the host accepts it (or refuses it with a
//! [`HostError`]) and delivers the outcome later through one of the
//! [`crate::engine::Relay`] `on_*` entry points, on the same execution
//! context that owns the engine.

use crate::ble::{BdAddr, LinkId, LocalCharacteristic, SubscriptionKey};
use crate::error::HostError;

/// One step of a GATT discovery walk.
///
/// Each request is answered by exactly one `on_discovered` callback carrying
/// the first matching attribute in range, or `None` once the range is
/// exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoverRequest {
    /// Primary service by 16-bit UUID.
    PrimaryService { uuid: u16 },
    /// Next characteristic declaration in `start..=end`.
    Characteristics { start: u16, end: u16 },
    /// Next descriptor with `uuid` in `start..=end`.
    Descriptor { uuid: u16, start: u16, end: u16 },
}

/// Characteristic property bits (Core Vol 3, Part G, 3.3.1.1).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CharProps(pub u8);

impl CharProps {
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub const fn can_read(self) -> bool {
        self.0 & Self::READ != 0
    }
    pub const fn can_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }
    pub const fn can_notify(self) -> bool {
        self.0 & Self::NOTIFY != 0
    }
    pub const fn can_indicate(self) -> bool {
        self.0 & Self::INDICATE != 0
    }
}

/// Attribute reported by a discovery step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Attribute {
    Service {
        start: u16,
        end: u16,
    },
    Characteristic {
        uuid: u16,
        value_handle: u16,
        props: CharProps,
    },
    Descriptor {
        handle: u16,
    },
}

/// Notification or indication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscribeMode {
    Notify,
    Indicate,
}

impl SubscribeMode {
    /// Value written to the CCC descriptor.
    pub const fn ccc_value(self) -> u16 {
        match self {
            SubscribeMode::Notify => 0x0001,
            SubscribeMode::Indicate => 0x0002,
        }
    }
}

/// Parameters of one subscription request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subscription {
    pub value_handle: u16,
    pub ccc_handle: u16,
    pub mode: SubscribeMode,
}

/// One-shot timers the engine arms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimerId {
    /// Connection establishment deadline.
    ConnectTimeout,
    /// End of the priority reconnection window.
    PriorityWindowEnd,
}

/// Work items deferred to run after the current callback returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Work {
    /// Send the queued Control Point response to the companion app.
    FlushControlPointResponse,
}

/// Requests the engine issues to the BLE host stack.
pub trait BleHost {
    /// Start (or keep) scanning. [`HostError::Already`] is not a failure.
    fn start_scan(&mut self) -> Result<(), HostError>;

    /// Stop scanning. Stopping an idle scanner is not a failure.
    fn stop_scan(&mut self) -> Result<(), HostError>;

    /// Start connectable advertising under `name` with the relayed service UUIDs.
    fn start_advertising(&mut self, name: &str) -> Result<(), HostError>;

    /// Initiate a connection; the result arrives via `on_connected`.
    fn connect(&mut self, addr: &BdAddr) -> Result<LinkId, HostError>;

    /// Abort a connection attempt that has not completed.
    fn cancel_connect(&mut self, link: LinkId) -> Result<(), HostError>;

    /// Tear down an established link.
    fn disconnect(&mut self, link: LinkId) -> Result<(), HostError>;

    /// Run one discovery step on `link`.
    fn discover(&mut self, link: LinkId, request: DiscoverRequest) -> Result<(), HostError>;

    /// Enable notifications/indications; payloads arrive tagged with `key`.
    fn subscribe(
        &mut self,
        link: LinkId,
        key: SubscriptionKey,
        subscription: Subscription,
    ) -> Result<(), HostError>;

    /// Write-with-response; completion arrives via `on_write_complete`.
    fn write(&mut self, link: LinkId, handle: u16, data: &[u8]) -> Result<(), HostError>;

    /// Read a characteristic value; result arrives via `on_read_complete`.
    fn read(&mut self, link: LinkId, handle: u16) -> Result<(), HostError>;

    /// Notify the companion app (dropped silently by the stack if not subscribed).
    fn notify(&mut self, characteristic: LocalCharacteristic, data: &[u8]) -> Result<(), HostError>;

    /// Indicate to the companion app; `on_indication_released` follows.
    fn indicate(&mut self, characteristic: LocalCharacteristic, data: &[u8]) -> Result<(), HostError>;

    /// Arm (or re-arm) a one-shot timer.
    fn schedule(&mut self, timer: TimerId, after_ms: u64);

    /// Disarm a timer; no-op if it is not armed.
    fn cancel(&mut self, timer: TimerId);

    /// Queue `work` to run after the current callback returns.
    fn defer(&mut self, work: Work);
}
