//! Unified error types for zrelay.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Every type implements `defmt::Format` (with the `defmt` feature) for
//! efficient on-target logging.

/// Top-level error type used across the relay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // BLE
    /// A request to the BLE host stack failed.
    Ble(BleError),

    // Control point
    /// The companion app's write was rejected at the ATT boundary.
    Att(AttError),

    /// No connected trainer exposes a Control Point handle.
    NoTrainer,

    /// A Control Point write to the trainer is still outstanding.
    WriteBusy,

    // Storage
    /// Persistent store operation failed.
    Storage(StorageError),

    // Generic
    /// Frame shorter than the minimum its format requires.
    Malformed,
}

/// Subset of BLE errors we propagate (keeps the enum `Copy`-friendly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BleError {
    /// Raw failure reported by the host stack.
    Host(HostError),
    /// Scan could not be started.
    ScanFailed,
    /// Connection attempt failed or timed out.
    ConnectFailed,
    /// GATT discovery failed.
    DiscoveryFailed,
    /// Characteristic subscribe (CCC write) failed.
    SubscribeFailed,
    /// All connection slots are in use.
    NoFreeSlot,
}

/// Failure codes a [`crate::ble::host::BleHost`] request may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostError {
    /// The requested operation is already in progress (scan, advertising).
    Already,
    /// The stack cannot accept another request right now.
    Busy,
    /// The link is gone.
    NotConnected,
    /// Request queue or attribute table out of memory.
    NoMemory,
    /// The peer has not enabled notifications/indications.
    NotEnabled,
    /// Stack-specific error code.
    Raw(u32),
}

/// ATT protocol error codes returned to the companion app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttError {
    /// Write with a non-zero offset.
    InvalidOffset,
    /// Empty write or longer than the Control Point accepts.
    InvalidAttributeValueLength,
}

impl AttError {
    /// Bluetooth Core ATT error code.
    pub const fn code(self) -> u8 {
        match self {
            AttError::InvalidOffset => 0x07,
            AttError::InvalidAttributeValueLength => 0x0D,
        }
    }
}

/// Persistent store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// All device slots hold other addresses.
    NoFreeSlot,
    /// Flash read/write/erase failed.
    Flash,
    /// Stored blob could not be decoded.
    Corrupt,
}

// Convenience conversions

impl From<BleError> for Error {
    fn from(e: BleError) -> Self {
        Error::Ble(e)
    }
}

impl From<HostError> for BleError {
    fn from(e: HostError) -> Self {
        BleError::Host(e)
    }
}

impl From<HostError> for Error {
    fn from(e: HostError) -> Self {
        Error::Ble(BleError::Host(e))
    }
}

impl From<AttError> for Error {
    fn from(e: AttError) -> Self {
        Error::Att(e)
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::Storage(e)
    }
}
