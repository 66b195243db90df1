//! nRF52840 + S140 glue around the relay engine.
//!
//! Tasks talk to the engine task through the channels below; the engine
//! talks back through [`host::ChannelHost`].
//!
//! ```text
//!   scanner ─┐                          ┌─ slot_task ×3 (central links)
//!   slots   ─┼─ EVENTS ─▶ relay_task ───┼─ SCAN / ADVERTISE signals
//!   server  ─┤            (Relay)       └─ GATT server notify/indicate
//!   button  ─┴─ BUTTONS ─▶
//! ```

pub mod central;
pub mod host;
pub mod peripheral;
pub mod scanner;
pub mod server;
pub mod softdevice;
pub mod uart;

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use heapless::{String, Vec};
use nrf_softdevice::ble::Connection;

use zrelay::ble::host::{Attribute, DiscoverRequest, Subscription};
use zrelay::ble::multi_conn::ADV_NAME_MAX_LEN;
use zrelay::ble::{BdAddr, LinkId, SubscriptionKey};
use zrelay::config::{CP_MAX_WRITE_LEN, MAX_CONNECTIONS};
use zrelay::error::HostError;
use zrelay::relay::MAX_FRAME_LEN;
use zrelay::ui::ButtonEvent;

/// Legacy advertising payload limit.
pub const ADV_DATA_MAX_LEN: usize = 31;

/// Longest characteristic value read back from a sensor.
pub const READ_MAX_LEN: usize = 20;

/// Everything the engine task reacts to, except buttons.
pub enum Event {
    Advertisement {
        address: BdAddr,
        rssi: i8,
        data: Vec<u8, ADV_DATA_MAX_LEN>,
    },
    Connected(LinkId),
    ConnectFailed(LinkId, HostError),
    PeripheralConnected(LinkId),
    Disconnected(LinkId),
    Discovered(LinkId, Result<Option<Attribute>, HostError>),
    Notification(SubscriptionKey, Vec<u8, MAX_FRAME_LEN>),
    ReadComplete(LinkId, u16, Result<Vec<u8, READ_MAX_LEN>, HostError>),
    WriteComplete(LinkId, Result<(), HostError>),
    ControlPointWrite {
        link: LinkId,
        offset: u16,
        data: Vec<u8, CP_MAX_WRITE_LEN>,
    },
    ControlPointCcc {
        link: LinkId,
        indications: bool,
    },
    IndicationReleased(bool),
}

/// Requests for one central link, served by its slot task.
pub enum SlotCommand {
    Connect { address: BdAddr, link: LinkId },
    /// Abort a pending connect.
    Cancel,
    Disconnect,
    Discover(DiscoverRequest),
    Subscribe(SubscriptionKey, Subscription),
    Write(u16, Vec<u8, CP_MAX_WRITE_LEN>),
    Read(u16),
}

pub static EVENTS: Channel<CriticalSectionRawMutex, Event, 16> = Channel::new();
pub static BUTTONS: Channel<CriticalSectionRawMutex, ButtonEvent, 4> = Channel::new();

pub static SLOTS: [Channel<CriticalSectionRawMutex, SlotCommand, 4>; MAX_CONNECTIONS] =
    [const { Channel::new() }; MAX_CONNECTIONS];

/// Scanner on/off; the latest value wins.
pub static SCAN: Signal<CriticalSectionRawMutex, bool> = Signal::new();

/// (Re)start advertising under this name.
pub static ADVERTISE: Signal<CriticalSectionRawMutex, String<ADV_NAME_MAX_LEN>> = Signal::new();

/// The companion app's link, while connected.
pub static PERIPHERAL: Mutex<CriticalSectionRawMutex, RefCell<Option<Connection>>> =
    Mutex::new(RefCell::new(None));

/// Post an event from a callback that cannot await.
pub fn post(event: Event) {
    if EVENTS.try_send(event).is_err() {
        defmt::warn!("board: event queue full, event dropped");
    }
}
