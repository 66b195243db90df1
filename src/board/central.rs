//! Central links: one task per slot.
//!
//! A slot task waits for `Connect`, connects with a whitelist of one, then
//! serves discovery, subscription, write and read requests for that link
//! while `gatt_client::run` routes its notifications to the engine.
//!
//! The SoftDevice discovers a whole service at once; [`DiscoveryCursor`]
//! caches the result and answers the engine's step-by-step walk from it.

use core::cell::RefCell;

use defmt::{info, warn};
use embassy_futures::select::{select, Either};
use heapless::Vec;
use nrf_softdevice::ble::gatt_client::{self, Characteristic, Descriptor, DiscoverError};
use nrf_softdevice::ble::{central, Address, Connection, HvxType, Uuid};
use nrf_softdevice::{raw, Softdevice};

use zrelay::ble::host::{Attribute, CharProps, DiscoverRequest};
use zrelay::ble::{uuid, BdAddr, LinkId, SubscriptionKey};
use zrelay::config::{
    BLE_CONN_INTERVAL_MAX, BLE_CONN_INTERVAL_MIN, BLE_SLAVE_LATENCY, BLE_SUP_TIMEOUT,
    MAX_CONNECTIONS, MAX_SUBSCRIPTIONS,
};
use zrelay::error::HostError;
use zrelay::relay::MAX_FRAME_LEN;

use super::{post, Event, SlotCommand, EVENTS, READ_MAX_LEN, SLOTS};

/// Characteristics cached per discovered service.
const MAX_CHARS: usize = 8;

/// Characteristic UUIDs the engine may ask for.
const KNOWN_CHARS: [u16; 8] = [
    uuid::HEART_RATE_MEASUREMENT,
    uuid::CSC_MEASUREMENT,
    uuid::CYCLING_POWER_MEASUREMENT,
    uuid::FITNESS_MACHINE_FEATURE,
    uuid::INDOOR_BIKE_DATA,
    uuid::TRAINING_STATUS,
    uuid::FITNESS_MACHINE_CONTROL_POINT,
    uuid::FITNESS_MACHINE_STATUS,
];

#[derive(Clone, Copy)]
struct CachedChar {
    uuid: u16,
    decl_handle: u16,
    value_handle: u16,
    props: CharProps,
    cccd_handle: Option<u16>,
}

// ─── Discovery ────────────────────────────────────────────────────────────

/// Discovery client for one primary service.
struct ServiceClient<const UUID: u16> {
    chars: Vec<CachedChar, MAX_CHARS>,
}

impl<const UUID: u16> gatt_client::Client for ServiceClient<UUID> {
    type Event = ();

    fn on_hvx(&self, _conn: &Connection, _type: HvxType, _handle: u16, _data: &[u8]) -> Option<()> {
        None
    }

    fn uuid() -> Uuid {
        Uuid::new_16(UUID)
    }

    fn new_undiscovered(_conn: Connection) -> Self {
        Self { chars: Vec::new() }
    }

    fn discovered_characteristic(&mut self, characteristic: &Characteristic, descriptors: &[Descriptor]) {
        let Some(&uuid) = KNOWN_CHARS
            .iter()
            .find(|&&u| characteristic.uuid == Some(Uuid::new_16(u)))
        else {
            return;
        };
        let p = &characteristic.props;
        let mut props = 0;
        if p.read() != 0 {
            props |= CharProps::READ;
        }
        if p.write() != 0 {
            props |= CharProps::WRITE;
        }
        if p.notify() != 0 {
            props |= CharProps::NOTIFY;
        }
        if p.indicate() != 0 {
            props |= CharProps::INDICATE;
        }
        let cccd_handle = descriptors
            .iter()
            .find(|d| d.uuid == Some(Uuid::new_16(uuid::CLIENT_CHARACTERISTIC_CONFIG)))
            .map(|d| d.handle);
        let cached = CachedChar {
            uuid,
            decl_handle: characteristic.handle_decl,
            value_handle: characteristic.handle_value,
            props: CharProps(props),
            cccd_handle,
        };
        if self.chars.push(cached).is_err() {
            warn!("central: service {=u16:#x} has too many characteristics", UUID);
        }
    }

    fn discovery_complete(&mut self) -> Result<(), DiscoverError> {
        Ok(())
    }
}

#[derive(Default)]
struct DiscoveryCursor {
    chars: Vec<CachedChar, MAX_CHARS>,
}

impl DiscoveryCursor {
    async fn answer(
        &mut self,
        conn: &Connection,
        request: DiscoverRequest,
    ) -> Result<Option<Attribute>, HostError> {
        match request {
            DiscoverRequest::PrimaryService { uuid } => {
                let found = match uuid {
                    uuid::HEART_RATE_SERVICE => {
                        discover_service::<{ uuid::HEART_RATE_SERVICE }>(conn).await
                    }
                    uuid::CYCLING_POWER_SERVICE => {
                        discover_service::<{ uuid::CYCLING_POWER_SERVICE }>(conn).await
                    }
                    uuid::FITNESS_MACHINE_SERVICE => {
                        discover_service::<{ uuid::FITNESS_MACHINE_SERVICE }>(conn).await
                    }
                    _ => Ok(None),
                }?;
                Ok(found.map(|chars| {
                    self.chars = chars;
                    self.service_range()
                }))
            }
            DiscoverRequest::Characteristics { start, end } => Ok(self
                .chars
                .iter()
                .find(|c| (start..=end).contains(&c.decl_handle))
                .map(|c| Attribute::Characteristic {
                    uuid: c.uuid,
                    value_handle: c.value_handle,
                    props: c.props,
                })),
            DiscoverRequest::Descriptor { uuid, start, end } => {
                if uuid != uuid::CLIENT_CHARACTERISTIC_CONFIG {
                    return Ok(None);
                }
                Ok(self
                    .chars
                    .iter()
                    .filter_map(|c| c.cccd_handle)
                    .find(|h| (start..=end).contains(h))
                    .map(|handle| Attribute::Descriptor { handle }))
            }
        }
    }

    /// Handle range rebuilt from the cached characteristics: the service
    /// declaration sits just before the first characteristic declaration.
    fn service_range(&self) -> Attribute {
        let start = self
            .chars
            .iter()
            .map(|c| c.decl_handle)
            .min()
            .map_or(1, |h| h.saturating_sub(1).max(1));
        let end = self
            .chars
            .iter()
            .map(|c| c.cccd_handle.unwrap_or(c.value_handle))
            .max()
            .unwrap_or(start)
            .max(start + 1);
        Attribute::Service { start, end }
    }
}

async fn discover_service<const UUID: u16>(
    conn: &Connection,
) -> Result<Option<Vec<CachedChar, MAX_CHARS>>, HostError> {
    match gatt_client::discover::<ServiceClient<UUID>>(conn).await {
        Ok(client) => Ok(Some(client.chars)),
        Err(DiscoverError::ServiceNotFound) => Ok(None),
        Err(e) => {
            warn!("central: discovery of {=u16:#x} failed: {:?}", UUID, e);
            Err(HostError::Busy)
        }
    }
}

// ─── Notifications ────────────────────────────────────────────────────────

/// Maps value handles to subscription keys for `gatt_client::run`.
struct SubscriptionRouter {
    routes: RefCell<Vec<(u16, SubscriptionKey), MAX_SUBSCRIPTIONS>>,
}

impl SubscriptionRouter {
    fn new() -> Self {
        Self {
            routes: RefCell::new(Vec::new()),
        }
    }

    fn add(&self, value_handle: u16, key: SubscriptionKey) {
        let mut routes = self.routes.borrow_mut();
        routes.retain(|(h, _)| *h != value_handle);
        if routes.push((value_handle, key)).is_err() {
            warn!("central: subscription table full");
        }
    }

    fn remove(&self, value_handle: u16) {
        self.routes.borrow_mut().retain(|(h, _)| *h != value_handle);
    }
}

impl gatt_client::Client for SubscriptionRouter {
    type Event = (SubscriptionKey, Vec<u8, MAX_FRAME_LEN>);

    fn on_hvx(&self, _conn: &Connection, _type: HvxType, handle: u16, data: &[u8]) -> Option<Self::Event> {
        let key = self
            .routes
            .borrow()
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, k)| *k)?;
        let len = data.len().min(MAX_FRAME_LEN);
        Vec::from_slice(&data[..len]).ok().map(|d| (key, d))
    }

    // Never used for discovery.
    fn uuid() -> Uuid {
        Uuid::new_16(uuid::FITNESS_MACHINE_SERVICE)
    }

    fn new_undiscovered(_conn: Connection) -> Self {
        Self::new()
    }

    fn discovered_characteristic(&mut self, _characteristic: &Characteristic, _descriptors: &[Descriptor]) {}

    fn discovery_complete(&mut self) -> Result<(), DiscoverError> {
        Ok(())
    }
}

// ─── Slot task ────────────────────────────────────────────────────────────

fn peer_address(address: &BdAddr) -> Address {
    Address::from_raw(raw::ble_gap_addr_t {
        _bitfield_1: raw::ble_gap_addr_t::new_bitfield_1(0, address.addr_type),
        addr: address.bytes,
    })
}

async fn connect(sd: &'static Softdevice, address: &BdAddr) -> Result<Connection, HostError> {
    let peer = peer_address(address);
    let whitelist = [&peer];
    let mut config = central::ConnectConfig::default();
    config.scan_config.whitelist = Some(&whitelist);
    config.conn_params = raw::ble_gap_conn_params_t {
        min_conn_interval: BLE_CONN_INTERVAL_MIN,
        max_conn_interval: BLE_CONN_INTERVAL_MAX,
        slave_latency: BLE_SLAVE_LATENCY,
        conn_sup_timeout: BLE_SUP_TIMEOUT,
    };
    central::connect(sd, &config).await.map_err(|e| {
        warn!("central: connect to {} failed: {:?}", address, e);
        HostError::Busy
    })
}

/// Resolves when the engine gives up on a pending connect.
async fn cancelled(slot: usize) {
    loop {
        match SLOTS[slot].receive().await {
            SlotCommand::Cancel | SlotCommand::Disconnect => return,
            _ => warn!("central: slot {} not connected, request dropped", slot),
        }
    }
}

#[embassy_executor::task(pool_size = MAX_CONNECTIONS)]
pub async fn slot_task(sd: &'static Softdevice, slot: usize) -> ! {
    loop {
        let SlotCommand::Connect { address, link } = SLOTS[slot].receive().await else {
            continue;
        };

        let conn = match select(connect(sd, &address), cancelled(slot)).await {
            Either::First(Ok(conn)) => conn,
            Either::First(Err(e)) => {
                EVENTS.send(Event::ConnectFailed(link, e)).await;
                continue;
            }
            Either::Second(()) => {
                info!("central: slot {} connect to {} cancelled", slot, address);
                EVENTS.send(Event::Disconnected(link)).await;
                continue;
            }
        };

        info!("central: slot {} connected to {}", slot, address);
        EVENTS.send(Event::Connected(link)).await;

        let router = SubscriptionRouter::new();
        let notifications = gatt_client::run(&conn, &router, |(key, data)| {
            post(Event::Notification(key, data));
        });
        select(notifications, serve(&conn, &router, slot, link)).await;

        info!("central: slot {} disconnected", slot);
        EVENTS.send(Event::Disconnected(link)).await;
    }
}

/// Serve engine requests until it asks us to drop the link.
async fn serve(conn: &Connection, router: &SubscriptionRouter, slot: usize, link: LinkId) {
    let mut cursor = DiscoveryCursor::default();
    loop {
        match SLOTS[slot].receive().await {
            SlotCommand::Connect { .. } => warn!("central: slot {} already busy", slot),
            SlotCommand::Cancel | SlotCommand::Disconnect => {
                let _ = conn.disconnect();
                return;
            }
            SlotCommand::Discover(request) => {
                let result = cursor.answer(conn, request).await;
                EVENTS.send(Event::Discovered(link, result)).await;
            }
            SlotCommand::Subscribe(key, subscription) => {
                router.add(subscription.value_handle, key);
                let ccc = subscription.mode.ccc_value().to_le_bytes();
                if let Err(e) = gatt_client::write(conn, subscription.ccc_handle, &ccc).await {
                    warn!("central: CCC write on {=u16:#x} failed: {:?}", subscription.ccc_handle, e);
                    router.remove(subscription.value_handle);
                }
            }
            SlotCommand::Write(handle, data) => {
                let result = gatt_client::write(conn, handle, &data).await.map_err(|e| {
                    warn!("central: write to {=u16:#x} failed: {:?}", handle, e);
                    HostError::Busy
                });
                EVENTS.send(Event::WriteComplete(link, result)).await;
            }
            SlotCommand::Read(handle) => {
                let mut buf = [0u8; READ_MAX_LEN];
                let result = match gatt_client::read(conn, handle, &mut buf).await {
                    Ok(n) => Ok(Vec::from_slice(&buf[..n.min(READ_MAX_LEN)]).unwrap_or_default()),
                    Err(e) => {
                        warn!("central: read of {=u16:#x} failed: {:?}", handle, e);
                        Err(HostError::Busy)
                    }
                };
                EVENTS.send(Event::ReadComplete(link, handle, result)).await;
            }
        }
    }
}
