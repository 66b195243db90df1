//! Multi-sensor connection manager.
//!
//! Owns the fixed slot table ([`MAX_CONNECTIONS`] sensor links), the table
//! of advertisers seen while scanning, the scan/advertise lifecycle and the
//! priority reconnection window. Each connected slot runs its own
//! [`Discovery`] walk; subscriptions it establishes are tagged with a
//! [`SubscriptionKey`] so later notifications are dispatched by index, never
//! by pointer identity.
//!
//! Admission policy:
//!
//! - advertisers named like this relay are ignored;
//! - outside a priority window only saved sensors are tracked;
//! - inside one, anything advertising a relayed service is tracked too;
//! - one connection attempt is in flight at a time, bounded by
//!   [`CONNECT_TIMEOUT_MS`].

use heapless::{String, Vec};

use crate::ble::adv_parser;
use crate::ble::devices::{DeviceTable, DiscoveredDevice};
use crate::ble::discovery::{Discovery, Found, Next, Step};
use crate::ble::host::{Attribute, BleHost, DiscoverRequest, Subscription, TimerId};
use crate::ble::{BdAddr, LinkId, SubscriptionKey, SubscriptionKind};
use crate::config::{CONNECT_TIMEOUT_MS, MAX_CONNECTIONS, MAX_SUBSCRIPTIONS};
use crate::control_point::Trainer;
use crate::error::{BleError, HostError};
use crate::events::{self, DeviceEntry, EventSink};
use crate::storage::DeviceStore;

/// Longest advertised name of this unit ("Z-Relay-XXXX").
pub const ADV_NAME_MAX_LEN: usize = 16;

/// Target Setting Features bit 13: Indoor Bike Simulation Parameters.
const FEATURE_INDOOR_BIKE_SIMULATION: u32 = 1 << 13;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    #[default]
    Free,
    /// Connect issued, waiting for the link.
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotSubscription {
    pub kind: SubscriptionKind,
    pub value_handle: u16,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectionSlot {
    pub state: SlotState,
    pub link: Option<LinkId>,
    pub address: Option<BdAddr>,
    /// Bumped on every connection attempt.
    pub generation: u8,
    pub rssi: i8,
    discovery: Discovery,
    subscriptions: Vec<SlotSubscription, MAX_SUBSCRIPTIONS>,
    /// Trainer Control Point value handle.
    pub control_point: Option<u16>,
    pub feature_handle: Option<u16>,
    pub supports_simulation: bool,
}

impl ConnectionSlot {
    pub fn subscriptions(&self) -> &[SlotSubscription] {
        &self.subscriptions
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Reset for a new attempt, keeping the generation counter moving.
    fn begin(&mut self, address: BdAddr, link: LinkId) {
        let generation = self.generation.wrapping_add(1);
        *self = Self {
            state: SlotState::Connecting,
            link: Some(link),
            address: Some(address),
            generation,
            ..Default::default()
        };
    }

    /// Free the slot. Subscriptions are dropped without unsubscribing.
    fn clear(&mut self) {
        let generation = self.generation;
        *self = Self {
            generation,
            ..Default::default()
        };
    }

    fn is_live(&self) -> bool {
        self.state != SlotState::Free
    }
}

/// Subscription a notification arrived on, resolved against the slot table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ActiveSubscription {
    pub slot: usize,
    pub kind: SubscriptionKind,
    pub rssi: i8,
}

/// Which side a dropped link belonged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Disconnected {
    Sensor {
        slot: usize,
        was_trainer: bool,
        was_power_meter: bool,
    },
    Peripheral,
    Unknown,
}

pub struct ConnectionManager {
    slots: [ConnectionSlot; MAX_CONNECTIONS],
    devices: DeviceTable,
    /// Slot with a connect in flight.
    pending: Option<usize>,
    priority_window: bool,
    peripheral: Option<LinkId>,
    name: String<ADV_NAME_MAX_LEN>,
}

impl ConnectionManager {
    /// `name` is what the relay advertises itself as.
    pub fn new(name: &str) -> Self {
        let mut adv_name = String::new();
        for c in name.chars() {
            if adv_name.push(c).is_err() {
                break;
            }
        }
        Self {
            slots: Default::default(),
            devices: DeviceTable::new(),
            pending: None,
            priority_window: false,
            peripheral: None,
            name: adv_name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot(&self, slot: usize) -> Option<&ConnectionSlot> {
        self.slots.get(slot)
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn is_priority_window_open(&self) -> bool {
        self.priority_window
    }

    pub fn peripheral(&self) -> Option<LinkId> {
        self.peripheral
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state == SlotState::Connected).count()
    }

    pub fn is_connected_address(&self, address: &BdAddr) -> bool {
        self.slots
            .iter()
            .any(|s| s.state == SlotState::Connected && s.address.as_ref() == Some(address))
    }

    fn is_claimed_address(&self, address: &BdAddr) -> bool {
        self.slots
            .iter()
            .any(|s| s.is_live() && s.address.as_ref() == Some(address))
    }

    pub fn find_empty_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.is_live())
    }

    fn slot_of_link(&self, link: LinkId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.is_live() && s.link == Some(link))
    }

    /// Connected slot exposing a Control Point.
    pub fn trainer(&self) -> Option<Trainer> {
        self.slots.iter().find_map(|s| match (s.state, s.link, s.control_point) {
            (SlotState::Connected, Some(link), Some(handle)) => Some(Trainer {
                link,
                handle,
                supports_simulation: s.supports_simulation,
            }),
            _ => None,
        })
    }

    /// Resolve a subscription key; stale generations do not match.
    pub fn subscription(&self, key: SubscriptionKey) -> Option<ActiveSubscription> {
        let slot = key.slot as usize;
        let s = self.slots.get(slot)?;
        if s.state != SlotState::Connected || s.generation != key.generation {
            return None;
        }
        let sub = s.subscriptions.get(key.index as usize)?;
        Some(ActiveSubscription {
            slot,
            kind: sub.kind,
            rssi: s.rssi,
        })
    }

    // Scan / advertise lifecycle

    /// Start scanning; already scanning is fine.
    pub fn start_scan<H: BleHost>(&self, host: &mut H) {
        match host.start_scan() {
            Ok(()) | Err(HostError::Already) => {
                trace!("ble: scanning (window {})", self.priority_window);
            }
            Err(e) => warn!("ble: scan start failed: {:?}", BleError::from(e)),
        }
    }

    /// (Re)start connectable advertising, then resume scanning so saved
    /// sensors reconnect while the app is away.
    pub fn start_advertising<H: BleHost>(&self, host: &mut H) {
        match host.start_advertising(&self.name) {
            Ok(()) | Err(HostError::Already) => info!("ble: advertising as {}", self.name.as_str()),
            Err(e) => warn!("ble: advertising failed: {:?}", e),
        }
        self.start_scan(host);
    }

    pub fn open_priority_window<H: BleHost>(&mut self, host: &mut H, duration_ms: u64) {
        info!("ble: priority window open for {} ms", duration_ms);
        self.priority_window = true;
        host.schedule(TimerId::PriorityWindowEnd, duration_ms);
        self.start_scan(host);
    }

    pub fn close_priority_window<H: BleHost>(&mut self, host: &mut H) {
        if self.priority_window {
            info!("ble: priority window closed");
        }
        self.priority_window = false;
        self.start_scan(host);
    }

    // Discovery of advertisers

    /// Handle one scan report. Returns true if the device list changed.
    pub fn on_advertisement<H: BleHost>(
        &mut self,
        host: &mut H,
        store: &DeviceStore,
        address: BdAddr,
        rssi: i8,
        data: &[u8],
        now_ms: u64,
    ) -> bool {
        let mut changed = self.purge_stale(now_ms);

        let adv = adv_parser::parse(data);
        if adv.is_relay() {
            return changed;
        }

        let saved = store.get(&address);
        let mut services = adv.services;
        if let Some(record) = saved {
            services.insert(record.services);
        }

        if let Some(device) = self.devices.get_mut(&address) {
            if adv.name.is_some() && device.name != adv.name {
                if device.name.is_none() {
                    debug!("ble: captured name for {}", address);
                }
                device.name = adv.name;
            }
            device.services.insert(services);
            device.last_seen_ms = now_ms;
            device.rssi = rssi;
            device.saved = saved.is_some();
        } else {
            let track = saved.is_some() || (self.priority_window && !services.is_empty());
            if !track {
                return changed;
            }
            let device = DiscoveredDevice {
                address,
                name: adv.name,
                services,
                last_seen_ms: now_ms,
                rssi,
                saved: saved.is_some(),
            };
            if self.devices.insert(device).is_err() {
                warn!("ble: device table full, ignoring {}", address);
                return changed;
            }
            info!(
                "ble: added {} (services {:#x}, saved {})",
                address,
                services.bits(),
                saved.is_some()
            );
            changed = true;
        }

        self.try_connect(host, address);
        changed
    }

    fn purge_stale(&mut self, now_ms: u64) -> bool {
        let slots = &self.slots;
        let removed = self.devices.purge_stale(now_ms, |a| {
            slots
                .iter()
                .any(|s| s.is_live() && s.address.as_ref() == Some(a))
        });
        if removed > 0 {
            debug!("ble: aged out {} device(s)", removed);
        }
        removed > 0
    }

    fn try_connect<H: BleHost>(&mut self, host: &mut H, address: BdAddr) {
        let Some(device) = self.devices.get(&address) else {
            return;
        };
        if !device.is_connectable() || self.is_claimed_address(&address) {
            return;
        }
        if !device.saved && !self.priority_window {
            return;
        }
        if self.pending.is_some() {
            trace!("ble: connect already pending, {} waits", address);
            return;
        }
        let Some(slot) = self.find_empty_slot() else {
            trace!("ble: no free slot for {}", address);
            return;
        };

        if let Err(e) = host.stop_scan() {
            warn!("ble: stop scan failed: {:?}", e);
            return;
        }
        match host.connect(&address) {
            Ok(link) => {
                info!("ble: connecting to {} (slot {})", address, slot);
                self.slots[slot].begin(address, link);
                self.pending = Some(slot);
                host.schedule(TimerId::ConnectTimeout, CONNECT_TIMEOUT_MS);
            }
            Err(e) => {
                warn!("ble: connect to {} failed: {:?}", address, e);
                self.start_scan(host);
            }
        }
    }

    /// Connection establishment deadline passed.
    pub fn on_connect_timeout<H: BleHost>(&mut self, host: &mut H) {
        let Some(slot) = self.pending.take() else {
            return;
        };
        let s = &mut self.slots[slot];
        if let Some(link) = s.link {
            warn!("ble: connect timeout on slot {}, cancelling", slot);
            if let Err(e) = host.cancel_connect(link) {
                debug!("ble: cancel connect failed: {:?}", e);
            }
        }
        s.clear();
        self.start_scan(host);
    }

    // Link events

    /// A sensor link completed. Returns the slot if it was one of ours.
    pub fn on_connected<H: BleHost>(
        &mut self,
        host: &mut H,
        store: &mut DeviceStore,
        link: LinkId,
    ) -> Option<usize> {
        let Some(slot) = self.slot_of_link(link) else {
            warn!("ble: link {} connected without a slot", link.0);
            return None;
        };
        if self.pending == Some(slot) {
            self.pending = None;
            host.cancel(TimerId::ConnectTimeout);
        }

        let address = self.slots[slot].address?;
        let device = self.devices.get_mut(&address);
        let rssi = device.as_ref().map_or(0, |d| d.rssi);
        info!("ble: connected {} (slot {}, rssi {})", address, slot, rssi);

        if let Some(device) = device {
            if !device.saved {
                let name = device.name.as_deref().unwrap_or("");
                match store.save(address, name, device.services) {
                    Ok(_) => device.saved = true,
                    Err(e) => warn!("ble: could not remember {}: {:?}", address, e),
                }
            }
        }

        let s = &mut self.slots[slot];
        s.state = SlotState::Connected;
        s.rssi = rssi;
        let request = s.discovery.start();
        self.issue_discovery(host, slot, request);
        Some(slot)
    }

    /// A connection attempt failed before the link came up.
    pub fn on_connect_failed<H: BleHost>(&mut self, host: &mut H, link: LinkId, error: HostError) {
        let Some(slot) = self.slot_of_link(link) else {
            return;
        };
        warn!("ble: connect failed on slot {}: {:?}", slot, error);
        if self.pending == Some(slot) {
            self.pending = None;
            host.cancel(TimerId::ConnectTimeout);
        }
        self.slots[slot].clear();
        self.start_scan(host);
    }

    /// The companion app connected to our GATT server.
    pub fn on_peripheral_connected(&mut self, link: LinkId) {
        info!("ble: companion app connected (link {})", link.0);
        self.peripheral = Some(link);
    }

    pub fn on_disconnected<H: BleHost>(&mut self, host: &mut H, link: LinkId) -> Disconnected {
        if let Some(slot) = self.slot_of_link(link) {
            let s = &mut self.slots[slot];
            let was_trainer = s.control_point.is_some();
            let was_power_meter = s
                .subscriptions
                .iter()
                .any(|sub| sub.kind == SubscriptionKind::CyclingPower);
            info!(
                "ble: slot {} disconnected ({} subscriptions)",
                slot,
                s.subscriptions.len()
            );
            if let Some(address) = s.address {
                self.devices.remove(&address);
            }
            self.slots[slot].clear();
            if self.pending == Some(slot) {
                self.pending = None;
                host.cancel(TimerId::ConnectTimeout);
            }
            self.start_scan(host);
            return Disconnected::Sensor {
                slot,
                was_trainer,
                was_power_meter,
            };
        }

        if self.peripheral == Some(link) {
            info!("ble: companion app disconnected, re-advertising");
            self.peripheral = None;
            self.start_advertising(host);
            return Disconnected::Peripheral;
        }

        debug!("ble: unknown link {} disconnected", link.0);
        Disconnected::Unknown
    }

    /// Drop every sensor link; each one reports back through `on_disconnected`.
    pub fn disconnect_all<H: BleHost>(&mut self, host: &mut H) {
        for (i, s) in self.slots.iter().enumerate() {
            if let (SlotState::Connected, Some(link)) = (s.state, s.link) {
                info!("ble: disconnecting slot {}", i);
                if let Err(e) = host.disconnect(link) {
                    warn!("ble: disconnect slot {} failed: {:?}", i, e);
                }
            }
        }
    }

    /// Saved flags are stale once the store was cleared.
    pub fn forget_saved(&mut self) {
        for d in self.devices.iter_mut() {
            d.saved = false;
        }
    }

    // Discovery walk

    /// Answer to the outstanding discovery request on `link`.
    pub fn on_discovered<H: BleHost>(
        &mut self,
        host: &mut H,
        link: LinkId,
        result: Result<Option<Attribute>, HostError>,
    ) {
        let Some(slot) = self.slot_of_link(link) else {
            debug!("ble: discovery result for unknown link {}", link.0);
            return;
        };
        let step = self.slots[slot].discovery.on_result(result);
        self.run_step(host, slot, step);
    }

    fn issue_discovery<H: BleHost>(
        &mut self,
        host: &mut H,
        slot: usize,
        request: DiscoverRequest,
    ) {
        let Some(link) = self.slots[slot].link else {
            return;
        };
        if let Err(e) = host.discover(link, request) {
            let step = self.slots[slot].discovery.on_request_failed(e);
            self.run_step(host, slot, step);
        }
    }

    fn run_step<H: BleHost>(&mut self, host: &mut H, slot: usize, mut step: Step) {
        loop {
            if let Some(found) = step.found.take() {
                self.on_found(host, slot, found);
            }
            let Some(link) = self.slots[slot].link else {
                return;
            };
            match step.next {
                Next::Request(request) => match host.discover(link, request) {
                    Ok(()) => return,
                    Err(e) => step = self.slots[slot].discovery.on_request_failed(e),
                },
                Next::Complete => {
                    let s = &self.slots[slot];
                    info!(
                        "ble: slot {} discovery complete, {} subscriptions",
                        slot,
                        s.subscriptions.len()
                    );
                    if let Some(handle) = s.feature_handle {
                        if let Err(e) = host.read(link, handle) {
                            warn!("ble: feature read failed: {:?}", e);
                        }
                    }
                    self.start_scan(host);
                    return;
                }
                Next::Abort => {
                    warn!("ble: slot {} discovery aborted", slot);
                    self.start_scan(host);
                    return;
                }
            }
        }
    }

    fn on_found<H: BleHost>(&mut self, host: &mut H, slot: usize, found: Found) {
        match found {
            Found::Subscribe(kind, subscription) => self.subscribe(host, slot, kind, subscription),
            Found::ControlPoint(subscription) => {
                info!(
                    "ble: slot {} is the trainer (control point {})",
                    slot, subscription.value_handle
                );
                self.slots[slot].control_point = Some(subscription.value_handle);
                self.subscribe(host, slot, SubscriptionKind::ControlPoint, subscription);
            }
            Found::Feature(handle) => self.slots[slot].feature_handle = Some(handle),
        }
    }

    fn subscribe<H: BleHost>(
        &mut self,
        host: &mut H,
        slot: usize,
        kind: SubscriptionKind,
        subscription: Subscription,
    ) {
        let s = &mut self.slots[slot];
        let Some(link) = s.link else {
            return;
        };
        if s.subscriptions.is_full() {
            warn!("ble: slot {} subscription table full, {:?} dropped", slot, kind);
            return;
        }
        let key = SubscriptionKey {
            slot: slot as u8,
            generation: s.generation,
            index: s.subscriptions.len() as u8,
        };
        match host.subscribe(link, key, subscription) {
            Ok(()) => {
                debug!("ble: slot {} subscribed {:?}", slot, kind);
                let _ = s.subscriptions.push(SlotSubscription {
                    kind,
                    value_handle: subscription.value_handle,
                });
            }
            Err(e) => warn!("ble: subscribe {:?} failed: {:?}", kind, BleError::from(e)),
        }
    }

    /// Read answer; only the Fitness Machine Feature is ever read.
    pub fn on_read_complete(&mut self, link: LinkId, handle: u16, result: Result<&[u8], HostError>) {
        let Some(slot) = self.slot_of_link(link) else {
            return;
        };
        let s = &mut self.slots[slot];
        if s.feature_handle != Some(handle) {
            return;
        }
        match result {
            Ok(data) if data.len() >= 8 => {
                let target = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                s.supports_simulation = target & FEATURE_INDOOR_BIKE_SIMULATION != 0;
                info!(
                    "ble: trainer simulation support: {}",
                    s.supports_simulation
                );
            }
            Ok(data) => warn!("ble: short feature value ({} bytes)", data.len()),
            Err(e) => warn!("ble: feature read failed: {:?}", e),
        }
    }

    /// Emit a `devices` event.
    pub fn snapshot<S: EventSink>(&self, out: &mut S, now_ms: u64) {
        let list: Vec<DeviceEntry<'_>, { crate::config::MAX_DISCOVERED }> = self
            .devices
            .iter()
            .map(|d| DeviceEntry {
                name: d.name.as_deref(),
                address: d.address,
                connected: self.is_connected_address(&d.address),
                saved: d.saved,
                last_seen_ms: d.last_seen_ms,
            })
            .collect();
        events::devices(out, now_ms, &list);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::host::mock::{Call, MockHost};
    use crate::ble::host::{CharProps, SubscribeMode};
    use crate::ble::{uuid, ServiceMask};
    use crate::events::testing::Lines;

    const HRM: BdAddr = BdAddr::new(0, [1, 0, 0, 0, 0, 0xC0]);
    const KICKR: BdAddr = BdAddr::new(0, [2, 0, 0, 0, 0, 0xC0]);

    fn adv(name: &str, service: u16) -> std::vec::Vec<u8> {
        let mut data = vec![3, 0x03];
        data.extend_from_slice(&service.to_le_bytes());
        data.push(name.len() as u8 + 1);
        data.push(0x09);
        data.extend_from_slice(name.as_bytes());
        data
    }

    fn manager() -> (ConnectionManager, MockHost, DeviceStore) {
        (ConnectionManager::new("Z-Relay-1234"), MockHost::default(), DeviceStore::new())
    }

    #[test]
    fn unsaved_device_ignored_outside_window() {
        let (mut m, mut host, store) = manager();
        let changed = m.on_advertisement(&mut host, &store, HRM, -50, &adv("HRM", 0x180D), 0);
        assert!(!changed);
        assert!(m.devices().is_empty());
        assert!(host.calls.is_empty());
    }

    #[test]
    fn own_relays_are_ignored() {
        let (mut m, mut host, store) = manager();
        m.open_priority_window(&mut host, 1_000);
        host.take();
        m.on_advertisement(&mut host, &store, HRM, -50, &adv("Z-Relay-9ABC", 0x180D), 0);
        assert!(m.devices().is_empty());
    }

    #[test]
    fn window_admits_and_connects() {
        let (mut m, mut host, store) = manager();
        m.open_priority_window(&mut host, 300_000);
        assert_eq!(
            host.take(),
            [Call::Schedule(TimerId::PriorityWindowEnd, 300_000), Call::StartScan]
        );

        assert!(m.on_advertisement(&mut host, &store, HRM, -50, &adv("HRM", 0x180D), 0));
        assert_eq!(
            host.take(),
            [
                Call::StopScan,
                Call::Connect(HRM),
                Call::Schedule(TimerId::ConnectTimeout, CONNECT_TIMEOUT_MS)
            ]
        );
        assert_eq!(m.slot(0).unwrap().state, SlotState::Connecting);
    }

    #[test]
    fn saved_device_connects_any_time() {
        let (mut m, mut host, mut store) = manager();
        store.save(KICKR, "KICKR", ServiceMask::FITNESS_MACHINE).unwrap();
        // no service list in this advertisement; the saved mask fills in
        let mut data = vec![6, 0x09];
        data.extend_from_slice(b"KICKR");
        m.on_advertisement(&mut host, &store, KICKR, -40, &data, 0);
        assert!(host.calls.contains(&Call::Connect(KICKR)));
    }

    #[test]
    fn nameless_device_tracked_but_not_connected() {
        let (mut m, mut host, store) = manager();
        m.open_priority_window(&mut host, 1_000);
        host.take();
        m.on_advertisement(&mut host, &store, HRM, -50, &[3, 0x03, 0x0D, 0x18], 0);
        assert_eq!(m.devices().len(), 1);
        assert!(host.calls.is_empty());
    }

    #[test]
    fn only_one_pending_connect() {
        let (mut m, mut host, store) = manager();
        m.open_priority_window(&mut host, 1_000);
        m.on_advertisement(&mut host, &store, HRM, -50, &adv("HRM", 0x180D), 0);
        host.take();
        m.on_advertisement(&mut host, &store, KICKR, -50, &adv("KICKR", 0x1826), 10);
        assert!(!host.calls.iter().any(|c| matches!(c, Call::Connect(_))));
    }

    #[test]
    fn connect_timeout_cancels_and_rescans() {
        let (mut m, mut host, store) = manager();
        m.open_priority_window(&mut host, 1_000);
        m.on_advertisement(&mut host, &store, HRM, -50, &adv("HRM", 0x180D), 0);
        host.take();
        m.on_connect_timeout(&mut host);
        assert_eq!(host.take(), [Call::CancelConnect(LinkId(1)), Call::StartScan]);
        assert_eq!(m.slot(0).unwrap().state, SlotState::Free);
    }

    #[test]
    fn connected_device_is_saved_and_discovery_starts() {
        let (mut m, mut host, mut store) = manager();
        m.open_priority_window(&mut host, 1_000);
        m.on_advertisement(&mut host, &store, HRM, -55, &adv("HRM", 0x180D), 0);
        host.take();

        assert_eq!(m.on_connected(&mut host, &mut store, LinkId(1)), Some(0));
        assert!(store.is_saved(&HRM));
        assert_eq!(m.slot(0).unwrap().rssi, -55);
        assert_eq!(
            host.take(),
            [
                Call::Cancel(TimerId::ConnectTimeout),
                Call::Discover(
                    LinkId(1),
                    DiscoverRequest::PrimaryService { uuid: uuid::HEART_RATE_SERVICE }
                )
            ]
        );
    }

    fn connected_trainer() -> (ConnectionManager, MockHost, DeviceStore) {
        let (mut m, mut host, mut store) = manager();
        m.open_priority_window(&mut host, 1_000);
        m.on_advertisement(&mut host, &store, KICKR, -40, &adv("KICKR", 0x1826), 0);
        m.on_connected(&mut host, &mut store, LinkId(1));
        // no HR, no CP
        m.on_discovered(&mut host, LinkId(1), Ok(None));
        m.on_discovered(&mut host, LinkId(1), Ok(None));
        m.on_discovered(&mut host, LinkId(1), Ok(Some(Attribute::Service { start: 10, end: 30 })));
        m.on_discovered(
            &mut host,
            LinkId(1),
            Ok(Some(Attribute::Characteristic {
                uuid: uuid::FITNESS_MACHINE_FEATURE,
                value_handle: 12,
                props: CharProps(CharProps::READ),
            })),
        );
        m.on_discovered(
            &mut host,
            LinkId(1),
            Ok(Some(Attribute::Characteristic {
                uuid: uuid::INDOOR_BIKE_DATA,
                value_handle: 14,
                props: CharProps(CharProps::NOTIFY),
            })),
        );
        m.on_discovered(&mut host, LinkId(1), Ok(Some(Attribute::Descriptor { handle: 15 })));
        m.on_discovered(
            &mut host,
            LinkId(1),
            Ok(Some(Attribute::Characteristic {
                uuid: uuid::FITNESS_MACHINE_CONTROL_POINT,
                value_handle: 20,
                props: CharProps(CharProps::WRITE | CharProps::INDICATE),
            })),
        );
        host.take();
        m.on_discovered(&mut host, LinkId(1), Ok(None));
        (m, host, store)
    }

    #[test]
    fn trainer_discovery_subscribes_and_reads_feature() {
        let (m, mut host, _) = connected_trainer();
        assert_eq!(host.take(), [Call::Read(LinkId(1), 12), Call::StartScan]);

        let slot = m.slot(0).unwrap();
        assert!(slot.discovery().is_complete());
        assert_eq!(slot.subscriptions().len(), 2);
        assert_eq!(slot.subscriptions()[1].kind, SubscriptionKind::ControlPoint);
        assert_eq!(
            m.trainer(),
            Some(Trainer {
                link: LinkId(1),
                handle: 20,
                supports_simulation: false
            })
        );
    }

    #[test]
    fn control_point_subscription_uses_next_handle() {
        let (mut m, mut host, mut store) = manager();
        m.open_priority_window(&mut host, 1_000);
        m.on_advertisement(&mut host, &store, KICKR, -40, &adv("KICKR", 0x1826), 0);
        m.on_connected(&mut host, &mut store, LinkId(1));
        m.on_discovered(&mut host, LinkId(1), Ok(None));
        m.on_discovered(&mut host, LinkId(1), Ok(None));
        m.on_discovered(&mut host, LinkId(1), Ok(Some(Attribute::Service { start: 10, end: 30 })));
        host.take();
        m.on_discovered(
            &mut host,
            LinkId(1),
            Ok(Some(Attribute::Characteristic {
                uuid: uuid::FITNESS_MACHINE_CONTROL_POINT,
                value_handle: 20,
                props: CharProps(CharProps::WRITE | CharProps::INDICATE),
            })),
        );
        let key = SubscriptionKey {
            slot: 0,
            generation: 1,
            index: 0,
        };
        assert_eq!(
            host.take()[0],
            Call::Subscribe(
                LinkId(1),
                key,
                Subscription {
                    value_handle: 20,
                    ccc_handle: 21,
                    mode: SubscribeMode::Indicate
                }
            )
        );
    }

    #[test]
    fn feature_bit_13_marks_simulation_support() {
        let (mut m, _, _) = connected_trainer();
        let feature = [0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0x00];
        m.on_read_complete(LinkId(1), 12, Ok(&feature));
        assert!(m.trainer().unwrap().supports_simulation);
    }

    #[test]
    fn stale_generation_rejected() {
        let (mut m, mut host, mut store) = connected_trainer();
        let key = SubscriptionKey {
            slot: 0,
            generation: 1,
            index: 0,
        };
        assert_eq!(m.subscription(key).unwrap().kind, SubscriptionKind::IndoorBikeData);

        m.on_disconnected(&mut host, LinkId(1));
        assert_eq!(m.subscription(key), None);

        // same sensor back in the same slot, new generation
        m.on_advertisement(&mut host, &store, KICKR, -40, &adv("KICKR", 0x1826), 100);
        m.on_connected(&mut host, &mut store, LinkId(2));
        assert_eq!(m.slot(0).unwrap().generation, 2);
        assert_eq!(m.subscription(key), None);
    }

    #[test]
    fn sensor_disconnect_frees_slot_and_rescans() {
        let (mut m, mut host, _) = connected_trainer();
        host.take();
        let d = m.on_disconnected(&mut host, LinkId(1));
        assert_eq!(
            d,
            Disconnected::Sensor {
                slot: 0,
                was_trainer: true,
                was_power_meter: false
            }
        );
        assert_eq!(host.take(), [Call::StartScan]);
        assert!(m.devices().get(&KICKR).is_none());
        assert_eq!(m.trainer(), None);
    }

    #[test]
    fn peripheral_disconnect_readvertises() {
        let (mut m, mut host, _) = manager();
        m.on_peripheral_connected(LinkId(9));
        assert_eq!(m.on_disconnected(&mut host, LinkId(9)), Disconnected::Peripheral);
        assert_eq!(
            host.take(),
            [Call::StartAdvertising("Z-Relay-1234".into()), Call::StartScan]
        );
        assert_eq!(m.peripheral(), None);
    }

    #[test]
    fn primary_service_failure_aborts_and_rescans() {
        let (mut m, mut host, mut store) = manager();
        m.open_priority_window(&mut host, 1_000);
        m.on_advertisement(&mut host, &store, HRM, -50, &adv("HRM", 0x180D), 0);
        m.on_connected(&mut host, &mut store, LinkId(1));
        host.take();
        m.on_discovered(&mut host, LinkId(1), Err(HostError::Raw(0x0A)));
        assert_eq!(host.take(), [Call::StartScan]);
        assert_eq!(m.slot(0).unwrap().state, SlotState::Connected);
    }

    #[test]
    fn failed_subscribe_not_recorded() {
        let (mut m, mut host, mut store) = manager();
        m.open_priority_window(&mut host, 1_000);
        m.on_advertisement(&mut host, &store, HRM, -50, &adv("HRM", 0x180D), 0);
        m.on_connected(&mut host, &mut store, LinkId(1));
        m.on_discovered(&mut host, LinkId(1), Ok(Some(Attribute::Service { start: 1, end: 5 })));
        m.on_discovered(
            &mut host,
            LinkId(1),
            Ok(Some(Attribute::Characteristic {
                uuid: uuid::HEART_RATE_MEASUREMENT,
                value_handle: 3,
                props: CharProps(CharProps::NOTIFY),
            })),
        );
        host.fail_subscribe = Some(HostError::NoMemory);
        m.on_discovered(&mut host, LinkId(1), Ok(Some(Attribute::Descriptor { handle: 4 })));
        assert!(m.slot(0).unwrap().subscriptions().is_empty());
    }

    #[test]
    fn stale_devices_aged_on_advertisement() {
        let (mut m, mut host, mut store) = manager();
        store.save(HRM, "HRM", ServiceMask::HEART_RATE).unwrap();
        m.open_priority_window(&mut host, 1_000);
        m.on_advertisement(&mut host, &store, KICKR, -40, &[3, 0x03, 0x26, 0x18], 0);
        assert_eq!(m.devices().len(), 1);
        let changed = m.on_advertisement(&mut host, &store, HRM, -40, &[], 10_001);
        assert!(changed);
        assert!(m.devices().get(&KICKR).is_none());
    }

    #[test]
    fn closing_window_resumes_scan() {
        let (mut m, mut host, _) = manager();
        m.open_priority_window(&mut host, 1_000);
        host.take();
        m.close_priority_window(&mut host);
        assert!(!m.is_priority_window_open());
        assert_eq!(host.take(), [Call::StartScan]);
    }

    #[test]
    fn disconnect_all_touches_connected_slots() {
        let (mut m, mut host, _) = connected_trainer();
        host.take();
        m.disconnect_all(&mut host);
        assert_eq!(host.take(), [Call::Disconnect(LinkId(1))]);
    }

    #[test]
    fn snapshot_marks_connected_devices() {
        let (m, _, _) = connected_trainer();
        let mut out = Lines::default();
        m.snapshot(&mut out, 5);
        let line = &out.lines[0];
        assert!(line.contains("\"count\":1"));
        assert!(line.contains("\"name\":\"KICKR\""));
        assert!(line.contains("\"connected\":true,\"saved\":true"));
    }
}
