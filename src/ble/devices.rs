//! Bounded table of devices seen while scanning.
//!
//! Allocated once with [`MAX_DISCOVERED`] entries; when it is full new
//! advertisers are simply not tracked until aging frees an entry.

use heapless::{String, Vec};

use crate::ble::{BdAddr, ServiceMask};
use crate::config::{DEVICE_AGING_MS, MAX_DISCOVERED, NAME_MAX_LEN};

/// An advertiser the relay is tracking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: BdAddr,
    /// Advertised name; `None` until one was seen.
    pub name: Option<String<NAME_MAX_LEN>>,
    pub services: ServiceMask,
    pub last_seen_ms: u64,
    pub rssi: i8,
    pub saved: bool,
}

impl DiscoveredDevice {
    /// Eligible for a connection attempt: a relayed service and a real name.
    pub fn is_connectable(&self) -> bool {
        !self.services.is_empty() && self.name.is_some()
    }
}

/// Fixed-capacity set of [`DiscoveredDevice`]s keyed by address.
#[derive(Default)]
pub struct DeviceTable {
    devices: Vec<DiscoveredDevice, MAX_DISCOVERED>,
}

impl DeviceTable {
    pub const fn new() -> Self {
        Self { devices: Vec::new() }
    }

    pub fn get(&self, address: &BdAddr) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.address == *address)
    }

    pub fn get_mut(&mut self, address: &BdAddr) -> Option<&mut DiscoveredDevice> {
        self.devices.iter_mut().find(|d| d.address == *address)
    }

    /// Insert a new device; returns it back if the table is full.
    pub fn insert(&mut self, device: DiscoveredDevice) -> Result<(), DiscoveredDevice> {
        self.devices.push(device)
    }

    pub fn remove(&mut self, address: &BdAddr) -> bool {
        match self.devices.iter().position(|d| d.address == *address) {
            Some(i) => {
                self.devices.swap_remove(i);
                true
            }
            None => false,
        }
    }

    /// Drop devices not seen for [`DEVICE_AGING_MS`]; `is_connected` ones
    /// are refreshed instead. Returns how many were removed.
    pub fn purge_stale(&mut self, now_ms: u64, is_connected: impl Fn(&BdAddr) -> bool) -> usize {
        let before = self.devices.len();
        self.devices.retain_mut(|d| {
            if is_connected(&d.address) {
                d.last_seen_ms = now_ms;
                return true;
            }
            now_ms.saturating_sub(d.last_seen_ms) < DEVICE_AGING_MS
        });
        before - self.devices.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DiscoveredDevice> {
        self.devices.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.devices.is_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(last: u8, seen: u64) -> DiscoveredDevice {
        DiscoveredDevice {
            address: BdAddr::new(1, [last, 0, 0, 0, 0, 0xC0]),
            name: None,
            services: ServiceMask::HEART_RATE,
            last_seen_ms: seen,
            rssi: -60,
            saved: false,
        }
    }

    #[test]
    fn idle_unconnected_device_is_purged() {
        let mut table = DeviceTable::new();
        table.insert(device(1, 0)).unwrap();
        table.insert(device(2, 5_000)).unwrap();

        let removed = table.purge_stale(10_000, |_| false);
        assert_eq!(removed, 1);
        assert!(table.get(&device(1, 0).address).is_none());
        assert!(table.get(&device(2, 0).address).is_some());
    }

    #[test]
    fn connected_device_survives_and_is_refreshed() {
        let mut table = DeviceTable::new();
        let d = device(1, 0);
        let addr = d.address;
        table.insert(d).unwrap();

        assert_eq!(table.purge_stale(60_000, |a| *a == addr), 0);
        assert_eq!(table.get(&addr).unwrap().last_seen_ms, 60_000);
    }

    #[test]
    fn full_table_rejects_new_devices() {
        let mut table = DeviceTable::new();
        for i in 0..MAX_DISCOVERED as u8 {
            table.insert(device(i, 0)).unwrap();
        }
        assert!(table.is_full());
        assert!(table.insert(device(0xFF, 0)).is_err());
    }

    #[test]
    fn connectable_needs_service_and_name() {
        let mut d = device(1, 0);
        assert!(!d.is_connectable());
        d.name = Some(String::try_from("HRM").unwrap());
        assert!(d.is_connectable());
        d.services = ServiceMask::NONE;
        assert!(!d.is_connectable());
    }
}
