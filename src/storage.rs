//! Persistent storage for previously connected sensors.
//!
//! The in-memory [`DeviceStore`] is authoritative; every mutation marks the
//! touched slot dirty and the embedded build flushes dirty slots to the
//! nRF52840's internal flash through `sequential-storage`.
//!
//! Storage layout (key → value, one map over the reserved flash pages):
//!   - `1..=4`  one [`SavedDevice`] record per slot
//!   - `100`    grade safety table (see [`crate::grade_limiter`])
//!   - `101`    grade limiter active-time counters
//!   - `200`    persisted random device suffix (boards without a hardware id)

use core::fmt::Write;

use heapless::{String, Vec};

use crate::ble::{BdAddr, ServiceMask};
use crate::config::{MAX_SAVED_DEVICES, NAME_MAX_LEN};
use crate::error::StorageError;

/// Flash map key of device slot `i`.
pub const fn device_key(slot: usize) -> u8 {
    1 + slot as u8
}
pub const KEY_GRADE_TABLE: u8 = 100;
pub const KEY_GRADE_ACTIVITY: u8 = 101;
pub const KEY_DEVICE_SUFFIX: u8 = 200;

/// Serialized size of one device record:
/// `[valid][type][6 addr][mask][name_len][32 name]`.
pub const DEVICE_RECORD_SIZE: usize = 1 + 1 + 6 + 1 + 1 + NAME_MAX_LEN;

/// A sensor remembered across reboots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SavedDevice {
    pub address: BdAddr,
    pub name: String<NAME_MAX_LEN>,
    pub services: ServiceMask,
}

impl SavedDevice {
    /// Serialize to a fixed-size record.
    pub fn serialize(&self, buf: &mut [u8; DEVICE_RECORD_SIZE]) {
        let name = self.name.as_bytes();
        buf.fill(0);
        buf[0] = 1;
        buf[1] = self.address.addr_type;
        buf[2..8].copy_from_slice(&self.address.bytes);
        buf[8] = self.services.bits();
        buf[9] = name.len() as u8;
        buf[10..10 + name.len()].copy_from_slice(name);
    }

    /// Decode a record. `Ok(None)` is an empty (forgotten) slot.
    pub fn deserialize(data: &[u8]) -> Result<Option<Self>, StorageError> {
        if data.len() < 10 {
            return Err(StorageError::Corrupt);
        }
        if data[0] == 0 {
            return Ok(None);
        }

        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&data[2..8]);
        let name_len = data[9] as usize;
        if name_len > NAME_MAX_LEN || data.len() < 10 + name_len {
            return Err(StorageError::Corrupt);
        }

        let mut name = String::new();
        if let Ok(s) = core::str::from_utf8(&data[10..10 + name_len]) {
            let _ = name.push_str(s);
        }

        Ok(Some(Self {
            address: BdAddr::new(data[1], bytes),
            name,
            services: ServiceMask::from_bits(data[8]),
        }))
    }
}

/// Up to [`MAX_SAVED_DEVICES`] remembered sensors.
pub struct DeviceStore {
    slots: [Option<SavedDevice>; MAX_SAVED_DEVICES],
    /// Bit `i` set - slot `i` differs from flash.
    dirty: u8,
}

impl Default for DeviceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore {
    /// Create an empty store.
    pub const fn new() -> Self {
        const EMPTY: Option<SavedDevice> = None;
        Self {
            slots: [EMPTY; MAX_SAVED_DEVICES],
            dirty: 0,
        }
    }

    /// Remember a sensor: update in place, else take the first empty slot.
    ///
    /// There is no eviction; a fifth distinct address fails.
    pub fn save(
        &mut self,
        address: BdAddr,
        name: &str,
        services: ServiceMask,
    ) -> Result<usize, StorageError> {
        let mut stored_name = String::new();
        for c in name.chars() {
            if stored_name.push(c).is_err() {
                break;
            }
        }
        let record = SavedDevice {
            address,
            name: stored_name,
            services,
        };

        let slot = match self.slot_of(&address) {
            Some(i) => i,
            None => self
                .slots
                .iter()
                .position(Option::is_none)
                .ok_or(StorageError::NoFreeSlot)?,
        };

        if self.slots[slot].as_ref() != Some(&record) {
            info!("store: saved {} in slot {}", record.name.as_str(), slot);
            self.slots[slot] = Some(record);
            self.dirty |= 1 << slot;
        }
        Ok(slot)
    }

    pub fn is_saved(&self, address: &BdAddr) -> bool {
        self.slot_of(address).is_some()
    }

    pub fn get(&self, address: &BdAddr) -> Option<&SavedDevice> {
        self.slots.iter().flatten().find(|d| d.address == *address)
    }

    /// All valid records, in slot order.
    pub fn load_all(&self) -> Vec<SavedDevice, MAX_SAVED_DEVICES> {
        self.slots.iter().flatten().cloned().collect()
    }

    /// Forget every sensor.
    pub fn clear_all(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.take().is_some() {
                self.dirty |= 1 << i;
            }
        }
        info!("store: all devices forgotten");
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restore slot `i` from its flash record without marking it dirty.
    pub fn restore(&mut self, slot: usize, device: Option<SavedDevice>) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = device;
        }
    }

    /// Record of slot `i` as stored in flash (all-zero if empty).
    pub fn record(&self, slot: usize) -> [u8; DEVICE_RECORD_SIZE] {
        let mut buf = [0u8; DEVICE_RECORD_SIZE];
        if let Some(Some(d)) = self.slots.get(slot) {
            d.serialize(&mut buf);
        }
        buf
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    /// Dirty slot indices; clears the flags. A failed flush re-marks them.
    pub fn take_dirty(&mut self) -> impl Iterator<Item = usize> {
        let dirty = core::mem::take(&mut self.dirty);
        (0..MAX_SAVED_DEVICES).filter(move |i| dirty & (1 << i) != 0)
    }

    pub fn mark_dirty(&mut self, slot: usize) {
        self.dirty |= 1 << slot;
    }

    fn slot_of(&self, address: &BdAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|d| d.address == *address))
    }
}

/// 4-hex-digit unit suffix derived by XOR-folding a hardware id into 16 bits.
pub fn device_suffix(hardware_id: &[u8]) -> String<4> {
    let hash = hardware_id
        .iter()
        .enumerate()
        .fold(0u16, |h, (i, &b)| h ^ ((b as u16) << (8 * (i % 2))));
    suffix_from_u16(hash)
}

pub fn suffix_from_u16(value: u16) -> String<4> {
    let mut s = String::new();
    let _ = write!(s, "{:04X}", value);
    s
}

/// Thin wrappers over `sequential-storage`'s key-value map.
#[cfg(feature = "embedded")]
pub mod flash {
    use core::ops::Range;

    use embedded_storage_async::nor_flash::NorFlash;
    use sequential_storage::cache::NoCache;
    use sequential_storage::map::{fetch_item, store_item};

    use super::*;
    use crate::config::{STORAGE_FLASH_PAGE_COUNT, STORAGE_FLASH_PAGE_START};
    use crate::grade_limiter::{GradeLimiter, ACTIVITY_BLOB_SIZE, TABLE_BLOB_SIZE};

    /// Flash page size for nRF52840 (4 KB).
    const FLASH_PAGE_SIZE: u32 = 4096;

    /// Reserved flash region.
    pub const RANGE: Range<u32> = (STORAGE_FLASH_PAGE_START * FLASH_PAGE_SIZE)
        ..((STORAGE_FLASH_PAGE_START + STORAGE_FLASH_PAGE_COUNT) * FLASH_PAGE_SIZE);

    /// Scratch buffer size; fits the largest value (grade table).
    pub const BUF_SIZE: usize = 128;

    /// Fetch `key` into `out`; `Ok(0)` if absent.
    pub async fn fetch<F: NorFlash>(flash: &mut F, key: u8, out: &mut [u8]) -> Result<usize, StorageError> {
        let mut buf = [0u8; BUF_SIZE];
        match fetch_item::<u8, &[u8], _>(flash, RANGE, &mut NoCache::new(), &mut buf, &key).await {
            Ok(Some(data)) => {
                let n = data.len().min(out.len());
                out[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Ok(None) => Ok(0),
            Err(e) => {
                error!("flash: read of key {} failed: {:?}", key, defmt::Debug2Format(&e));
                Err(StorageError::Flash)
            }
        }
    }

    /// Store `data` under `key`.
    pub async fn store<F: NorFlash>(flash: &mut F, key: u8, data: &[u8]) -> Result<(), StorageError> {
        let mut buf = [0u8; BUF_SIZE];
        store_item::<u8, &[u8], _>(flash, RANGE, &mut NoCache::new(), &mut buf, &key, &data)
            .await
            .map_err(|e| {
                error!("flash: write of key {} failed: {:?}", key, defmt::Debug2Format(&e));
                StorageError::Flash
            })
    }

    impl DeviceStore {
        /// Load all device slots from flash.
        pub async fn load_from_flash<F: NorFlash>(&mut self, flash: &mut F) {
            let mut record = [0u8; DEVICE_RECORD_SIZE];
            for slot in 0..MAX_SAVED_DEVICES {
                let device = match fetch(flash, device_key(slot), &mut record).await {
                    Ok(0) | Err(_) => None,
                    Ok(n) => SavedDevice::deserialize(&record[..n]).unwrap_or(None),
                };
                self.restore(slot, device);
            }
            self.dirty = 0;
            info!("store: loaded {} devices from flash", self.len());
        }

        /// Persist dirty slots. Failed slots stay dirty for the next flush.
        pub async fn save_to_flash<F: NorFlash>(&mut self, flash: &mut F) {
            let dirty: Vec<usize, MAX_SAVED_DEVICES> = self.take_dirty().collect();
            for slot in dirty {
                let record = self.record(slot);
                if store(flash, device_key(slot), &record).await.is_err() {
                    self.mark_dirty(slot);
                }
            }
        }
    }

    /// Restore the grade table and activity counters; defaults stay on a miss.
    pub async fn load_grade_limiter<F: NorFlash>(flash: &mut F, limiter: &mut GradeLimiter) {
        let mut buf = [0u8; TABLE_BLOB_SIZE];
        if let Ok(n) = fetch(flash, KEY_GRADE_TABLE, &mut buf).await {
            if n > 0 && limiter.load_table(&buf[..n]).is_ok() {
                info!("store: grade table restored");
            }
        }
        let mut buf = [0u8; ACTIVITY_BLOB_SIZE];
        if let Ok(n) = fetch(flash, KEY_GRADE_ACTIVITY, &mut buf).await {
            if n > 0 && limiter.load_activity(&buf[..n]).is_ok() {
                info!("store: {} active hours on record", limiter.active_hours());
            }
        }
    }

    /// Persist whatever the limiter marked dirty.
    pub async fn save_grade_limiter<F: NorFlash>(flash: &mut F, limiter: &mut GradeLimiter) {
        if limiter.take_table_dirty() {
            let _ = store(flash, KEY_GRADE_TABLE, &limiter.encode_table()).await;
        }
        if limiter.take_activity_dirty() {
            let _ = store(flash, KEY_GRADE_ACTIVITY, &limiter.encode_activity()).await;
        }
    }

    /// Persisted random suffix for boards without a usable hardware id.
    ///
    /// `fresh` is stored and returned the first time.
    pub async fn persisted_suffix<F: NorFlash>(flash: &mut F, fresh: u16) -> String<4> {
        let mut buf = [0u8; 2];
        let value = match fetch(flash, KEY_DEVICE_SUFFIX, &mut buf).await {
            Ok(2) => u16::from_le_bytes(buf),
            _ => {
                let _ = store(flash, KEY_DEVICE_SUFFIX, &fresh.to_le_bytes()).await;
                fresh
            }
        };
        suffix_from_u16(value)
    }
}
