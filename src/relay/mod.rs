//! Data-plane relay: sensor notifications in, peripheral notifications out.
//!
//! Each inbound notification is dispatched on its subscription tag,
//! decoded for the event stream and republished on the matching local
//! characteristic. Two streams are fused on the way through:
//!
//! - power-meter crank data is turned into a cadence value and a
//!   synthesized CSC Measurement;
//! - a fresh power-meter reading replaces the trainer's own power estimate
//!   in Indoor Bike Data.

pub mod cycling_power;
pub mod heart_rate;
pub mod indoor_bike;
pub mod machine_status;

use crate::ble::host::BleHost;
use crate::ble::{LocalCharacteristic, SubscriptionKind};
use crate::config::{CADENCE_ZERO_TIMEOUT_MS, CP_CACHE_TIMEOUT_MS};
use crate::error::HostError;
use crate::events::{self, EventSink};

use self::cycling_power::{CrankData, CyclingPowerMeasurement};

/// Longest Indoor Bike Data frame that can be rewritten; longer frames are
/// relayed untouched.
pub const MAX_FRAME_LEN: usize = 64;

/// Last power-meter state, shared with the trainer stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrossSensorCache {
    power: i16,
    /// 0.5 rpm units.
    cadence: u16,
    crank: Option<CrankData>,
    crank_changed_at_ms: u64,
    updated_at_ms: u64,
    valid: bool,
}

impl CrossSensorCache {
    pub const fn new() -> Self {
        Self {
            power: 0,
            cadence: 0,
            crank: None,
            crank_changed_at_ms: 0,
            updated_at_ms: 0,
            valid: false,
        }
    }

    /// Fold one power measurement in.
    pub fn update(&mut self, m: &CyclingPowerMeasurement, now_ms: u64) {
        self.power = m.power;
        self.updated_at_ms = now_ms;
        self.valid = true;

        let Some(current) = m.crank else {
            return;
        };
        match self.crank {
            None => self.crank_changed_at_ms = now_ms,
            Some(previous) if previous.revolutions != current.revolutions => {
                match cycling_power::cadence_half_rpm(previous, current) {
                    Some(cadence) => self.cadence = cadence,
                    None => {
                        debug!("relay: crank counter jumped, new baseline");
                        self.cadence = 0;
                    }
                }
                self.crank_changed_at_ms = now_ms;
            }
            Some(_) => {
                if now_ms.saturating_sub(self.crank_changed_at_ms) >= CADENCE_ZERO_TIMEOUT_MS {
                    self.cadence = 0;
                }
            }
        }
        self.crank = Some(current);
    }

    /// Drop everything learned from the power meter.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Cached power if it was updated less than 5 s ago.
    pub fn fresh_power(&self, now_ms: u64) -> Option<i16> {
        let age = now_ms.saturating_sub(self.updated_at_ms);
        (self.valid && age < CP_CACHE_TIMEOUT_MS).then_some(self.power)
    }

    /// Derived cadence, 0.5 rpm units.
    pub fn cadence_half_rpm(&self) -> u16 {
        self.cadence
    }

    pub fn crank(&self) -> Option<CrankData> {
        self.crank
    }
}

/// Something the engine must react to beyond relaying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Observed {
    Nothing,
    /// Trainer reported a thermal release (Machine Status 0x84).
    ThermalRelease,
}

pub struct DataPlane {
    cache: CrossSensorCache,
    /// Last instantaneous speed reported by the trainer, 0.01 km/h.
    last_speed: Option<u16>,
}

impl Default for DataPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl DataPlane {
    pub const fn new() -> Self {
        Self {
            cache: CrossSensorCache::new(),
            last_speed: None,
        }
    }

    pub fn cache(&self) -> &CrossSensorCache {
        &self.cache
    }

    pub fn last_speed(&self) -> Option<u16> {
        self.last_speed
    }

    /// The power meter went away; its crank baseline and power go with it.
    pub fn forget_power_meter(&mut self) {
        self.cache.clear();
    }

    /// Decode, log and republish one sensor notification.
    ///
    /// Control Point indications belong to the translator and are ignored.
    pub fn relay<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        kind: SubscriptionKind,
        rssi: i8,
        data: &[u8],
        now_ms: u64,
    ) -> Observed {
        match kind {
            SubscriptionKind::HeartRate => {
                match heart_rate::parse(data) {
                    Some(hr) => events::heart_rate(out, now_ms, hr.bpm, rssi),
                    None => warn!("relay: short heart rate frame ({} bytes)", data.len()),
                }
                republish(host, LocalCharacteristic::HeartRateMeasurement, data);
            }
            SubscriptionKind::CyclingPower => {
                // The measurement is forwarded before it is decoded.
                republish(host, LocalCharacteristic::CyclingPowerMeasurement, data);
                let Some(m) = cycling_power::parse(data) else {
                    warn!("relay: short cycling power frame ({} bytes)", data.len());
                    return Observed::Nothing;
                };
                self.cache.update(&m, now_ms);
                events::cycling_power(out, now_ms, &m, self.cache.cadence_half_rpm(), rssi);
                if let Some(crank) = self.cache.crank() {
                    republish(host, LocalCharacteristic::CscMeasurement, &cycling_power::csc_frame(crank));
                }
            }
            SubscriptionKind::IndoorBikeData => self.relay_indoor_bike(host, out, rssi, data, now_ms),
            SubscriptionKind::TrainingStatus => {
                debug!("relay: training status [{} bytes]", data.len());
                republish(host, LocalCharacteristic::TrainingStatus, data);
            }
            SubscriptionKind::MachineStatus => {
                let status = machine_status::parse(data);
                match &status {
                    Some(s) => events::machine_status(out, now_ms, s),
                    None => debug!("relay: empty machine status"),
                }
                republish(host, LocalCharacteristic::MachineStatus, data);
                if status.is_some_and(|s| s.is_thermal_release()) {
                    info!("relay: trainer thermal release");
                    return Observed::ThermalRelease;
                }
            }
            SubscriptionKind::ControlPoint => {}
        }
        Observed::Nothing
    }

    fn relay_indoor_bike<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        rssi: i8,
        data: &[u8],
        now_ms: u64,
    ) {
        let Some(bike) = indoor_bike::parse(data) else {
            warn!("relay: short indoor bike frame ({} bytes)", data.len());
            republish(host, LocalCharacteristic::IndoorBikeData, data);
            return;
        };
        if bike.speed.is_some() {
            self.last_speed = bike.speed;
        }
        events::indoor_bike(out, now_ms, &bike, rssi);

        let injected = match (self.cache.fresh_power(now_ms), bike.power_offset) {
            (Some(power), Some(_)) if power >= 0 => heapless::Vec::<u8, MAX_FRAME_LEN>::from_slice(data)
                .ok()
                .and_then(|mut frame| indoor_bike::inject_power(&mut frame, power).then_some(frame)),
            _ => None,
        };
        match injected {
            Some(frame) => {
                trace!("relay: injected power into indoor bike data");
                republish(host, LocalCharacteristic::IndoorBikeData, &frame);
            }
            None => republish(host, LocalCharacteristic::IndoorBikeData, data),
        }
    }
}

fn republish<H: BleHost>(host: &mut H, characteristic: LocalCharacteristic, data: &[u8]) {
    match host.notify(characteristic, data) {
        Ok(()) | Err(HostError::NotEnabled) | Err(HostError::NotConnected) => {}
        Err(e) => debug!("relay: notify {:?} failed: {:?}", characteristic, e),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
