//! Local GATT server: the virtual sensor the companion app sees.
//!
//! Heart Rate, Cycling Speed and Cadence, Cycling Power and Fitness Machine,
//! each with its measurement characteristics (notify) and the FTMS Control
//! Point (write + indicate). Values are pushed with `notify_value` /
//! `indicate_value`; nothing is stored server-side beyond what the
//! SoftDevice keeps.
//!
//! Control Point writes are authorized: malformed ones are answered with
//! the ATT error before anything reaches the engine.

use defmt::warn;
use heapless::Vec;
use nrf_softdevice::ble::gatt_server::{
    self, DeferredWriteReply, IndicateValueError, NotifyValueError, RegisterError, WriteOp,
};
use nrf_softdevice::ble::{Connection, GattError};
use nrf_softdevice::{RawError, Softdevice};

use zrelay::ble::LocalCharacteristic;
use zrelay::config::CP_MAX_WRITE_LEN;
use zrelay::control_point;
use zrelay::error::{AttError, HostError};

use super::{post, Event};

#[nrf_softdevice::gatt_service(uuid = "180d")]
pub struct HeartRateService {
    #[characteristic(uuid = "2a37", notify)]
    pub measurement: Vec<u8, 20>,
}

#[nrf_softdevice::gatt_service(uuid = "1816")]
pub struct CyclingSpeedCadenceService {
    #[characteristic(uuid = "2a5b", notify)]
    pub measurement: Vec<u8, 20>,
}

#[nrf_softdevice::gatt_service(uuid = "1818")]
pub struct CyclingPowerService {
    #[characteristic(uuid = "2a63", notify)]
    pub measurement: Vec<u8, 20>,
}

#[nrf_softdevice::gatt_service(uuid = "1826")]
pub struct FitnessMachineService {
    #[characteristic(uuid = "2ad2", notify)]
    pub indoor_bike_data: Vec<u8, 20>,
    #[characteristic(uuid = "2ad3", read, notify)]
    pub training_status: Vec<u8, 20>,
    #[characteristic(uuid = "2ada", notify)]
    pub machine_status: Vec<u8, 20>,
    #[characteristic(uuid = "2ad9", write, indicate, deferred_write)]
    pub control_point: Vec<u8, 20>,
}

/// What the companion app did to us.
pub enum ServerEvent {
    ControlPointWrite {
        offset: u16,
        data: Vec<u8, CP_MAX_WRITE_LEN>,
    },
    ControlPointCcc {
        indications: bool,
    },
}

pub struct RelayServer {
    pub hrs: HeartRateService,
    pub cscs: CyclingSpeedCadenceService,
    pub cps: CyclingPowerService,
    pub ftms: FitnessMachineService,
}

impl RelayServer {
    pub fn new(sd: &mut Softdevice) -> Result<Self, RegisterError> {
        Ok(Self {
            hrs: HeartRateService::new(sd)?,
            cscs: CyclingSpeedCadenceService::new(sd)?,
            cps: CyclingPowerService::new(sd)?,
            ftms: FitnessMachineService::new(sd)?,
        })
    }

    fn value_handle(&self, characteristic: LocalCharacteristic) -> u16 {
        match characteristic {
            LocalCharacteristic::HeartRateMeasurement => self.hrs.measurement_value_handle,
            LocalCharacteristic::CscMeasurement => self.cscs.measurement_value_handle,
            LocalCharacteristic::CyclingPowerMeasurement => self.cps.measurement_value_handle,
            LocalCharacteristic::IndoorBikeData => self.ftms.indoor_bike_data_value_handle,
            LocalCharacteristic::TrainingStatus => self.ftms.training_status_value_handle,
            LocalCharacteristic::MachineStatus => self.ftms.machine_status_value_handle,
            LocalCharacteristic::ControlPoint => self.ftms.control_point_value_handle,
        }
    }

    pub fn notify(
        &self,
        conn: &Connection,
        characteristic: LocalCharacteristic,
        data: &[u8],
    ) -> Result<(), HostError> {
        gatt_server::notify_value(conn, self.value_handle(characteristic), data).map_err(|e| match e {
            NotifyValueError::Disconnected => HostError::NotConnected,
            NotifyValueError::Raw(raw) => raw_error(raw),
        })
    }

    pub fn indicate(
        &self,
        conn: &Connection,
        characteristic: LocalCharacteristic,
        data: &[u8],
    ) -> Result<(), HostError> {
        gatt_server::indicate_value(conn, self.value_handle(characteristic), data).map_err(|e| match e {
            IndicateValueError::Disconnected => HostError::NotConnected,
            IndicateValueError::Raw(raw) => raw_error(raw),
        })
    }
}

fn att_error(e: AttError) -> GattError {
    match e {
        AttError::InvalidOffset => GattError::AtterrInvalidOffset,
        AttError::InvalidAttributeValueLength => GattError::AtterrInvalidAttValLength,
    }
}

fn raw_error(raw: RawError) -> HostError {
    match raw {
        // CCCD not written yet
        RawError::BleGattsSysAttrMissing | RawError::InvalidState => HostError::NotEnabled,
        RawError::Busy => HostError::Busy,
        RawError::Resources | RawError::NoMem => HostError::NoMemory,
        other => HostError::Raw(other as u32),
    }
}

impl gatt_server::Server for RelayServer {
    type Event = ServerEvent;

    fn on_write(
        &self,
        _conn: &Connection,
        handle: u16,
        _op: WriteOp,
        offset: usize,
        data: &[u8],
    ) -> Option<ServerEvent> {
        if handle == self.ftms.control_point_cccd_handle {
            let indications = data.first().is_some_and(|v| v & 0x02 != 0);
            return Some(ServerEvent::ControlPointCcc { indications });
        }
        None
    }

    fn on_deferred_write(
        &self,
        handle: u16,
        _op: WriteOp,
        offset: usize,
        data: &[u8],
        reply: DeferredWriteReply,
    ) -> Option<ServerEvent> {
        if handle != self.ftms.control_point_value_handle {
            return None;
        }
        let offset = u16::try_from(offset).unwrap_or(u16::MAX);
        let checked = control_point::check_write(offset, data);
        if let Err(e) = reply.reply(checked.map(|()| None).map_err(att_error)) {
            warn!("server: control point reply failed: {:?}", e);
        }
        if let Err(e) = checked {
            warn!("server: control point write rejected: {:?}", e);
            return None;
        }
        let data = Vec::from_slice(data).ok()?;
        Some(ServerEvent::ControlPointWrite { offset, data })
    }

    fn on_indicate_confirm(&self, _conn: &Connection, handle: u16) {
        if handle == self.ftms.control_point_value_handle {
            post(Event::IndicationReleased(true));
        }
    }
}
