//! Diagnostic event stream.
//!
//! Every event is one self-contained JSON object terminated by a newline.
//! Events are serialized with `serde-json-core` straight into the buffer an
//! [`EventSink`] lends out. The firmware drains the sink to the UART; tests
//! collect it into strings.
//!
//! The stream is best-effort: an event that does not fit the buffer is
//! dropped whole, never truncated.

use serde::{Serialize, Serializer};

use crate::ble::BdAddr;
use crate::config::GRADE_BUCKETS;
use crate::grade_limiter::{bucket_range, GradeDecision};
use crate::relay::cycling_power::CyclingPowerMeasurement;
use crate::relay::indoor_bike::IndoorBikeData;
use crate::relay::machine_status::MachineStatus;

/// Line-oriented output.
pub trait EventSink {
    /// Scratch space one event is serialized into.
    fn buffer(&mut self) -> &mut [u8];
    /// The first `len` bytes of [`buffer`](Self::buffer) hold one complete
    /// line, newline included.
    fn commit(&mut self, len: usize);
}

fn emit<S: EventSink, E: Serialize>(out: &mut S, event: &E) {
    let len = {
        let buf = out.buffer();
        match serde_json_core::to_slice(event, buf) {
            Ok(n) if n < buf.len() => {
                buf[n] = b'\n';
                n + 1
            }
            Ok(_) | Err(_) => {
                warn!("events: event does not fit, dropped");
                return;
            }
        }
    };
    out.commit(len);
}

/// One row of a `devices` snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceEntry<'a> {
    pub name: Option<&'a str>,
    pub address: BdAddr,
    pub connected: bool,
    pub saved: bool,
    pub last_seen_ms: u64,
}

/// Unnamed devices are listed under their address.
#[derive(Serialize)]
#[serde(untagged)]
enum Label<'a> {
    Name(&'a str),
    Address(BdAddr),
}

#[derive(Serialize)]
struct DeviceRow<'a> {
    name: Label<'a>,
    addr: BdAddr,
    connected: bool,
    saved: bool,
    last_seen: u64,
}

impl<'a> From<&DeviceEntry<'a>> for DeviceRow<'a> {
    fn from(d: &DeviceEntry<'a>) -> Self {
        Self {
            name: d.name.map_or(Label::Address(d.address), Label::Name),
            addr: d.address,
            connected: d.connected,
            saved: d.saved,
            last_seen: d.last_seen_ms,
        }
    }
}

fn device_rows<S: Serializer>(list: &&[DeviceEntry<'_>], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(list.iter().map(DeviceRow::from))
}

#[derive(Serialize)]
struct DevicesEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
    count: usize,
    #[serde(serialize_with = "device_rows")]
    list: &'a [DeviceEntry<'a>],
}

pub fn devices<S: EventSink>(out: &mut S, ts: u64, list: &[DeviceEntry<'_>]) {
    emit(
        out,
        &DevicesEvent {
            kind: "devices",
            ts,
            count: list.len(),
            list,
        },
    );
}

#[derive(Serialize)]
struct HeartRateEvent {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
    bpm: u16,
    rssi: i8,
}

pub fn heart_rate<S: EventSink>(out: &mut S, ts: u64, bpm: u16, rssi: i8) {
    emit(
        out,
        &HeartRateEvent {
            kind: "hr",
            ts,
            bpm,
            rssi,
        },
    );
}

#[derive(Serialize)]
struct CyclingPowerEvent {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
    power: i16,
    flags: u16,
    rssi: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    balance: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crank_revs: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crank_time: Option<u16>,
    /// rpm
    #[serde(skip_serializing_if = "Option::is_none")]
    cadence: Option<u16>,
}

/// `cadence_half_rpm` is reported in whole rpm.
pub fn cycling_power<S: EventSink>(
    out: &mut S,
    ts: u64,
    m: &CyclingPowerMeasurement,
    cadence_half_rpm: u16,
    rssi: i8,
) {
    emit(
        out,
        &CyclingPowerEvent {
            kind: "cp",
            ts,
            power: m.power,
            flags: m.flags,
            rssi,
            balance: m.balance,
            crank_revs: m.crank.map(|c| c.revolutions),
            crank_time: m.crank.map(|c| c.event_time),
            cadence: m.crank.map(|_| cadence_half_rpm / 2),
        },
    );
}

#[derive(Serialize)]
struct IndoorBikeEvent {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
    flags: u16,
    rssi: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cadence: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resistance: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    power: Option<i16>,
}

/// Fields as the trainer sent them (before power injection).
pub fn indoor_bike<S: EventSink>(out: &mut S, ts: u64, d: &IndoorBikeData, rssi: i8) {
    emit(
        out,
        &IndoorBikeEvent {
            kind: "ftms",
            ts,
            flags: d.flags,
            rssi,
            speed: d.speed,
            cadence: d.cadence.map(|c| c / 2),
            resistance: d.resistance,
            power: d.power,
        },
    );
}

#[derive(Default, Serialize)]
struct StatusEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
    code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    incline: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resistance: Option<i8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_power: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_hr: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temp: Option<u8>,
    #[serde(skip_serializing_if = "<[u8]>::is_empty")]
    data: &'a [u8],
}

pub fn machine_status<S: EventSink>(out: &mut S, ts: u64, status: &MachineStatus) {
    let mut event = StatusEvent {
        kind: "status",
        ts,
        code: status.code(),
        ..StatusEvent::default()
    };
    match status {
        MachineStatus::TargetSpeed(v) => event.speed = Some(*v),
        MachineStatus::TargetIncline(v) => event.incline = Some(*v),
        MachineStatus::TargetResistance(v) => event.resistance = Some(*v),
        MachineStatus::TargetPower(v) => event.target_power = Some(*v),
        MachineStatus::TargetHeartRate(v) => event.target_hr = Some(*v),
        MachineStatus::Temperature { temp, .. } => event.temp = Some(*temp),
        MachineStatus::Other { data, .. } => event.data = &data[..],
    }
    emit(out, &event);
}

/// One Set Indoor Bike Simulation command as seen by the translator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimulationEvent {
    pub wind_speed: i16,
    pub crr: Option<u8>,
    pub cw: Option<u8>,
    pub grade: GradeDecision,
    /// Resistance level when the command was rewritten to 0x04.
    pub resistance: Option<u8>,
}

#[derive(Serialize)]
struct SimulationLine {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
    wind_speed: i16,
    grade: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    crr: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cw: Option<u8>,
    applied_grade: i16,
    limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    resistance: Option<u8>,
}

pub fn simulation<S: EventSink>(out: &mut S, ts: u64, sim: &SimulationEvent) {
    emit(
        out,
        &SimulationLine {
            kind: "sim",
            ts,
            wind_speed: sim.wind_speed,
            grade: sim.grade.requested,
            crr: sim.crr,
            cw: sim.cw,
            applied_grade: sim.grade.applied,
            limited: sim.grade.limited,
            resistance: sim.resistance,
        },
    );
}

#[derive(Serialize)]
struct ControlPointResponseEvent {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
    request: u8,
    result: u8,
    translated: bool,
}

pub fn control_point_response<S: EventSink>(
    out: &mut S,
    ts: u64,
    request_opcode: u8,
    result: u8,
    translated: bool,
) {
    emit(
        out,
        &ControlPointResponseEvent {
            kind: "cp_response",
            ts,
            request: request_opcode,
            result,
            translated,
        },
    );
}

#[derive(Serialize)]
struct BucketRow {
    start: u16,
    end: u16,
    max_grade: i16,
}

fn bucket_rows<S: Serializer>(ceilings: &&[i16; GRADE_BUCKETS], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(ceilings.iter().enumerate().map(|(bucket, &max_grade)| {
        let (start, end) = bucket_range(bucket);
        BucketRow { start, end, max_grade }
    }))
}

#[derive(Serialize)]
struct GradeTableEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    ts: u64,
    active_hours: u32,
    #[serde(serialize_with = "bucket_rows")]
    buckets: &'a [i16; GRADE_BUCKETS],
}

pub fn grade_table<S: EventSink>(
    out: &mut S,
    ts: u64,
    active_hours: u32,
    ceilings: &[i16; GRADE_BUCKETS],
) {
    emit(
        out,
        &GradeTableEvent {
            kind: "grade_table",
            ts,
            active_hours,
            buckets: ceilings,
        },
    );
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

/// Collecting sink for unit tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::EVENT_LINE_MAX;

    pub struct Lines {
        buf: Vec<u8>,
        pub lines: Vec<String>,
    }

    impl Default for Lines {
        fn default() -> Self {
            Self {
                buf: vec![0; EVENT_LINE_MAX],
                lines: Vec::new(),
            }
        }
    }

    impl Lines {
        /// Lines whose `type` is `kind`.
        pub fn of_type(&self, kind: &str) -> Vec<&str> {
            let tag = format!("{{\"type\":\"{}\"", kind);
            self.lines
                .iter()
                .filter(|l| l.starts_with(&tag))
                .map(String::as_str)
                .collect()
        }
    }

    impl EventSink for Lines {
        fn buffer(&mut self) -> &mut [u8] {
            &mut self.buf
        }

        fn commit(&mut self, len: usize) {
            let line = core::str::from_utf8(&self.buf[..len]).expect("events are UTF-8");
            self.lines.push(line.to_string());
        }
    }
}
