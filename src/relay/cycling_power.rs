//! Cycling Power Measurement (0x2A63) decoding and cadence derivation.
//!
//! Power meters report cumulative crank revolutions with the sensor time
//! of the last crank event (1/1024 s). Cadence is derived from the delta
//! between two consecutive pairs.

/// Pedal Power Balance present (1 byte).
const FLAG_BALANCE: u16 = 0x0001;
/// Accumulated Torque present (2 bytes).
const FLAG_TORQUE: u16 = 0x0004;
/// Wheel Revolution Data present (4 + 2 bytes).
const FLAG_WHEEL: u16 = 0x0010;
/// Crank Revolution Data present (2 + 2 bytes).
const FLAG_CRANK: u16 = 0x0020;

/// `60 s * 1024 ticks/s * 2` - converts revs per tick to 0.5 rpm units.
pub const HALF_RPM_PER_REV_TICK: u64 = 122_880;

/// Largest revolution step between two samples taken as pedalling. A bigger
/// jump is a counter reset or a stale pair from an earlier connection.
pub const MAX_REVS_PER_SAMPLE: u16 = 255;

/// Cumulative crank revolutions and the sensor time of the last event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CrankData {
    pub revolutions: u16,
    /// Last crank event time, 1/1024 s.
    pub event_time: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CyclingPowerMeasurement {
    pub flags: u16,
    /// Instantaneous power (W).
    pub power: i16,
    /// Pedal power balance, 1/2 %.
    pub balance: Option<u8>,
    pub crank: Option<CrankData>,
}

/// Decode a measurement; `None` below the 4-byte minimum.
///
/// Optional fields that are flagged but truncated are left out.
pub fn parse(data: &[u8]) -> Option<CyclingPowerMeasurement> {
    if data.len() < 4 {
        return None;
    }
    let flags = u16::from_le_bytes([data[0], data[1]]);
    let mut m = CyclingPowerMeasurement {
        flags,
        power: i16::from_le_bytes([data[2], data[3]]),
        balance: None,
        crank: None,
    };

    let mut offset = 4;
    if flags & FLAG_BALANCE != 0 {
        let Some(&b) = data.get(offset) else {
            return Some(m);
        };
        m.balance = Some(b);
        offset += 1;
    }
    if flags & FLAG_TORQUE != 0 {
        offset += 2;
    }
    if flags & FLAG_WHEEL != 0 {
        offset += 6;
    }
    if flags & FLAG_CRANK != 0 {
        if let Some(c) = data.get(offset..offset + 4) {
            m.crank = Some(CrankData {
                revolutions: u16::from_le_bytes([c[0], c[1]]),
                event_time: u16::from_le_bytes([c[2], c[3]]),
            });
        }
    }

    Some(m)
}

/// Cadence in 0.5 rpm units between two crank samples.
///
/// `None` if the crank did not advance, no time elapsed, or the step is
/// larger than [`MAX_REVS_PER_SAMPLE`]. Both counters wrap at 16 bits. The
/// result saturates at `u16::MAX`.
pub fn cadence_half_rpm(previous: CrankData, current: CrankData) -> Option<u16> {
    let revs = current.revolutions.wrapping_sub(previous.revolutions);
    let ticks = current.event_time.wrapping_sub(previous.event_time);
    if revs == 0 || ticks == 0 || revs > MAX_REVS_PER_SAMPLE {
        return None;
    }
    let cadence = u64::from(revs) * HALF_RPM_PER_REV_TICK / u64::from(ticks);
    Some(cadence.min(u64::from(u16::MAX)) as u16)
}

/// Cycling Speed and Cadence Measurement carrying crank data only.
pub fn csc_frame(crank: CrankData) -> [u8; 5] {
    let r = crank.revolutions.to_le_bytes();
    let t = crank.event_time.to_le_bytes();
    [0x02, r[0], r[1], t[0], t[1]]
}
