//! FTMS Indoor Bike Data (0x2AD2) decoding and power injection.
//!
//! The frame is a 16-bit flags word followed by the fields whose presence
//! bits are set, in a fixed order. Instantaneous speed is the odd one out:
//! it is present when bit 0 ("More Data") is *clear*.

const FLAG_MORE_DATA: u16 = 1 << 0;

/// Optional fields in frame order: (flag bit, size in bytes).
const FIELDS: [(u16, usize); 12] = [
    (1 << 1, 2),  // average speed
    (1 << 2, 2),  // instantaneous cadence
    (1 << 3, 2),  // average cadence
    (1 << 4, 3),  // total distance
    (1 << 5, 2),  // resistance level
    (1 << 6, 2),  // instantaneous power
    (1 << 7, 2),  // average power
    (1 << 8, 5),  // expended energy (total, per hour, per minute)
    (1 << 9, 1),  // heart rate
    (1 << 10, 1), // metabolic equivalent
    (1 << 11, 2), // elapsed time
    (1 << 12, 2), // remaining time
];

const FLAG_CADENCE: u16 = 1 << 2;
const FLAG_RESISTANCE: u16 = 1 << 5;
const FLAG_POWER: u16 = 1 << 6;

/// Fields the relay looks at, plus where the power field sits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IndoorBikeData {
    pub flags: u16,
    /// Instantaneous speed, 0.01 km/h.
    pub speed: Option<u16>,
    /// Instantaneous cadence, 0.5 rpm.
    pub cadence: Option<u16>,
    pub resistance: Option<i16>,
    /// Instantaneous power (W).
    pub power: Option<i16>,
    /// Byte offset of the instantaneous power field, if it fits in the frame.
    pub power_offset: Option<usize>,
}

fn le16(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Walk the flags to locate fields; `None` below the 2-byte minimum.
pub fn parse(data: &[u8]) -> Option<IndoorBikeData> {
    let flags = le16(data, 0)?;
    let mut d = IndoorBikeData {
        flags,
        ..Default::default()
    };

    let mut offset = 2;
    if flags & FLAG_MORE_DATA == 0 {
        d.speed = le16(data, offset);
        offset += 2;
    }

    for (bit, size) in FIELDS {
        if flags & bit == 0 {
            continue;
        }
        match bit {
            FLAG_CADENCE => d.cadence = le16(data, offset),
            FLAG_RESISTANCE => d.resistance = le16(data, offset).map(|v| v as i16),
            FLAG_POWER => {
                d.power = le16(data, offset).map(|v| v as i16);
                if d.power.is_some() {
                    d.power_offset = Some(offset);
                }
            }
            _ => {}
        }
        offset += size;
    }

    Some(d)
}

/// Overwrite the instantaneous power field in place.
///
/// Returns false (frame untouched) if the frame has no complete power field.
pub fn inject_power(frame: &mut [u8], power: i16) -> bool {
    let Some(offset) = parse(frame).and_then(|d| d.power_offset) else {
        return false;
    };
    match frame.get_mut(offset..offset + 2) {
        Some(field) => {
            field.copy_from_slice(&power.to_le_bytes());
            true
        }
        None => false,
    }
}
