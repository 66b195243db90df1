//! Heart Rate Measurement (0x2A37) decoding.

/// Decoded heart-rate sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HeartRate {
    pub bpm: u16,
    /// Sensor contact detected (only meaningful if `contact_supported`).
    pub contact: bool,
    pub contact_supported: bool,
}

/// Flags bit 0: heart-rate value is UINT16.
const FLAG_HR_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;

/// Decode a measurement; `None` if shorter than the format requires.
pub fn parse(data: &[u8]) -> Option<HeartRate> {
    let (&flags, rest) = data.split_first()?;
    let bpm = if flags & FLAG_HR_U16 == 0 {
        *rest.first()? as u16
    } else {
        u16::from_le_bytes([*rest.first()?, *rest.get(1)?])
    };

    Some(HeartRate {
        bpm,
        contact: flags & FLAG_CONTACT_DETECTED != 0,
        contact_supported: flags & FLAG_CONTACT_SUPPORTED != 0,
    })
}
