//! Fitness Machine Status (0x2ADA) decoding, for logging only.
//!
//! The first byte is an op code selecting how the rest is read. Frames are
//! always republished unmodified; decoding never fails the relay.

/// Vendor temperature warning.
pub const THERMAL_WARNING_CODE: u8 = 0x83;
/// Vendor thermal release: the trainer dropped resistance to cool down.
pub const THERMAL_RELEASE_CODE: u8 = 0x84;

/// Longest raw parameter list kept for unknown op codes.
pub const MAX_RAW_LEN: usize = 18;

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MachineStatus {
    /// 0x05: new target speed, 0.01 km/h.
    TargetSpeed(u16),
    /// 0x06: new target incline, 0.1 %.
    TargetIncline(i16),
    /// 0x07: new target resistance, 0.1 unitless.
    TargetResistance(i8),
    /// 0x08: new target power (W).
    TargetPower(i16),
    /// 0x09: new target heart rate (bpm).
    TargetHeartRate(u8),
    /// 0x83 / 0x84: vendor temperature codes.
    Temperature { code: u8, temp: u8 },
    /// Anything else, or a known code with a truncated parameter.
    Other {
        code: u8,
        data: heapless::Vec<u8, MAX_RAW_LEN>,
    },
}

impl MachineStatus {
    pub fn code(&self) -> u8 {
        match self {
            MachineStatus::TargetSpeed(_) => 0x05,
            MachineStatus::TargetIncline(_) => 0x06,
            MachineStatus::TargetResistance(_) => 0x07,
            MachineStatus::TargetPower(_) => 0x08,
            MachineStatus::TargetHeartRate(_) => 0x09,
            MachineStatus::Temperature { code, .. } | MachineStatus::Other { code, .. } => *code,
        }
    }

    pub fn is_thermal_release(&self) -> bool {
        self.code() == THERMAL_RELEASE_CODE
    }
}

/// Decode a status frame; `None` for an empty frame.
pub fn parse(data: &[u8]) -> Option<MachineStatus> {
    let (&code, params) = data.split_first()?;
    let u16_param = || params.get(..2).map(|p| u16::from_le_bytes([p[0], p[1]]));
    let u8_param = || params.first().copied();

    let status = match code {
        0x05 => u16_param().map(MachineStatus::TargetSpeed),
        0x06 => u16_param().map(|v| MachineStatus::TargetIncline(v as i16)),
        0x07 => u8_param().map(|v| MachineStatus::TargetResistance(v as i8)),
        0x08 => u16_param().map(|v| MachineStatus::TargetPower(v as i16)),
        0x09 => u8_param().map(MachineStatus::TargetHeartRate),
        THERMAL_WARNING_CODE | THERMAL_RELEASE_CODE => {
            u8_param().map(|temp| MachineStatus::Temperature { code, temp })
        }
        _ => None,
    };

    Some(status.unwrap_or_else(|| {
        let len = params.len().min(MAX_RAW_LEN);
        MachineStatus::Other {
            code,
            data: heapless::Vec::from_slice(&params[..len]).unwrap_or_default(),
        }
    }))
}
