//! Advertisement data (AD structure) parsing.
//!
//! Scan reports carry a sequence of `[len][type][payload...]` structures.
//! The relay needs two things from them: the advertised name and which of
//! the relayed services (heart rate, cycling power, fitness machine) the
//! advertiser lists.

use heapless::String;

use crate::ble::ServiceMask;
use crate::config::{NAME_MAX_LEN, OWN_NAME_PREFIX};

const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;
const AD_TYPE_NAME_SHORTENED: u8 = 0x08;
const AD_TYPE_NAME_COMPLETE: u8 = 0x09;

/// Fields of interest extracted from one advertisement or scan response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdvSummary {
    /// Local name, if the report carried one.
    pub name: Option<String<NAME_MAX_LEN>>,
    /// Relayed services listed in the 16-bit UUID lists.
    pub services: ServiceMask,
}

impl AdvSummary {
    /// True if the advertiser is another relay unit.
    pub fn is_relay(&self) -> bool {
        self.name
            .as_ref()
            .is_some_and(|n| n.starts_with(OWN_NAME_PREFIX))
    }
}

/// Iterate over `(ad_type, payload)` pairs, stopping at the first malformed entry.
fn ad_structures(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut i = 0;
    core::iter::from_fn(move || {
        let len = *data.get(i)? as usize;
        if len == 0 || i + len >= data.len() {
            return None;
        }
        let entry = (data[i + 1], &data[i + 2..i + 1 + len]);
        i += len + 1;
        Some(entry)
    })
}

/// Local name as UTF-8, cut at the first invalid sequence (a shortened name
/// may end mid-character) and at the last whole character that fits.
fn decode_name(payload: &[u8]) -> String<NAME_MAX_LEN> {
    let text = match core::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => core::str::from_utf8(&payload[..e.valid_up_to()]).unwrap_or_default(),
    };
    let mut name = String::new();
    for c in text.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

/// Walk the AD structures of a scan report.
pub fn parse(data: &[u8]) -> AdvSummary {
    let mut summary = AdvSummary::default();

    for (ad_type, payload) in ad_structures(data) {
        match ad_type {
            AD_TYPE_UUID16_INCOMPLETE | AD_TYPE_UUID16_COMPLETE => {
                // An odd-length list is malformed; skip it entirely.
                if payload.len() % 2 != 0 {
                    continue;
                }
                for chunk in payload.chunks_exact(2) {
                    let uuid = u16::from_le_bytes([chunk[0], chunk[1]]);
                    summary.services.insert(ServiceMask::from_service_uuid(uuid));
                }
            }
            AD_TYPE_NAME_SHORTENED | AD_TYPE_NAME_COMPLETE => {
                let name = decode_name(payload);
                if !name.is_empty() {
                    summary.name = Some(name);
                }
            }
            _ => {}
        }
    }

    summary
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════
