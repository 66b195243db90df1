//! Continuous active scan, switched on and off by the engine.
//!
//! Every report goes to the engine unfiltered; the advertisement parser in
//! the library decides what is interesting.

use defmt::{info, warn};
use embassy_futures::select::{select, Either};
use embassy_time::Timer;
use heapless::Vec;
use nrf_softdevice::ble::central;
use nrf_softdevice::Softdevice;

use zrelay::ble::BdAddr;

use super::{post, Event, ADV_DATA_MAX_LEN, SCAN};

/// Back-off after the SoftDevice refuses to scan (e.g. while a connect
/// attempt owns the scanner).
const RETRY_MS: u64 = 200;

#[embassy_executor::task]
pub async fn scanner_task(sd: &'static Softdevice) -> ! {
    let mut enabled = false;
    loop {
        if !enabled {
            enabled = SCAN.wait().await;
            continue;
        }

        info!("scanner: on");
        let config = central::ScanConfig {
            // scan responses carry most sensors' names
            active: true,
            ..Default::default()
        };
        let scan = central::scan(sd, &config, |params| {
            let data =
                unsafe { core::slice::from_raw_parts(params.data.p_data, params.data.len as usize) };
            let len = data.len().min(ADV_DATA_MAX_LEN);
            let address = BdAddr::new(params.peer_addr.addr_type(), params.peer_addr.addr);
            if let Ok(data) = Vec::from_slice(&data[..len]) {
                post(Event::Advertisement {
                    address,
                    rssi: params.rssi,
                    data,
                });
            }
            None::<()>
        });

        match select(scan, SCAN.wait()).await {
            Either::First(Ok(())) => {}
            Either::First(Err(e)) => {
                warn!("scanner: scan failed: {:?}", e);
                Timer::after_millis(RETRY_MS).await;
            }
            Either::Second(on) => {
                enabled = on;
                if !on {
                    info!("scanner: off");
                }
            }
        }
    }
}
