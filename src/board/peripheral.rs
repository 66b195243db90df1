//! Peripheral role: advertise the virtual sensor and serve the companion app.

use defmt::{info, warn};
use embassy_time::Timer;
use nrf_softdevice::ble::advertisement_builder::{
    Flag, LegacyAdvertisementBuilder, ServiceList, ServiceUuid16,
};
use nrf_softdevice::ble::{gatt_server, peripheral};
use nrf_softdevice::Softdevice;

use zrelay::ble::{uuid, LinkId};

use super::server::{RelayServer, ServerEvent};
use super::{post, Event, ADVERTISE, EVENTS, PERIPHERAL};

/// Companion links are numbered apart from central links.
const LINK_BASE: u16 = 0x8000;

const RETRY_MS: u64 = 1_000;

const SERVICES: [ServiceUuid16; 4] = [
    ServiceUuid16::from_u16(uuid::HEART_RATE_SERVICE),
    ServiceUuid16::from_u16(uuid::CYCLING_SPEED_CADENCE_SERVICE),
    ServiceUuid16::from_u16(uuid::CYCLING_POWER_SERVICE),
    ServiceUuid16::from_u16(uuid::FITNESS_MACHINE_SERVICE),
];

#[embassy_executor::task]
pub async fn peripheral_task(sd: &'static Softdevice, server: &'static RelayServer) -> ! {
    let mut name = ADVERTISE.wait().await;
    let mut count: u16 = 0;

    loop {
        let adv_data = LegacyAdvertisementBuilder::new()
            .flags(&[Flag::GeneralDiscovery, Flag::LE_Only])
            .services_16(ServiceList::Complete, &SERVICES)
            .build();
        let scan_data = LegacyAdvertisementBuilder::new().full_name(&name).build();
        let advertisement = peripheral::ConnectableAdvertisement::ScannableUndirected {
            adv_data: &adv_data,
            scan_data: &scan_data,
        };

        info!("peripheral: advertising as {}", name.as_str());
        let conn = match peripheral::advertise_connectable(sd, advertisement, &peripheral::Config::default()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("peripheral: advertising failed: {:?}", e);
                Timer::after_millis(RETRY_MS).await;
                continue;
            }
        };

        let link = LinkId(LINK_BASE | (count & 0x7FFF));
        count = count.wrapping_add(1);
        PERIPHERAL.lock(|c| *c.borrow_mut() = Some(conn.clone()));
        EVENTS.send(Event::PeripheralConnected(link)).await;

        let reason = gatt_server::run(&conn, server, |event| match event {
            ServerEvent::ControlPointWrite { offset, data } => {
                post(Event::ControlPointWrite { link, offset, data })
            }
            ServerEvent::ControlPointCcc { indications } => {
                post(Event::ControlPointCcc { link, indications })
            }
        })
        .await;

        info!("peripheral: companion gone: {:?}", reason);
        PERIPHERAL.lock(|c| *c.borrow_mut() = None);
        EVENTS.send(Event::Disconnected(link)).await;

        // the engine re-arms advertising once it has seen the disconnect
        name = ADVERTISE.wait().await;
    }
}
