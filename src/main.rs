//! zrelay firmware entry point (nRF52840 + S140).
//!
//! Task layout:
//!
//! * `softdevice_task` runs the SoftDevice event loop.
//! * `relay_task` owns the [`Relay`] engine, its flash and its timers.
//! * `scanner_task`, `slot_task` ×3 and `peripheral_task` carry out BLE
//!   requests and feed results back over [`board::EVENTS`].
//! * `uart_task` drains the JSON event stream.
//! * `button` times presses on the user button.

#![no_std]
#![no_main]

mod board;

use core::future::pending;

use defmt::{info, unwrap};
use embassy_executor::Spawner;
use embassy_futures::select::{select4, Either4};
use embassy_nrf::gpio::{AnyPin, Pin};
use embassy_nrf::interrupt::{self, InterruptExt, Priority};
use embassy_nrf::peripherals;
use embassy_nrf::uarte::{self, UarteTx};
use embassy_time::{Duration, Instant, Ticker, Timer};
use nrf_softdevice::Softdevice;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use zrelay::config::{RelayConfig, ACTIVITY_TICK_MS, OWN_NAME_PREFIX};
use zrelay::storage::{self, flash};
use zrelay::Relay;

use board::host::ChannelHost;
use board::server::RelayServer;
use board::uart::UartSink;
use board::{Event, BUTTONS, EVENTS};

embassy_nrf::bind_interrupts!(struct Irqs {
    UARTE0_UART0 => uarte::InterruptHandler<peripherals::UARTE0>;
});

static SERVER: StaticCell<RelayServer> = StaticCell::new();

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("zrelay starting");

    // P0, P1 and P4 belong to the SoftDevice
    let mut config = embassy_nrf::config::Config::default();
    config.gpiote_interrupt_priority = Priority::P2;
    config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(config);

    interrupt::UARTE0_UART0.set_priority(Priority::P3);
    let mut uart_config = uarte::Config::default();
    uart_config.baudrate = uarte::Baudrate::BAUD115200;
    let tx = UarteTx::new(p.UARTE0, Irqs, p.P0_06, uart_config);

    let hardware_id = {
        let ficr = embassy_nrf::pac::FICR;
        let lo = ficr.deviceid(0).read().to_le_bytes();
        let hi = ficr.deviceid(1).read().to_le_bytes();
        [lo[0], lo[1], lo[2], lo[3], hi[0], hi[1], hi[2], hi[3]]
    };

    let sd = board::softdevice::enable();
    let server = SERVER.init(unwrap!(RelayServer::new(sd)));
    let sd: &'static Softdevice = sd;

    unwrap!(spawner.spawn(board::softdevice::softdevice_task(sd)));
    unwrap!(spawner.spawn(board::uart::uart_task(tx)));
    unwrap!(spawner.spawn(board::scanner::scanner_task(sd)));
    unwrap!(spawner.spawn(board::peripheral::peripheral_task(sd, server)));
    for slot in 0..zrelay::config::MAX_CONNECTIONS {
        unwrap!(spawner.spawn(board::central::slot_task(sd, slot)));
    }
    unwrap!(spawner.spawn(button(p.P0_11.degrade())));
    unwrap!(spawner.spawn(relay_task(sd, server, hardware_id)));
}

#[embassy_executor::task]
async fn button(pin: AnyPin) -> ! {
    zrelay::ui::buttons::button_task(pin, BUTTONS.sender()).await
}

fn now_ms() -> u64 {
    Instant::now().as_millis()
}

/// Advertised name: hardware-derived suffix, or a random one kept in
/// flash when the FICR id is blank.
async fn unit_name(
    sd: &Softdevice,
    flash: &mut nrf_softdevice::Flash,
    hardware_id: &[u8; 8],
) -> heapless::String<16> {
    let suffix = if hardware_id.iter().all(|&b| b == 0xFF) {
        let mut random = [0u8; 2];
        if nrf_softdevice::random_bytes(sd, &mut random).is_err() {
            defmt::warn!("relay: no randomness for the name suffix");
        }
        flash::persisted_suffix(flash, u16::from_le_bytes(random)).await
    } else {
        storage::device_suffix(hardware_id)
    };
    let mut name = heapless::String::new();
    let _ = name.push_str(OWN_NAME_PREFIX);
    let _ = name.push('-');
    let _ = name.push_str(&suffix);
    name
}

#[embassy_executor::task]
async fn relay_task(sd: &'static Softdevice, server: &'static RelayServer, hardware_id: [u8; 8]) -> ! {
    let mut flash = nrf_softdevice::Flash::take(sd);
    let name = unit_name(sd, &mut flash, &hardware_id).await;

    let mut relay = Relay::new(RelayConfig::default(), &name);
    relay.store_mut().load_from_flash(&mut flash).await;
    flash::load_grade_limiter(&mut flash, relay.limiter_mut()).await;

    let mut host = ChannelHost::new(server);
    let mut out = UartSink::new();
    relay.start(&mut host, &mut out, now_ms());

    let mut ticker = Ticker::every(Duration::from_millis(ACTIVITY_TICK_MS));
    loop {
        let deadline = host.next_deadline();
        let timer = async {
            match deadline {
                Some(at) => Timer::at(at).await,
                None => pending().await,
            }
        };

        match select4(EVENTS.receive(), BUTTONS.receive(), timer, ticker.next()).await {
            Either4::First(event) => dispatch(&mut relay, &mut host, &mut out, event),
            Either4::Second(press) => relay.on_button(&mut host, &mut out, press, now_ms()),
            Either4::Third(()) => {
                for timer in host.take_expired(Instant::now()) {
                    relay.on_timer(&mut host, timer);
                }
            }
            Either4::Fourth(()) => relay.on_tick(now_ms()),
        }

        while let Some(work) = host.take_work() {
            relay.on_work(&mut host, work);
        }

        relay.store_mut().save_to_flash(&mut flash).await;
        flash::save_grade_limiter(&mut flash, relay.limiter_mut()).await;
    }
}

fn dispatch(relay: &mut Relay, host: &mut ChannelHost, out: &mut UartSink, event: Event) {
    let now = now_ms();
    match event {
        Event::Advertisement { address, rssi, data } => {
            relay.on_advertisement(host, out, address, rssi, &data, now)
        }
        Event::Connected(link) => relay.on_connected(host, out, link, now),
        Event::ConnectFailed(link, e) => {
            host.release(link);
            relay.on_connect_failed(host, link, e);
        }
        Event::PeripheralConnected(link) => relay.on_peripheral_connected(link),
        Event::Disconnected(link) => {
            host.release(link);
            relay.on_disconnected(host, out, link, now);
        }
        Event::Discovered(link, result) => relay.on_discovered(host, link, result),
        Event::Notification(key, data) => relay.on_notification(host, out, key, &data, now),
        Event::ReadComplete(link, handle, result) => {
            relay.on_read_complete(link, handle, result.as_ref().map(|d| d.as_slice()).map_err(|e| *e))
        }
        Event::WriteComplete(link, result) => relay.on_write_complete(link, result),
        Event::ControlPointWrite { link, offset, data } => {
            if let Err(e) = relay.on_control_point_write(host, out, link, offset, &data, now) {
                defmt::warn!("relay: control point write rejected: {:?}", e);
            }
        }
        Event::ControlPointCcc { link, indications } => {
            relay.on_control_point_ccc(host, link, indications)
        }
        Event::IndicationReleased(acknowledged) => relay.on_indication_released(host, acknowledged),
    }
}
