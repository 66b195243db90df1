//! Integration tests for the relay engine, driven through its public API
//! with a recording host and an in-memory event sink.

use zrelay::ble::host::{
    Attribute, BleHost, CharProps, DiscoverRequest, Subscription, TimerId, Work,
};
use zrelay::ble::{uuid, BdAddr, LinkId, LocalCharacteristic, SubscriptionKey};
use zrelay::config::{RelayConfig, EVENT_LINE_MAX};
use zrelay::error::HostError;
use zrelay::events::EventSink;
use zrelay::grade_limiter::bucket_of;
use zrelay::ui::ButtonEvent;
use zrelay::Relay;

const KICKR: BdAddr = BdAddr::new(0, [0x01, 0x02, 0x03, 0x04, 0x05, 0xC6]);
const ASSIOMA: BdAddr = BdAddr::new(1, [0x11, 0x12, 0x13, 0x14, 0x15, 0xD7]);
const HRM: BdAddr = BdAddr::new(1, [0x21, 0x22, 0x23, 0x24, 0x25, 0xE8]);
const APP: LinkId = LinkId(0x8000);

const TRAINER_LINK: LinkId = LinkId(1);
const CP_HANDLE: u16 = 20;

fn key(slot: u8, index: u8) -> SubscriptionKey {
    SubscriptionKey {
        slot,
        generation: 1,
        index,
    }
}

// trainer subscriptions, in discovery order
const IBD: u8 = 0;
const STATUS: u8 = 1;
const CONTROL: u8 = 2;

// ─── Recording host ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    StartScan,
    StopScan,
    StartAdvertising(String),
    Connect(BdAddr),
    CancelConnect(LinkId),
    Disconnect(LinkId),
    Discover(LinkId, DiscoverRequest),
    Subscribe(LinkId, SubscriptionKey, Subscription),
    Write(LinkId, u16, Vec<u8>),
    Read(LinkId, u16),
    Notify(LocalCharacteristic, Vec<u8>),
    Indicate(LocalCharacteristic, Vec<u8>),
    Schedule(TimerId, u64),
    Cancel(TimerId),
    Defer(Work),
}

#[derive(Default)]
struct Host {
    calls: Vec<Call>,
    links: u16,
}

impl Host {
    fn take(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }

    fn notified(&self, characteristic: LocalCharacteristic) -> Vec<&[u8]> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Notify(ch, data) if *ch == characteristic => Some(data.as_slice()),
                _ => None,
            })
            .collect()
    }
}

impl BleHost for Host {
    fn start_scan(&mut self) -> Result<(), HostError> {
        self.calls.push(Call::StartScan);
        Ok(())
    }
    fn stop_scan(&mut self) -> Result<(), HostError> {
        self.calls.push(Call::StopScan);
        Ok(())
    }
    fn start_advertising(&mut self, name: &str) -> Result<(), HostError> {
        self.calls.push(Call::StartAdvertising(name.to_string()));
        Ok(())
    }
    fn connect(&mut self, addr: &BdAddr) -> Result<LinkId, HostError> {
        self.calls.push(Call::Connect(*addr));
        self.links += 1;
        Ok(LinkId(self.links))
    }
    fn cancel_connect(&mut self, link: LinkId) -> Result<(), HostError> {
        self.calls.push(Call::CancelConnect(link));
        Ok(())
    }
    fn disconnect(&mut self, link: LinkId) -> Result<(), HostError> {
        self.calls.push(Call::Disconnect(link));
        Ok(())
    }
    fn discover(&mut self, link: LinkId, request: DiscoverRequest) -> Result<(), HostError> {
        self.calls.push(Call::Discover(link, request));
        Ok(())
    }
    fn subscribe(
        &mut self,
        link: LinkId,
        key: SubscriptionKey,
        subscription: Subscription,
    ) -> Result<(), HostError> {
        self.calls.push(Call::Subscribe(link, key, subscription));
        Ok(())
    }
    fn write(&mut self, link: LinkId, handle: u16, data: &[u8]) -> Result<(), HostError> {
        self.calls.push(Call::Write(link, handle, data.to_vec()));
        Ok(())
    }
    fn read(&mut self, link: LinkId, handle: u16) -> Result<(), HostError> {
        self.calls.push(Call::Read(link, handle));
        Ok(())
    }
    fn notify(&mut self, characteristic: LocalCharacteristic, data: &[u8]) -> Result<(), HostError> {
        self.calls.push(Call::Notify(characteristic, data.to_vec()));
        Ok(())
    }
    fn indicate(&mut self, characteristic: LocalCharacteristic, data: &[u8]) -> Result<(), HostError> {
        self.calls.push(Call::Indicate(characteristic, data.to_vec()));
        Ok(())
    }
    fn schedule(&mut self, timer: TimerId, after_ms: u64) {
        self.calls.push(Call::Schedule(timer, after_ms));
    }
    fn cancel(&mut self, timer: TimerId) {
        self.calls.push(Call::Cancel(timer));
    }
    fn defer(&mut self, work: Work) {
        self.calls.push(Call::Defer(work));
    }
}

// ─── Event sink ───────────────────────────────────────────────────────────

struct Sink {
    buf: Vec<u8>,
    lines: Vec<String>,
}

impl Default for Sink {
    fn default() -> Self {
        Sink {
            buf: vec![0; EVENT_LINE_MAX],
            lines: Vec::new(),
        }
    }
}

impl Sink {
    fn of_type(&self, kind: &str) -> Vec<&str> {
        let tag = format!("{{\"type\":\"{}\"", kind);
        self.lines
            .iter()
            .filter(|l| l.starts_with(&tag))
            .map(String::as_str)
            .collect()
    }
}

impl EventSink for Sink {
    fn buffer(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn commit(&mut self, len: usize) {
        self.lines
            .push(String::from_utf8(self.buf[..len].to_vec()).unwrap());
    }
}

// ─── Fixture ──────────────────────────────────────────────────────────────

fn adv(name: &str, service: u16) -> Vec<u8> {
    let mut data = vec![3, 0x03];
    data.extend_from_slice(&service.to_le_bytes());
    data.push(name.len() as u8 + 1);
    data.push(0x09);
    data.extend_from_slice(name.as_bytes());
    data
}

fn characteristic(uuid: u16, value_handle: u16, props: u8) -> Result<Option<Attribute>, HostError> {
    Ok(Some(Attribute::Characteristic {
        uuid,
        value_handle,
        props: CharProps(props),
    }))
}

struct Rig {
    relay: Relay,
    host: Host,
    out: Sink,
}

impl Rig {
    /// Boot, open the pairing window and let the companion app subscribe.
    fn new() -> Self {
        let mut rig = Rig {
            relay: Relay::new(RelayConfig::default(), "Z-Relay-0001"),
            host: Host::default(),
            out: Sink::default(),
        };
        rig.relay.start(&mut rig.host, &mut rig.out, 0);
        rig.relay
            .on_button(&mut rig.host, &mut rig.out, ButtonEvent::LongPress, 0);
        rig.relay.on_peripheral_connected(APP);
        rig.relay.on_control_point_ccc(&mut rig.host, APP, true);
        rig.host.take();
        rig
    }

    /// Trainer with Indoor Bike Data, Machine Status and Control Point.
    fn with_trainer() -> Self {
        let mut rig = Rig::new();
        let (relay, host, out) = (&mut rig.relay, &mut rig.host, &mut rig.out);
        relay.on_advertisement(host, out, KICKR, -45, &adv("KICKR", uuid::FITNESS_MACHINE_SERVICE), 10);
        relay.on_connected(host, out, TRAINER_LINK, 20);
        for answer in [
            Ok(None), // heart rate
            Ok(None), // cycling power
            Ok(Some(Attribute::Service { start: 10, end: 30 })),
            characteristic(uuid::INDOOR_BIKE_DATA, 12, CharProps::NOTIFY),
            Ok(Some(Attribute::Descriptor { handle: 13 })),
            characteristic(uuid::FITNESS_MACHINE_STATUS, 15, CharProps::NOTIFY),
            Ok(Some(Attribute::Descriptor { handle: 16 })),
            characteristic(uuid::FITNESS_MACHINE_CONTROL_POINT, CP_HANDLE, CharProps::WRITE | CharProps::INDICATE),
            Ok(None),
        ] {
            relay.on_discovered(host, TRAINER_LINK, answer);
        }
        rig.host.take();
        rig.out.lines.clear();
        rig
    }

    /// Power meter on the second slot, link 2.
    fn add_power_meter(&mut self) {
        let (relay, host, out) = (&mut self.relay, &mut self.host, &mut self.out);
        relay.on_advertisement(host, out, ASSIOMA, -60, &adv("ASSIOMA", uuid::CYCLING_POWER_SERVICE), 30);
        relay.on_connected(host, out, LinkId(2), 40);
        for answer in [
            Ok(None),
            Ok(Some(Attribute::Service { start: 1, end: 9 })),
            characteristic(uuid::CYCLING_POWER_MEASUREMENT, 3, CharProps::NOTIFY),
            Ok(Some(Attribute::Descriptor { handle: 4 })),
            Ok(None),
            Ok(None),
        ] {
            relay.on_discovered(host, LinkId(2), answer);
        }
        self.host.take();
    }

    fn notify(&mut self, key: SubscriptionKey, data: &[u8], now_ms: u64) {
        self.relay
            .on_notification(&mut self.host, &mut self.out, key, data, now_ms);
    }

    fn app_writes(&mut self, data: &[u8], now_ms: u64) {
        self.relay
            .on_control_point_write(&mut self.host, &mut self.out, APP, 0, data, now_ms)
            .unwrap();
    }
}

fn bike_data(speed: u16) -> Vec<u8> {
    let mut frame = vec![0x00, 0x00];
    frame.extend_from_slice(&speed.to_le_bytes());
    frame
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[test]
fn boot_advertises_and_scans() {
    let mut relay = Relay::new(RelayConfig::default(), "Z-Relay-0001");
    let mut host = Host::default();
    let mut out = Sink::default();
    relay.start(&mut host, &mut out, 0);
    assert_eq!(
        host.take(),
        [Call::StartAdvertising("Z-Relay-0001".into()), Call::StartScan]
    );
    assert_eq!(
        out.lines,
        ["{\"type\":\"devices\",\"ts\":0,\"count\":0,\"list\":[]}\n"]
    );
}

#[test]
fn trainer_is_remembered_and_fully_subscribed() {
    let rig = Rig::with_trainer();
    assert!(rig.relay.store().is_saved(&KICKR));
    let slot = rig.relay.connections().slot(0).unwrap();
    assert_eq!(slot.subscriptions().len(), 3);
    assert_eq!(rig.relay.connections().trainer().map(|t| t.handle), Some(CP_HANDLE));
}

#[test]
fn bike_data_is_relayed_and_reported() {
    let mut rig = Rig::with_trainer();
    let frame = bike_data(2500);
    rig.notify(key(0, IBD), &frame, 100);
    assert_eq!(rig.host.notified(LocalCharacteristic::IndoorBikeData), [&frame[..]]);
    assert_eq!(rig.out.of_type("ftms").len(), 1);
    assert_eq!(rig.relay.data_plane().last_speed(), Some(2500));
}

#[test]
fn simulation_request_is_limited_and_translated() {
    let mut rig = Rig::with_trainer();
    rig.notify(key(0, IBD), &bike_data(1500), 100);
    let bucket = bucket_of(1500).unwrap();
    rig.relay.limiter_mut().set_ceiling(bucket, 300);
    rig.host.take();

    // 5.00 % grade, no wind, default crr/cw omitted
    rig.app_writes(&[0x11, 0x00, 0x00, 0xF4, 0x01], 200);

    assert_eq!(rig.host.take(), [Call::Write(TRAINER_LINK, CP_HANDLE, vec![0x04, 0x0F])]);
    let sims = rig.out.of_type("sim");
    assert_eq!(sims.len(), 1);
    assert!(sims[0].contains("\"applied_grade\":300"));
    assert!(sims[0].contains("\"limited\":true"));
}

#[test]
fn trainer_response_is_rewritten_for_the_app() {
    let mut rig = Rig::with_trainer();
    rig.app_writes(&[0x11, 0x00, 0x00, 0x2C, 0x01], 0);
    rig.relay.on_write_complete(TRAINER_LINK, Ok(()));
    rig.host.take();

    rig.notify(key(0, CONTROL), &[0x80, 0x04, 0x01], 50);
    assert_eq!(rig.host.take(), [Call::Defer(Work::FlushControlPointResponse)]);

    rig.relay.on_work(&mut rig.host, Work::FlushControlPointResponse);
    assert_eq!(
        rig.host.take(),
        [Call::Indicate(LocalCharacteristic::ControlPoint, vec![0x80, 0x11, 0x01])]
    );
    assert_eq!(rig.out.of_type("cp_response").len(), 1);
}

#[test]
fn pass_through_commands_reach_the_trainer_untouched() {
    let mut rig = Rig::with_trainer();
    rig.app_writes(&[0x00], 0);
    assert_eq!(rig.host.take(), [Call::Write(TRAINER_LINK, CP_HANDLE, vec![0x00])]);

    rig.relay.on_write_complete(TRAINER_LINK, Ok(()));
    rig.app_writes(&[0x05, 0xC8, 0x00], 10);
    assert_eq!(
        rig.host.take(),
        [Call::Write(TRAINER_LINK, CP_HANDLE, vec![0x05, 0xC8, 0x00])]
    );
}

#[test]
fn fresh_power_is_injected_into_bike_data() {
    let mut rig = Rig::with_trainer();
    rig.add_power_meter();

    // 250 W from the pedals
    rig.notify(key(1, 0), &[0x00, 0x00, 0xFA, 0x00], 1_000);
    assert_eq!(
        rig.host.notified(LocalCharacteristic::CyclingPowerMeasurement),
        [&[0x00, 0x00, 0xFA, 0x00][..]]
    );

    // trainer reports 15 km/h and 100 W
    rig.notify(key(0, IBD), &[0x40, 0x00, 0xDC, 0x05, 0x64, 0x00], 1_500);
    assert_eq!(
        rig.host.notified(LocalCharacteristic::IndoorBikeData),
        [&[0x40, 0x00, 0xDC, 0x05, 0xFA, 0x00][..]]
    );
}

#[test]
fn stale_power_is_not_injected() {
    let mut rig = Rig::with_trainer();
    rig.add_power_meter();
    rig.notify(key(1, 0), &[0x00, 0x00, 0xFA, 0x00], 0);
    let frame = [0x40, 0x00, 0xDC, 0x05, 0x64, 0x00];
    rig.notify(key(0, IBD), &frame, 60_000);
    assert_eq!(rig.host.notified(LocalCharacteristic::IndoorBikeData), [&frame[..]]);
}

#[test]
fn dropped_power_meter_takes_its_crank_baseline_along() {
    let mut rig = Rig::with_trainer();
    rig.add_power_meter();
    // 250 W, 40000 revs, then 3 more revs one second later
    rig.notify(key(1, 0), &[0x20, 0x00, 0xFA, 0x00, 0x40, 0x9C, 0x00, 0x00], 1_000);
    rig.notify(key(1, 0), &[0x20, 0x00, 0xFA, 0x00, 0x43, 0x9C, 0x00, 0x04], 2_000);
    assert_eq!(rig.relay.data_plane().cache().cadence_half_rpm(), 360);

    rig.relay
        .on_disconnected(&mut rig.host, &mut rig.out, LinkId(2), 2_500);
    let cache = rig.relay.data_plane().cache();
    assert_eq!(cache.crank(), None);
    assert_eq!(cache.cadence_half_rpm(), 0);
    assert_eq!(cache.fresh_power(2_500), None);

    let frame = [0x40, 0x00, 0xDC, 0x05, 0x64, 0x00];
    rig.host.take();
    rig.notify(key(0, IBD), &frame, 3_000);
    assert_eq!(rig.host.notified(LocalCharacteristic::IndoorBikeData), [&frame[..]]);
}

#[test]
fn losing_the_trainer_keeps_pedal_power() {
    let mut rig = Rig::with_trainer();
    rig.add_power_meter();
    rig.notify(key(1, 0), &[0x00, 0x00, 0xFA, 0x00], 1_000);
    rig.relay
        .on_disconnected(&mut rig.host, &mut rig.out, TRAINER_LINK, 1_200);
    assert_eq!(rig.relay.data_plane().cache().fresh_power(1_500), Some(250));
}

#[test]
fn thermal_release_teaches_the_limiter() {
    let mut rig = Rig::with_trainer();
    rig.notify(key(0, IBD), &bike_data(1500), 0);
    // 10.00 %
    rig.app_writes(&[0x11, 0x00, 0x00, 0xE8, 0x03], 10);
    rig.notify(key(0, STATUS), &[0x84, 72], 20);

    let bucket = bucket_of(1500).unwrap();
    assert_eq!(rig.relay.limiter().ceiling(bucket), Some(900));
    assert_eq!(rig.out.of_type("status").len(), 1);
}

#[test]
fn losing_the_trainer_rescans_and_reconnects() {
    let mut rig = Rig::with_trainer();
    rig.relay
        .on_disconnected(&mut rig.host, &mut rig.out, TRAINER_LINK, 1_000);
    assert!(rig.host.take().contains(&Call::StartScan));
    assert_eq!(rig.relay.connections().trainer(), None);

    // saved, so no pairing window needed
    rig.relay.on_timer(&mut rig.host, TimerId::PriorityWindowEnd);
    rig.host.take();
    rig.relay.on_advertisement(
        &mut rig.host,
        &mut rig.out,
        KICKR,
        -50,
        &adv("KICKR", uuid::FITNESS_MACHINE_SERVICE),
        2_000,
    );
    assert!(rig.host.take().contains(&Call::Connect(KICKR)));
}

#[test]
fn full_store_still_connects_without_saving() {
    let mut rig = Rig::new();
    for n in 0..4u8 {
        let addr = BdAddr::new(0, [n, 0, 0, 0, 0, 0xC0]);
        rig.relay
            .store_mut()
            .save(addr, "OLD", zrelay::ble::ServiceMask::HEART_RATE)
            .unwrap();
    }

    rig.relay.on_advertisement(
        &mut rig.host,
        &mut rig.out,
        HRM,
        -50,
        &adv("HRM", uuid::HEART_RATE_SERVICE),
        0,
    );
    assert!(rig.host.take().contains(&Call::Connect(HRM)));
    rig.relay.on_connected(&mut rig.host, &mut rig.out, LinkId(1), 10);

    assert!(!rig.relay.store().is_saved(&HRM));
    assert!(rig.host.take().contains(&Call::Discover(
        LinkId(1),
        DiscoverRequest::PrimaryService {
            uuid: uuid::HEART_RATE_SERVICE
        }
    )));
}

#[test]
fn heart_rate_strap_end_to_end() {
    let mut rig = Rig::new();
    rig.relay.on_advertisement(
        &mut rig.host,
        &mut rig.out,
        HRM,
        -58,
        &adv("HRM", uuid::HEART_RATE_SERVICE),
        0,
    );
    rig.relay.on_connected(&mut rig.host, &mut rig.out, LinkId(1), 10);
    for answer in [
        Ok(Some(Attribute::Service { start: 1, end: 6 })),
        characteristic(uuid::HEART_RATE_MEASUREMENT, 3, CharProps::NOTIFY),
        Ok(Some(Attribute::Descriptor { handle: 4 })),
        Ok(None),
        Ok(None),
        Ok(None),
    ] {
        rig.relay.on_discovered(&mut rig.host, LinkId(1), answer);
    }
    rig.host.take();

    rig.notify(key(0, 0), &[0x00, 142], 1_200);
    assert_eq!(
        rig.host.notified(LocalCharacteristic::HeartRateMeasurement),
        [&[0x00, 142][..]]
    );
    assert_eq!(
        rig.out.of_type("hr"),
        ["{\"type\":\"hr\",\"ts\":1200,\"bpm\":142,\"rssi\":-58}\n"]
    );
}

#[test]
fn short_press_reports_grade_table() {
    let mut rig = Rig::new();
    rig.relay
        .on_button(&mut rig.host, &mut rig.out, ButtonEvent::ShortPress, 5);
    assert_eq!(rig.out.of_type("grade_table").len(), 1);
    assert_eq!(rig.out.of_type("devices").len(), 1);
}
