//! The relay engine.
//!
//! [`Relay`] owns every table (slots, discovered devices, saved devices,
//! grade limiter, cross-sensor cache, control-point state) and exposes one
//! entry point per host-stack callback. The embedded build feeds it from a
//! single task; tests drive it with a recording host.
//!
//! Every entry point takes the host, the event sink and the current
//! uptime in milliseconds. Nothing in here blocks or fails: problems are
//! logged and the engine keeps going.

use crate::activity::{self, ActivityTracker};
use crate::ble::host::{Attribute, BleHost, TimerId, Work};
use crate::ble::multi_conn::{ConnectionManager, Disconnected};
use crate::ble::{BdAddr, LinkId, SubscriptionKey, SubscriptionKind};
use crate::config::RelayConfig;
use crate::control_point::Translator;
use crate::error::{AttError, HostError};
use crate::events::{self, EventSink};
use crate::grade_limiter::GradeLimiter;
use crate::relay::{DataPlane, Observed};
use crate::storage::DeviceStore;
use crate::ui::ButtonEvent;

pub struct Relay {
    config: RelayConfig,
    connections: ConnectionManager,
    store: DeviceStore,
    limiter: GradeLimiter,
    data: DataPlane,
    translator: Translator,
    activity: ActivityTracker,
}

impl Relay {
    /// `name` is the advertised name, `Z-Relay-XXXX`.
    pub fn new(config: RelayConfig, name: &str) -> Self {
        Self {
            config,
            connections: ConnectionManager::new(name),
            store: DeviceStore::new(),
            limiter: GradeLimiter::new(config.grade_limit),
            data: DataPlane::new(),
            translator: Translator::new(config.translation),
            activity: ActivityTracker::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    /// Restore at boot and drain dirty slots after each event.
    pub fn store_mut(&mut self) -> &mut DeviceStore {
        &mut self.store
    }

    pub fn limiter(&self) -> &GradeLimiter {
        &self.limiter
    }

    pub fn limiter_mut(&mut self) -> &mut GradeLimiter {
        &mut self.limiter
    }

    pub fn data_plane(&self) -> &DataPlane {
        &self.data
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    /// Boot: dump what we remember and come up on air.
    pub fn start<H: BleHost, S: EventSink>(&mut self, host: &mut H, out: &mut S, now_ms: u64) {
        info!(
            "relay: starting with {} saved device(s), translation {:?}, grade limit {:?}",
            self.store.len(),
            self.config.translation,
            self.config.grade_limit
        );
        self.connections.snapshot(out, now_ms);
        self.connections.start_advertising(host);
    }

    // Central role

    pub fn on_advertisement<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        address: BdAddr,
        rssi: i8,
        data: &[u8],
        now_ms: u64,
    ) {
        let changed =
            self.connections
                .on_advertisement(host, &self.store, address, rssi, data, now_ms);
        if changed {
            self.connections.snapshot(out, now_ms);
        }
    }

    pub fn on_connected<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        link: LinkId,
        now_ms: u64,
    ) {
        if self.connections.on_connected(host, &mut self.store, link).is_some() {
            self.connections.snapshot(out, now_ms);
        }
    }

    pub fn on_connect_failed<H: BleHost>(&mut self, host: &mut H, link: LinkId, error: HostError) {
        self.connections.on_connect_failed(host, link, error);
    }

    pub fn on_discovered<H: BleHost>(
        &mut self,
        host: &mut H,
        link: LinkId,
        result: Result<Option<Attribute>, HostError>,
    ) {
        self.connections.on_discovered(host, link, result);
    }

    pub fn on_read_complete(&mut self, link: LinkId, handle: u16, result: Result<&[u8], HostError>) {
        self.connections.on_read_complete(link, handle, result);
    }

    /// Notification or indication from a sensor subscription.
    pub fn on_notification<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        key: SubscriptionKey,
        data: &[u8],
        now_ms: u64,
    ) {
        let Some(sub) = self.connections.subscription(key) else {
            trace!("relay: stale subscription {:?}", key);
            return;
        };

        if sub.kind == SubscriptionKind::ControlPoint {
            self.translator.on_trainer_indication(host, out, data, now_ms);
            return;
        }

        if self.data.relay(host, out, sub.kind, sub.rssi, data, now_ms) == Observed::ThermalRelease {
            self.on_thermal_release();
        }
    }

    fn on_thermal_release(&mut self) {
        if !self.config.learn_on_thermal_release {
            return;
        }
        match (self.data.last_speed(), self.translator.last_applied_grade()) {
            (Some(speed), Some(grade)) => {
                if !self.limiter.learn(speed, grade) {
                    debug!("relay: release at speed {} grade {} taught nothing", speed, grade);
                }
            }
            _ => debug!("relay: thermal release before any speed or grade was seen"),
        }
    }

    /// Forwarded Control Point write finished on the trainer link.
    pub fn on_write_complete(&mut self, link: LinkId, result: Result<(), HostError>) {
        trace!("relay: write complete on link {}", link.0);
        self.translator.on_write_complete(result);
    }

    // Peripheral role

    pub fn on_peripheral_connected(&mut self, link: LinkId) {
        self.connections.on_peripheral_connected(link);
    }

    pub fn on_disconnected<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        link: LinkId,
        now_ms: u64,
    ) {
        match self.connections.on_disconnected(host, link) {
            Disconnected::Sensor {
                was_trainer,
                was_power_meter,
                ..
            } => {
                if was_trainer {
                    self.translator.on_trainer_lost();
                }
                if was_power_meter {
                    self.data.forget_power_meter();
                }
                self.connections.snapshot(out, now_ms);
            }
            Disconnected::Peripheral => self.translator.on_peripheral_disconnected(),
            Disconnected::Unknown => {}
        }
    }

    /// Write to our Control Point from the companion app.
    pub fn on_control_point_write<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        link: LinkId,
        offset: u16,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(), AttError> {
        let trainer = self.connections.trainer();
        let speed = self.data.last_speed();
        self.translator
            .on_write(host, out, &self.limiter, trainer, speed, link, offset, data, now_ms)
    }

    pub fn on_control_point_ccc<H: BleHost>(&mut self, host: &mut H, link: LinkId, indications: bool) {
        self.translator.on_ccc_write(host, link, indications);
    }

    pub fn on_indication_released<H: BleHost>(&mut self, host: &mut H, acknowledged: bool) {
        self.translator.on_indication_released(host, acknowledged);
    }

    // Timers, work and ticks

    pub fn on_work<H: BleHost>(&mut self, host: &mut H, work: Work) {
        match work {
            Work::FlushControlPointResponse => self.translator.flush(host),
        }
    }

    pub fn on_timer<H: BleHost>(&mut self, host: &mut H, timer: TimerId) {
        match timer {
            TimerId::ConnectTimeout => self.connections.on_connect_timeout(host),
            TimerId::PriorityWindowEnd => self.connections.close_priority_window(host),
        }
    }

    /// Periodic activity tick ([`crate::config::ACTIVITY_TICK_MS`]).
    pub fn on_tick(&mut self, now_ms: u64) {
        let active = activity::is_active(
            self.connections.trainer().is_some(),
            self.data.cache().fresh_power(now_ms),
        );
        let secs = self.activity.tick(now_ms, active);
        self.limiter.add_active_seconds(secs);
    }

    pub fn on_button<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        event: ButtonEvent,
        now_ms: u64,
    ) {
        match event {
            ButtonEvent::ShortPress => {
                self.connections.snapshot(out, now_ms);
                events::grade_table(out, now_ms, self.limiter.active_hours(), self.limiter.ceilings());
            }
            ButtonEvent::LongPress => {
                info!("relay: forgetting all sensors");
                self.connections.disconnect_all(host);
                self.store.clear_all();
                self.connections.forget_saved();
                self.connections
                    .open_priority_window(host, self.config.priority_window_ms);
                self.connections.snapshot(out, now_ms);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
