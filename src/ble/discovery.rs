//! Per-connection GATT discovery walk.
//!
//! The walk visits a fixed service list (Heart Rate, Cycling Power,
//! Fitness Machine). For every service it enumerates the characteristics,
//! locates the CCC descriptor of each relayed one and asks the connection
//! manager to subscribe. Exactly one host request is outstanding at a time;
//! the manager feeds each answer back through [`Discovery::on_result`].
//!
//! ```text
//! Idle → Service(i) → Characteristic(i) ⇄ Ccc(i) → Service(i+1) … → Complete
//! ```

use crate::ble::host::{Attribute, CharProps, DiscoverRequest, SubscribeMode, Subscription};
use crate::ble::{uuid, SubscriptionKind};
use crate::error::HostError;

/// Services walked, in order.
pub const SERVICES: [u16; 3] = [
    uuid::HEART_RATE_SERVICE,
    uuid::CYCLING_POWER_SERVICE,
    uuid::FITNESS_MACHINE_SERVICE,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryState {
    #[default]
    Idle,
    /// Looking up primary service `SERVICES[i]`.
    Service(usize),
    /// Enumerating characteristics of service `i`.
    Characteristic(usize),
    /// Looking for the CCC of the characteristic held in `pending`.
    Ccc(usize),
    Complete,
}

/// Something the walk found that the connection manager must act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Found {
    /// Subscribe to a relayed characteristic.
    Subscribe(SubscriptionKind, Subscription),
    /// Trainer Control Point; record the handle and subscribe for indications.
    ControlPoint(Subscription),
    /// Fitness Machine Feature value handle (read once discovery completes).
    Feature(u16),
}

/// What the manager does after feeding a result in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Next {
    Request(DiscoverRequest),
    Complete,
    /// Primary service discovery failed; give up on this link.
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Step {
    pub found: Option<Found>,
    pub next: Next,
}

impl Step {
    const fn next(next: Next) -> Self {
        Self { found: None, next }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingCharacteristic {
    kind: SubscriptionKind,
    value_handle: u16,
}

/// Discovery cursor and scratch state of one connection slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Discovery {
    state: DiscoveryState,
    service_end: u16,
    pending: Option<PendingCharacteristic>,
}

impl Discovery {
    pub const fn new() -> Self {
        Self {
            state: DiscoveryState::Idle,
            service_end: 0,
            pending: None,
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == DiscoveryState::Complete
    }

    /// Begin the walk; returns the first request to issue.
    pub fn start(&mut self) -> DiscoverRequest {
        *self = Self::new();
        self.state = DiscoveryState::Service(0);
        DiscoverRequest::PrimaryService { uuid: SERVICES[0] }
    }

    /// The host refused to start the request returned by the previous step.
    pub fn on_request_failed(&mut self, error: HostError) -> Step {
        self.on_result(Err(error))
    }

    /// Feed the answer to the outstanding request.
    pub fn on_result(&mut self, result: Result<Option<Attribute>, HostError>) -> Step {
        match self.state {
            DiscoveryState::Service(i) => self.on_service(i, result),
            DiscoveryState::Characteristic(i) => self.on_characteristic(i, result),
            DiscoveryState::Ccc(i) => self.on_ccc(i, result),
            DiscoveryState::Idle | DiscoveryState::Complete => {
                debug!("discovery: result ignored in state {:?}", self.state);
                Step::next(Next::Complete)
            }
        }
    }

    fn on_service(&mut self, i: usize, result: Result<Option<Attribute>, HostError>) -> Step {
        match result {
            Ok(Some(Attribute::Service { start, end })) if start < end => {
                debug!("discovery: service {:#x} at {}..{}", SERVICES[i], start, end);
                self.service_end = end;
                self.state = DiscoveryState::Characteristic(i);
                Step::next(Next::Request(DiscoverRequest::Characteristics {
                    start: start + 1,
                    end,
                }))
            }
            Ok(_) => {
                debug!("discovery: service {:#x} not present", SERVICES[i]);
                self.next_service(i)
            }
            Err(e) => {
                warn!("discovery: primary service {:#x} failed: {:?}", SERVICES[i], e);
                self.state = DiscoveryState::Idle;
                Step::next(Next::Abort)
            }
        }
    }

    fn on_characteristic(&mut self, i: usize, result: Result<Option<Attribute>, HostError>) -> Step {
        let (char_uuid, value_handle, props) = match result {
            Ok(Some(Attribute::Characteristic {
                uuid,
                value_handle,
                props,
            })) => (uuid, value_handle, props),
            Ok(_) => return self.next_service(i),
            Err(e) => {
                warn!("discovery: characteristic walk of {:#x} failed: {:?}", SERVICES[i], e);
                return self.next_service(i);
            }
        };

        match classify(SERVICES[i], char_uuid, props) {
            Classified::Notify(kind) => {
                self.pending = Some(PendingCharacteristic { kind, value_handle });
                self.state = DiscoveryState::Ccc(i);
                match value_handle.checked_add(1) {
                    Some(start) if start <= self.service_end => {
                        Step::next(Next::Request(DiscoverRequest::Descriptor {
                            uuid: uuid::CLIENT_CHARACTERISTIC_CONFIG,
                            start,
                            end: self.service_end,
                        }))
                    }
                    _ => self.next_service(i),
                }
            }
            Classified::ControlPoint => {
                let subscription = Subscription {
                    value_handle,
                    ccc_handle: value_handle.wrapping_add(1),
                    mode: SubscribeMode::Indicate,
                };
                let mut step = self.continue_after(i, value_handle);
                step.found = Some(Found::ControlPoint(subscription));
                step
            }
            Classified::Feature => {
                let mut step = self.continue_after(i, value_handle);
                step.found = Some(Found::Feature(value_handle));
                step
            }
            Classified::Skip => {
                trace!("discovery: skipping characteristic {:#x}", char_uuid);
                self.continue_after(i, value_handle)
            }
        }
    }

    fn on_ccc(&mut self, i: usize, result: Result<Option<Attribute>, HostError>) -> Step {
        let Some(pending) = self.pending.take() else {
            return self.next_service(i);
        };
        self.state = DiscoveryState::Characteristic(i);

        match result {
            Ok(Some(Attribute::Descriptor { handle })) => {
                let subscription = Subscription {
                    value_handle: pending.value_handle,
                    ccc_handle: handle,
                    mode: SubscribeMode::Notify,
                };
                let mut step = self.continue_after(i, handle);
                step.found = Some(Found::Subscribe(pending.kind, subscription));
                step
            }
            Ok(_) => {
                debug!("discovery: no CCC for {:?}", pending.kind);
                self.continue_after(i, pending.value_handle)
            }
            Err(e) => {
                warn!("discovery: CCC lookup for {:?} failed: {:?}", pending.kind, e);
                self.continue_after(i, pending.value_handle)
            }
        }
    }

    /// Resume the characteristic walk of service `i` after `handle`.
    fn continue_after(&mut self, i: usize, handle: u16) -> Step {
        self.state = DiscoveryState::Characteristic(i);
        match handle.checked_add(1) {
            Some(start) if start <= self.service_end => {
                Step::next(Next::Request(DiscoverRequest::Characteristics {
                    start,
                    end: self.service_end,
                }))
            }
            _ => self.next_service(i),
        }
    }

    fn next_service(&mut self, i: usize) -> Step {
        self.pending = None;
        let next = i + 1;
        if next < SERVICES.len() {
            self.state = DiscoveryState::Service(next);
            Step::next(Next::Request(DiscoverRequest::PrimaryService {
                uuid: SERVICES[next],
            }))
        } else {
            self.state = DiscoveryState::Complete;
            Step::next(Next::Complete)
        }
    }
}

enum Classified {
    Notify(SubscriptionKind),
    ControlPoint,
    Feature,
    Skip,
}

fn classify(service: u16, characteristic: u16, props: CharProps) -> Classified {
    let kind = match (service, characteristic) {
        (uuid::HEART_RATE_SERVICE, uuid::HEART_RATE_MEASUREMENT) => SubscriptionKind::HeartRate,
        (uuid::CYCLING_POWER_SERVICE, uuid::CYCLING_POWER_MEASUREMENT) => {
            SubscriptionKind::CyclingPower
        }
        (uuid::FITNESS_MACHINE_SERVICE, uuid::INDOOR_BIKE_DATA) => SubscriptionKind::IndoorBikeData,
        (uuid::FITNESS_MACHINE_SERVICE, uuid::TRAINING_STATUS) => SubscriptionKind::TrainingStatus,
        (uuid::FITNESS_MACHINE_SERVICE, uuid::FITNESS_MACHINE_STATUS) => {
            SubscriptionKind::MachineStatus
        }
        (uuid::FITNESS_MACHINE_SERVICE, uuid::FITNESS_MACHINE_CONTROL_POINT) => {
            return if props.can_indicate() && props.can_write() {
                Classified::ControlPoint
            } else {
                Classified::Skip
            };
        }
        (uuid::FITNESS_MACHINE_SERVICE, uuid::FITNESS_MACHINE_FEATURE) if props.can_read() => {
            return Classified::Feature;
        }
        _ => return Classified::Skip,
    };

    if props.can_notify() {
        Classified::Notify(kind)
    } else {
        Classified::Skip
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════
