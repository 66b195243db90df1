//! [`BleHost`] over the board's task channels.
//!
//! Central requests go to the slot task that owns the link; scanning and
//! advertising are signals; notify/indicate go straight to the GATT server
//! on the companion link. Timers and deferred work stay local and are
//! polled by the engine task.

use embassy_time::{Duration, Instant};
use heapless::{Deque, String, Vec};

use zrelay::ble::host::{BleHost, DiscoverRequest, Subscription, TimerId, Work};
use zrelay::ble::{BdAddr, LinkId, LocalCharacteristic, SubscriptionKey};
use zrelay::config::MAX_CONNECTIONS;
use zrelay::error::HostError;

use super::server::RelayServer;
use super::{SlotCommand, ADVERTISE, PERIPHERAL, SCAN, SLOTS};

const TIMER_COUNT: usize = 2;

fn timer_index(timer: TimerId) -> usize {
    match timer {
        TimerId::ConnectTimeout => 0,
        TimerId::PriorityWindowEnd => 1,
    }
}

const TIMERS: [TimerId; TIMER_COUNT] = [TimerId::ConnectTimeout, TimerId::PriorityWindowEnd];

pub struct ChannelHost {
    server: &'static RelayServer,
    /// Link served by each slot task.
    links: [Option<LinkId>; MAX_CONNECTIONS],
    next_link: u16,
    deadlines: [Option<Instant>; TIMER_COUNT],
    work: Deque<Work, 4>,
}

impl ChannelHost {
    pub fn new(server: &'static RelayServer) -> Self {
        Self {
            server,
            links: [None; MAX_CONNECTIONS],
            next_link: 1,
            deadlines: [None; TIMER_COUNT],
            work: Deque::new(),
        }
    }

    /// Forget a central link once its slot task reports it gone.
    pub fn release(&mut self, link: LinkId) {
        for l in self.links.iter_mut().filter(|l| **l == Some(link)) {
            *l = None;
        }
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// Disarm and return every timer due at `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerId, TIMER_COUNT> {
        let mut due = Vec::new();
        for (deadline, timer) in self.deadlines.iter_mut().zip(TIMERS) {
            if deadline.is_some_and(|at| at <= now) {
                *deadline = None;
                let _ = due.push(timer);
            }
        }
        due
    }

    pub fn take_work(&mut self) -> Option<Work> {
        self.work.pop_front()
    }

    fn send(&self, link: LinkId, command: SlotCommand) -> Result<(), HostError> {
        let slot = self
            .links
            .iter()
            .position(|l| *l == Some(link))
            .ok_or(HostError::NotConnected)?;
        SLOTS[slot].try_send(command).map_err(|_| HostError::Busy)
    }

    fn companion<R>(
        &self,
        f: impl FnOnce(&nrf_softdevice::ble::Connection) -> Result<R, HostError>,
    ) -> Result<R, HostError> {
        let conn = PERIPHERAL.lock(|c| c.borrow().clone());
        match conn {
            Some(conn) => f(&conn),
            None => Err(HostError::NotConnected),
        }
    }
}

impl BleHost for ChannelHost {
    fn start_scan(&mut self) -> Result<(), HostError> {
        SCAN.signal(true);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), HostError> {
        SCAN.signal(false);
        Ok(())
    }

    fn start_advertising(&mut self, name: &str) -> Result<(), HostError> {
        let mut adv_name = String::new();
        adv_name.push_str(name).map_err(|_| HostError::NoMemory)?;
        ADVERTISE.signal(adv_name);
        Ok(())
    }

    fn connect(&mut self, addr: &BdAddr) -> Result<LinkId, HostError> {
        let slot = self
            .links
            .iter()
            .position(Option::is_none)
            .ok_or(HostError::NoMemory)?;
        let link = LinkId(self.next_link);
        SLOTS[slot]
            .try_send(SlotCommand::Connect { address: *addr, link })
            .map_err(|_| HostError::Busy)?;
        self.links[slot] = Some(link);
        // peripheral links live above 0x8000
        self.next_link = if self.next_link >= 0x7FFF { 1 } else { self.next_link + 1 };
        Ok(link)
    }

    fn cancel_connect(&mut self, link: LinkId) -> Result<(), HostError> {
        self.send(link, SlotCommand::Cancel)
    }

    fn disconnect(&mut self, link: LinkId) -> Result<(), HostError> {
        self.send(link, SlotCommand::Disconnect)
    }

    fn discover(&mut self, link: LinkId, request: DiscoverRequest) -> Result<(), HostError> {
        self.send(link, SlotCommand::Discover(request))
    }

    fn subscribe(
        &mut self,
        link: LinkId,
        key: SubscriptionKey,
        subscription: Subscription,
    ) -> Result<(), HostError> {
        self.send(link, SlotCommand::Subscribe(key, subscription))
    }

    fn write(&mut self, link: LinkId, handle: u16, data: &[u8]) -> Result<(), HostError> {
        let data = Vec::from_slice(data).map_err(|_| HostError::NoMemory)?;
        self.send(link, SlotCommand::Write(handle, data))
    }

    fn read(&mut self, link: LinkId, handle: u16) -> Result<(), HostError> {
        self.send(link, SlotCommand::Read(handle))
    }

    fn notify(&mut self, characteristic: LocalCharacteristic, data: &[u8]) -> Result<(), HostError> {
        let server = self.server;
        self.companion(|conn| server.notify(conn, characteristic, data))
    }

    fn indicate(&mut self, characteristic: LocalCharacteristic, data: &[u8]) -> Result<(), HostError> {
        let server = self.server;
        self.companion(|conn| server.indicate(conn, characteristic, data))
    }

    fn schedule(&mut self, timer: TimerId, after_ms: u64) {
        self.deadlines[timer_index(timer)] = Some(Instant::now() + Duration::from_millis(after_ms));
    }

    fn cancel(&mut self, timer: TimerId) {
        self.deadlines[timer_index(timer)] = None;
    }

    fn defer(&mut self, work: Work) {
        if !self.work.iter().any(|w| *w == work) {
            let _ = self.work.push_back(work);
        }
    }
}
