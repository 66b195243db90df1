//! Fitness Machine Control Point translator.
//!
//! Sits between the companion app's writes to the relay's Control Point
//! and the trainer's own Control Point:
//!
//! ```text
//! app write ─► validate ─► (0x11: grade limiter ─► translate/patch) ─► trainer write
//! trainer indication ─► (0x04 → 0x11 if translated) ─► queue ─► app indication
//! ```
//!
//! Buffers are owned by the operation using them: a [`PendingWrite`] holds
//! the forwarded command until the trainer acknowledges the write, and a
//! [`ControlPointResponse`] holds the response until the app's indication
//! is released. A second command is never encoded into an occupied buffer.

use heapless::{Deque, Vec};

use crate::ble::host::{BleHost, Work};
use crate::ble::{LinkId, LocalCharacteristic};
use crate::config::{SimulationTranslation, CP_MAX_WRITE_LEN};
use crate::error::{AttError, Error, HostError};
use crate::events::{self, EventSink, SimulationEvent};
use crate::grade_limiter::GradeLimiter;

/// FTMS Control Point op codes.
pub mod opcode {
    pub const REQUEST_CONTROL: u8 = 0x00;
    pub const RESET: u8 = 0x01;
    pub const SET_TARGET_SPEED: u8 = 0x02;
    pub const SET_TARGET_INCLINATION: u8 = 0x03;
    pub const SET_TARGET_RESISTANCE: u8 = 0x04;
    pub const SET_TARGET_POWER: u8 = 0x05;
    pub const SET_TARGET_HEART_RATE: u8 = 0x06;
    pub const START_RESUME: u8 = 0x07;
    pub const STOP_PAUSE: u8 = 0x08;
    pub const SET_INDOOR_BIKE_SIMULATION: u8 = 0x11;
    pub const RESPONSE_CODE: u8 = 0x80;
}

/// Result codes carried by a Response Code indication.
pub mod result_code {
    pub const SUCCESS: u8 = 0x01;
    pub const NOT_SUPPORTED: u8 = 0x02;
    pub const INVALID_PARAMETER: u8 = 0x03;
    pub const FAILED: u8 = 0x04;
}

pub fn opcode_name(op: u8) -> &'static str {
    match op {
        opcode::REQUEST_CONTROL => "Request Control",
        opcode::RESET => "Reset",
        opcode::SET_TARGET_SPEED => "Set Target Speed",
        opcode::SET_TARGET_INCLINATION => "Set Target Inclination",
        opcode::SET_TARGET_RESISTANCE => "Set Target Resistance",
        opcode::SET_TARGET_POWER => "Set Target Power",
        opcode::SET_TARGET_HEART_RATE => "Set Target Heart Rate",
        opcode::START_RESUME => "Start/Resume",
        opcode::STOP_PAUSE => "Stop/Pause",
        opcode::SET_INDOOR_BIKE_SIMULATION => "Set Indoor Bike Simulation",
        opcode::RESPONSE_CODE => "Response Code",
        _ => "Unknown",
    }
}

pub fn result_name(result: u8) -> &'static str {
    match result {
        result_code::SUCCESS => "Success",
        result_code::NOT_SUPPORTED => "Not Supported",
        result_code::INVALID_PARAMETER => "Invalid Parameter",
        result_code::FAILED => "Failed",
        _ => "Unknown",
    }
}

/// Parameters of Set Indoor Bike Simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SimulationParams {
    /// 0.001 m/s.
    pub wind_speed: i16,
    /// 0.01 %.
    pub grade: i16,
    /// Rolling resistance coefficient, 0.0001.
    pub crr: Option<u8>,
    /// Wind resistance coefficient, 0.01 kg/m.
    pub cw: Option<u8>,
}

/// Decode a 0x11 command; `None` if it is not one or is shorter than 5 bytes.
pub fn parse_simulation(data: &[u8]) -> Option<SimulationParams> {
    if data.len() < 5 || data[0] != opcode::SET_INDOOR_BIKE_SIMULATION {
        return None;
    }
    Some(SimulationParams {
        wind_speed: i16::from_le_bytes([data[1], data[2]]),
        grade: i16::from_le_bytes([data[3], data[4]]),
        crr: data.get(5).copied(),
        cw: data.get(6).copied(),
    })
}

/// Grade (0.01 %) to unitless resistance level 0..=100.
pub fn grade_to_resistance(grade: i16) -> u8 {
    (grade / 20).clamp(0, 100) as u8
}

/// ATT-level validation of a Control Point write.
///
/// Pure, so the GATT server can answer the peer before the write is queued.
pub fn check_write(offset: u16, data: &[u8]) -> Result<(), AttError> {
    if offset != 0 {
        return Err(AttError::InvalidOffset);
    }
    if data.is_empty() || data.len() > CP_MAX_WRITE_LEN {
        return Err(AttError::InvalidAttributeValueLength);
    }
    Ok(())
}

/// Control Point of the connected trainer, as known to the connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Trainer {
    pub link: LinkId,
    pub handle: u16,
    /// Trainer declared Indoor Bike Simulation in its feature characteristic.
    pub supports_simulation: bool,
}

type CommandBuf = Vec<u8, CP_MAX_WRITE_LEN>;

/// Command forwarded to the trainer, owned until the write completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingWrite {
    pub link: LinkId,
    pub data: CommandBuf,
    /// Set Indoor Bike Simulation rewritten to Set Target Resistance.
    pub translated: bool,
}

/// Commands the trainer accepted but has not answered yet.
const MAX_OUTSTANDING: usize = 4;

/// A forwarded command still waiting for its Response Code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
struct Outstanding {
    /// Op code as the trainer received it.
    sent: u8,
    translated: bool,
}

/// Response waiting for (or undergoing) indication to the app.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPointResponse {
    pub data: CommandBuf,
}

pub struct Translator {
    policy: SimulationTranslation,
    peripheral: Option<LinkId>,
    indications_enabled: bool,
    in_flight: Option<PendingWrite>,
    /// Oldest first; trainers answer in order.
    outstanding: Deque<Outstanding, MAX_OUTSTANDING>,
    queued: Option<ControlPointResponse>,
    indicating: Option<ControlPointResponse>,
    last_applied_grade: Option<i16>,
}

impl Translator {
    pub const fn new(policy: SimulationTranslation) -> Self {
        Self {
            policy,
            peripheral: None,
            indications_enabled: false,
            in_flight: None,
            outstanding: Deque::new(),
            queued: None,
            indicating: None,
            last_applied_grade: None,
        }
    }

    pub fn is_write_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_indicating(&self) -> bool {
        self.indicating.is_some()
    }

    pub fn queued(&self) -> Option<&ControlPointResponse> {
        self.queued.as_ref()
    }

    /// Grade most recently sent to the trainer (after limiting).
    pub fn last_applied_grade(&self) -> Option<i16> {
        self.last_applied_grade
    }

    fn translates(&self, trainer: Option<Trainer>) -> bool {
        match self.policy {
            SimulationTranslation::Always => true,
            SimulationTranslation::Never => false,
            SimulationTranslation::Auto => !trainer.is_some_and(|t| t.supports_simulation),
        }
    }

    // Command path

    /// Handle a write from the companion app.
    ///
    /// Only malformed writes are rejected; forwarding problems are logged
    /// and the write is still acknowledged to the app.
    #[allow(clippy::too_many_arguments)]
    pub fn on_write<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        limiter: &GradeLimiter,
        trainer: Option<Trainer>,
        speed: Option<u16>,
        link: LinkId,
        offset: u16,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(), AttError> {
        check_write(offset, data)?;

        let op = data[0];
        info!("cp: app -> {} ({:#x})", opcode_name(op), op);

        if self.peripheral.is_none() {
            debug!("cp: bound peripheral link {}", link.0);
            self.peripheral = Some(link);
        }

        let (command, translated) = self.encode(out, limiter, trainer, speed, data, now_ms);
        if let Err(e) = self.forward(host, trainer, command, translated) {
            warn!("cp: command {:#x} not forwarded: {:?}", op, e);
        }
        Ok(())
    }

    /// Build the command the trainer receives.
    fn encode<S: EventSink>(
        &mut self,
        out: &mut S,
        limiter: &GradeLimiter,
        trainer: Option<Trainer>,
        speed: Option<u16>,
        data: &[u8],
        now_ms: u64,
    ) -> (CommandBuf, bool) {
        let mut command = CommandBuf::new();
        let Some(sim) = parse_simulation(data) else {
            // data.len() <= CP_MAX_WRITE_LEN was checked by the caller
            let _ = command.extend_from_slice(data);
            return (command, false);
        };

        let grade = limiter.apply(speed.unwrap_or(0), sim.grade);
        if grade.limited {
            info!("cp: grade {} limited to {}", grade.requested, grade.applied);
        }
        self.last_applied_grade = Some(grade.applied);

        let translated = self.translates(trainer);
        let resistance = if translated {
            let level = grade_to_resistance(grade.applied);
            let _ = command.extend_from_slice(&[opcode::SET_TARGET_RESISTANCE, level]);
            debug!("cp: 0x11 grade {} -> 0x04 resistance {}", grade.applied, level);
            Some(level)
        } else {
            let _ = command.extend_from_slice(data);
            command[3..5].copy_from_slice(&grade.applied.to_le_bytes());
            None
        };

        events::simulation(
            out,
            now_ms,
            &SimulationEvent {
                wind_speed: sim.wind_speed,
                crr: sim.crr,
                cw: sim.cw,
                grade,
                resistance,
            },
        );
        (command, translated)
    }

    fn forward<H: BleHost>(
        &mut self,
        host: &mut H,
        trainer: Option<Trainer>,
        command: CommandBuf,
        translated: bool,
    ) -> Result<(), Error> {
        let trainer = trainer.ok_or(Error::NoTrainer)?;
        if self.in_flight.is_some() {
            return Err(Error::WriteBusy);
        }
        host.write(trainer.link, trainer.handle, &command)?;

        debug!("cp: forwarded {:?} to handle {}", command.as_slice(), trainer.handle);
        if self.outstanding.is_full() {
            let _ = self.outstanding.pop_front();
        }
        let _ = self.outstanding.push_back(Outstanding {
            sent: command[0],
            translated,
        });
        self.in_flight = Some(PendingWrite {
            link: trainer.link,
            data: command,
            translated,
        });
        Ok(())
    }

    /// The trainer answered (or failed) the forwarded write.
    pub fn on_write_complete(&mut self, result: Result<(), HostError>) {
        let Some(pending) = self.in_flight.take() else {
            debug!("cp: write completion without a pending write");
            return;
        };
        match result {
            Ok(()) => trace!("cp: trainer accepted {:#x}", pending.data[0]),
            Err(e) => warn!("cp: trainer write {:#x} failed: {:?}", pending.data[0], e),
        }
    }

    /// The trainer link went away; nothing will complete the pending write.
    pub fn on_trainer_lost(&mut self) {
        self.in_flight = None;
        self.outstanding.clear();
    }

    /// Retire the oldest command sent as `op`, and any unanswered ones
    /// before it. Returns whether that command was translated.
    fn answer(&mut self, op: u8) -> bool {
        if !self.outstanding.iter().any(|o| o.sent == op) {
            debug!("cp: response to {:#x} matches no outstanding command", op);
            return false;
        }
        while let Some(o) = self.outstanding.pop_front() {
            if o.sent == op {
                return o.translated;
            }
            debug!("cp: {:#x} never answered", o.sent);
        }
        false
    }

    // Response path

    /// Indication received on the trainer's Control Point.
    pub fn on_trainer_indication<H: BleHost, S: EventSink>(
        &mut self,
        host: &mut H,
        out: &mut S,
        data: &[u8],
        now_ms: u64,
    ) {
        debug!("cp: trainer response {:?}", data);
        if data.is_empty() {
            return;
        }

        let mut response = CommandBuf::new();
        let len = data.len().min(CP_MAX_WRITE_LEN);
        if len < data.len() {
            warn!("cp: response truncated from {} bytes", data.len());
        }
        let _ = response.extend_from_slice(&data[..len]);

        if response.len() >= 3 && response[0] == opcode::RESPONSE_CODE {
            let translated = self.answer(response[1]);
            if translated {
                response[1] = opcode::SET_INDOOR_BIKE_SIMULATION;
            }
            info!(
                "cp: response to {}: {}",
                opcode_name(response[1]),
                result_name(response[2])
            );
            events::control_point_response(out, now_ms, response[1], response[2], translated);
        }

        if self.queued.is_some() {
            debug!("cp: replacing unsent response");
        }
        self.queued = Some(ControlPointResponse { data: response });
        host.defer(Work::FlushControlPointResponse);
    }

    /// Deferred: indicate the queued response if the app can take it.
    pub fn flush<H: BleHost>(&mut self, host: &mut H) {
        if self.peripheral.is_none() || !self.indications_enabled || self.indicating.is_some() {
            return;
        }
        let Some(response) = self.queued.take() else {
            return;
        };
        match host.indicate(LocalCharacteristic::ControlPoint, &response.data) {
            Ok(()) => self.indicating = Some(response),
            Err(e) => {
                warn!("cp: indication failed: {:?}", e);
                // keep it for the next trigger unless a newer one arrived
                self.queued.get_or_insert(response);
            }
        }
    }

    /// App acknowledged the indication, or it failed.
    pub fn on_indication_released<H: BleHost>(&mut self, host: &mut H, acknowledged: bool) {
        if !acknowledged {
            warn!("cp: indication not acknowledged");
        }
        self.indicating = None;
        if self.queued.is_some() {
            host.defer(Work::FlushControlPointResponse);
        }
    }

    /// App wrote the Control Point CCC.
    pub fn on_ccc_write<H: BleHost>(&mut self, host: &mut H, link: LinkId, indications: bool) {
        info!("cp: indications {}", if indications { "enabled" } else { "disabled" });
        self.indications_enabled = indications;
        if self.peripheral.is_none() {
            self.peripheral = Some(link);
        }
        if indications && self.queued.is_some() {
            host.defer(Work::FlushControlPointResponse);
        }
    }

    /// Companion app disconnected.
    pub fn on_peripheral_disconnected(&mut self) {
        self.peripheral = None;
        self.indications_enabled = false;
        self.indicating = None;
        self.queued = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::host::mock::{Call, MockHost};
    use crate::config::GradeLimitMode;
    use crate::events::testing::Lines;

    const APP: LinkId = LinkId(100);
    const TRAINER: Trainer = Trainer {
        link: LinkId(3),
        handle: 0x2A,
        supports_simulation: false,
    };

    struct Fixture {
        host: MockHost,
        out: Lines,
        limiter: GradeLimiter,
        cp: Translator,
    }

    impl Fixture {
        fn new(policy: SimulationTranslation) -> Self {
            Self {
                host: MockHost::default(),
                out: Lines::default(),
                limiter: GradeLimiter::new(GradeLimitMode::Adaptive),
                cp: Translator::new(policy),
            }
        }

        fn write(&mut self, trainer: Option<Trainer>, speed: u16, data: &[u8]) -> Result<(), AttError> {
            self.cp.on_write(
                &mut self.host,
                &mut self.out,
                &self.limiter,
                trainer,
                Some(speed),
                APP,
                0,
                data,
                0,
            )
        }
    }

    fn sim(grade: i16) -> [u8; 7] {
        let g = grade.to_le_bytes();
        [0x11, 0x00, 0x00, g[0], g[1], 40, 51]
    }

    #[test]
    fn rejects_offset_and_bad_length() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        let r = f.cp.on_write(&mut f.host, &mut f.out, &f.limiter, Some(TRAINER), None, APP, 1, &[0x00], 0);
        assert_eq!(r, Err(AttError::InvalidOffset));
        assert_eq!(f.write(Some(TRAINER), 0, &[]), Err(AttError::InvalidAttributeValueLength));
        assert_eq!(f.write(Some(TRAINER), 0, &[0u8; 21]), Err(AttError::InvalidAttributeValueLength));
        assert!(f.host.calls.is_empty());
    }

    #[test]
    fn write_check_matches_att_codes() {
        assert_eq!(check_write(0, &[0x00]), Ok(()));
        assert_eq!(check_write(0, &[0u8; 20]), Ok(()));
        assert_eq!(check_write(2, &[0x00]).map_err(AttError::code), Err(0x07));
        assert_eq!(check_write(0, &[]).map_err(AttError::code), Err(0x0D));
        assert_eq!(check_write(0, &[0u8; 21]).map_err(AttError::code), Err(0x0D));
    }

    #[test]
    fn other_opcodes_forwarded_verbatim() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.write(Some(TRAINER), 0, &[0x05, 0xC8, 0x00]).unwrap();
        assert_eq!(f.host.take(), [Call::Write(LinkId(3), 0x2A, vec![0x05, 0xC8, 0x00])]);
        assert!(f.cp.is_write_busy());
    }

    #[test]
    fn limited_grade_translated_to_resistance() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.limiter.set_ceiling(12, 300);
        let speed = 1000 + 12 * 40 + 5;
        f.write(Some(TRAINER), speed, &[0x11, 0x00, 0x00, 0xF4, 0x01]).unwrap();
        assert_eq!(f.host.writes(), [&[0x04, 0x0F][..]]);
        let sims = f.out.of_type("sim");
        assert_eq!(sims.len(), 1);
        assert!(sims[0].contains("\"grade\":500,\"applied_grade\":300,\"limited\":true,\"resistance\":15"));
        assert_eq!(f.cp.last_applied_grade(), Some(300));
    }

    #[test]
    fn negative_grade_maps_to_zero_resistance() {
        assert_eq!(grade_to_resistance(-800), 0);
        assert_eq!(grade_to_resistance(300), 15);
        assert_eq!(grade_to_resistance(2000), 100);
        assert_eq!(grade_to_resistance(i16::MAX), 100);
    }

    #[test]
    fn simulation_capable_trainer_gets_patched_grade() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.limiter.set_ceiling(0, 300);
        let trainer = Trainer {
            supports_simulation: true,
            ..TRAINER
        };
        f.write(Some(trainer), 1000, &sim(500)).unwrap();
        let [lo, hi] = 300i16.to_le_bytes();
        assert_eq!(f.host.writes(), [&[0x11, 0x00, 0x00, lo, hi, 40, 51][..]]);
    }

    #[test]
    fn policy_overrides_feature_detection() {
        let capable = Trainer {
            supports_simulation: true,
            ..TRAINER
        };
        let mut always = Fixture::new(SimulationTranslation::Always);
        always.write(Some(capable), 0, &sim(100)).unwrap();
        assert_eq!(always.host.writes(), [&[0x04, 0x05][..]]);

        let mut never = Fixture::new(SimulationTranslation::Never);
        never.write(Some(TRAINER), 0, &sim(100)).unwrap();
        assert_eq!(never.host.writes()[0][0], 0x11);
    }

    #[test]
    fn write_while_busy_is_dropped() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.write(Some(TRAINER), 0, &[0x00]).unwrap();
        f.write(Some(TRAINER), 0, &[0x07]).unwrap();
        assert_eq!(f.host.writes().len(), 1);

        f.cp.on_write_complete(Ok(()));
        f.write(Some(TRAINER), 0, &[0x07]).unwrap();
        assert_eq!(f.host.writes().len(), 2);
    }

    #[test]
    fn no_trainer_is_logged_not_rejected() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        assert_eq!(f.write(None, 0, &[0x00]), Ok(()));
        assert!(f.host.writes().is_empty());
        assert!(!f.cp.is_write_busy());
    }

    #[test]
    fn failed_host_write_leaves_translator_idle() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.host.fail_write = Some(HostError::Busy);
        f.write(Some(TRAINER), 0, &[0x00]).unwrap();
        assert!(!f.cp.is_write_busy());
    }

    #[test]
    fn translated_response_restores_simulation_opcode() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.cp.on_ccc_write(&mut f.host, APP, true);
        f.write(Some(TRAINER), 0, &sim(300)).unwrap();
        f.cp.on_write_complete(Ok(()));
        f.host.take();

        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x04, 0x01], 0);
        assert_eq!(f.host.take(), [Call::Defer(Work::FlushControlPointResponse)]);
        f.cp.flush(&mut f.host);
        assert_eq!(
            f.host.take(),
            [Call::Indicate(LocalCharacteristic::ControlPoint, vec![0x80, 0x11, 0x01])]
        );
        assert!(f.out.of_type("cp_response")[0].contains("\"request\":17,\"result\":1,\"translated\":true"));
    }

    #[test]
    fn untranslated_resistance_response_kept() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.cp.on_ccc_write(&mut f.host, APP, true);
        f.write(Some(TRAINER), 0, &[0x04, 0x20]).unwrap();
        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x04, 0x01], 0);
        f.cp.flush(&mut f.host);
        assert!(f
            .host
            .calls
            .contains(&Call::Indicate(LocalCharacteristic::ControlPoint, vec![0x80, 0x04, 0x01])));
    }

    #[test]
    fn translated_response_survives_a_later_pass_through_write() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.cp.on_ccc_write(&mut f.host, APP, true);
        f.write(Some(TRAINER), 0, &sim(300)).unwrap();
        f.cp.on_write_complete(Ok(()));
        f.write(Some(TRAINER), 0, &[0x07]).unwrap();
        f.cp.on_write_complete(Ok(()));
        f.host.take();

        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x04, 0x01], 0);
        f.cp.flush(&mut f.host);
        f.cp.on_indication_released(&mut f.host, true);
        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x07, 0x01], 0);
        f.cp.flush(&mut f.host);
        assert_eq!(
            f.host.indicated(),
            [&[0x80, 0x11, 0x01][..], &[0x80, 0x07, 0x01][..]]
        );
    }

    #[test]
    fn genuine_resistance_response_not_rewritten_after_a_translated_write() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.cp.on_ccc_write(&mut f.host, APP, true);
        f.write(Some(TRAINER), 0, &[0x04, 0x20]).unwrap();
        f.cp.on_write_complete(Ok(()));
        f.write(Some(TRAINER), 0, &sim(300)).unwrap();
        f.cp.on_write_complete(Ok(()));
        f.host.take();

        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x04, 0x01], 0);
        f.cp.flush(&mut f.host);
        f.cp.on_indication_released(&mut f.host, true);
        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x04, 0x01], 0);
        f.cp.flush(&mut f.host);
        assert_eq!(
            f.host.indicated(),
            [&[0x80, 0x04, 0x01][..], &[0x80, 0x11, 0x01][..]]
        );
        let responses = f.out.of_type("cp_response");
        assert!(responses[0].contains("\"translated\":false"));
        assert!(responses[1].contains("\"translated\":true"));
    }

    #[test]
    fn unanswered_command_is_skipped_when_a_later_one_answers() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.cp.on_ccc_write(&mut f.host, APP, true);
        f.write(Some(TRAINER), 0, &sim(300)).unwrap();
        f.cp.on_write_complete(Ok(()));
        f.write(Some(TRAINER), 0, &[0x00]).unwrap();
        f.cp.on_write_complete(Ok(()));
        f.host.take();

        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x00, 0x01], 0);
        f.cp.flush(&mut f.host);
        f.cp.on_indication_released(&mut f.host, true);
        // late answer to the already retired resistance command
        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x04, 0x01], 0);
        f.cp.flush(&mut f.host);
        assert_eq!(
            f.host.indicated(),
            [&[0x80, 0x00, 0x01][..], &[0x80, 0x04, 0x01][..]]
        );
    }

    #[test]
    fn response_waits_for_indications_enabled() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.write(Some(TRAINER), 0, &[0x00]).unwrap();
        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x00, 0x01], 0);
        f.host.take();
        f.cp.flush(&mut f.host);
        assert!(f.host.calls.is_empty());
        assert!(f.cp.queued().is_some());

        f.cp.on_ccc_write(&mut f.host, APP, true);
        assert_eq!(f.host.take(), [Call::Defer(Work::FlushControlPointResponse)]);
        f.cp.flush(&mut f.host);
        assert!(f.cp.is_indicating());
        assert!(f.cp.queued().is_none());
    }

    #[test]
    fn single_slot_queue_newest_wins_while_indicating() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.cp.on_ccc_write(&mut f.host, APP, true);
        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x00, 0x01], 0);
        f.cp.flush(&mut f.host);
        assert!(f.cp.is_indicating());

        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x07, 0x01], 0);
        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x08, 0x01], 0);
        f.host.take();
        f.cp.flush(&mut f.host);
        assert!(f.host.calls.is_empty());

        f.cp.on_indication_released(&mut f.host, true);
        assert_eq!(f.host.take(), [Call::Defer(Work::FlushControlPointResponse)]);
        f.cp.flush(&mut f.host);
        assert_eq!(
            f.host.take(),
            [Call::Indicate(LocalCharacteristic::ControlPoint, vec![0x80, 0x08, 0x01])]
        );
    }

    #[test]
    fn failed_indication_clears_busy() {
        let mut f = Fixture::new(SimulationTranslation::Auto);
        f.cp.on_ccc_write(&mut f.host, APP, true);
        f.cp.on_trainer_indication(&mut f.host, &mut f.out, &[0x80, 0x00, 0x01], 0);
        f.cp.flush(&mut f.host);
        f.cp.on_indication_released(&mut f.host, false);
        assert!(!f.cp.is_indicating());
    }

    #[test]
    fn short_simulation_forwarded_as_is() {
        let mut f = Fixture::new(SimulationTranslation::Always);
        f.write(Some(TRAINER), 0, &[0x11, 0x00, 0x00]).unwrap();
        assert_eq!(f.host.writes(), [&[0x11, 0x00, 0x00][..]]);
        assert!(f.out.of_type("sim").is_empty());
    }

    #[test]
    fn names() {
        assert_eq!(opcode_name(0x11), "Set Indoor Bike Simulation");
        assert_eq!(opcode_name(0x42), "Unknown");
        assert_eq!(result_name(0x03), "Invalid Parameter");
    }
}
