use crate::frame::{encode_packet, DshotCommand, DSHOT_THROTTLE_MAX};
use crate::speed::DshotConfig;
use crate::telemetry::{decode_edt, TelemetryFrame};
use log::{debug, error, warn};
use thumbsup_core::clock::{RobotClock, TuDuration};
use thumbsup_core::hw::{
    wait_until, DshotHal, ExecutorId, ProgramKind, ProgramOffset, TransferId,
};
use thumbsup_core::{ErrorKind, MotorChannel, TuError, TuResult};

/// Ceiling for any wait on the transfer engine.
pub const TRANSFER_TIMEOUT: TuDuration = TuDuration::from_millis(50);
/// Special commands only take effect when repeated.
pub const COMMAND_REPEAT: usize = 10;
pub const COMMAND_GAP_US: u32 = 1_000;
const TRANSFER_POLL_US: u32 = 5;

/// Per channel transmit state, one arena slot per motor channel.
#[derive(Debug, Clone, Copy)]
struct ChannelSlot {
    config: DshotConfig,
    program: ProgramKind,
    executor: ExecutorId,
    transfer: TransferId,
    last_packet: u16,
    last_telemetry: TelemetryFrame,
}

/// A transmit program loaded once and shared by every channel using it.
#[derive(Debug, Clone, Copy)]
struct SharedProgram {
    offset: ProgramOffset,
    refcount: u8,
}

const fn program_index(kind: ProgramKind) -> usize {
    match kind {
        ProgramKind::Standard => 0,
        ProgramKind::Bidirectional => 1,
    }
}

pub struct DshotEngine<H: DshotHal> {
    hal: H,
    clock: RobotClock,
    slots: [Option<ChannelSlot>; MotorChannel::COUNT],
    programs: [Option<SharedProgram>; 2],
}

impl<H: DshotHal> DshotEngine<H> {
    pub fn new(hal: H, clock: RobotClock) -> Self {
        DshotEngine {
            hal,
            clock,
            slots: [None; MotorChannel::COUNT],
            programs: [None; 2],
        }
    }

    /// Loads the program on first use, otherwise bumps its count.
    fn acquire_program(&mut self, kind: ProgramKind) -> TuResult<ProgramOffset> {
        let index = program_index(kind);
        if let Some(program) = self.programs[index].as_mut() {
            program.refcount = program.refcount.checked_add(1).ok_or_else(|| {
                TuError::new(ErrorKind::ResourceExhausted, "program refcount overflow")
            })?;
            return Ok(program.offset);
        }
        let offset = self.hal.install_program(kind)?;
        self.programs[index] = Some(SharedProgram {
            offset,
            refcount: 1,
        });
        debug!("dshot: {:?} program loaded at {}", kind, offset.0);
        Ok(offset)
    }

    /// Drops one reference; the program is unloaded at zero.
    fn release_program(&mut self, kind: ProgramKind) {
        let entry = &mut self.programs[program_index(kind)];
        let Some(program) = entry.as_mut() else {
            error!("dshot: release of a {:?} program that is not loaded", kind);
            return;
        };
        program.refcount = program.refcount.saturating_sub(1);
        if program.refcount == 0 {
            let offset = program.offset;
            *entry = None;
            self.hal.remove_program(kind, offset);
            debug!("dshot: {:?} program unloaded", kind);
        }
    }

    pub fn program_refcount(&self, kind: ProgramKind) -> u8 {
        self.programs[program_index(kind)].map_or(0, |p| p.refcount)
    }

    pub fn is_initialized(&self, channel: MotorChannel) -> bool {
        self.slots[channel.index()].is_some()
    }

    pub fn config(&self, channel: MotorChannel) -> Option<DshotConfig> {
        self.slots[channel.index()].map(|s| s.config)
    }

    /// Claims a program reference, an executor and a transfer for `channel`.
    /// Any failure gives back what was already claimed.
    pub fn init(&mut self, channel: MotorChannel, config: DshotConfig) -> TuResult<()> {
        if self.is_initialized(channel) {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                format!("DShot already running on {channel}"),
            ));
        }
        let kind = if config.bidirectional {
            ProgramKind::Bidirectional
        } else {
            ProgramKind::Standard
        };
        let offset = self
            .acquire_program(kind)
            .map_err(|e| e.add_context("loading DShot program"))?;
        let Some(executor) = self.hal.claim_executor() else {
            self.release_program(kind);
            return Err(TuError::new(
                ErrorKind::ResourceExhausted,
                "no free DShot executor",
            ));
        };
        let Some(transfer) = self.hal.claim_transfer() else {
            self.hal.release_executor(executor);
            self.release_program(kind);
            return Err(TuError::new(
                ErrorKind::ResourceExhausted,
                "no free DShot transfer",
            ));
        };
        let divider = config.speed.clock_divider(self.hal.system_clock_hz());
        self.hal.start_executor(executor, offset, channel, divider);
        self.slots[channel.index()] = Some(ChannelSlot {
            config,
            program: kind,
            executor,
            transfer,
            last_packet: 0,
            last_telemetry: TelemetryFrame::default(),
        });
        debug!(
            "dshot: {} up at {} kbit/s, bidirectional={}, divider={:.3}",
            channel,
            config.speed.kbits_per_second(),
            config.bidirectional,
            divider
        );
        Ok(())
    }

    /// Stops the channel and returns every resource it held.
    pub fn deinit(&mut self, channel: MotorChannel) {
        let Some(slot) = self.slots[channel.index()].take() else {
            return;
        };
        if self.hal.transfer_busy(slot.transfer) {
            self.hal.abort_transfer(slot.transfer);
        }
        self.hal.stop_executor(slot.executor);
        self.hal.release_transfer(slot.transfer);
        self.hal.release_executor(slot.executor);
        self.release_program(slot.program);
        debug!("dshot: {} released", channel);
    }

    fn slot(&self, channel: MotorChannel) -> TuResult<&ChannelSlot> {
        self.slots[channel.index()].as_ref().ok_or_else(|| {
            TuError::new(
                ErrorKind::NotInitialized,
                format!("DShot not initialized on {channel}"),
            )
        })
    }

    /// Bounded wait for the transfer engine; aborts the transfer on timeout.
    fn wait_transfer_idle(&mut self, transfer: TransferId) -> TuResult<()> {
        let result = wait_until(
            &self.clock,
            &mut self.hal,
            TRANSFER_TIMEOUT,
            TRANSFER_POLL_US,
            |hal| !hal.transfer_busy(transfer),
        );
        if let Err(e) = result {
            self.hal.abort_transfer(transfer);
            return Err(e.add_context("DShot transfer stuck, aborted"));
        }
        Ok(())
    }

    /// Sends one frame. Throttle values above 2047 are clamped.
    pub fn send_throttle(
        &mut self,
        channel: MotorChannel,
        throttle: u16,
        request_telemetry: bool,
    ) -> TuResult<()> {
        let slot = *self.slot(channel)?;
        let packet = encode_packet(throttle.min(DSHOT_THROTTLE_MAX), request_telemetry);
        if self.hal.transfer_busy(slot.transfer) {
            warn!("dshot: previous frame on {} still in flight", channel);
            self.wait_transfer_idle(slot.transfer)?;
        }
        self.hal.start_transfer(slot.transfer, slot.executor, packet as u32);
        if let Some(s) = self.slots[channel.index()].as_mut() {
            s.last_packet = packet;
        }
        self.wait_transfer_idle(slot.transfer).inspect_err(|e| {
            error!("dshot: frame on {} failed: {}", channel, e);
        })
    }

    /// Sends a special command the required number of times, 1 ms apart.
    /// Any failed repeat fails the whole command.
    pub fn send_command(&mut self, channel: MotorChannel, command: DshotCommand) -> TuResult<()> {
        for _ in 0..COMMAND_REPEAT {
            self.send_throttle(channel, command.value(), false)
                .map_err(|e| e.add_context("sending DShot command"))?;
            self.hal.delay_us(COMMAND_GAP_US);
        }
        debug!("dshot: {:?} sent to {}", command, channel);
        Ok(())
    }

    /// Pulls one EDT response if there is one. Only meaningful in bidirectional mode.
    pub fn read_telemetry(&mut self, channel: MotorChannel) -> TuResult<Option<TelemetryFrame>> {
        let slot = *self.slot(channel)?;
        if !slot.config.bidirectional {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                format!("{channel} is not in bidirectional DShot"),
            ));
        }
        let Some(raw) = self.hal.read_response(slot.executor) else {
            return Ok(None);
        };
        let Some((value, crc)) = decode_edt(raw) else {
            warn!("dshot: corrupt EDT frame 0x{:06X} on {}", raw, channel);
            return Err(TuError::new(
                ErrorKind::CommFailure,
                "EDT frame failed GCR or CRC check",
            ));
        };
        let now = self.clock.now();
        let frame = match self.slots[channel.index()].as_mut() {
            Some(s) => {
                s.last_telemetry.merge(value, crc, now);
                s.last_telemetry
            }
            None => return Ok(None),
        };
        Ok(Some(frame))
    }

    /// Last telemetry, only when it is recent enough to act on.
    pub fn get_telemetry(&self, channel: MotorChannel) -> TuResult<TelemetryFrame> {
        let slot = self.slot(channel)?;
        let frame = slot.last_telemetry;
        if !frame.valid {
            return Err(TuError::new(
                ErrorKind::CommFailure,
                format!("no telemetry received on {channel}"),
            ));
        }
        let now = self.clock.now();
        if !frame.is_fresh(now) {
            return Err(TuError::new(
                ErrorKind::Timeout,
                format!(
                    "telemetry on {} is {} old",
                    channel,
                    now.saturating_sub(frame.timestamp)
                ),
            ));
        }
        Ok(frame)
    }

    pub fn last_packet(&self, channel: MotorChannel) -> Option<u16> {
        self.slots[channel.index()].map(|s| s.last_packet)
    }
}

/// Mechanical RPM from electrical RPM. Zero pole pairs yields 0.
pub fn erpm_to_rpm(erpm: u16, pole_pairs: u8) -> u16 {
    if pole_pairs == 0 {
        warn!("dshot: erpm_to_rpm called with zero pole pairs");
        return 0;
    }
    erpm / pole_pairs as u16
}

impl<H: DshotHal> Drop for DshotEngine<H> {
    fn drop(&mut self) {
        for channel in MotorChannel::ALL {
            self.deinit(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_packet;
    use crate::speed::DshotSpeed;
    use crate::telemetry::edt_raw_from_value;
    use tu_sim::SimBoard;

    fn engine() -> (DshotEngine<SimBoard>, SimBoard) {
        let board = SimBoard::new();
        (DshotEngine::new(board.clone(), board.clock()), board)
    }

    fn bidir() -> DshotConfig {
        DshotConfig {
            bidirectional: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_program_shared_and_refcounted() {
        let (mut engine, board) = engine();
        engine.init(MotorChannel::Weapon, DshotConfig::default()).unwrap();
        engine.init(MotorChannel::LeftDrive, DshotConfig::default()).unwrap();
        assert_eq!(engine.program_refcount(ProgramKind::Standard), 2);
        assert_eq!(board.installed_program_count(), 1);
        engine.deinit(MotorChannel::Weapon);
        assert_eq!(board.installed_program_count(), 1);
        engine.deinit(MotorChannel::LeftDrive);
        assert_eq!(board.installed_program_count(), 0);
        assert_eq!(engine.program_refcount(ProgramKind::Standard), 0);
        assert_eq!(board.claimed_executors(), 0);
        assert_eq!(board.claimed_transfers(), 0);
    }

    #[test]
    fn test_init_rolls_back_when_executors_run_out() {
        let (mut engine, board) = engine();
        board.with_state(|s| s.executor_capacity = 0);
        let err = engine.init(MotorChannel::Weapon, DshotConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(board.installed_program_count(), 0);
        assert!(!engine.is_initialized(MotorChannel::Weapon));
    }

    #[test]
    fn test_init_rolls_back_when_transfers_run_out() {
        let (mut engine, board) = engine();
        board.with_state(|s| s.transfer_capacity = 0);
        assert!(engine.init(MotorChannel::Weapon, bidir()).is_err());
        assert_eq!(board.claimed_executors(), 0);
        assert_eq!(board.installed_program_count(), 0);
        assert_eq!(engine.program_refcount(ProgramKind::Bidirectional), 0);
    }

    #[test]
    fn test_init_twice_rejected() {
        let (mut engine, _board) = engine();
        engine.init(MotorChannel::Weapon, DshotConfig::default()).unwrap();
        let err = engine.init(MotorChannel::Weapon, bidir()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_send_throttle_emits_valid_frame() {
        let (mut engine, board) = engine();
        engine.init(MotorChannel::Weapon, DshotConfig::default()).unwrap();
        engine.send_throttle(MotorChannel::Weapon, 1047, true).unwrap();
        let frames = board.dshot_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, MotorChannel::Weapon);
        assert_eq!(decode_packet(frames[0].word as u16), Some((1047, true)));
        engine.send_throttle(MotorChannel::Weapon, 5000, false).unwrap();
        assert_eq!(
            decode_packet(engine.last_packet(MotorChannel::Weapon).unwrap()),
            Some((2047, false))
        );
    }

    #[test]
    fn test_uninitialized_channel_rejected() {
        let (mut engine, _board) = engine();
        let err = engine.send_throttle(MotorChannel::Weapon, 0, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[test]
    fn test_wedged_transfer_times_out_and_aborts() {
        let (mut engine, board) = engine();
        engine.init(MotorChannel::Weapon, DshotConfig::default()).unwrap();
        board.set_wedged(true);
        let start = board.clock().now();
        let err = engine.send_throttle(MotorChannel::Weapon, 100, false).unwrap_err();
        assert!(err.is_timeout());
        assert!(board.clock().now() - start >= TRANSFER_TIMEOUT);
        assert_eq!(board.with_state(|s| s.transfer_aborts), 1);
        engine.send_throttle(MotorChannel::Weapon, 100, false).unwrap();
    }

    #[test]
    fn test_command_repeated_with_gaps() {
        let (mut engine, board) = engine();
        engine.init(MotorChannel::Weapon, DshotConfig::default()).unwrap();
        engine.send_command(MotorChannel::Weapon, DshotCommand::Beep3).unwrap();
        let frames = board.dshot_frames();
        assert_eq!(frames.len(), COMMAND_REPEAT);
        for pair in frames.windows(2) {
            assert!(pair[1].at - pair[0].at >= TuDuration::from_millis(1));
        }
        assert!(frames
            .iter()
            .all(|f| decode_packet(f.word as u16) == Some((3, false))));
    }

    #[test]
    fn test_command_fails_if_any_repeat_fails() {
        let (mut engine, board) = engine();
        engine.init(MotorChannel::Weapon, DshotConfig::default()).unwrap();
        board.set_wedged(true);
        assert!(engine.send_command(MotorChannel::Weapon, DshotCommand::Beep1).is_err());
    }

    #[test]
    fn test_telemetry_requires_bidirectional() {
        let (mut engine, _board) = engine();
        engine.init(MotorChannel::Weapon, DshotConfig::default()).unwrap();
        let err = engine.read_telemetry(MotorChannel::Weapon).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn test_telemetry_merge_and_freshness() {
        let (mut engine, board) = engine();
        engine.init(MotorChannel::Weapon, bidir()).unwrap();
        assert!(engine.get_telemetry(MotorChannel::Weapon).is_err());
        assert_eq!(engine.read_telemetry(MotorChannel::Weapon).unwrap(), None);

        board.push_telemetry(MotorChannel::Weapon, edt_raw_from_value(1400));
        board.push_telemetry(MotorChannel::Weapon, edt_raw_from_value(2048 + 300));
        engine.read_telemetry(MotorChannel::Weapon).unwrap();
        let frame = engine.read_telemetry(MotorChannel::Weapon).unwrap().unwrap();
        assert_eq!(frame.erpm, 1400);
        assert_eq!(frame.voltage_cv, 1200);
        assert!(frame.valid);
        assert!(engine.get_telemetry(MotorChannel::Weapon).is_ok());

        board.mock().advance_millis(101);
        let err = engine.get_telemetry(MotorChannel::Weapon).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_corrupt_telemetry_rejected() {
        let (mut engine, board) = engine();
        engine.init(MotorChannel::Weapon, bidir()).unwrap();
        board.push_telemetry(MotorChannel::Weapon, 0);
        let err = engine.read_telemetry(MotorChannel::Weapon).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommFailure);
        assert!(engine.get_telemetry(MotorChannel::Weapon).is_err());
    }

    #[test]
    fn test_divider_follows_speed() {
        let (mut engine, board) = engine();
        let config = DshotConfig {
            speed: DshotSpeed::Dshot600,
            ..Default::default()
        };
        engine.init(MotorChannel::Weapon, config).unwrap();
        let div = board.with_state(|s| s.executor_divider[0]);
        assert!((div - DshotSpeed::Dshot600.clock_divider(125_000_000)).abs() < f32::EPSILON);
    }

    #[test]
    fn test_erpm_to_rpm() {
        assert_eq!(erpm_to_rpm(1400, 7), 200);
        assert_eq!(erpm_to_rpm(1400, 0), 0);
    }

    #[test]
    fn test_drop_releases_everything() {
        let board = SimBoard::new();
        {
            let mut engine = DshotEngine::new(board.clone(), board.clock());
            engine.init(MotorChannel::Weapon, bidir()).unwrap();
        }
        assert_eq!(board.installed_program_count(), 0);
        assert_eq!(board.claimed_executors(), 0);
    }
}
