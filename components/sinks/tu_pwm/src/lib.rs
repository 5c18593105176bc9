use bincode::de::Decoder;
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thumbsup_core::config::{getcfg, ComponentConfig};
use thumbsup_core::freeze::Freezable;
use thumbsup_core::hw::PwmHal;
use thumbsup_core::{ErrorKind, MotorChannel, TuError, TuResult};

pub const PWM_MIN_PULSE_US: u16 = 1000;
pub const PWM_NEUTRAL_PULSE_US: u16 = 1500;
pub const PWM_MAX_PULSE_US: u16 = 2000;
pub const PWM_FREQUENCY_HZ: u32 = 50;
/// Pulse change per control tick while ramping.
pub const PWM_RAMP_STEP_US: u16 = 10;

/// Clamps anything (including garbage) into the legal pulse window.
#[inline]
pub fn clamp_pulse(pulse_us: i64) -> u16 {
    pulse_us.clamp(PWM_MIN_PULSE_US as i64, PWM_MAX_PULSE_US as i64) as u16
}

/// Bidirectional ESC mapping: -100 full reverse, 0 neutral, 100 full forward.
pub fn speed_to_pulse(speed_percent: i32) -> u16 {
    let speed = speed_percent.clamp(-100, 100) as i64;
    let span = (PWM_MAX_PULSE_US - PWM_NEUTRAL_PULSE_US) as i64;
    clamp_pulse(PWM_NEUTRAL_PULSE_US as i64 + speed * span / 100)
}

/// Unidirectional mapping for the weapon ESC: 0 is the minimum pulse.
pub fn weapon_speed_to_pulse(speed_percent: i32) -> u16 {
    let speed = speed_percent.clamp(0, 100) as i64;
    if speed == 0 {
        return PWM_MIN_PULSE_US;
    }
    let span = (PWM_MAX_PULSE_US - PWM_MIN_PULSE_US) as i64;
    clamp_pulse(PWM_MIN_PULSE_US as i64 + speed * span / 100)
}

/// The pulse a channel must rest at when nothing commands it.
pub const fn safe_pulse(channel: MotorChannel) -> u16 {
    match channel {
        MotorChannel::Weapon => PWM_MIN_PULSE_US,
        _ => PWM_NEUTRAL_PULSE_US,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct PulseCommand {
    pub channel: MotorChannel,
    pub current_pulse_us: u16,
    pub target_pulse_us: u16,
}

impl PulseCommand {
    pub fn at_rest(channel: MotorChannel) -> Self {
        PulseCommand {
            channel,
            current_pulse_us: safe_pulse(channel),
            target_pulse_us: safe_pulse(channel),
        }
    }

    /// Moves the current pulse at most `step` toward the target.
    pub fn step_toward_target(&mut self, step: u16) {
        let step = step.max(1);
        if self.current_pulse_us < self.target_pulse_us {
            self.current_pulse_us = self
                .current_pulse_us
                .saturating_add(step)
                .min(self.target_pulse_us);
        } else if self.current_pulse_us > self.target_pulse_us {
            self.current_pulse_us = self
                .current_pulse_us
                .saturating_sub(step)
                .max(self.target_pulse_us);
        }
    }

    pub fn settle(&mut self) {
        self.current_pulse_us = self.target_pulse_us;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmOutputConfig {
    pub frequency_hz: u32,
    pub ramp_step_us: u16,
    /// The right drive motor is mounted mirrored.
    pub reverse_right: bool,
}

impl Default for PwmOutputConfig {
    fn default() -> Self {
        PwmOutputConfig {
            frequency_hz: PWM_FREQUENCY_HZ,
            ramp_step_us: PWM_RAMP_STEP_US,
            reverse_right: true,
        }
    }
}

impl PwmOutputConfig {
    pub fn from_config(config: Option<&ComponentConfig>) -> TuResult<Self> {
        let defaults = PwmOutputConfig::default();
        let frequency_hz: u32 = getcfg(config, "frequency_hz", defaults.frequency_hz)?;
        let ramp_step_us: u16 = getcfg(config, "ramp_step_us", defaults.ramp_step_us)?;
        let reverse_right: bool = getcfg(config, "reverse_right", defaults.reverse_right)?;
        if !(20..=500).contains(&frequency_hz) {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("PWM frequency {frequency_hz} Hz is outside 20..=500"),
            ));
        }
        if ramp_step_us == 0 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                "ramp_step_us must be at least 1",
            ));
        }
        Ok(PwmOutputConfig {
            frequency_hz,
            ramp_step_us,
            reverse_right,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelSlot {
    command: PulseCommand,
    /// False while another transport owns the pin.
    claimed: bool,
}

/// PWM output stage for a subset of the motor channels.
/// Targets are clamped, current pulses ramp toward them on `update`.
pub struct PwmOutput<H: PwmHal> {
    hal: H,
    config: PwmOutputConfig,
    slots: [Option<ChannelSlot>; MotorChannel::COUNT],
    weapon_enabled: bool,
}

impl<H: PwmHal> PwmOutput<H> {
    /// Takes the channels, parks every one at its safe pulse and enables them.
    pub fn new(mut hal: H, channels: &[MotorChannel], config: PwmOutputConfig) -> TuResult<Self> {
        let mut slots = [None; MotorChannel::COUNT];
        for &channel in channels {
            hal.configure(channel, config.frequency_hz)
                .map_err(|e| e.add_context("configuring PWM output"))?;
            let command = PulseCommand::at_rest(channel);
            hal.write_pulse_us(channel, command.current_pulse_us);
            hal.set_enabled(channel, true);
            slots[channel.index()] = Some(ChannelSlot {
                command,
                claimed: true,
            });
            debug!("pwm: {} ready at {} us", channel, command.current_pulse_us);
        }
        Ok(PwmOutput {
            hal,
            config,
            slots,
            weapon_enabled: false,
        })
    }

    fn slot_mut(&mut self, channel: MotorChannel) -> TuResult<&mut ChannelSlot> {
        self.slots[channel.index()].as_mut().ok_or_else(|| {
            TuError::new(
                ErrorKind::InvalidParam,
                format!("{channel} is not driven by this PWM output"),
            )
        })
    }

    /// Extra interlock on the weapon channel: while disabled only the
    /// minimum pulse can be targeted.
    pub fn set_weapon_enabled(&mut self, enabled: bool) {
        self.weapon_enabled = enabled;
        if !enabled {
            if let Some(slot) = self.slots[MotorChannel::Weapon.index()].as_mut() {
                slot.command.target_pulse_us = PWM_MIN_PULSE_US;
            }
        }
    }

    pub fn weapon_enabled(&self) -> bool {
        self.weapon_enabled
    }

    /// Sets a raw pulse target; out of range values are clamped.
    pub fn set_pulse(&mut self, channel: MotorChannel, pulse_us: i32) -> TuResult<()> {
        let weapon_enabled = self.weapon_enabled;
        let slot = self.slot_mut(channel)?;
        let mut pulse = clamp_pulse(pulse_us as i64);
        if channel == MotorChannel::Weapon && !weapon_enabled && pulse != PWM_MIN_PULSE_US {
            warn!("pwm: weapon pulse {} refused while weapon is locked out", pulse);
            pulse = PWM_MIN_PULSE_US;
        }
        slot.command.target_pulse_us = pulse;
        Ok(())
    }

    /// Sets a speed target in percent, using the mapping of the channel.
    pub fn set_speed(&mut self, channel: MotorChannel, speed_percent: i32) -> TuResult<()> {
        let pulse = match channel {
            MotorChannel::Weapon => weapon_speed_to_pulse(speed_percent),
            MotorChannel::RightDrive if self.config.reverse_right => {
                speed_to_pulse(speed_percent.clamp(-100, 100).saturating_neg())
            }
            _ => speed_to_pulse(speed_percent),
        };
        self.set_pulse(channel, pulse as i32)
    }

    /// One control tick: ramp every claimed channel and write it out.
    pub fn update(&mut self) {
        let step = self.config.ramp_step_us;
        for slot in self.slots.iter_mut().flatten() {
            if !slot.claimed {
                continue;
            }
            slot.command.step_toward_target(step);
            self.hal
                .write_pulse_us(slot.command.channel, slot.command.current_pulse_us);
        }
    }

    /// Jumps a channel straight to its safe pulse, skipping the ramp.
    pub fn force_safe(&mut self, channel: MotorChannel) -> TuResult<()> {
        let slot = self.slot_mut(channel)?;
        slot.command = PulseCommand::at_rest(channel);
        let claimed = slot.claimed;
        if claimed {
            self.hal.write_pulse_us(channel, safe_pulse(channel));
        }
        Ok(())
    }

    /// Every channel to its safe pulse immediately.
    pub fn stop_all(&mut self) {
        for channel in MotorChannel::ALL {
            if self.slots[channel.index()].is_some() {
                let _ = self.force_safe(channel);
            }
        }
    }

    /// Safe pulses everywhere, then the outputs are switched off so the ESCs
    /// see signal loss. `resume` brings them back.
    pub fn emergency_stop(&mut self) {
        self.stop_all();
        self.weapon_enabled = false;
        for slot in self.slots.iter().flatten() {
            self.hal.set_enabled(slot.command.channel, false);
        }
        warn!("pwm: emergency stop, outputs disabled");
    }

    pub fn resume(&mut self) {
        for slot in self.slots.iter().flatten() {
            if slot.claimed {
                self.hal.set_enabled(slot.command.channel, true);
            }
        }
    }

    /// Hands the pin over to another transport. The output is disabled
    /// after a last safe pulse.
    pub fn release(&mut self, channel: MotorChannel) -> TuResult<()> {
        self.force_safe(channel)?;
        let slot = self.slot_mut(channel)?;
        slot.claimed = false;
        self.hal.set_enabled(channel, false);
        debug!("pwm: released {}", channel);
        Ok(())
    }

    /// Takes the pin back at its safe pulse.
    pub fn claim(&mut self, channel: MotorChannel) -> TuResult<()> {
        let frequency = self.config.frequency_hz;
        self.hal.configure(channel, frequency)?;
        let slot = self.slot_mut(channel)?;
        slot.command = PulseCommand::at_rest(channel);
        slot.claimed = true;
        self.hal.write_pulse_us(channel, safe_pulse(channel));
        self.hal.set_enabled(channel, true);
        debug!("pwm: claimed {}", channel);
        Ok(())
    }

    pub fn is_claimed(&self, channel: MotorChannel) -> bool {
        self.slots[channel.index()].is_some_and(|s| s.claimed)
    }

    pub fn pulse(&self, channel: MotorChannel) -> Option<PulseCommand> {
        self.slots[channel.index()].map(|s| s.command)
    }

    pub fn current_pulse_us(&self, channel: MotorChannel) -> Option<u16> {
        self.pulse(channel).map(|p| p.current_pulse_us)
    }
}

impl<H: PwmHal> Freezable for PwmOutput<H> {
    fn freeze<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        let commands: [Option<PulseCommand>; MotorChannel::COUNT] =
            self.slots.map(|s| s.map(|s| s.command));
        Encode::encode(&commands, encoder)?;
        Encode::encode(&self.weapon_enabled, encoder)
    }

    fn thaw<D: Decoder>(&mut self, decoder: &mut D) -> Result<(), DecodeError> {
        let commands: [Option<PulseCommand>; MotorChannel::COUNT] = Decode::decode(decoder)?;
        for (slot, command) in self.slots.iter_mut().zip(commands) {
            if let (Some(slot), Some(command)) = (slot.as_mut(), command) {
                slot.command = PulseCommand {
                    channel: command.channel,
                    current_pulse_us: clamp_pulse(command.current_pulse_us as i64),
                    target_pulse_us: clamp_pulse(command.target_pulse_us as i64),
                };
            }
        }
        self.weapon_enabled = Decode::decode(decoder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumbsup_core::freeze::{freeze_to_vec, thaw_from_slice};
    use tu_sim::SimBoard;

    const ALL: [MotorChannel; 3] = MotorChannel::ALL;

    fn output() -> (PwmOutput<SimBoard>, SimBoard) {
        let board = SimBoard::new();
        let out = PwmOutput::new(board.clone(), &ALL, PwmOutputConfig::default()).unwrap();
        (out, board)
    }

    #[test]
    fn test_initial_pulses_are_safe() {
        let (out, board) = output();
        assert_eq!(board.pwm_pulse(MotorChannel::Weapon), PWM_MIN_PULSE_US);
        assert_eq!(board.pwm_pulse(MotorChannel::LeftDrive), PWM_NEUTRAL_PULSE_US);
        assert_eq!(board.pwm_pulse(MotorChannel::RightDrive), PWM_NEUTRAL_PULSE_US);
        assert!(board.pwm_enabled(MotorChannel::Weapon));
        assert_eq!(out.current_pulse_us(MotorChannel::Weapon), Some(1000));
    }

    #[test]
    fn test_speed_mapping() {
        assert_eq!(speed_to_pulse(0), 1500);
        assert_eq!(speed_to_pulse(100), 2000);
        assert_eq!(speed_to_pulse(-100), 1000);
        assert_eq!(speed_to_pulse(50), 1750);
        assert_eq!(speed_to_pulse(i32::MAX), 2000);
        assert_eq!(weapon_speed_to_pulse(0), 1000);
        assert_eq!(weapon_speed_to_pulse(1), 1010);
        assert_eq!(weapon_speed_to_pulse(100), 2000);
        assert_eq!(weapon_speed_to_pulse(-20), 1000);
    }

    #[test]
    fn test_pulse_bounds_under_adversarial_input() {
        let (mut out, _board) = output();
        out.set_weapon_enabled(true);
        for channel in ALL {
            for pulse in [5000, -500, i32::MIN, i32::MAX, 0, 999, 2001] {
                out.set_pulse(channel, pulse).unwrap();
                for _ in 0..200 {
                    out.update();
                }
                let cmd = out.pulse(channel).unwrap();
                assert!((PWM_MIN_PULSE_US..=PWM_MAX_PULSE_US).contains(&cmd.current_pulse_us));
                assert!((PWM_MIN_PULSE_US..=PWM_MAX_PULSE_US).contains(&cmd.target_pulse_us));
            }
            for speed in [5000, -500, i32::MIN, i32::MAX] {
                out.set_speed(channel, speed).unwrap();
                out.update();
                let cmd = out.pulse(channel).unwrap();
                assert!((PWM_MIN_PULSE_US..=PWM_MAX_PULSE_US).contains(&cmd.target_pulse_us));
            }
        }
    }

    #[test]
    fn test_ramp_never_jumps() {
        let (mut out, board) = output();
        out.set_speed(MotorChannel::LeftDrive, 100).unwrap();
        let mut last = PWM_NEUTRAL_PULSE_US;
        for _ in 0..50 {
            out.update();
            let now = board.pwm_pulse(MotorChannel::LeftDrive);
            assert!(now >= last && now - last <= PWM_RAMP_STEP_US);
            last = now;
        }
        assert_eq!(last, PWM_MAX_PULSE_US);
        out.update();
        assert_eq!(board.pwm_pulse(MotorChannel::LeftDrive), PWM_MAX_PULSE_US);
    }

    #[test]
    fn test_right_drive_is_reversed() {
        let (mut out, _board) = output();
        out.set_speed(MotorChannel::RightDrive, 100).unwrap();
        assert_eq!(out.pulse(MotorChannel::RightDrive).unwrap().target_pulse_us, 1000);
        out.set_speed(MotorChannel::RightDrive, i32::MIN).unwrap();
        assert_eq!(out.pulse(MotorChannel::RightDrive).unwrap().target_pulse_us, 2000);
    }

    #[test]
    fn test_weapon_locked_out_by_default() {
        let (mut out, _board) = output();
        out.set_speed(MotorChannel::Weapon, 80).unwrap();
        assert_eq!(out.pulse(MotorChannel::Weapon).unwrap().target_pulse_us, 1000);
        out.set_weapon_enabled(true);
        out.set_speed(MotorChannel::Weapon, 80).unwrap();
        assert_eq!(out.pulse(MotorChannel::Weapon).unwrap().target_pulse_us, 1800);
        out.set_weapon_enabled(false);
        assert_eq!(out.pulse(MotorChannel::Weapon).unwrap().target_pulse_us, 1000);
    }

    #[test]
    fn test_stop_all_skips_ramp() {
        let (mut out, board) = output();
        out.set_speed(MotorChannel::LeftDrive, 100).unwrap();
        for _ in 0..20 {
            out.update();
        }
        out.stop_all();
        assert_eq!(board.pwm_pulse(MotorChannel::LeftDrive), PWM_NEUTRAL_PULSE_US);
        assert_eq!(out.pulse(MotorChannel::LeftDrive).unwrap().target_pulse_us, 1500);
    }

    #[test]
    fn test_emergency_stop_disables_and_resume() {
        let (mut out, board) = output();
        out.emergency_stop();
        for channel in ALL {
            assert!(!board.pwm_enabled(channel));
            assert_eq!(board.pwm_pulse(channel), safe_pulse(channel));
        }
        out.resume();
        assert!(board.pwm_enabled(MotorChannel::LeftDrive));
    }

    #[test]
    fn test_release_and_claim() {
        let (mut out, board) = output();
        out.release(MotorChannel::Weapon).unwrap();
        assert!(!out.is_claimed(MotorChannel::Weapon));
        assert!(!board.pwm_enabled(MotorChannel::Weapon));
        let writes = board.with_state(|s| s.pwm_writes);
        out.update();
        // the drive channels still get written, the released weapon does not
        assert_eq!(board.with_state(|s| s.pwm_writes), writes + 2);
        out.claim(MotorChannel::Weapon).unwrap();
        assert!(board.pwm_enabled(MotorChannel::Weapon));
        assert_eq!(board.pwm_pulse(MotorChannel::Weapon), PWM_MIN_PULSE_US);
    }

    #[test]
    fn test_foreign_channel_rejected() {
        let board = SimBoard::new();
        let mut out =
            PwmOutput::new(board, &[MotorChannel::Weapon], PwmOutputConfig::default()).unwrap();
        let err = out.set_speed(MotorChannel::LeftDrive, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParam);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = ComponentConfig::new();
        cfg.set("ramp_step_us", 0u32);
        assert!(PwmOutputConfig::from_config(Some(&cfg)).is_err());
        let mut cfg = ComponentConfig::new();
        cfg.set("frequency_hz", 400u32);
        cfg.set("reverse_right", false);
        let parsed = PwmOutputConfig::from_config(Some(&cfg)).unwrap();
        assert_eq!(parsed.frequency_hz, 400);
        assert!(!parsed.reverse_right);
        assert_eq!(PwmOutputConfig::from_config(None).unwrap(), PwmOutputConfig::default());
    }

    #[test]
    fn test_freeze_thaw() {
        let (mut out, _board) = output();
        out.set_speed(MotorChannel::LeftDrive, 40).unwrap();
        out.update();
        let bytes = freeze_to_vec(&out).unwrap();
        let (mut restored, _b) = output();
        thaw_from_slice(&mut restored, &bytes).unwrap();
        assert_eq!(
            restored.pulse(MotorChannel::LeftDrive),
            out.pulse(MotorChannel::LeftDrive)
        );
    }
}
