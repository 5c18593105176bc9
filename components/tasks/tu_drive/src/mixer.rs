use crate::expo::{apply_expo, STICK_MAX};
use crate::linearizer::compensate;
use crate::trim::TrimCalibrator;
use bincode::{Decode, Encode};
use log::warn;
use serde::{Deserialize, Serialize};
use thumbsup_core::config::{getcfg, ComponentConfig};
use thumbsup_core::{ErrorKind, MotorChannel, TuError, TuResult};

pub const DEFAULT_DRIVE_EXPO: u8 = 30;
pub const DEFAULT_MAX_SPEED: u8 = 100;

/// Signed speed percentages for the two drive sides.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct DriveOutput {
    pub left: i32,
    pub right: i32,
}

impl DriveOutput {
    pub const STOP: DriveOutput = DriveOutput { left: 0, right: 0 };

    pub fn is_stopped(&self) -> bool {
        *self == Self::STOP
    }

    pub fn get(&self, channel: MotorChannel) -> i32 {
        match channel {
            MotorChannel::LeftDrive => self.left,
            MotorChannel::RightDrive => self.right,
            MotorChannel::Weapon => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveConfig {
    pub expo: u8,
    pub max_speed: u8,
    pub linearize: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        DriveConfig {
            expo: DEFAULT_DRIVE_EXPO,
            max_speed: DEFAULT_MAX_SPEED,
            linearize: true,
        }
    }
}

impl DriveConfig {
    pub fn from_config(config: Option<&ComponentConfig>) -> TuResult<Self> {
        let defaults = DriveConfig::default();
        let expo: u8 = getcfg(config, "expo", defaults.expo)?;
        let max_speed: u8 = getcfg(config, "max_speed", defaults.max_speed)?;
        let linearize: bool = getcfg(config, "linearize", defaults.linearize)?;
        if expo > 100 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("drive expo {expo} is above 100"),
            ));
        }
        if max_speed == 0 || max_speed > 100 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("max_speed {max_speed} is outside 1..=100"),
            ));
        }
        Ok(DriveConfig {
            expo,
            max_speed,
            linearize,
        })
    }
}

/// Tank mixer: forward and turn sticks in, per-side speed percent out.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriveMixer {
    config: DriveConfig,
}

impl DriveMixer {
    pub fn new(config: DriveConfig) -> Self {
        DriveMixer { config }
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub fn mix(&self, forward: i32, turn: i32) -> DriveOutput {
        if !in_stick_range(forward) || !in_stick_range(turn) {
            warn!("drive input out of range (forward={forward}, turn={turn}), stopping");
            return DriveOutput::STOP;
        }
        let max_speed = self.config.max_speed as i32;
        let f = apply_expo(forward, self.config.expo) * max_speed / STICK_MAX;
        let t = apply_expo(turn, self.config.expo) * max_speed / STICK_MAX;

        let mut left = f + t;
        let mut right = f - t;
        let largest = left.abs().max(right.abs());
        if largest > 100 {
            left = left * 100 / largest;
            right = right * 100 / largest;
        }
        DriveOutput {
            left: left.clamp(-100, 100),
            right: right.clamp(-100, 100),
        }
    }

    /// Adds the calibrated turn offset for the commanded speed before mixing.
    pub fn mix_with_trim(&self, forward: i32, turn: i32, trim: &TrimCalibrator) -> DriveOutput {
        if !in_stick_range(forward) || !in_stick_range(turn) {
            return self.mix(forward, turn);
        }
        let speed_percent = forward * 100 / STICK_MAX;
        let offset = trim.get_offset(speed_percent) * STICK_MAX / 100;
        let turn = (turn + offset).clamp(-STICK_MAX, STICK_MAX);
        self.mix(forward, turn)
    }

    /// Full drive path: mix, trim, then per-motor linearization when enabled.
    pub fn drive(&self, forward: i32, turn: i32, trim: Option<&TrimCalibrator>) -> DriveOutput {
        let mixed = match trim {
            Some(trim) => self.mix_with_trim(forward, turn, trim),
            None => self.mix(forward, turn),
        };
        if !self.config.linearize {
            return mixed;
        }
        DriveOutput {
            left: compensate(MotorChannel::LeftDrive, mixed.left),
            right: compensate(MotorChannel::RightDrive, mixed.right),
        }
    }
}

fn in_stick_range(value: i32) -> bool {
    (-STICK_MAX..=STICK_MAX).contains(&value)
}
