//! AM32 settings EEPROM image.
use crate::protocol::xor_checksum;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thumbsup_core::{ErrorKind, TuError, TuResult};

pub const EEPROM_SIZE: usize = 256;
/// Anything shorter cannot hold the fields below.
pub const MIN_SETTINGS_LEN: usize = 32;

pub const ADDR_VERSION: usize = 0x00;
pub const ADDR_MOTOR_DIRECTION: usize = 0x01;
pub const ADDR_BIDIRECTIONAL: usize = 0x02;
pub const ADDR_BRAKE_ON_STOP: usize = 0x03;
pub const ADDR_STARTUP_POWER: usize = 0x04;
pub const ADDR_MOTOR_TIMING: usize = 0x05;
pub const ADDR_PWM_FREQUENCY: usize = 0x06;
pub const ADDR_DEMAG_COMP: usize = 0x07;
pub const ADDR_TEMP_LIMIT: usize = 0x08;
pub const ADDR_CURRENT_LIMIT: usize = 0x09;
pub const ADDR_THROTTLE_MIN: usize = 0x0A;
pub const ADDR_THROTTLE_MAX: usize = 0x0C;
pub const ADDR_THROTTLE_CAL: usize = 0x0E;
pub const ADDR_MOTOR_KV: usize = 0x10;
pub const ADDR_MOTOR_POLES: usize = 0x12;
pub const ADDR_TELEMETRY: usize = 0x14;
pub const ADDR_SERVO_CENTER: usize = 0x15;
pub const ADDR_DEADBAND: usize = 0x17;
pub const ADDR_LOW_VOLTAGE_CUTOFF: usize = 0x18;
pub const ADDR_SINE_MODE: usize = 0x19;
pub const ADDR_SETTINGS_CHECKSUM: usize = 0xFF;

pub const MAX_TEMPERATURE_LIMIT: u8 = 150;
pub const MAX_CURRENT_LIMIT: u8 = 100;
pub const MAX_MOTOR_TIMING: u8 = 30;
pub const PWM_FREQUENCIES_KHZ: [u8; 3] = [24, 48, 96];

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct EscSettings {
    pub layout_version: u8,
    pub motor_direction: u8,
    pub bidirectional: u8,
    pub brake_on_stop: u8,
    /// 1 (low) to 10 (high).
    pub startup_power: u8,
    /// Degrees, 0 to 30.
    pub motor_timing: u8,
    /// kHz, one of 24, 48, 96.
    pub pwm_frequency: u8,
    pub demag_compensation: u8,
    /// Celsius.
    pub temperature_limit: u8,
    /// Amps.
    pub current_limit: u8,
    pub throttle_min: u16,
    pub throttle_max: u16,
    pub throttle_calibration: u8,
    pub motor_kv: u16,
    pub motor_poles: u8,
    pub telemetry: u8,
    pub servo_center: u16,
    pub deadband: u8,
    pub low_voltage_cutoff: u8,
    pub sine_mode: u8,
}

fn read_u16(bytes: &[u8], addr: usize) -> u16 {
    u16::from_le_bytes([bytes[addr], bytes[addr + 1]])
}

fn write_u16(bytes: &mut [u8], addr: usize, value: u16) {
    bytes[addr..addr + 2].copy_from_slice(&value.to_le_bytes());
}

impl EscSettings {
    /// The weapon ESC profile: unidirectional, no brake, no low voltage
    /// cutoff since the robot does its own battery monitoring.
    pub fn weapon_defaults() -> Self {
        let mut settings = EscSettings::default();
        settings.apply_weapon_defaults();
        settings
    }

    pub fn apply_weapon_defaults(&mut self) {
        self.motor_direction = 0;
        self.bidirectional = 0;
        self.brake_on_stop = 0;
        self.startup_power = 6;
        self.motor_timing = 16;
        self.motor_kv = 1100;
        self.motor_poles = 14;
        self.pwm_frequency = 24;
        self.throttle_min = 1000;
        self.throttle_max = 2000;
        self.temperature_limit = 80;
        self.current_limit = 40;
        self.low_voltage_cutoff = 0;
        self.demag_compensation = 2;
        self.sine_mode = 0;
        self.telemetry = 0;
        self.servo_center = 1500;
        self.deadband = 2;
    }

    /// Every field is checked before anything goes on the wire.
    pub fn validate(&self) -> TuResult<()> {
        let invalid = |what: String| Err(TuError::new(ErrorKind::InvalidParam, what));
        if self.temperature_limit > MAX_TEMPERATURE_LIMIT {
            return invalid(format!(
                "temperature limit {} C above {}",
                self.temperature_limit, MAX_TEMPERATURE_LIMIT
            ));
        }
        if self.current_limit > MAX_CURRENT_LIMIT {
            return invalid(format!(
                "current limit {} A above {}",
                self.current_limit, MAX_CURRENT_LIMIT
            ));
        }
        if !(1..=10).contains(&self.startup_power) {
            return invalid(format!("startup power {} not in 1..=10", self.startup_power));
        }
        if self.motor_timing > MAX_MOTOR_TIMING {
            return invalid(format!("motor timing {} above 30", self.motor_timing));
        }
        if !PWM_FREQUENCIES_KHZ.contains(&self.pwm_frequency) {
            return invalid(format!(
                "PWM frequency {} kHz not one of 24, 48, 96",
                self.pwm_frequency
            ));
        }
        Ok(())
    }

    /// Parses a settings reply. A full image must carry a matching checksum.
    pub fn from_eeprom(bytes: &[u8]) -> TuResult<Self> {
        if bytes.len() < MIN_SETTINGS_LEN {
            return Err(TuError::new(
                ErrorKind::CommFailure,
                format!("settings reply of {} bytes is too short", bytes.len()),
            ));
        }
        if bytes.len() >= EEPROM_SIZE {
            let expected = xor_checksum(&bytes[..ADDR_SETTINGS_CHECKSUM]);
            if bytes[ADDR_SETTINGS_CHECKSUM] != expected {
                return Err(TuError::new(
                    ErrorKind::CommFailure,
                    format!(
                        "settings checksum 0x{:02X}, expected 0x{:02X}",
                        bytes[ADDR_SETTINGS_CHECKSUM], expected
                    ),
                ));
            }
        }
        Ok(EscSettings {
            layout_version: bytes[ADDR_VERSION],
            motor_direction: bytes[ADDR_MOTOR_DIRECTION],
            bidirectional: bytes[ADDR_BIDIRECTIONAL],
            brake_on_stop: bytes[ADDR_BRAKE_ON_STOP],
            startup_power: bytes[ADDR_STARTUP_POWER],
            motor_timing: bytes[ADDR_MOTOR_TIMING],
            pwm_frequency: bytes[ADDR_PWM_FREQUENCY],
            demag_compensation: bytes[ADDR_DEMAG_COMP],
            temperature_limit: bytes[ADDR_TEMP_LIMIT],
            current_limit: bytes[ADDR_CURRENT_LIMIT],
            throttle_min: read_u16(bytes, ADDR_THROTTLE_MIN),
            throttle_max: read_u16(bytes, ADDR_THROTTLE_MAX),
            throttle_calibration: bytes[ADDR_THROTTLE_CAL],
            motor_kv: read_u16(bytes, ADDR_MOTOR_KV),
            motor_poles: bytes[ADDR_MOTOR_POLES],
            telemetry: bytes[ADDR_TELEMETRY],
            servo_center: read_u16(bytes, ADDR_SERVO_CENTER),
            deadband: bytes[ADDR_DEADBAND],
            low_voltage_cutoff: bytes[ADDR_LOW_VOLTAGE_CUTOFF],
            sine_mode: bytes[ADDR_SINE_MODE],
        })
    }

    /// Writes the fields over `base` (the last image read back, or zeros)
    /// and reseals the checksum. Bytes this layout does not know are kept.
    pub fn to_eeprom(&self, base: Option<&[u8; EEPROM_SIZE]>) -> [u8; EEPROM_SIZE] {
        let mut image = base.copied().unwrap_or([0u8; EEPROM_SIZE]);
        if base.is_none() {
            image[ADDR_VERSION] = self.layout_version;
        }
        image[ADDR_MOTOR_DIRECTION] = self.motor_direction;
        image[ADDR_BIDIRECTIONAL] = self.bidirectional;
        image[ADDR_BRAKE_ON_STOP] = self.brake_on_stop;
        image[ADDR_STARTUP_POWER] = self.startup_power;
        image[ADDR_MOTOR_TIMING] = self.motor_timing;
        image[ADDR_PWM_FREQUENCY] = self.pwm_frequency;
        image[ADDR_DEMAG_COMP] = self.demag_compensation;
        image[ADDR_TEMP_LIMIT] = self.temperature_limit;
        image[ADDR_CURRENT_LIMIT] = self.current_limit;
        write_u16(&mut image, ADDR_THROTTLE_MIN, self.throttle_min);
        write_u16(&mut image, ADDR_THROTTLE_MAX, self.throttle_max);
        image[ADDR_THROTTLE_CAL] = self.throttle_calibration;
        write_u16(&mut image, ADDR_MOTOR_KV, self.motor_kv);
        image[ADDR_MOTOR_POLES] = self.motor_poles;
        image[ADDR_TELEMETRY] = self.telemetry;
        write_u16(&mut image, ADDR_SERVO_CENTER, self.servo_center);
        image[ADDR_DEADBAND] = self.deadband;
        image[ADDR_LOW_VOLTAGE_CUTOFF] = self.low_voltage_cutoff;
        image[ADDR_SINE_MODE] = self.sine_mode;
        image[ADDR_SETTINGS_CHECKSUM] = xor_checksum(&image[..ADDR_SETTINGS_CHECKSUM]);
        image
    }
}

/// What `GET_INFO` reports.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct EscInfo {
    pub firmware_version: [u8; 3],
    pub firmware_name: String,
    pub mcu_type: u8,
    pub flash_size_kib: u8,
    pub bootloader_version: u8,
}

pub const ESC_INFO_LEN: usize = 22;

impl EscInfo {
    pub fn parse(bytes: &[u8]) -> TuResult<Self> {
        if bytes.len() < ESC_INFO_LEN {
            return Err(TuError::new(
                ErrorKind::CommFailure,
                format!("device info reply of {} bytes is too short", bytes.len()),
            ));
        }
        let name = &bytes[3..19];
        let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
        Ok(EscInfo {
            firmware_version: [bytes[0], bytes[1], bytes[2]],
            firmware_name: String::from_utf8_lossy(&name[..end]).into_owned(),
            mcu_type: bytes[19],
            flash_size_kib: bytes[20],
            bootloader_version: bytes[21],
        })
    }
}
