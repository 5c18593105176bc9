use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Lowest throttle value that spins the motor. Values below are commands.
pub const DSHOT_THROTTLE_MIN: u16 = 48;
pub const DSHOT_THROTTLE_MAX: u16 = 2047;

/// 4 bit CRC over the 12 bit payload (throttle + telemetry bit), polynomial 0x19.
pub fn crc4(payload: u16) -> u8 {
    let mut crc: u16 = 0;
    let mut data = payload;
    for _ in 0..12 {
        crc ^= if data & 0x800 != 0 { 0x8 } else { 0 };
        data <<= 1;
        crc <<= 1;
        if crc & 0x10 != 0 {
            crc ^= 0x19;
        }
    }
    (crc & 0x0F) as u8
}

/// `[11 bit throttle][telemetry][4 bit crc]`
pub fn encode_packet(throttle: u16, request_telemetry: bool) -> u16 {
    let payload = ((throttle & 0x7FF) << 1) | request_telemetry as u16;
    (payload << 4) | crc4(payload) as u16
}

/// Returns the throttle and telemetry flag when the CRC matches.
pub fn decode_packet(packet: u16) -> Option<(u16, bool)> {
    let payload = packet >> 4;
    if crc4(payload) != (packet & 0x0F) as u8 {
        return None;
    }
    Some((payload >> 1, payload & 1 == 1))
}

/// Bidirectional mapping: -100..=100 percent onto 48..=2047, 0 disarms.
pub fn throttle_from_percent(percent: i32) -> u16 {
    let percent = percent.clamp(-100, 100);
    if percent == 0 {
        return 0;
    }
    let range = (DSHOT_THROTTLE_MAX - DSHOT_THROTTLE_MIN) as i32;
    let value = DSHOT_THROTTLE_MIN as i32 + ((percent + 100) * range) / 200;
    value.clamp(DSHOT_THROTTLE_MIN as i32, DSHOT_THROTTLE_MAX as i32) as u16
}

/// Unidirectional mapping for the weapon: 1..=100 percent onto 48..=2047.
pub fn throttle_from_unsigned_percent(percent: i32) -> u16 {
    let percent = percent.clamp(0, 100);
    if percent == 0 {
        return 0;
    }
    let range = (DSHOT_THROTTLE_MAX - DSHOT_THROTTLE_MIN) as i32;
    (DSHOT_THROTTLE_MIN as i32 + (percent * range) / 100) as u16
}

/// Special commands carried in the throttle field (values 0..=31).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
#[repr(u8)]
pub enum DshotCommand {
    MotorStop = 0,
    Beep1 = 1,
    Beep2 = 2,
    Beep3 = 3,
    Beep4 = 4,
    Beep5 = 5,
    EscInfo = 6,
    SpinDirection1 = 7,
    SpinDirection2 = 8,
    Mode3dOff = 9,
    Mode3dOn = 10,
    SettingsRequest = 11,
    SaveSettings = 12,
    SpinDirectionNormal = 20,
    SpinDirectionReversed = 21,
    Led0On = 22,
    Led1On = 23,
    Led2On = 24,
    Led3On = 25,
    Led0Off = 26,
    Led1Off = 27,
    Led2Off = 28,
    Led3Off = 29,
    AudioStream = 30,
    SilentMode = 31,
}

impl DshotCommand {
    pub const fn value(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u8> for DshotCommand {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use DshotCommand::*;
        Ok(match value {
            0 => MotorStop,
            1 => Beep1,
            2 => Beep2,
            3 => Beep3,
            4 => Beep4,
            5 => Beep5,
            6 => EscInfo,
            7 => SpinDirection1,
            8 => SpinDirection2,
            9 => Mode3dOff,
            10 => Mode3dOn,
            11 => SettingsRequest,
            12 => SaveSettings,
            20 => SpinDirectionNormal,
            21 => SpinDirectionReversed,
            22 => Led0On,
            23 => Led1On,
            24 => Led2On,
            25 => Led3On,
            26 => Led0Off,
            27 => Led1Off,
            28 => Led2Off,
            29 => Led3Off,
            30 => AudioStream,
            31 => SilentMode,
            other => return Err(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_endpoints() {
        assert_eq!(throttle_from_percent(0), 0);
        assert_eq!(throttle_from_percent(-100), 48);
        assert_eq!(throttle_from_percent(100), 2047);
        assert_eq!(throttle_from_percent(500), 2047);
        assert_eq!(throttle_from_percent(i32::MIN), 48);
        assert_eq!(throttle_from_unsigned_percent(0), 0);
        assert_eq!(throttle_from_unsigned_percent(1), 67);
        assert_eq!(throttle_from_unsigned_percent(100), 2047);
        assert_eq!(throttle_from_unsigned_percent(-3), 0);
    }

    #[test]
    fn test_every_packet_passes_crc() {
        for throttle in 0..=DSHOT_THROTTLE_MAX {
            for telemetry in [false, true] {
                let packet = encode_packet(throttle, telemetry);
                assert_eq!(decode_packet(packet), Some((throttle, telemetry)));
            }
        }
    }

    #[test]
    fn test_single_bit_flips_are_rejected() {
        for throttle in [0u16, 1, 48, 1000, 1047, 2047] {
            for telemetry in [false, true] {
                let packet = encode_packet(throttle, telemetry);
                for bit in 0..16 {
                    assert_eq!(decode_packet(packet ^ (1 << bit)), None);
                }
            }
        }
    }

    #[test]
    fn test_throttle_is_masked() {
        assert_eq!(encode_packet(0x0FFF, false) >> 5, 0x7FF);
    }

    #[test]
    fn test_command_values() {
        assert_eq!(DshotCommand::SilentMode.value(), 31);
        assert_eq!(DshotCommand::try_from(21), Ok(DshotCommand::SpinDirectionReversed));
        assert_eq!(DshotCommand::try_from(15), Err(15));
        for v in 0u8..=31 {
            if let Ok(cmd) = DshotCommand::try_from(v) {
                assert_eq!(cmd.value(), v as u16);
            }
        }
    }
}
