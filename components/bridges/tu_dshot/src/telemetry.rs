//! Extended DShot Telemetry (EDT) decoding.
//!
//! A 21 bit response carries four 5 bit GCR symbols which decode to a 16 bit
//! word: a 12 bit value followed by a 4 bit CRC.
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thumbsup_core::clock::{TuDuration, TuTime};

/// Telemetry older than this is not reported as valid.
pub const TELEMETRY_MAX_AGE: TuDuration = TuDuration::from_millis(100);

const INVALID_GCR_ENTRY: u8 = 0xFF;

// 5 bit GCR symbol to nibble.
const GCR_LUT: [u8; 32] = [
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    0x9,
    0xA,
    0xB,
    INVALID_GCR_ENTRY,
    0xD,
    0xE,
    0xF,
    INVALID_GCR_ENTRY,
    INVALID_GCR_ENTRY,
    0x2,
    0x3,
    INVALID_GCR_ENTRY,
    0x5,
    0x6,
    0x7,
    INVALID_GCR_ENTRY,
    0x0,
    0x8,
    0x1,
    INVALID_GCR_ENTRY,
    0x4,
    0xC,
    INVALID_GCR_ENTRY,
];

// Nibble to 5 bit GCR symbol, the inverse of GCR_LUT.
const GCR_ENCODE: [u8; 16] = [
    0x19, 0x1B, 0x12, 0x13, 0x1D, 0x15, 0x16, 0x17, 0x1A, 0x09, 0x0A, 0x0B, 0x1E, 0x0D, 0x0E,
    0x0F,
];

/// Bit positions of the four symbols inside the raw word.
// TODO: confirm against a logic capture of a real ESC; the capture program may
// leave a start bit in front of the first symbol.
const SYMBOL_SHIFTS: [u32; 4] = [16, 11, 6, 1];

/// CRC over the 12 bit EDT value, polynomial 0x07.
pub fn edt_crc(value: u16) -> u8 {
    let mut crc: u8 = 0;
    for i in 0..12 {
        let bit = ((value >> (11 - i)) & 1) as u8;
        let feedback = (crc & 0x08) >> 3;
        crc = ((crc << 1) | bit) & 0x0F;
        if feedback != 0 {
            crc ^= 0x07;
        }
    }
    crc
}

#[inline]
pub fn gcr_to_16bit(raw21: u32) -> Option<u16> {
    let mut word = 0u16;
    for shift in SYMBOL_SHIFTS {
        let nibble = GCR_LUT[((raw21 >> shift) & 0x1F) as usize];
        if nibble == INVALID_GCR_ENTRY {
            return None;
        }
        word = (word << 4) | nibble as u16;
    }
    Some(word)
}

/// Builds the raw response an ESC would send for `value`.
/// Used by simulated ESCs and tests.
pub fn edt_raw_from_value(value: u16) -> u32 {
    let value = value & 0x0FFF;
    let word = (value << 4) | edt_crc(value) as u16;
    SYMBOL_SHIFTS
        .iter()
        .enumerate()
        .fold(0u32, |raw, (i, shift)| {
            let nibble = (word >> (12 - 4 * i)) & 0xF;
            raw | (GCR_ENCODE[nibble as usize] as u32) << shift
        })
}

/// One decoded EDT value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum EdtValue {
    Erpm(u16),
    VoltageCentivolts(u16),
    CurrentCentiamps(u16),
    TemperatureCelsius(u8),
}

impl EdtValue {
    pub fn from_value(value: u16) -> Self {
        match value {
            0..=2047 => EdtValue::Erpm(value),
            2048..=3071 => EdtValue::VoltageCentivolts((value - 2048) * 4),
            3072..=3583 => EdtValue::CurrentCentiamps((value - 3072) * 4),
            _ => EdtValue::TemperatureCelsius(((value.min(4095) - 3584) / 2) as u8),
        }
    }
}

/// Returns the value and the received CRC, or None on a bad symbol or CRC.
pub fn decode_edt(raw21: u32) -> Option<(EdtValue, u8)> {
    let word = gcr_to_16bit(raw21)?;
    let value = (word >> 4) & 0x0FFF;
    let crc = (word & 0x0F) as u8;
    if edt_crc(value) != crc {
        return None;
    }
    Some((EdtValue::from_value(value), crc))
}

/// Latest known telemetry for one channel. Each EDT frame only refreshes one field.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub erpm: u16,
    pub voltage_cv: u16,
    pub current_ca: u16,
    pub temperature_c: u8,
    pub crc: u8,
    pub valid: bool,
    pub timestamp: TuTime,
}

impl TelemetryFrame {
    pub fn merge(&mut self, value: EdtValue, crc: u8, at: TuTime) {
        match value {
            EdtValue::Erpm(v) => self.erpm = v,
            EdtValue::VoltageCentivolts(v) => self.voltage_cv = v,
            EdtValue::CurrentCentiamps(v) => self.current_ca = v,
            EdtValue::TemperatureCelsius(v) => self.temperature_c = v,
        }
        self.crc = crc;
        self.valid = true;
        self.timestamp = at;
    }

    pub fn is_fresh(&self, now: TuTime) -> bool {
        self.valid && now.saturating_sub(self.timestamp) <= TELEMETRY_MAX_AGE
    }
}
