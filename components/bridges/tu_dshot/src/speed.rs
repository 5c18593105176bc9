use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thumbsup_core::config::{getcfg, ComponentConfig};
use thumbsup_core::{ErrorKind, TuError, TuResult};

/// Executor cycles spent on one DShot bit.
pub const CYCLES_PER_BIT: u32 = 15;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum DshotSpeed {
    Dshot150,
    #[default]
    Dshot300,
    Dshot600,
    Dshot1200,
}

impl DshotSpeed {
    pub const fn kbits_per_second(self) -> u32 {
        match self {
            DshotSpeed::Dshot150 => 150,
            DshotSpeed::Dshot300 => 300,
            DshotSpeed::Dshot600 => 600,
            DshotSpeed::Dshot1200 => 1200,
        }
    }

    pub fn from_kbits(kbits: u32) -> TuResult<Self> {
        match kbits {
            150 => Ok(DshotSpeed::Dshot150),
            300 => Ok(DshotSpeed::Dshot300),
            600 => Ok(DshotSpeed::Dshot600),
            1200 => Ok(DshotSpeed::Dshot1200),
            other => Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("unsupported DShot speed {other} kbit/s"),
            )),
        }
    }

    /// Fractional divider that makes the executor tick `CYCLES_PER_BIT` times per bit.
    pub fn clock_divider(self, system_clock_hz: u32) -> f32 {
        let executor_hz = self.kbits_per_second() as f32 * 1_000.0 * CYCLES_PER_BIT as f32;
        (system_clock_hz as f32 / executor_hz).clamp(1.0, 65_536.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct DshotConfig {
    pub speed: DshotSpeed,
    /// Enables EDT telemetry and the inverted-signal program.
    pub bidirectional: bool,
    /// Motor poles / 2, used to turn eRPM into RPM.
    pub pole_pairs: u8,
}

impl Default for DshotConfig {
    fn default() -> Self {
        DshotConfig {
            speed: DshotSpeed::Dshot300,
            bidirectional: false,
            pole_pairs: 7,
        }
    }
}

impl DshotConfig {
    pub fn from_config(config: Option<&ComponentConfig>) -> TuResult<Self> {
        let defaults = DshotConfig::default();
        let kbits: u32 = getcfg(config, "speed_kbits", defaults.speed.kbits_per_second())?;
        Ok(DshotConfig {
            speed: DshotSpeed::from_kbits(kbits)?,
            bidirectional: getcfg(config, "bidirectional", defaults.bidirectional)?,
            pole_pairs: getcfg(config, "pole_pairs", defaults.pole_pairs)?,
        })
    }
}
