use bincode::{Decode, Encode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thumbsup_core::config::{getcfg, ComponentConfig};
use thumbsup_core::hw::SafetyInputs;
use thumbsup_core::{ErrorKind, TuError, TuResult};

pub const BATTERY_LOW_MV: u32 = 9_600;
pub const BATTERY_CRITICAL_MV: u32 = 9_000;
/// Consecutive low-battery readings tolerated while live.
pub const MAX_LOW_BATTERY_WARNINGS: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyConfig {
    pub low_battery_mv: u32,
    pub critical_battery_mv: u32,
    pub max_low_battery_warnings: u8,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        SafetyConfig {
            low_battery_mv: BATTERY_LOW_MV,
            critical_battery_mv: BATTERY_CRITICAL_MV,
            max_low_battery_warnings: MAX_LOW_BATTERY_WARNINGS,
        }
    }
}

impl SafetyConfig {
    pub fn from_config(config: Option<&ComponentConfig>) -> TuResult<Self> {
        let defaults = SafetyConfig::default();
        let low_battery_mv: u32 = getcfg(config, "low_battery_mv", defaults.low_battery_mv)?;
        let critical_battery_mv: u32 =
            getcfg(config, "critical_battery_mv", defaults.critical_battery_mv)?;
        let max_low_battery_warnings: u8 = getcfg(
            config,
            "max_low_battery_warnings",
            defaults.max_low_battery_warnings,
        )?;
        if critical_battery_mv >= low_battery_mv {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                format!(
                    "critical battery {critical_battery_mv} mV must be below low battery {low_battery_mv} mV"
                ),
            ));
        }
        if max_low_battery_warnings == 0 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                "max_low_battery_warnings must be at least 1",
            ));
        }
        Ok(SafetyConfig {
            low_battery_mv,
            critical_battery_mv,
            max_low_battery_warnings,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum BatteryStatus {
    Ok,
    Low,
    Critical,
}

/// Why a live weapon was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum SafetyViolation {
    FailsafeActive,
    SafetyButton,
    CriticalBattery { millivolts: u32 },
    LowBattery { millivolts: u32, readings: u8 },
}

impl SafetyViolation {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SafetyViolation::FailsafeActive => ErrorKind::FailsafeActive,
            SafetyViolation::SafetyButton => ErrorKind::SafetyViolation,
            SafetyViolation::CriticalBattery { .. } | SafetyViolation::LowBattery { .. } => {
                ErrorKind::LowBattery
            }
        }
    }
}

impl Display for SafetyViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SafetyViolation::FailsafeActive => write!(f, "radio failsafe active"),
            SafetyViolation::SafetyButton => write!(f, "safety button pressed"),
            SafetyViolation::CriticalBattery { millivolts } => {
                write!(f, "battery critical at {millivolts} mV")
            }
            SafetyViolation::LowBattery {
                millivolts,
                readings,
            } => write!(f, "battery low at {millivolts} mV for {readings} checks"),
        }
    }
}

impl From<SafetyViolation> for TuError {
    fn from(violation: SafetyViolation) -> Self {
        TuError::new(violation.kind(), violation.to_string())
    }
}

/// Gates arming and keeps vetoing a live weapon.
#[derive(Debug, Clone, Default)]
pub struct SafetyMonitor {
    config: SafetyConfig,
    low_battery_readings: u8,
    violations: u32,
}

impl SafetyMonitor {
    pub fn new(config: SafetyConfig) -> Self {
        SafetyMonitor {
            config,
            low_battery_readings: 0,
            violations: 0,
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn battery_status(&self, millivolts: u32) -> BatteryStatus {
        if millivolts < self.config.critical_battery_mv {
            BatteryStatus::Critical
        } else if millivolts < self.config.low_battery_mv {
            BatteryStatus::Low
        } else {
            BatteryStatus::Ok
        }
    }

    pub fn check_arm_conditions(&self, inputs: &impl SafetyInputs) -> TuResult<()> {
        let battery = inputs.battery_voltage_mv();
        if battery < self.config.low_battery_mv {
            debug!("safety: arm refused, battery {battery} mV");
            return Err(TuError::new(
                ErrorKind::LowBattery,
                format!(
                    "cannot arm: battery {} mV below {} mV",
                    battery, self.config.low_battery_mv
                ),
            ));
        }
        if inputs.is_safety_button_pressed() {
            debug!("safety: arm refused, safety button pressed");
            return Err(TuError::new(
                ErrorKind::SafetyViolation,
                "cannot arm: safety button pressed",
            ));
        }
        Ok(())
    }

    /// One check of a live weapon. Low battery is tolerated for a few
    /// consecutive readings before it counts as a violation.
    pub fn check_live(&mut self, inputs: &impl SafetyInputs) -> Result<(), SafetyViolation> {
        let result = self.evaluate(inputs);
        if let Err(violation) = result {
            self.violations = self.violations.saturating_add(1);
            warn!("safety: {violation}");
        }
        result
    }

    fn evaluate(&mut self, inputs: &impl SafetyInputs) -> Result<(), SafetyViolation> {
        if inputs.is_failsafe_active() {
            return Err(SafetyViolation::FailsafeActive);
        }
        if inputs.is_safety_button_pressed() {
            return Err(SafetyViolation::SafetyButton);
        }
        let millivolts = inputs.battery_voltage_mv();
        match self.battery_status(millivolts) {
            BatteryStatus::Critical => Err(SafetyViolation::CriticalBattery { millivolts }),
            BatteryStatus::Low => {
                self.low_battery_readings = self.low_battery_readings.saturating_add(1);
                if self.low_battery_readings >= self.config.max_low_battery_warnings {
                    return Err(SafetyViolation::LowBattery {
                        millivolts,
                        readings: self.low_battery_readings,
                    });
                }
                debug!(
                    "safety: low battery {} mV ({}/{})",
                    millivolts, self.low_battery_readings, self.config.max_low_battery_warnings
                );
                Ok(())
            }
            BatteryStatus::Ok => {
                self.low_battery_readings = 0;
                Ok(())
            }
        }
    }

    pub fn reset_warnings(&mut self) {
        self.low_battery_readings = 0;
    }

    pub fn low_battery_readings(&self) -> u8 {
        self.low_battery_readings
    }

    pub fn violation_count(&self) -> u32 {
        self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumbsup_core::hw::SafetyFacts;

    fn healthy() -> SafetyFacts {
        SafetyFacts {
            battery_mv: 11_800,
            ..Default::default()
        }
    }

    #[test]
    fn test_arm_conditions() {
        let monitor = SafetyMonitor::default();
        assert!(monitor.check_arm_conditions(&healthy()).is_ok());

        let low = SafetyFacts {
            battery_mv: BATTERY_LOW_MV - 1,
            ..healthy()
        };
        assert_eq!(
            monitor.check_arm_conditions(&low).unwrap_err().kind(),
            ErrorKind::LowBattery
        );

        let button = SafetyFacts {
            safety_button: true,
            ..healthy()
        };
        assert_eq!(
            monitor.check_arm_conditions(&button).unwrap_err().kind(),
            ErrorKind::SafetyViolation
        );

        let edge = SafetyFacts {
            battery_mv: BATTERY_LOW_MV,
            ..healthy()
        };
        assert!(monitor.check_arm_conditions(&edge).is_ok());
    }

    #[test]
    fn test_live_hard_violations() {
        let mut monitor = SafetyMonitor::new(SafetyConfig::default());
        let failsafe = SafetyFacts {
            failsafe_active: true,
            ..healthy()
        };
        assert_eq!(monitor.check_live(&failsafe), Err(SafetyViolation::FailsafeActive));
        let critical = SafetyFacts {
            battery_mv: 8_900,
            ..healthy()
        };
        assert_eq!(
            monitor.check_live(&critical),
            Err(SafetyViolation::CriticalBattery { millivolts: 8_900 })
        );
        assert_eq!(monitor.violation_count(), 2);
    }

    #[test]
    fn test_low_battery_needs_consecutive_readings() {
        let mut monitor = SafetyMonitor::new(SafetyConfig::default());
        let low = SafetyFacts {
            battery_mv: 9_300,
            ..healthy()
        };
        for _ in 0..4 {
            assert!(monitor.check_live(&low).is_ok());
        }
        // a good reading resets the streak
        assert!(monitor.check_live(&healthy()).is_ok());
        for _ in 0..4 {
            assert!(monitor.check_live(&low).is_ok());
        }
        let err = monitor.check_live(&low).unwrap_err();
        assert_eq!(
            err,
            SafetyViolation::LowBattery {
                millivolts: 9_300,
                readings: 5
            }
        );
        assert_eq!(TuError::from(err).kind(), ErrorKind::LowBattery);
    }

    #[test]
    fn test_battery_status() {
        let monitor = SafetyMonitor::default();
        assert_eq!(monitor.battery_status(11_000), BatteryStatus::Ok);
        assert_eq!(monitor.battery_status(9_599), BatteryStatus::Low);
        assert_eq!(monitor.battery_status(8_999), BatteryStatus::Critical);
    }

    #[test]
    fn test_config_validation() {
        let mut cfg = ComponentConfig::new();
        cfg.set("critical_battery_mv", 9_700u32);
        assert!(SafetyConfig::from_config(Some(&cfg)).is_err());
        let mut cfg = ComponentConfig::new();
        cfg.set("low_battery_mv", 10_000u32);
        let parsed = SafetyConfig::from_config(Some(&cfg)).unwrap();
        assert_eq!(parsed.low_battery_mv, 10_000);
        assert_eq!(parsed.critical_battery_mv, BATTERY_CRITICAL_MV);
    }
}
