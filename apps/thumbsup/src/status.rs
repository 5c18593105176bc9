//! Indicator patterns derived from controller state.
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thumbsup_core::hw::LedPattern;
use tu_weapon::WeaponState;

/// Overall controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    /// Self-test not run yet.
    Booting,
    Ready,
    Failsafe,
    Trim,
    /// Self-test failed. Fatal: outputs stay safe until power cycle.
    Halted,
}

impl Display for SystemState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemState::Booting => "booting",
            SystemState::Ready => "ready",
            SystemState::Failsafe => "failsafe",
            SystemState::Trim => "trim",
            SystemState::Halted => "halted",
        };
        f.write_str(name)
    }
}

pub fn system_pattern(state: SystemState) -> LedPattern {
    match state {
        SystemState::Booting => LedPattern::BlinkSlow,
        SystemState::Ready => LedPattern::Solid,
        SystemState::Failsafe => LedPattern::BlinkMedium,
        SystemState::Trim => LedPattern::BlinkSlow,
        SystemState::Halted => LedPattern::BlinkFast,
    }
}

pub fn weapon_pattern(state: WeaponState) -> LedPattern {
    match state {
        WeaponState::Disarmed => LedPattern::Off,
        WeaponState::Arming => LedPattern::BlinkSlow,
        WeaponState::Armed => LedPattern::Solid,
        WeaponState::Spinning => LedPattern::BlinkMedium,
        WeaponState::EmergencyStop => LedPattern::BlinkFast,
    }
}

/// Both indicators. A halted controller shows the alarm on both.
pub fn patterns(system: SystemState, weapon: WeaponState) -> (LedPattern, LedPattern) {
    if system == SystemState::Halted {
        return (LedPattern::BlinkFast, LedPattern::BlinkFast);
    }
    (system_pattern(system), weapon_pattern(weapon))
}
