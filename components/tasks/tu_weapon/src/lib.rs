//! Weapon control: arming interlocks, the spin-up ramp and the choice of
//! transport (PWM, DShot or the AM32 config link) on the weapon pin.
pub mod safety;
pub mod weapon;

pub use safety::{
    BatteryStatus, SafetyConfig, SafetyMonitor, SafetyViolation, BATTERY_CRITICAL_MV,
    BATTERY_LOW_MV,
};
pub use weapon::{
    EStopHandle, SharedTransports, WeaponBoard, WeaponConfig, WeaponControlMode, WeaponState,
    WeaponStateMachine, WeaponTransports,
};
