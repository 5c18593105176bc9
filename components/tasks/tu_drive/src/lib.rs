//! Stick-to-wheel drive path: expo, tank mixing, trim and linearization.
pub mod expo;
pub mod linearizer;
pub mod mixer;
pub mod trim;

pub use expo::{apply_expo, expo_curve, expo_percent, STICK_MAX};
pub use linearizer::{compensate, MotorCurveParams, MAX_WHEEL_RPM};
pub use mixer::{DriveConfig, DriveMixer, DriveOutput};
pub use trim::{TrimCalibrator, TrimSample, TRIM_BLOB_KEY};
