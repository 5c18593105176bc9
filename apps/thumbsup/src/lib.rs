//! ThumbsUp control core: the root controller, the gamepad boundary, the
//! radio failsafe and the boot self-test, with a simulated board build for
//! host runs.
pub mod controller;
pub mod failsafe;
pub mod gamepad;
pub mod selftest;
pub mod sim;
pub mod status;
pub mod store;

pub use controller::{ControllerConfig, RadioLink, RobotBoard, RobotController};
pub use gamepad::{GamepadAdapter, GamepadState, HidAdapter, HidReport};
pub use selftest::SelfTestReport;
pub use status::SystemState;
pub use store::FileBlobStore;
