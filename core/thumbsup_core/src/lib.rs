pub mod channel;
pub mod config;
pub mod error;
pub mod freeze;
pub mod hw;

pub use channel::MotorChannel;
pub use error::{ErrorKind, TuError, TuResult};
pub use thumbsup_clock as clock;

pub mod prelude {
    pub use crate::channel::MotorChannel;
    pub use crate::clock::{Deadline, RobotClock, RobotClockMock, TuDuration, TuTime};
    pub use crate::config::{getcfg, ComponentConfig, RobotConfig};
    pub use crate::error::{ErrorKind, TuError, TuResult};
    pub use crate::freeze::{freeze_to_vec, thaw_from_slice, Freezable};
    pub use crate::hw::*;
}
