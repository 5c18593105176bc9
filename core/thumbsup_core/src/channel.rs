use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// One physical motor output. Each owns one signal pin which is driven by
/// exactly one transport at a time (PWM slice, DShot executor or UART).
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize, Deserialize,
)]
pub enum MotorChannel {
    LeftDrive,
    RightDrive,
    Weapon,
}

impl MotorChannel {
    pub const COUNT: usize = 3;
    pub const ALL: [MotorChannel; MotorChannel::COUNT] = [
        MotorChannel::LeftDrive,
        MotorChannel::RightDrive,
        MotorChannel::Weapon,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            MotorChannel::LeftDrive => 0,
            MotorChannel::RightDrive => 1,
            MotorChannel::Weapon => 2,
        }
    }

    #[inline]
    pub const fn is_drive(self) -> bool {
        !matches!(self, MotorChannel::Weapon)
    }
}

impl Display for MotorChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MotorChannel::LeftDrive => "left-drive",
            MotorChannel::RightDrive => "right-drive",
            MotorChannel::Weapon => "weapon",
        };
        write!(f, "{name}")
    }
}
