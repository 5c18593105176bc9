//! Gamepad boundary. The radio stack hands over its own report type; a
//! [`GamepadAdapter`] turns it into the neutral [`GamepadState`] the
//! controller works with.
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thumbsup_core::clock::{TuDuration, TuTime};
use tu_drive::STICK_MAX;

pub const BUTTON_A: u16 = 0x0001;
pub const BUTTON_B: u16 = 0x0002;
pub const BUTTON_X: u16 = 0x0004;
pub const BUTTON_Y: u16 = 0x0008;
pub const BUTTON_L1: u16 = 0x0010;
pub const BUTTON_R1: u16 = 0x0020;
pub const BUTTON_BACK: u16 = 0x0040;
pub const BUTTON_START: u16 = 0x0080;
pub const BUTTON_L3: u16 = 0x0100;
pub const BUTTON_R3: u16 = 0x0200;

pub const ARM_COMBO: u16 = BUTTON_X | BUTTON_Y;
pub const ESTOP_COMBO: u16 = BUTTON_L1 | BUTTON_R1;
pub const TRIM_COMBO: u16 = BUTTON_L3 | BUTTON_R3;

pub const AXIS_MIN: i32 = -512;
pub const AXIS_MAX: i32 = 511;
pub const AXIS_DEADZONE: i32 = 50;
pub const TRIGGER_MAX: i32 = 1023;
/// Trigger travel ignored before the weapon responds.
pub const TRIGGER_THRESHOLD: i32 = 80;
pub const BUTTON_DEBOUNCE: TuDuration = TuDuration::from_millis(100);

/// One normalized gamepad frame. Axes are in `[-512, 511]` with Y growing
/// downwards, triggers in `[0, 1023]`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct GamepadState {
    pub axis_x: i32,
    pub axis_y: i32,
    pub axis_rx: i32,
    pub axis_ry: i32,
    pub brake: i32,
    pub throttle: i32,
    pub buttons: u16,
}

impl GamepadState {
    pub fn with_buttons(mut self, buttons: u16) -> Self {
        self.buttons = buttons;
        self
    }

    /// True when every button of `mask` is down.
    pub fn held(&self, mask: u16) -> bool {
        self.buttons & mask == mask
    }

    /// Left stick forward on the `±127` drive scale. Pushing up is positive.
    pub fn forward(&self) -> i32 {
        axis_to_stick(self.axis_y.saturating_neg())
    }

    pub fn turn(&self) -> i32 {
        axis_to_stick(self.axis_x)
    }

    /// Right trigger as a weapon speed request in percent.
    pub fn weapon_percent(&self) -> i32 {
        trigger_to_percent(self.throttle)
    }
}

/// Deadzone, then `±512` onto `±127`.
pub fn axis_to_stick(value: i32) -> i32 {
    let value = value.clamp(-AXIS_MAX - 1, AXIS_MAX + 1);
    if value.abs() < AXIS_DEADZONE {
        return 0;
    }
    (value * STICK_MAX / (AXIS_MAX + 1)).clamp(-STICK_MAX, STICK_MAX)
}

pub fn trigger_to_percent(value: i32) -> i32 {
    let value = value.clamp(0, TRIGGER_MAX);
    if value <= TRIGGER_THRESHOLD {
        return 0;
    }
    value * 100 / TRIGGER_MAX
}

/// Converts whatever the radio stack produces into a [`GamepadState`].
pub trait GamepadAdapter {
    type Report;

    fn adapt(&self, report: &Self::Report) -> GamepadState;
}

/// Report layout of plain HID gamepads: 8 bit axes centred on 128 and
/// 8 bit analog triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HidReport {
    pub x: u8,
    pub y: u8,
    pub rx: u8,
    pub ry: u8,
    pub l2: u8,
    pub r2: u8,
    pub buttons: u16,
}

impl Default for HidReport {
    fn default() -> Self {
        HidReport {
            x: 128,
            y: 128,
            rx: 128,
            ry: 128,
            l2: 0,
            r2: 0,
            buttons: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HidAdapter;

impl HidAdapter {
    fn axis(raw: u8) -> i32 {
        (raw as i32 - 128) * 4
    }

    fn trigger(raw: u8) -> i32 {
        raw as i32 * TRIGGER_MAX / u8::MAX as i32
    }
}

impl GamepadAdapter for HidAdapter {
    type Report = HidReport;

    fn adapt(&self, report: &HidReport) -> GamepadState {
        GamepadState {
            axis_x: Self::axis(report.x),
            axis_y: Self::axis(report.y),
            axis_rx: Self::axis(report.rx),
            axis_ry: Self::axis(report.ry),
            brake: Self::trigger(report.l2),
            throttle: Self::trigger(report.r2),
            buttons: report.buttons,
        }
    }
}

/// Transitions accepted by the debouncer during one update.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEdges {
    pub pressed: u16,
    pub released: u16,
}

impl ButtonEdges {
    pub fn pressed(&self, mask: u16) -> bool {
        self.pressed & mask != 0
    }
}

/// Per button debounce: a transition is only accepted once the window has
/// passed since that button's previous accepted transition.
#[derive(Debug, Clone)]
pub struct ButtonDebouncer {
    window: TuDuration,
    stable: u16,
    last_change: [Option<TuTime>; 16],
}

impl Default for ButtonDebouncer {
    fn default() -> Self {
        Self::new(BUTTON_DEBOUNCE)
    }
}

impl ButtonDebouncer {
    pub fn new(window: TuDuration) -> Self {
        ButtonDebouncer {
            window,
            stable: 0,
            last_change: [None; 16],
        }
    }

    pub fn update(&mut self, raw: u16, now: TuTime) -> ButtonEdges {
        let mut edges = ButtonEdges::default();
        let changed = raw ^ self.stable;
        for bit in 0..16 {
            let mask = 1u16 << bit;
            if changed & mask == 0 {
                continue;
            }
            let settled = self.last_change[bit]
                .is_none_or(|at| now.saturating_sub(at) >= self.window);
            if !settled {
                continue;
            }
            self.last_change[bit] = Some(now);
            self.stable ^= mask;
            if raw & mask != 0 {
                edges.pressed |= mask;
            } else {
                edges.released |= mask;
            }
        }
        edges
    }

    /// Debounced button mask.
    pub fn stable(&self) -> u16 {
        self.stable
    }

    pub fn held(&self, mask: u16) -> bool {
        self.stable & mask == mask
    }
}
