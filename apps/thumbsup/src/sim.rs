//! The controller wired to the simulated board, plus scripted gamepad runs.
use crate::controller::{ControllerConfig, RobotBoard, RobotController};
use crate::gamepad::{HidAdapter, HidReport, ARM_COMBO, BUTTON_A, BUTTON_B, TRIM_COMBO};
use crate::status::SystemState;
use clap::ValueEnum;
use log::info;
use std::fmt::{self, Display, Formatter};
use thumbsup_core::config::RobotConfig;
use thumbsup_core::hw::BlobStore;
use thumbsup_core::{MotorChannel, TuResult};
use tu_drive::{DriveConfig, DriveMixer, DriveOutput};
use tu_dshot::DshotEngine;
use tu_esc_config::{EscConfigChannel, EscLinkConfig};
use tu_pwm::{PwmOutput, PwmOutputConfig};
use tu_sim::SimBoard;
use tu_weapon::{
    SafetyConfig, WeaponBoard, WeaponConfig, WeaponState, WeaponStateMachine, WeaponTransports,
};

/// Every seam backed by the same [`SimBoard`].
pub struct SimRobot;

impl WeaponBoard for SimRobot {
    type Pwm = SimBoard;
    type Dshot = SimBoard;
    type Serial = SimBoard;
    type Pin = SimBoard;
}

impl RobotBoard for SimRobot {
    type Aux = SimBoard;
}

pub type SimController<S> = RobotController<SimRobot, S>;

/// Builds the whole robot on `board`, reading each component's section of `config`.
pub fn build_sim_controller<S: BlobStore>(
    board: &SimBoard,
    store: S,
    config: &RobotConfig,
) -> TuResult<SimController<S>> {
    let pwm = PwmOutput::new(
        board.clone(),
        &MotorChannel::ALL,
        PwmOutputConfig::from_config(config.component("pwm"))?,
    )?;
    let dshot = DshotEngine::new(board.clone(), board.clock());
    let esc = EscConfigChannel::new(
        board.clone(),
        board.clone(),
        board.clock(),
        MotorChannel::Weapon,
        EscLinkConfig::from_config(config.component("esc_link"))?,
    );
    let weapon = WeaponStateMachine::new(
        WeaponTransports::new(pwm, dshot, esc),
        board.clone(),
        board.clock(),
        WeaponConfig::from_config(config.component("weapon"))?,
        SafetyConfig::from_config(config.component("safety"))?,
    )?;
    let mixer = DriveMixer::new(DriveConfig::from_config(config.component("drive"))?);
    let controller_config = ControllerConfig::from_config(config.component("controller"))?;
    Ok(RobotController::new(
        weapon,
        mixer,
        board.clone(),
        store,
        board.clock(),
        controller_config,
    ))
}

/// Canned driver inputs, one HID report per 10 ms tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Script {
    /// Arm with X+Y, wait out the arming delay, spin up on the trigger, disarm with B.
    ArmAndSpin,
    /// Forward, spin in place, reverse.
    Drive,
    /// Drive for a second, then the radio goes quiet.
    Failsafe,
    /// Record a trim curve with L3+R3 and A.
    Trim,
}

impl Script {
    pub fn default_ticks(&self) -> u64 {
        match self {
            Script::ArmAndSpin => 1_100,
            Script::Drive => 400,
            Script::Failsafe => 400,
            Script::Trim => 1_000,
        }
    }

    /// The report sent before tick `tick`, or `None` when the radio is silent.
    pub fn report(&self, tick: u64) -> Option<HidReport> {
        let idle = HidReport::default();
        let report = match self {
            Script::ArmAndSpin => match tick {
                50..70 => HidReport {
                    buttons: ARM_COMBO,
                    ..idle
                },
                600..900 => HidReport {
                    r2: ((tick - 600) * 255 / 150).min(255) as u8,
                    ..idle
                },
                1_000..1_010 => HidReport {
                    buttons: BUTTON_B,
                    ..idle
                },
                _ => idle,
            },
            Script::Drive => match tick {
                0..100 => HidReport { y: 0, ..idle },
                100..200 => HidReport { x: 255, ..idle },
                200..300 => HidReport { y: 255, ..idle },
                _ => idle,
            },
            Script::Failsafe => match tick {
                0..100 => HidReport { y: 64, ..idle },
                _ => return None,
            },
            Script::Trim => match tick {
                20..250 | 700..950 => HidReport {
                    buttons: TRIM_COMBO,
                    ..idle
                },
                300..660 => {
                    let step = (tick - 300) / 60;
                    let phase = (tick - 300) % 60;
                    HidReport {
                        y: 128 - 16 * (step as u8 + 2),
                        x: 142,
                        buttons: if (30..40).contains(&phase) { BUTTON_A } else { 0 },
                        ..idle
                    }
                }
                _ => idle,
            },
        };
        Some(report)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSummary {
    pub script: Script,
    pub ticks: u64,
    pub system: SystemState,
    pub weapon: WeaponState,
    pub peak_weapon_speed: u8,
    pub failsafe_ticks: u64,
    pub drive: DriveOutput,
    pub left_pulse_us: u16,
    pub right_pulse_us: u16,
    pub weapon_pulse_us: u16,
    pub trim_points: usize,
    pub watchdog_feeds: u64,
}

impl Display for SimulationSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "script:            {:?}", self.script)?;
        writeln!(f, "ticks:             {}", self.ticks)?;
        writeln!(f, "system state:      {}", self.system)?;
        writeln!(f, "weapon state:      {}", self.weapon)?;
        writeln!(f, "peak weapon speed: {}%", self.peak_weapon_speed)?;
        writeln!(f, "failsafe ticks:    {}", self.failsafe_ticks)?;
        writeln!(
            f,
            "drive:             left {}% right {}%",
            self.drive.left, self.drive.right
        )?;
        writeln!(
            f,
            "pulses:            left {} us, right {} us, weapon {} us",
            self.left_pulse_us, self.right_pulse_us, self.weapon_pulse_us
        )?;
        writeln!(f, "trim points:       {}", self.trim_points)?;
        write!(f, "watchdog feeds:    {}", self.watchdog_feeds)
    }
}

/// Plays `script` for `ticks` loop periods against a booted controller.
pub fn run_script<S: BlobStore>(
    controller: &mut SimController<S>,
    board: &SimBoard,
    script: Script,
    ticks: u64,
) -> TuResult<SimulationSummary> {
    let link = controller.radio_link();
    let adapter = HidAdapter;
    let period = controller.config().loop_period;
    let mut peak_weapon_speed = 0;
    let mut failsafe_ticks = 0;
    info!("sim: running {script:?} for {ticks} ticks");
    for tick in 0..ticks {
        if let Some(report) = script.report(tick) {
            link.submit_report(&adapter, &report);
        }
        board.mock().advance_micros(period.as_micros());
        controller.tick()?;
        peak_weapon_speed = peak_weapon_speed.max(controller.weapon().current_speed());
        if controller.state() == SystemState::Failsafe {
            failsafe_ticks += 1;
        }
    }
    Ok(SimulationSummary {
        script,
        ticks,
        system: controller.state(),
        weapon: controller.weapon().state(),
        peak_weapon_speed,
        failsafe_ticks,
        drive: controller.drive_output(),
        left_pulse_us: board.pwm_pulse(MotorChannel::LeftDrive),
        right_pulse_us: board.pwm_pulse(MotorChannel::RightDrive),
        weapon_pulse_us: board.pwm_pulse(MotorChannel::Weapon),
        trim_points: controller.trim().fitted().len(),
        watchdog_feeds: board.watchdog_feeds(),
    })
}
