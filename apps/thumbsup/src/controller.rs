//! The root context. One `RobotController` owns every subsystem and runs
//! the 10 ms control tick.
use crate::failsafe::{LinkMonitor, FAILSAFE_TIMEOUT};
use crate::gamepad::{
    ButtonDebouncer, ButtonEdges, GamepadAdapter, GamepadState, ARM_COMBO, BUTTON_A, BUTTON_B,
    BUTTON_DEBOUNCE, BUTTON_START, ESTOP_COMBO, TRIM_COMBO,
};
use crate::selftest::{self, SelfTestReport};
use crate::status::{patterns, SystemState};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thumbsup_core::clock::{RobotClock, TuDuration, TuTime};
use thumbsup_core::config::{getcfg, ComponentConfig};
use thumbsup_core::hw::{BlobStore, BoardSensors, SafetyFacts, StatusIndicator, Watchdog};
use thumbsup_core::{ErrorKind, MotorChannel, TuError, TuResult};
use tu_drive::{DriveMixer, DriveOutput, TrimCalibrator, STICK_MAX};
use tu_weapon::{
    BatteryStatus, EStopHandle, SharedTransports, WeaponBoard, WeaponState, WeaponStateMachine,
    WeaponTransports,
};

pub const LOOP_PERIOD: TuDuration = TuDuration::from_millis(10);
pub const BATTERY_CHECK_INTERVAL: TuDuration = TuDuration::from_millis(1_000);
/// How long L3+R3 must be held to enter or leave trim mode.
pub const TRIM_HOLD: TuDuration = TuDuration::from_millis(2_000);

/// Everything the controller needs from a board on top of the weapon seams.
pub trait RobotBoard: WeaponBoard {
    type Aux: BoardSensors + Watchdog + StatusIndicator;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub loop_period: TuDuration,
    pub battery_check_interval: TuDuration,
    pub failsafe_timeout: TuDuration,
    pub trim_hold: TuDuration,
    pub debounce: TuDuration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            loop_period: LOOP_PERIOD,
            battery_check_interval: BATTERY_CHECK_INTERVAL,
            failsafe_timeout: FAILSAFE_TIMEOUT,
            trim_hold: TRIM_HOLD,
            debounce: BUTTON_DEBOUNCE,
        }
    }
}

impl ControllerConfig {
    pub fn from_config(config: Option<&ComponentConfig>) -> TuResult<Self> {
        let defaults = ControllerConfig::default();
        let ms = |key: &str, default: TuDuration| -> TuResult<TuDuration> {
            let value: u64 = getcfg(config, key, default.as_millis())?;
            if value == 0 {
                return Err(TuError::new(
                    ErrorKind::InvalidParam,
                    format!("controller {key} must be above zero"),
                ));
            }
            Ok(TuDuration::from_millis(value))
        };
        Ok(ControllerConfig {
            loop_period: ms("loop_period_ms", defaults.loop_period)?,
            battery_check_interval: ms("battery_check_interval_ms", defaults.battery_check_interval)?,
            failsafe_timeout: ms("failsafe_timeout_ms", defaults.failsafe_timeout)?,
            trim_hold: ms("trim_hold_ms", defaults.trim_hold)?,
            debounce: ms("debounce_ms", defaults.debounce)?,
        })
    }
}

type LatestFrame = Option<(GamepadState, TuTime)>;

/// Entry point for the radio context. Frames are stamped on arrival and
/// picked up by the next tick; the stop combo acts immediately.
pub struct RadioLink<B: WeaponBoard> {
    latest: Arc<Mutex<LatestFrame>>,
    clock: RobotClock,
    estop: EStopHandle<B>,
}

impl<B: WeaponBoard> Clone for RadioLink<B> {
    fn clone(&self) -> Self {
        RadioLink {
            latest: Arc::clone(&self.latest),
            clock: self.clock.clone(),
            estop: self.estop.clone(),
        }
    }
}

impl<B: WeaponBoard> RadioLink<B> {
    fn new(clock: RobotClock, estop: EStopHandle<B>) -> Self {
        RadioLink {
            latest: Arc::new(Mutex::new(None)),
            clock,
            estop,
        }
    }

    pub fn submit(&self, state: GamepadState) {
        if state.held(ESTOP_COMBO) {
            self.estop.trigger();
        }
        let now = self.clock.now();
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some((state, now));
    }

    pub fn submit_report<A: GamepadAdapter>(&self, adapter: &A, report: &A::Report) {
        self.submit(adapter.adapt(report));
    }

    fn latest(&self) -> LatestFrame {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RobotController<B: RobotBoard, S: BlobStore> {
    pub(crate) config: ControllerConfig,
    pub(crate) clock: RobotClock,
    pub(crate) weapon: WeaponStateMachine<B>,
    pub(crate) transports: SharedTransports<B>,
    pub(crate) mixer: DriveMixer,
    pub(crate) trim: TrimCalibrator,
    store: S,
    pub(crate) aux: B::Aux,
    link: RadioLink<B>,
    monitor: LinkMonitor,
    debouncer: ButtonDebouncer,
    state: SystemState,
    battery_mv: u32,
    safety_button: bool,
    last_battery_check: Option<TuTime>,
    trim_hold_started: Option<TuTime>,
    trim_hold_consumed: bool,
    drive_stopped: bool,
    drive: DriveOutput,
    ticks: u64,
    self_test: Option<SelfTestReport>,
}

fn lock<B: WeaponBoard>(transports: &SharedTransports<B>) -> MutexGuard<'_, WeaponTransports<B>> {
    transports.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: RobotBoard, S: BlobStore> RobotController<B, S> {
    /// Loads the stored trim; a missing or corrupt record means zero trim.
    pub fn new(
        weapon: WeaponStateMachine<B>,
        mixer: DriveMixer,
        mut aux: B::Aux,
        store: S,
        clock: RobotClock,
        config: ControllerConfig,
    ) -> Self {
        let mut trim = TrimCalibrator::new();
        if let Err(e) = trim.load(&store) {
            warn!("controller: stored trim rejected, driving untrimmed: {e}");
        }
        let battery_mv = aux.battery_voltage_mv();
        let transports = weapon.transports();
        let link = RadioLink::new(clock.clone(), weapon.estop_handle());
        RobotController {
            config,
            clock,
            weapon,
            transports,
            mixer,
            trim,
            store,
            aux,
            link,
            monitor: LinkMonitor::new(config.failsafe_timeout),
            debouncer: ButtonDebouncer::new(config.debounce),
            state: SystemState::Booting,
            battery_mv,
            safety_button: false,
            last_battery_check: None,
            trim_hold_started: None,
            trim_hold_consumed: false,
            drive_stopped: false,
            drive: DriveOutput::STOP,
            ticks: 0,
            self_test: None,
        }
    }

    /// Runs the boot self-test. A failure halts the controller for good.
    pub fn boot(&mut self) -> TuResult<()> {
        if self.state != SystemState::Booting {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                format!("boot requested while {}", self.state),
            ));
        }
        info!("controller: running boot self-test");
        let report = selftest::run(self);
        let passed = report.passed();
        self.self_test = Some(report);
        if !passed {
            self.halt();
            return Err(TuError::new(
                ErrorKind::HardwareFault,
                "boot self-test failed, controller halted",
            ));
        }
        // the emergency stop check leaves the weapon on pwm
        let mode = self.weapon.config().mode;
        if self.weapon.mode() != mode {
            if let Err(e) = self.weapon.set_control_mode(mode) {
                warn!("controller: weapon stays on pwm: {e}");
            }
        }
        self.state = SystemState::Ready;
        info!("controller: ready");
        Ok(())
    }

    fn halt(&mut self) {
        error!("controller: HALTED, do not operate");
        self.state = SystemState::Halted;
        self.weapon.emergency_stop();
        lock(&self.transports).pwm.stop_all();
        self.drive = DriveOutput::STOP;
        let (system, weapon) = patterns(self.state, self.weapon.state());
        self.aux.show(system, weapon);
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn weapon(&self) -> &WeaponStateMachine<B> {
        &self.weapon
    }

    pub fn weapon_mut(&mut self) -> &mut WeaponStateMachine<B> {
        &mut self.weapon
    }

    pub fn transports(&self) -> SharedTransports<B> {
        Arc::clone(&self.transports)
    }

    pub fn trim(&self) -> &TrimCalibrator {
        &self.trim
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn drive_output(&self) -> DriveOutput {
        self.drive
    }

    pub fn battery_mv(&self) -> u32 {
        self.battery_mv
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn self_test_report(&self) -> Option<&SelfTestReport> {
        self.self_test.as_ref()
    }

    /// Handle for the radio context.
    pub fn radio_link(&self) -> RadioLink<B> {
        self.link.clone()
    }

    /// One control iteration. Expected every `loop_period`.
    pub fn tick(&mut self) -> TuResult<()> {
        self.aux.feed();
        self.ticks += 1;
        let now = self.clock.now();

        if matches!(self.state, SystemState::Booting | SystemState::Halted) {
            self.hold_safe();
            self.show_status();
            return Ok(());
        }

        self.sample_sensors(now);

        let frame = self.link.latest();
        if let Some((_, at)) = frame {
            self.monitor.frame_received(at);
        }
        let failsafe = self.monitor.update(now);
        if failsafe && self.state != SystemState::Failsafe {
            self.enter_failsafe();
        } else if !failsafe && self.state == SystemState::Failsafe {
            self.state = if self.trim.is_active() {
                SystemState::Trim
            } else {
                SystemState::Ready
            };
            info!("controller: link restored, weapon stays disarmed");
        }

        let pad = match frame {
            Some((pad, _)) if !failsafe => pad,
            _ => GamepadState::default(),
        };
        let edges = self.debouncer.update(pad.buttons, now);
        let facts = self.safety_facts(failsafe);
        if !failsafe {
            self.handle_controls(&pad, edges, now, &facts);
        }

        if let Err(e) = self.weapon.update(&self.safety_facts(failsafe)) {
            warn!("controller: weapon update: {e}");
        }

        let drive = if failsafe || self.drive_stopped {
            DriveOutput::STOP
        } else {
            let trim = (!self.trim.is_active()).then_some(&self.trim);
            self.mixer.drive(pad.forward(), pad.turn(), trim)
        };
        self.write_drive(drive)?;
        self.show_status();
        Ok(())
    }

    fn safety_facts(&self, failsafe: bool) -> SafetyFacts {
        SafetyFacts {
            failsafe_active: failsafe,
            armed: self.weapon.is_live(),
            battery_mv: self.battery_mv,
            safety_button: self.safety_button,
        }
    }

    fn sample_sensors(&mut self, now: TuTime) {
        self.safety_button = self.aux.safety_button_pressed();
        let due = self
            .last_battery_check
            .is_none_or(|at| now.saturating_sub(at) >= self.config.battery_check_interval);
        if !due {
            return;
        }
        self.last_battery_check = Some(now);
        self.battery_mv = self.aux.battery_voltage_mv();
        match self.weapon.safety().battery_status(self.battery_mv) {
            BatteryStatus::Critical if self.weapon.is_live() => {
                error!("controller: battery critical at {} mV, disarming", self.battery_mv);
                self.weapon.disarm();
            }
            BatteryStatus::Critical | BatteryStatus::Low => {
                debug!("controller: battery {} mV", self.battery_mv);
            }
            BatteryStatus::Ok => {}
        }
    }

    fn enter_failsafe(&mut self) {
        warn!("controller: FAILSAFE, drive stopped and weapon disarmed");
        self.state = SystemState::Failsafe;
        self.weapon.disarm();
        self.trim_hold_started = None;
        self.drive = DriveOutput::STOP;
    }

    fn handle_controls(
        &mut self,
        pad: &GamepadState,
        edges: ButtonEdges,
        now: TuTime,
        facts: &SafetyFacts,
    ) {
        // raw frame, not debounced: a stop must never wait
        if pad.held(ESTOP_COMBO) {
            self.weapon.emergency_stop();
            if !self.drive_stopped {
                warn!("controller: emergency stop from gamepad");
                lock(&self.transports).pwm.emergency_stop();
                self.drive_stopped = true;
            }
            return;
        }

        if edges.pressed(BUTTON_START) {
            self.recover();
        }

        self.check_trim_hold(now);

        if self.trim.is_active() {
            if edges.pressed(BUTTON_A) {
                let speed = pad.forward() * 100 / STICK_MAX;
                let offset = pad.turn() * 100 / STICK_MAX;
                match self.trim.capture(speed, offset) {
                    Ok(()) => info!(
                        "trim: sample {} at {}% speed, {}% offset",
                        self.trim.sample_count(),
                        speed,
                        offset
                    ),
                    Err(e) => warn!("trim: sample refused: {e}"),
                }
            }
            if edges.pressed(BUTTON_B) {
                if let Some(sample) = self.trim.remove_last_sample() {
                    info!("trim: removed sample {:?}", sample);
                }
            }
        } else if edges.pressed(BUTTON_B) {
            self.weapon.disarm();
        }

        if self.debouncer.held(ARM_COMBO) && edges.pressed & ARM_COMBO != 0 {
            if self.trim.is_active() {
                warn!("controller: arming refused during trim calibration");
            } else if let Err(e) = self.weapon.arm(facts) {
                warn!("controller: arm refused: {e}");
            }
        }

        if self.weapon.state().can_actuate() {
            if let Err(e) = self.weapon.set_speed(pad.weapon_percent()) {
                debug!("controller: weapon speed ignored: {e}");
            }
        }
    }

    /// START: leaves an emergency stop and brings the drive outputs back.
    fn recover(&mut self) {
        if !self.drive_stopped && self.weapon.state() != WeaponState::EmergencyStop {
            return;
        }
        info!("controller: recovering from emergency stop");
        if self.weapon.state() == WeaponState::EmergencyStop {
            if let Err(e) = self.weapon.reinit() {
                error!("controller: weapon reinit failed: {e}");
                return;
            }
        }
        lock(&self.transports).pwm.resume();
        self.drive_stopped = false;
    }

    fn check_trim_hold(&mut self, now: TuTime) {
        if !self.debouncer.held(TRIM_COMBO) {
            self.trim_hold_started = None;
            self.trim_hold_consumed = false;
            return;
        }
        let Some(started) = self.trim_hold_started else {
            self.trim_hold_started = Some(now);
            return;
        };
        if self.trim_hold_consumed || now.saturating_sub(started) < self.config.trim_hold {
            return;
        }
        self.trim_hold_consumed = true;
        self.toggle_trim();
    }

    fn toggle_trim(&mut self) {
        if self.trim.is_active() {
            match self.trim.exit(&mut self.store) {
                Ok(points) => info!("trim: curve of {points} points saved"),
                Err(e) => warn!("trim: not saved: {e}"),
            }
            self.state = SystemState::Ready;
            return;
        }
        if self.weapon.state() != WeaponState::Disarmed {
            warn!("trim: calibration needs a disarmed weapon");
            return;
        }
        self.trim.enter();
        self.state = SystemState::Trim;
    }

    /// Clears the trim curve, in memory and in the store.
    pub fn reset_trim(&mut self) -> TuResult<()> {
        self.trim.reset(&mut self.store)
    }

    fn write_drive(&mut self, drive: DriveOutput) -> TuResult<()> {
        self.drive = drive;
        let mut transports = lock(&self.transports);
        transports.pwm.set_speed(MotorChannel::LeftDrive, drive.left)?;
        transports.pwm.set_speed(MotorChannel::RightDrive, drive.right)?;
        transports.pwm.update();
        Ok(())
    }

    fn hold_safe(&mut self) {
        self.drive = DriveOutput::STOP;
        let mut transports = lock(&self.transports);
        for channel in [MotorChannel::LeftDrive, MotorChannel::RightDrive] {
            if let Err(e) = transports.pwm.force_safe(channel) {
                error!("controller: {channel} not parked: {e}");
            }
        }
    }

    fn show_status(&mut self) {
        let (system, weapon) = patterns(self.state, self.weapon.state());
        self.aux.show(system, weapon);
    }
}
