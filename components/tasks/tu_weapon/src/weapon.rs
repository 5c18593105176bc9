use crate::safety::{SafetyConfig, SafetyMonitor, SafetyViolation};
use bincode::de::Decoder;
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use thumbsup_core::clock::{RobotClock, TuDuration, TuTime};
use thumbsup_core::config::{getcfg, ComponentConfig};
use thumbsup_core::freeze::Freezable;
use thumbsup_core::hw::{DshotHal, PinFunction, PwmHal, SafetyInputs, SerialPort, SignalPin};
use thumbsup_core::{ErrorKind, MotorChannel, TuError, TuResult};
use tu_drive::expo_percent;
use tu_dshot::{erpm_to_rpm, throttle_from_unsigned_percent, DshotConfig, DshotEngine, TelemetryFrame};
use tu_esc_config::{EscConfigChannel, EscInfo, EscSettings};
use tu_pwm::PwmOutput;

pub const WEAPON_ARM_TIMEOUT: TuDuration = TuDuration::from_millis(5_000);
pub const WEAPON_RAMP_INTERVAL: TuDuration = TuDuration::from_millis(40);
pub const WEAPON_RAMP_STEP: u8 = 2;
pub const WEAPON_EXPO: u8 = 20;
pub const MAX_WEAPON_SPEED: u8 = 100;

const WEAPON: MotorChannel = MotorChannel::Weapon;

/// The hardware a weapon drives, one associated type per seam.
pub trait WeaponBoard {
    type Pwm: PwmHal;
    type Dshot: DshotHal;
    type Serial: SerialPort;
    type Pin: SignalPin;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum WeaponState {
    Disarmed,
    Arming,
    Armed,
    Spinning,
    EmergencyStop,
}

impl WeaponState {
    /// States in which safety is re-checked every tick.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            WeaponState::Arming | WeaponState::Armed | WeaponState::Spinning
        )
    }

    /// States in which the weapon may receive a non-zero command.
    pub fn can_actuate(&self) -> bool {
        matches!(self, WeaponState::Armed | WeaponState::Spinning)
    }
}

impl Display for WeaponState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            WeaponState::Disarmed => "DISARMED",
            WeaponState::Arming => "ARMING",
            WeaponState::Armed => "ARMED",
            WeaponState::Spinning => "SPINNING",
            WeaponState::EmergencyStop => "EMERGENCY_STOP",
        };
        f.write_str(name)
    }
}

/// Which transport owns the weapon signal pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum WeaponControlMode {
    Pwm,
    Dshot,
    Config,
}

impl Display for WeaponControlMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            WeaponControlMode::Pwm => "pwm",
            WeaponControlMode::Dshot => "dshot",
            WeaponControlMode::Config => "config",
        };
        f.write_str(name)
    }
}

impl FromStr for WeaponControlMode {
    type Err = TuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pwm" => Ok(WeaponControlMode::Pwm),
            "dshot" => Ok(WeaponControlMode::Dshot),
            "config" => Ok(WeaponControlMode::Config),
            other => Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("unknown weapon mode '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeaponConfig {
    pub arm_timeout: TuDuration,
    pub ramp_interval: TuDuration,
    pub ramp_step: u8,
    pub expo: u8,
    pub max_speed: u8,
    pub mode: WeaponControlMode,
    pub dshot: DshotConfig,
}

impl Default for WeaponConfig {
    fn default() -> Self {
        WeaponConfig {
            arm_timeout: WEAPON_ARM_TIMEOUT,
            ramp_interval: WEAPON_RAMP_INTERVAL,
            ramp_step: WEAPON_RAMP_STEP,
            expo: WEAPON_EXPO,
            max_speed: MAX_WEAPON_SPEED,
            mode: WeaponControlMode::Pwm,
            dshot: DshotConfig::default(),
        }
    }
}

impl WeaponConfig {
    /// Keys: `arm_timeout_ms`, `ramp_interval_ms`, `ramp_step`, `expo`,
    /// `max_speed`, `mode` plus the DShot keys of [`DshotConfig`].
    pub fn from_config(config: Option<&ComponentConfig>) -> TuResult<Self> {
        let defaults = WeaponConfig::default();
        let arm_timeout_ms: u64 =
            getcfg(config, "arm_timeout_ms", defaults.arm_timeout.as_millis())?;
        let ramp_interval_ms: u64 =
            getcfg(config, "ramp_interval_ms", defaults.ramp_interval.as_millis())?;
        let ramp_step: u8 = getcfg(config, "ramp_step", defaults.ramp_step)?;
        let expo: u8 = getcfg(config, "expo", defaults.expo)?;
        let max_speed: u8 = getcfg(config, "max_speed", defaults.max_speed)?;
        let mode: String = getcfg(config, "mode", defaults.mode.to_string())?;
        let mode: WeaponControlMode = mode.parse()?;

        if ramp_step == 0 || ramp_step > 100 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("weapon ramp_step {ramp_step} is outside 1..=100"),
            ));
        }
        if expo > 100 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("weapon expo {expo} is above 100"),
            ));
        }
        if max_speed > 100 {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                format!("weapon max_speed {max_speed} is above 100"),
            ));
        }
        if mode == WeaponControlMode::Config {
            return Err(TuError::new(
                ErrorKind::InvalidParam,
                "the weapon cannot start in config mode",
            ));
        }
        Ok(WeaponConfig {
            arm_timeout: TuDuration::from_millis(arm_timeout_ms),
            ramp_interval: TuDuration::from_millis(ramp_interval_ms),
            ramp_step,
            expo,
            max_speed,
            mode,
            dshot: DshotConfig::from_config(config)?,
        })
    }
}

/// Every transport able to drive the weapon pin. Only the one matching
/// `mode` owns the pin at any time.
pub struct WeaponTransports<B: WeaponBoard> {
    pub pwm: PwmOutput<B::Pwm>,
    pub dshot: DshotEngine<B::Dshot>,
    pub esc: EscConfigChannel<B::Serial, B::Pin>,
    mode: WeaponControlMode,
}

impl<B: WeaponBoard> WeaponTransports<B> {
    /// The PWM output is expected to hold the weapon channel already.
    pub fn new(
        pwm: PwmOutput<B::Pwm>,
        dshot: DshotEngine<B::Dshot>,
        esc: EscConfigChannel<B::Serial, B::Pin>,
    ) -> Self {
        WeaponTransports {
            pwm,
            dshot,
            esc,
            mode: WeaponControlMode::Pwm,
        }
    }

    pub fn mode(&self) -> WeaponControlMode {
        self.mode
    }

    fn dispatch_speed(&mut self, speed: u8) -> TuResult<()> {
        match self.mode {
            WeaponControlMode::Pwm => self.pwm.set_speed(WEAPON, speed as i32),
            WeaponControlMode::Dshot => {
                self.dshot
                    .send_throttle(WEAPON, throttle_from_unsigned_percent(speed as i32), false)
            }
            WeaponControlMode::Config => Ok(()),
        }
    }

    fn dispatch_off(&mut self) -> TuResult<()> {
        match self.mode {
            WeaponControlMode::Pwm => {
                self.pwm.set_weapon_enabled(false);
                self.pwm.force_safe(WEAPON)
            }
            WeaponControlMode::Dshot => self.dshot.send_throttle(WEAPON, 0, false),
            WeaponControlMode::Config => Ok(()),
        }
    }

    /// Silences the weapon through every transport, whatever `mode` says.
    fn silence_all(&mut self) {
        self.pwm.set_weapon_enabled(false);
        if let Err(e) = self.pwm.force_safe(WEAPON) {
            error!("weapon: pwm stop failed: {e}");
        }
        if self.dshot.is_initialized(WEAPON) {
            if let Err(e) = self.dshot.send_throttle(WEAPON, 0, false) {
                error!("weapon: dshot stop failed: {e}");
            }
        }
    }
}

pub type SharedTransports<B> = Arc<Mutex<WeaponTransports<B>>>;

fn lock_transports<B: WeaponBoard>(
    transports: &SharedTransports<B>,
) -> MutexGuard<'_, WeaponTransports<B>> {
    transports.lock().unwrap_or_else(PoisonError::into_inner)
}

fn park_pin<P: SignalPin>(pin: &mut P) {
    if let Err(e) = pin.set_function(WEAPON, PinFunction::Output) {
        error!("weapon: could not park pin: {e}");
    }
    pin.write_level(WEAPON, false);
}

/// Emergency stop usable from any context, including the radio callback.
/// It never blocks on the mode lock.
pub struct EStopHandle<B: WeaponBoard> {
    transports: SharedTransports<B>,
    pin: Arc<Mutex<B::Pin>>,
    requested: Arc<AtomicBool>,
}

impl<B: WeaponBoard> Clone for EStopHandle<B> {
    fn clone(&self) -> Self {
        EStopHandle {
            transports: Arc::clone(&self.transports),
            pin: Arc::clone(&self.pin),
            requested: Arc::clone(&self.requested),
        }
    }
}

impl<B: WeaponBoard> EStopHandle<B> {
    /// Tries every transport rather than only the active one: during a
    /// fault the recorded mode may not match what owns the pin. The pin is
    /// then forced low directly. The request stays latched for the state
    /// machine's next `update`.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        match self.transports.try_lock() {
            Ok(mut transports) => transports.silence_all(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().silence_all(),
            Err(TryLockError::WouldBlock) => {
                warn!("weapon: transports busy, emergency stop through raw pin only");
            }
        }
        match self.pin.try_lock() {
            Ok(mut pin) => park_pin(&mut *pin),
            Err(TryLockError::Poisoned(poisoned)) => park_pin(&mut *poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                error!("weapon: pin busy during emergency stop, relying on latched request");
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Arms, ramps and stops the weapon motor, and decides which transport
/// owns its pin.
pub struct WeaponStateMachine<B: WeaponBoard> {
    config: WeaponConfig,
    clock: RobotClock,
    safety: SafetyMonitor,
    transports: SharedTransports<B>,
    estop: EStopHandle<B>,
    state: WeaponState,
    current_speed: u8,
    target_speed: u8,
    arm_started: TuTime,
    last_ramp: TuTime,
    last_violation: Option<SafetyViolation>,
}

impl<B: WeaponBoard> WeaponStateMachine<B> {
    /// Starts Disarmed with PWM on the pin, then brings up the configured mode.
    /// A failed DShot bring-up is logged and leaves PWM in place.
    pub fn new(
        transports: WeaponTransports<B>,
        pin: B::Pin,
        clock: RobotClock,
        config: WeaponConfig,
        safety: SafetyConfig,
    ) -> TuResult<Self> {
        let transports = Arc::new(Mutex::new(transports));
        let estop = EStopHandle {
            transports: Arc::clone(&transports),
            pin: Arc::new(Mutex::new(pin)),
            requested: Arc::new(AtomicBool::new(false)),
        };
        let now = clock.now();
        let mut machine = WeaponStateMachine {
            config,
            clock,
            safety: SafetyMonitor::new(safety),
            transports,
            estop,
            state: WeaponState::Disarmed,
            current_speed: 0,
            target_speed: 0,
            arm_started: now,
            last_ramp: now,
            last_violation: None,
        };
        {
            let mut transports = lock_transports(&machine.transports);
            machine.bring_up(&mut transports, WeaponControlMode::Pwm)?;
            transports.mode = WeaponControlMode::Pwm;
        }
        if config.mode != WeaponControlMode::Pwm {
            if let Err(e) = machine.set_control_mode(config.mode) {
                warn!("weapon: starting in pwm mode: {e}");
            }
        }
        info!("weapon: initialized in {} mode", machine.mode());
        Ok(machine)
    }

    pub fn state(&self) -> WeaponState {
        self.state
    }

    pub fn mode(&self) -> WeaponControlMode {
        lock_transports(&self.transports).mode
    }

    pub fn current_speed(&self) -> u8 {
        self.current_speed
    }

    pub fn target_speed(&self) -> u8 {
        self.target_speed
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn config(&self) -> &WeaponConfig {
        &self.config
    }

    pub fn safety(&self) -> &SafetyMonitor {
        &self.safety
    }

    pub fn last_violation(&self) -> Option<SafetyViolation> {
        self.last_violation
    }

    pub fn estop_handle(&self) -> EStopHandle<B> {
        self.estop.clone()
    }

    /// The transports behind the mode lock. Drive outputs share the PWM
    /// output, so the control loop writes them through this as well.
    pub fn transports(&self) -> SharedTransports<B> {
        Arc::clone(&self.transports)
    }

    pub fn arm(&mut self, inputs: &impl SafetyInputs) -> TuResult<()> {
        if self.state != WeaponState::Disarmed {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                format!("cannot arm from {}", self.state),
            ));
        }
        if self.mode() == WeaponControlMode::Config {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                "cannot arm while the ESC link is in config mode",
            ));
        }
        self.safety.check_arm_conditions(inputs)?;
        self.safety.reset_warnings();
        self.current_speed = 0;
        self.target_speed = 0;
        self.arm_started = self.clock.now();
        self.state = WeaponState::Arming;
        info!("weapon: arming");
        Ok(())
    }

    /// Always succeeds. An emergency stop is only left through `reinit`.
    pub fn disarm(&mut self) {
        self.current_speed = 0;
        self.target_speed = 0;
        if let Err(e) = lock_transports(&self.transports).dispatch_off() {
            error!("weapon: stop on disarm failed: {e}");
        }
        if self.state == WeaponState::EmergencyStop {
            warn!("weapon: disarm ignored, emergency stop needs reinit");
            return;
        }
        if self.state != WeaponState::Disarmed {
            info!("weapon: disarmed");
        }
        self.state = WeaponState::Disarmed;
    }

    /// New ramp target in percent, shaped by the weapon expo.
    pub fn set_speed(&mut self, percent: i32) -> TuResult<()> {
        if !self.state.can_actuate() {
            return Err(TuError::new(
                ErrorKind::NotArmed,
                format!("weapon speed ignored while {}", self.state),
            ));
        }
        let percent = percent.clamp(0, self.config.max_speed as i32);
        self.target_speed = expo_percent(percent, self.config.expo).clamp(0, 100) as u8;
        Ok(())
    }

    /// One control tick.
    pub fn update(&mut self, inputs: &impl SafetyInputs) -> TuResult<()> {
        if self.estop.is_requested() && self.state != WeaponState::EmergencyStop {
            warn!("weapon: honouring latched emergency stop");
            self.emergency_stop();
            return Ok(());
        }
        self.estop.requested.store(false, Ordering::SeqCst);

        if self.state.is_live() {
            if let Err(violation) = self.safety.check_live(inputs) {
                error!("weapon: safety violation while {}: {}", self.state, violation);
                self.last_violation = Some(violation);
                self.emergency_stop();
                return Err(violation.into());
            }
        }

        let now = self.clock.now();
        match self.state {
            WeaponState::Arming => {
                if now.saturating_sub(self.arm_started) >= self.config.arm_timeout {
                    self.state = WeaponState::Armed;
                    self.last_ramp = now;
                    lock_transports(&self.transports).pwm.set_weapon_enabled(true);
                    info!("weapon: armed");
                }
                Ok(())
            }
            WeaponState::Armed | WeaponState::Spinning => {
                if self.current_speed != self.target_speed
                    && now.saturating_sub(self.last_ramp) >= self.config.ramp_interval
                {
                    self.current_speed = step_toward(
                        self.current_speed,
                        self.target_speed,
                        self.config.ramp_step,
                    );
                    self.last_ramp = now;
                    self.state = if self.current_speed > 0 {
                        WeaponState::Spinning
                    } else {
                        WeaponState::Armed
                    };
                    debug!("weapon: speed {}% ({})", self.current_speed, self.state);
                }
                let speed = self.current_speed;
                lock_transports(&self.transports)
                    .dispatch_speed(speed)
                    .map_err(|e| e.add_context("driving weapon"))
            }
            WeaponState::Disarmed => {
                self.current_speed = 0;
                self.target_speed = 0;
                lock_transports(&self.transports).dispatch_off()
            }
            WeaponState::EmergencyStop => {
                self.current_speed = 0;
                self.target_speed = 0;
                Ok(())
            }
        }
    }

    /// Idempotent. Runs the same all-transport path as [`EStopHandle::trigger`].
    pub fn emergency_stop(&mut self) {
        if self.state != WeaponState::EmergencyStop {
            error!("weapon: EMERGENCY STOP from {}", self.state);
        }
        self.state = WeaponState::EmergencyStop;
        self.current_speed = 0;
        self.target_speed = 0;
        self.estop.trigger();
        self.estop.requested.store(false, Ordering::SeqCst);
    }

    /// Leaves an emergency stop: PWM is brought back on the pin and the
    /// weapon is Disarmed.
    pub fn reinit(&mut self) -> TuResult<()> {
        info!("weapon: reinit from {}", self.state);
        self.current_speed = 0;
        self.target_speed = 0;
        self.safety.reset_warnings();
        self.last_violation = None;
        self.estop.requested.store(false, Ordering::SeqCst);
        {
            let mut transports = lock_transports(&self.transports);
            let old = transports.mode;
            self.tear_down(&mut transports, old);
            self.bring_up(&mut transports, WeaponControlMode::Pwm)?;
            transports.mode = WeaponControlMode::Pwm;
        }
        self.state = WeaponState::Disarmed;
        Ok(())
    }

    /// Hands the weapon pin to another transport. Only while Disarmed.
    /// A failed DShot or config bring-up falls back to PWM and reports the failure.
    pub fn set_control_mode(&mut self, mode: WeaponControlMode) -> TuResult<()> {
        if self.state != WeaponState::Disarmed {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                format!("cannot switch weapon mode while {}", self.state),
            ));
        }
        let mut transports = lock_transports(&self.transports);
        let old = transports.mode;
        if old == mode {
            return Ok(());
        }
        info!("weapon: switching {old} -> {mode}");
        self.tear_down(&mut transports, old);
        match self.bring_up(&mut transports, mode) {
            Ok(()) => {
                transports.mode = mode;
                Ok(())
            }
            Err(e) => {
                warn!("weapon: {mode} bring-up failed ({e}), falling back to pwm");
                self.tear_down(&mut transports, mode);
                self.bring_up(&mut transports, WeaponControlMode::Pwm)
                    .map_err(|fallback| fallback.add_context("pwm fallback after failed switch"))?;
                transports.mode = WeaponControlMode::Pwm;
                Err(e.add_context(&format!("switching weapon to {mode}")))
            }
        }
    }

    pub fn enable_dshot(&mut self) -> TuResult<()> {
        self.set_control_mode(WeaponControlMode::Dshot)
    }

    pub fn enable_pwm(&mut self) -> TuResult<()> {
        self.set_control_mode(WeaponControlMode::Pwm)
    }

    pub fn enter_config_mode(&mut self) -> TuResult<()> {
        self.set_control_mode(WeaponControlMode::Config)
    }

    fn with_pin<R>(&self, f: impl FnOnce(&mut B::Pin) -> R) -> R {
        let mut pin = self.estop.pin.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut pin)
    }

    fn tear_down(&self, transports: &mut WeaponTransports<B>, mode: WeaponControlMode) {
        match mode {
            WeaponControlMode::Pwm => {
                transports.pwm.set_weapon_enabled(false);
                if let Err(e) = transports.pwm.release(WEAPON) {
                    error!("weapon: pwm release failed: {e}");
                }
            }
            WeaponControlMode::Dshot => {
                if transports.dshot.is_initialized(WEAPON) {
                    if let Err(e) = transports.dshot.send_throttle(WEAPON, 0, false) {
                        warn!("weapon: final dshot frame failed: {e}");
                    }
                    transports.dshot.deinit(WEAPON);
                }
            }
            WeaponControlMode::Config => transports.esc.exit_config_mode(),
        }
        self.with_pin(park_pin);
        debug!("weapon: {mode} torn down, pin parked low");
    }

    fn bring_up(&self, transports: &mut WeaponTransports<B>, mode: WeaponControlMode) -> TuResult<()> {
        match mode {
            WeaponControlMode::Pwm => {
                self.with_pin(|pin| pin.set_function(WEAPON, PinFunction::Pwm))?;
                transports.pwm.claim(WEAPON)
            }
            WeaponControlMode::Dshot => {
                self.with_pin(|pin| pin.set_function(WEAPON, PinFunction::Dshot))?;
                transports.dshot.init(WEAPON, self.config.dshot)?;
                transports.dshot.send_throttle(WEAPON, 0, false)
            }
            WeaponControlMode::Config => transports.esc.enter_config_mode(),
        }
    }

    fn config_link(&self) -> TuResult<MutexGuard<'_, WeaponTransports<B>>> {
        let transports = lock_transports(&self.transports);
        if transports.mode != WeaponControlMode::Config {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                format!("ESC link needs config mode, weapon is in {}", transports.mode),
            ));
        }
        Ok(transports)
    }

    pub fn read_esc_settings(&self) -> TuResult<EscSettings> {
        self.config_link()?.esc.read_settings()
    }

    pub fn write_esc_settings(&self, settings: &EscSettings) -> TuResult<()> {
        let mut transports = self.config_link()?;
        transports.esc.write_settings(settings)?;
        transports.esc.save_settings()
    }

    /// Reads the ESC, applies the weapon defaults and saves them.
    pub fn apply_esc_weapon_defaults(&self) -> TuResult<EscSettings> {
        let mut transports = self.config_link()?;
        let mut settings = transports.esc.read_settings()?;
        settings.apply_weapon_defaults();
        transports.esc.write_settings(&settings)?;
        transports.esc.save_settings()?;
        info!("weapon: ESC weapon defaults saved");
        Ok(settings)
    }

    pub fn esc_info(&self) -> TuResult<EscInfo> {
        self.config_link()?.esc.get_info()
    }

    /// Flashes the ESC through its bootloader. The link is closed afterwards
    /// whatever the outcome, so the weapon is back in PWM mode.
    pub fn flash_esc_firmware(&mut self, image: &[u8]) -> TuResult<usize> {
        let result = {
            let mut transports = self.config_link()?;
            transports
                .esc
                .enter_bootloader()
                .and_then(|_| transports.esc.flash_firmware(image))
        };
        if let Err(e) = self.set_control_mode(WeaponControlMode::Pwm) {
            error!("weapon: could not restore pwm after flashing: {e}");
        }
        result
    }

    /// Latest fresh EDT frame for the weapon, DShot bidirectional only.
    pub fn telemetry(&self) -> TuResult<TelemetryFrame> {
        let mut transports = lock_transports(&self.transports);
        if transports.mode != WeaponControlMode::Dshot {
            return Err(TuError::new(
                ErrorKind::InvalidState,
                "weapon telemetry needs DShot mode",
            ));
        }
        while transports.dshot.read_telemetry(WEAPON)?.is_some() {}
        transports.dshot.get_telemetry(WEAPON)
    }

    pub fn weapon_rpm(&self) -> TuResult<u16> {
        let frame = self.telemetry()?;
        Ok(erpm_to_rpm(frame.erpm, self.config.dshot.pole_pairs))
    }
}

fn step_toward(current: u8, target: u8, step: u8) -> u8 {
    if target > current {
        current.saturating_add(step).min(target)
    } else {
        current.saturating_sub(step).max(target)
    }
}

impl<B: WeaponBoard> Freezable for WeaponStateMachine<B> {
    fn freeze<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        Encode::encode(&self.state, encoder)?;
        Encode::encode(&self.mode(), encoder)?;
        Encode::encode(&self.current_speed, encoder)?;
        Encode::encode(&self.target_speed, encoder)?;
        Encode::encode(&self.arm_started, encoder)?;
        Encode::encode(&self.last_ramp, encoder)?;
        Encode::encode(&self.last_violation, encoder)
    }

    /// The mode is hardware backed; thawing keeps the live one.
    fn thaw<D: Decoder>(&mut self, decoder: &mut D) -> Result<(), DecodeError> {
        self.state = Decode::decode(decoder)?;
        let _mode: WeaponControlMode = Decode::decode(decoder)?;
        self.current_speed = Decode::decode(decoder)?;
        self.target_speed = Decode::decode(decoder)?;
        self.arm_started = Decode::decode(decoder)?;
        self.last_ramp = Decode::decode(decoder)?;
        self.last_violation = Decode::decode(decoder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thumbsup_core::freeze::{freeze_to_vec, thaw_from_slice};
    use thumbsup_core::hw::SafetyFacts;
    use tu_dshot::decode_packet;
    use tu_dshot::telemetry::edt_raw_from_value;
    use tu_esc_config::EscLinkConfig;
    use tu_pwm::{weapon_speed_to_pulse, PwmOutputConfig, PWM_MIN_PULSE_US};
    use tu_sim::SimBoard;

    struct Sim;

    impl WeaponBoard for Sim {
        type Pwm = SimBoard;
        type Dshot = SimBoard;
        type Serial = SimBoard;
        type Pin = SimBoard;
    }

    fn healthy() -> SafetyFacts {
        SafetyFacts {
            battery_mv: 11_800,
            ..Default::default()
        }
    }

    fn machine_with(board: &SimBoard, config: WeaponConfig) -> WeaponStateMachine<Sim> {
        let pwm = PwmOutput::new(board.clone(), &MotorChannel::ALL, PwmOutputConfig::default())
            .unwrap();
        let dshot = DshotEngine::new(board.clone(), board.clock());
        let esc = EscConfigChannel::new(
            board.clone(),
            board.clone(),
            board.clock(),
            WEAPON,
            EscLinkConfig::default(),
        );
        WeaponStateMachine::new(
            WeaponTransports::new(pwm, dshot, esc),
            board.clone(),
            board.clock(),
            config,
            SafetyConfig::default(),
        )
        .unwrap()
    }

    fn machine(board: &SimBoard) -> WeaponStateMachine<Sim> {
        machine_with(board, WeaponConfig::default())
    }

    /// One 10 ms control tick, including the PWM ramp the control loop runs.
    fn tick(
        board: &SimBoard,
        weapon: &mut WeaponStateMachine<Sim>,
        facts: &SafetyFacts,
    ) -> TuResult<()> {
        board.mock().advance_millis(10);
        let result = weapon.update(facts);
        weapon.transports().lock().unwrap().pwm.update();
        result
    }

    fn armed(board: &SimBoard) -> WeaponStateMachine<Sim> {
        let mut weapon = machine(board);
        weapon.arm(&healthy()).unwrap();
        for _ in 0..500 {
            tick(board, &mut weapon, &healthy()).unwrap();
        }
        assert_eq!(weapon.state(), WeaponState::Armed);
        weapon
    }

    fn spinning(board: &SimBoard) -> WeaponStateMachine<Sim> {
        let mut weapon = armed(board);
        weapon.set_speed(60).unwrap();
        for _ in 0..40 {
            tick(board, &mut weapon, &healthy()).unwrap();
        }
        assert_eq!(weapon.state(), WeaponState::Spinning);
        weapon
    }

    fn last_dshot_throttle(board: &SimBoard) -> Option<u16> {
        let frames = board.dshot_frames();
        let frame = frames.last()?;
        decode_packet(frame.word as u16).map(|(throttle, _)| throttle)
    }

    #[test]
    fn test_starts_disarmed_on_pwm() {
        let board = SimBoard::new();
        let weapon = machine(&board);
        assert_eq!(weapon.state(), WeaponState::Disarmed);
        assert_eq!(weapon.mode(), WeaponControlMode::Pwm);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Pwm);
        assert_eq!(board.pwm_pulse(WEAPON), PWM_MIN_PULSE_US);
    }

    #[test]
    fn test_low_battery_arm_refused() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        let low = SafetyFacts {
            battery_mv: 9_500,
            ..healthy()
        };
        let err = weapon.arm(&low).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LowBattery);
        assert_eq!(weapon.state(), WeaponState::Disarmed);
    }

    #[test]
    fn test_safety_button_arm_refused() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        let pressed = SafetyFacts {
            safety_button: true,
            ..healthy()
        };
        assert!(weapon.arm(&pressed).is_err());
        assert_eq!(weapon.state(), WeaponState::Disarmed);
    }

    #[test]
    fn test_arming_precedes_armed() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        weapon.arm(&healthy()).unwrap();
        assert_eq!(weapon.state(), WeaponState::Arming);
        for _ in 0..499 {
            tick(&board, &mut weapon, &healthy()).unwrap();
            assert_eq!(weapon.state(), WeaponState::Arming);
        }
        tick(&board, &mut weapon, &healthy()).unwrap();
        assert_eq!(weapon.state(), WeaponState::Armed);

        weapon.disarm();
        assert_eq!(weapon.state(), WeaponState::Disarmed);
        weapon.arm(&healthy()).unwrap();
        assert_eq!(weapon.state(), WeaponState::Arming);
        tick(&board, &mut weapon, &healthy()).unwrap();
        assert_eq!(weapon.state(), WeaponState::Arming);
    }

    #[test]
    fn test_arm_only_from_disarmed() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        weapon.arm(&healthy()).unwrap();
        assert_eq!(
            weapon.arm(&healthy()).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_speed_ignored_unless_armed() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        assert_eq!(weapon.set_speed(50).unwrap_err().kind(), ErrorKind::NotArmed);
        weapon.arm(&healthy()).unwrap();
        assert_eq!(weapon.set_speed(50).unwrap_err().kind(), ErrorKind::NotArmed);
        assert_eq!(weapon.target_speed(), 0);
    }

    #[test]
    fn test_arm_spin_ramp_scenario() {
        let board = SimBoard::new();
        let mut weapon = armed(&board);
        weapon.set_speed(100).unwrap();
        assert_eq!(weapon.target_speed(), 100);

        for _ in 0..3 {
            tick(&board, &mut weapon, &healthy()).unwrap();
        }
        assert_eq!(weapon.current_speed(), 0);
        assert_eq!(weapon.state(), WeaponState::Armed);

        let mut previous = 0;
        for _ in 0..200 {
            tick(&board, &mut weapon, &healthy()).unwrap();
            let speed = weapon.current_speed();
            assert!(speed >= previous && speed - previous <= WEAPON_RAMP_STEP);
            previous = speed;
        }
        assert_eq!(weapon.current_speed(), 100);
        assert_eq!(weapon.state(), WeaponState::Spinning);
        let target = weapon
            .transports()
            .lock()
            .unwrap()
            .pwm
            .pulse(WEAPON)
            .unwrap()
            .target_pulse_us;
        assert_eq!(target, weapon_speed_to_pulse(100));
    }

    #[test]
    fn test_weapon_expo_shapes_target() {
        let board = SimBoard::new();
        let mut weapon = armed(&board);
        weapon.set_speed(50).unwrap();
        assert_eq!(weapon.target_speed(), 43);
        weapon.set_speed(250).unwrap();
        assert_eq!(weapon.target_speed(), 100);
        weapon.set_speed(-20).unwrap();
        assert_eq!(weapon.target_speed(), 0);
    }

    #[test]
    fn test_spin_down_returns_to_armed() {
        let board = SimBoard::new();
        let mut weapon = spinning(&board);
        weapon.set_speed(0).unwrap();
        for _ in 0..400 {
            tick(&board, &mut weapon, &healthy()).unwrap();
        }
        assert_eq!(weapon.current_speed(), 0);
        assert_eq!(weapon.state(), WeaponState::Armed);
    }

    #[test]
    fn test_violation_forces_emergency_stop_next_tick() {
        let board = SimBoard::new();
        let mut weapon = spinning(&board);
        assert!(board.pwm_pulse(WEAPON) > PWM_MIN_PULSE_US);

        let failsafe = SafetyFacts {
            failsafe_active: true,
            ..healthy()
        };
        let err = tick(&board, &mut weapon, &failsafe).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailsafeActive);
        assert_eq!(weapon.state(), WeaponState::EmergencyStop);
        assert_eq!(weapon.last_violation(), Some(SafetyViolation::FailsafeActive));
        assert_eq!(weapon.current_speed(), 0);
        assert_eq!(board.pwm_pulse(WEAPON), PWM_MIN_PULSE_US);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Output);
        assert!(!board.pin_level(WEAPON));
    }

    #[test]
    fn test_violation_while_arming() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        weapon.arm(&healthy()).unwrap();
        let pressed = SafetyFacts {
            safety_button: true,
            ..healthy()
        };
        assert!(tick(&board, &mut weapon, &pressed).is_err());
        assert_eq!(weapon.state(), WeaponState::EmergencyStop);
    }

    #[test]
    fn test_low_battery_streak_stops_weapon() {
        let board = SimBoard::new();
        let mut weapon = armed(&board);
        let low = SafetyFacts {
            battery_mv: 9_300,
            ..healthy()
        };
        for _ in 0..4 {
            tick(&board, &mut weapon, &low).unwrap();
            assert_eq!(weapon.state(), WeaponState::Armed);
        }
        let err = tick(&board, &mut weapon, &low).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LowBattery);
        assert_eq!(weapon.state(), WeaponState::EmergencyStop);
    }

    #[test]
    fn test_disarmed_is_not_policed() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        let failsafe = SafetyFacts {
            failsafe_active: true,
            ..healthy()
        };
        tick(&board, &mut weapon, &failsafe).unwrap();
        assert_eq!(weapon.state(), WeaponState::Disarmed);
    }

    #[test]
    fn test_emergency_stop_needs_reinit() {
        let board = SimBoard::new();
        let mut weapon = spinning(&board);
        weapon.emergency_stop();
        weapon.emergency_stop();
        assert_eq!(weapon.state(), WeaponState::EmergencyStop);

        weapon.disarm();
        assert_eq!(weapon.state(), WeaponState::EmergencyStop);
        assert!(weapon.arm(&healthy()).is_err());
        tick(&board, &mut weapon, &healthy()).unwrap();
        assert_eq!(weapon.state(), WeaponState::EmergencyStop);

        weapon.reinit().unwrap();
        assert_eq!(weapon.state(), WeaponState::Disarmed);
        assert_eq!(weapon.mode(), WeaponControlMode::Pwm);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Pwm);
        assert!(weapon.transports().lock().unwrap().pwm.is_claimed(WEAPON));
        weapon.arm(&healthy()).unwrap();
    }

    #[test]
    fn test_emergency_stop_tries_every_transport() {
        let board = SimBoard::new();
        let mut weapon = spinning(&board);
        // DShot left running behind a PWM mode: the stop must not trust the mode.
        weapon
            .transports()
            .lock()
            .unwrap()
            .dshot
            .init(WEAPON, DshotConfig::default())
            .unwrap();
        board.clear_dshot_frames();

        weapon.emergency_stop();
        assert_eq!(last_dshot_throttle(&board), Some(0));
        assert_eq!(board.pwm_pulse(WEAPON), PWM_MIN_PULSE_US);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Output);
        assert!(!board.pin_level(WEAPON));
    }

    #[test]
    fn test_estop_handle_with_contested_lock() {
        let board = SimBoard::new();
        let mut weapon = spinning(&board);
        let handle = weapon.estop_handle();
        let shared = weapon.transports();
        {
            let _guard = shared.lock().unwrap();
            handle.trigger();
            assert!(handle.is_requested());
            assert_eq!(board.pin_function(WEAPON), PinFunction::Output);
            assert!(!board.pin_level(WEAPON));
            assert!(board.pwm_pulse(WEAPON) > PWM_MIN_PULSE_US);
            assert_eq!(weapon.state(), WeaponState::Spinning);
        }
        tick(&board, &mut weapon, &healthy()).unwrap();
        assert_eq!(weapon.state(), WeaponState::EmergencyStop);
        assert!(!handle.is_requested());
        assert_eq!(board.pwm_pulse(WEAPON), PWM_MIN_PULSE_US);
    }

    #[test]
    fn test_estop_handle_from_other_thread() {
        let board = SimBoard::new();
        let mut weapon = spinning(&board);
        let handle = weapon.estop_handle();
        std::thread::spawn(move || handle.trigger()).join().unwrap();
        assert_eq!(board.pwm_pulse(WEAPON), PWM_MIN_PULSE_US);
        tick(&board, &mut weapon, &healthy()).unwrap();
        assert_eq!(weapon.state(), WeaponState::EmergencyStop);
    }

    #[test]
    fn test_mode_switch_refused_while_armed() {
        let board = SimBoard::new();
        let mut weapon = armed(&board);
        let err = weapon.enable_dshot().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(weapon.mode(), WeaponControlMode::Pwm);
        assert_eq!(board.claimed_executors(), 0);
    }

    #[test]
    fn test_dshot_mode_round_trip() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        weapon.enable_dshot().unwrap();
        assert_eq!(weapon.mode(), WeaponControlMode::Dshot);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Dshot);
        assert_eq!(board.claimed_executors(), 1);
        assert!(!weapon.transports().lock().unwrap().pwm.is_claimed(WEAPON));
        assert_eq!(last_dshot_throttle(&board), Some(0));

        weapon.arm(&healthy()).unwrap();
        for _ in 0..500 {
            tick(&board, &mut weapon, &healthy()).unwrap();
        }
        weapon.set_speed(100).unwrap();
        for _ in 0..40 {
            tick(&board, &mut weapon, &healthy()).unwrap();
        }
        assert_eq!(weapon.current_speed(), 20);
        assert_eq!(
            last_dshot_throttle(&board),
            Some(throttle_from_unsigned_percent(20))
        );

        weapon.disarm();
        assert_eq!(last_dshot_throttle(&board), Some(0));
        weapon.enable_pwm().unwrap();
        assert_eq!(board.claimed_executors(), 0);
        assert_eq!(board.installed_program_count(), 0);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Pwm);
        assert!(weapon.transports().lock().unwrap().pwm.is_claimed(WEAPON));
    }

    #[test]
    fn test_dshot_failure_falls_back_to_pwm() {
        let board = SimBoard::new();
        board.with_state(|s| s.executor_capacity = 0);
        let mut weapon = machine(&board);
        let err = weapon.enable_dshot().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(weapon.mode(), WeaponControlMode::Pwm);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Pwm);
        assert_eq!(board.installed_program_count(), 0);
        assert!(weapon.transports().lock().unwrap().pwm.is_claimed(WEAPON));
    }

    #[test]
    fn test_starting_in_dshot_falls_back_quietly() {
        let board = SimBoard::new();
        board.with_state(|s| s.transfer_capacity = 0);
        let config = WeaponConfig {
            mode: WeaponControlMode::Dshot,
            ..Default::default()
        };
        let weapon = machine_with(&board, config);
        assert_eq!(weapon.mode(), WeaponControlMode::Pwm);
    }

    #[test]
    fn test_config_mode_operations() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        assert_eq!(
            weapon.read_esc_settings().unwrap_err().kind(),
            ErrorKind::InvalidState
        );

        weapon.enter_config_mode().unwrap();
        assert_eq!(weapon.mode(), WeaponControlMode::Config);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Uart);
        assert_eq!(
            weapon.arm(&healthy()).unwrap_err().kind(),
            ErrorKind::InvalidState
        );

        let info = weapon.esc_info().unwrap();
        assert_eq!(info.firmware_version, [2, 15, 0]);
        let settings = weapon.apply_esc_weapon_defaults().unwrap();
        let mut expected = settings;
        expected.apply_weapon_defaults();
        assert_eq!(settings, expected);
        assert_eq!(settings.motor_poles, 14);
        assert_eq!(weapon.read_esc_settings().unwrap(), settings);
        assert!(board.with_esc(|esc| esc.saved_eeprom.is_some()));

        weapon.enable_pwm().unwrap();
        assert_eq!(board.uart_baud(), None);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Pwm);
        assert!(!board.with_esc(|esc| esc.listening));
    }

    #[test]
    fn test_config_failure_falls_back_to_pwm() {
        let board = SimBoard::new();
        board.with_esc(|esc| esc.wired_bidirectional = false);
        let mut weapon = machine(&board);
        let err = weapon.enter_config_mode().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommFailure);
        assert_eq!(weapon.mode(), WeaponControlMode::Pwm);
        assert_eq!(board.pin_function(WEAPON), PinFunction::Pwm);
    }

    #[test]
    fn test_flash_returns_to_pwm() {
        let board = SimBoard::new();
        let mut weapon = machine(&board);
        weapon.enter_config_mode().unwrap();
        let pages = weapon.flash_esc_firmware(&[0xA5; 600]).unwrap();
        assert_eq!(pages, 3);
        assert_eq!(weapon.mode(), WeaponControlMode::Pwm);
        assert_eq!(board.with_esc(|esc| esc.flashed_pages.len()), 3);
    }

    #[test]
    fn test_telemetry_in_bidirectional_dshot() {
        let board = SimBoard::new();
        let config = WeaponConfig {
            mode: WeaponControlMode::Dshot,
            dshot: DshotConfig {
                bidirectional: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let weapon = machine_with(&board, config);
        assert_eq!(weapon.mode(), WeaponControlMode::Dshot);
        assert!(weapon.telemetry().is_err());

        board.push_telemetry(WEAPON, edt_raw_from_value(1400));
        assert_eq!(weapon.telemetry().unwrap().erpm, 1400);
        assert_eq!(weapon.weapon_rpm().unwrap(), 200);
    }

    #[test]
    fn test_telemetry_needs_dshot() {
        let board = SimBoard::new();
        let weapon = machine(&board);
        assert_eq!(
            weapon.telemetry().unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_config_from_component() {
        let mut cfg = ComponentConfig::new();
        cfg.set("mode", "dshot".to_string());
        cfg.set("expo", 35u8);
        cfg.set("arm_timeout_ms", 3_000u32);
        let parsed = WeaponConfig::from_config(Some(&cfg)).unwrap();
        assert_eq!(parsed.mode, WeaponControlMode::Dshot);
        assert_eq!(parsed.expo, 35);
        assert_eq!(parsed.arm_timeout, TuDuration::from_millis(3_000));

        let mut cfg = ComponentConfig::new();
        cfg.set("mode", "servo".to_string());
        assert!(WeaponConfig::from_config(Some(&cfg)).is_err());
        let mut cfg = ComponentConfig::new();
        cfg.set("mode", "config".to_string());
        assert!(WeaponConfig::from_config(Some(&cfg)).is_err());
        let mut cfg = ComponentConfig::new();
        cfg.set("ramp_step", 0u8);
        assert!(WeaponConfig::from_config(Some(&cfg)).is_err());
        assert_eq!(WeaponConfig::from_config(None).unwrap(), WeaponConfig::default());
    }

    #[test]
    fn test_freeze_thaw() {
        let board = SimBoard::new();
        let weapon = spinning(&board);
        let bytes = freeze_to_vec(&weapon).unwrap();

        let other = SimBoard::new();
        let mut restored = machine(&other);
        thaw_from_slice(&mut restored, &bytes).unwrap();
        assert_eq!(restored.state(), WeaponState::Spinning);
        assert_eq!(restored.current_speed(), weapon.current_speed());
        assert_eq!(restored.target_speed(), weapon.target_speed());
    }
}
